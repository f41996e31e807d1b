use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("message id '{raw}' is not a valid uuid"))]
    MalformedMessageId {
        stage: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("stored history is inconsistent: {details}"))]
    CorruptHistory {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("cannot create history directory {path}"))]
    CreateHistoryDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("history database url '{database_url}' is invalid"))]
    InvalidDatabaseUrl {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot open history database '{database_url}'"))]
    OpenDatabase {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("history database rejected pragma '{pragma}'"))]
    ApplyPragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("history schema migration failed"))]
    MigrateSchema {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("history query `{stage}` failed, {source}"))]
    HistoryQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

impl StorageError {
    /// Returns the pipeline stage that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::MalformedMessageId { stage, .. }
            | Self::CorruptHistory { stage, .. }
            | Self::CreateHistoryDirectory { stage, .. }
            | Self::InvalidDatabaseUrl { stage, .. }
            | Self::OpenDatabase { stage, .. }
            | Self::ApplyPragma { stage, .. }
            | Self::MigrateSchema { stage, .. }
            | Self::HistoryQuery { stage, .. } => stage,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
