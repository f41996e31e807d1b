use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    ApplyPragmaSnafu, CorruptHistorySnafu, CreateHistoryDirectorySnafu, HistoryQuerySnafu,
    InvalidDatabaseUrlSnafu, MigrateSchemaSnafu, OpenDatabaseSnafu, StorageError, StorageResult,
};
use super::ids::MessageId;
use super::types::{MessageEntry, MessageRole, StoredMessage};
use super::{BoxFuture, ConversationStore, unix_timestamp_millis};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    retention: Option<usize>,
}

impl SqliteStorage {
    /// Opens (creating if needed) the database and applies pending schema migrations.
    ///
    /// `retention` caps how many of the newest messages survive each append.
    pub async fn open(database_location: &str, retention: Option<usize>) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(InvalidDatabaseUrlSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(OpenDatabaseSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(ApplyPragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        // Versioned migrations run once per schema bump on first open.
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(MigrateSchemaSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(%database_url, ?retention, "sqlite conversation store opened");

        Ok(Self {
            pool,
            retention,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Full rows including storage-only fields, oldest first.
    pub async fn list_stored(&self) -> StorageResult<Vec<StoredMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, seq, role, content, created_at_ms FROM messages ORDER BY created_at_ms ASC, seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context(HistoryQuerySnafu {
            stage: "message-list-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn append_entry(&self, entry: MessageEntry) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.context(HistoryQuerySnafu {
            stage: "message-append-begin",
        })?;

        // Id, seq and timestamp are assigned by one statement; the timestamp is
        // clamped to the newest existing row so it never runs backwards.
        sqlx::query(
            "INSERT INTO messages (id, seq, role, content, created_at_ms) \
             SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, MAX(?, COALESCE(MAX(created_at_ms), 0)) FROM messages",
        )
        .bind(MessageId::new_v7().to_string())
        .bind(entry.role.as_str())
        .bind(entry.content)
        .bind(unix_timestamp_millis())
        .execute(&mut *tx)
        .await
        .context(HistoryQuerySnafu {
            stage: "message-append-insert",
        })?;

        if let Some(retention) = self.retention {
            let retention = usize_to_i64(retention, "message-append-retention")?;
            let pruned = sqlx::query(
                "DELETE FROM messages WHERE seq <= (SELECT MAX(seq) FROM messages) - ?",
            )
            .bind(retention)
            .execute(&mut *tx)
            .await
            .context(HistoryQuerySnafu {
                stage: "message-append-prune",
            })?;

            if pruned.rows_affected() > 0 {
                tracing::debug!(
                    pruned = pruned.rows_affected(),
                    retention,
                    "pruned messages beyond retention bound"
                );
            }
        }

        tx.commit().await.context(HistoryQuerySnafu {
            stage: "message-append-commit",
        })
    }

    async fn load_entries(&self) -> StorageResult<Vec<MessageEntry>> {
        Ok(self
            .list_stored()
            .await?
            .into_iter()
            .map(StoredMessage::into_entry)
            .collect())
    }

    async fn clear_entries(&self) -> StorageResult<()> {
        let removed = sqlx::query("DELETE FROM messages")
            .execute(&self.pool)
            .await
            .context(HistoryQuerySnafu {
                stage: "message-clear",
            })?;

        tracing::info!(removed = removed.rows_affected(), "conversation store cleared");
        Ok(())
    }
}

impl ConversationStore for SqliteStorage {
    fn append<'a>(&'a self, entry: MessageEntry) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.append_entry(entry))
    }

    fn load_all<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<MessageEntry>>> {
        Box::pin(self.load_entries())
    }

    fn clear<'a>(&'a self) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.clear_entries())
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    seq: i64,
    role: String,
    content: String,
    created_at_ms: i64,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<StoredMessage> {
    Ok(StoredMessage {
        id: MessageId::parse(&row.id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at_unix_ms: i64_to_u64(row.created_at_ms, "message-row-created-at")?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => CorruptHistorySnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::CorruptHistory {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::CorruptHistory {
            stage,
            details: format!("usize '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateHistoryDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
