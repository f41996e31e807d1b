use std::sync::Arc;

use clap::Parser;
use murmur::{
    ChatConfig, ChatOrchestrator, Cli, CommandOutcome, HELP_TEXT, InputLine, TerminalSurface,
};
use murmur_llm::RigCapabilityFactory;
use murmur_storage::{MemoryStore, MessageLog, SqliteStorage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "warn";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let config = match &cli.config {
        Some(path) => ChatConfig::load_from(path),
        None => ChatConfig::load(),
    };
    if cli.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(error) => tracing::error!(%error, "failed to serialize configuration"),
        }
        return;
    }

    let store = open_store(&config).await;
    let factory = Arc::new(RigCapabilityFactory::new(config.provider_config()));
    let mut chat = ChatOrchestrator::new(config, store, factory, TerminalSurface::stdout());
    if let Err(error) = chat.initialize().await {
        tracing::warn!(stage = error.stage(), %error, "started without a usable model");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        chat.surface_mut().prompt();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!(%error, "failed to read input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match InputLine::parse(&line) {
            InputLine::Quit => break,
            InputLine::Help => chat.surface_mut().print_line(HELP_TEXT),
            InputLine::Unrecognized(text) => chat
                .surface_mut()
                .print_line(&format!("unknown command `{text}`, /help lists commands")),
            InputLine::Command(command) => match chat.dispatch(command).await {
                Ok(CommandOutcome::NeedsConfirmation) => chat
                    .surface_mut()
                    .print_line("This deletes the whole conversation. Type /confirm to continue."),
                Ok(CommandOutcome::NothingToConfirm) => {
                    chat.surface_mut().print_line("Nothing to confirm.")
                }
                Ok(outcome) => tracing::debug!(?outcome, "command finished"),
                Err(error) => tracing::debug!(stage = error.stage(), %error, "command rejected"),
            },
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_LEVEL))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn open_store(config: &ChatConfig) -> MessageLog {
    let retention = Some(config.max_history);
    if !config.storage.persist {
        tracing::info!("history persistence disabled, keeping messages in memory");
        return MessageLog::new(Arc::new(MemoryStore::new(retention)));
    }

    let path = config.storage.database_path();
    tracing::info!(path = %path.display(), "opening chat history");
    MessageLog::from_open_result(SqliteStorage::open(&path.to_string_lossy(), retention).await)
}
