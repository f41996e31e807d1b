use crate::message::ChatStats;

/// User intent routed through `ChatOrchestrator::dispatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    SelectModel(String),
    ListModels,
    ClearHistory,
    ConfirmClearHistory,
    DismissNotice,
}

/// How a sent turn ended. Rejected sends are errors instead.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed {
        reply: String,
        stats: Option<ChatStats>,
    },
    /// Stream finished without any text; nothing was committed.
    EmptyReply,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Turn(TurnOutcome),
    ModelSelected(String),
    ModelsListed,
    NeedsConfirmation,
    HistoryCleared,
    NothingToConfirm,
    NoticeDismissed,
}

/// One line typed at the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    Command(Command),
    Help,
    Quit,
    /// Slash command the terminal does not understand.
    Unrecognized(String),
}

pub const HELP_TEXT: &str = "\
/model <id>   switch model
/models       list models
/clear        clear history (asks for /confirm)
/confirm      confirm clearing history
/dismiss      close the current notice
/help         show this help
/quit         exit
anything else is sent to the model";

impl InputLine {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Self::Command(Command::Send(line.trim_end_matches(['\r', '\n']).to_string()));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };
        match name {
            "model" if !argument.is_empty() => {
                Self::Command(Command::SelectModel(argument.to_string()))
            }
            "models" | "model" => Self::Command(Command::ListModels),
            "clear" => Self::Command(Command::ClearHistory),
            "confirm" => Self::Command(Command::ConfirmClearHistory),
            "dismiss" => Self::Command(Command::DismissNotice),
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => Self::Unrecognized(trimmed.to_string()),
        }
    }
}
