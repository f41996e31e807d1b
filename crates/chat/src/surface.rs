use murmur_llm::Model;

use crate::markdown::Fragment;
use crate::message::ChatStats;

/// Presentation boundary driven by the orchestrator.
pub trait ChatSurface: Send {
    fn append_user_message(&mut self, text: &str);
    fn append_assistant_message(&mut self, fragment: &Fragment);
    /// Opens an empty assistant bubble for a streamed reply.
    fn begin_assistant_reply(&mut self);
    /// Re-renders the open bubble with the full text so far.
    fn update_assistant_reply(&mut self, fragment: &Fragment);
    /// Replaces the open bubble with a notice, discarding partial output.
    fn replace_assistant_reply(&mut self, notice: &str);
    fn end_assistant_reply(&mut self);
    fn clear_messages(&mut self);
    fn scroll_to_bottom(&mut self);
    fn set_busy(&mut self, busy: bool);
    fn set_sending_enabled(&mut self, enabled: bool);
    fn focus_input(&mut self);
    fn set_status(&mut self, status: &str);
    fn show_stats(&mut self, stats: &ChatStats);
    fn show_inline_error(&mut self, message: &str);
    fn show_blocking_notice(&mut self, message: &str);
    fn dismiss_blocking_notice(&mut self);
    fn show_models(&mut self, models: &[Model], selected: Option<&str>);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    UserMessage(String),
    AssistantMessage(Fragment),
    BeginReply,
    UpdateReply(Fragment),
    ReplaceReply(String),
    EndReply,
    ClearMessages,
    ScrollToBottom,
    Busy(bool),
    SendingEnabled(bool),
    FocusInput,
    Status(String),
    Stats(ChatStats),
    InlineError(String),
    BlockingNotice(String),
    DismissNotice,
    Models {
        ids: Vec<String>,
        selected: Option<String>,
    },
}

/// Surface that remembers every call, for tests and headless runs.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    events: Vec<SurfaceEvent>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[SurfaceEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<SurfaceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Fragments pushed into the open reply, in order.
    pub fn reply_updates(&self) -> Vec<&Fragment> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SurfaceEvent::UpdateReply(fragment) => Some(fragment),
                _ => None,
            })
            .collect()
    }

    pub fn last_stats(&self) -> Option<&ChatStats> {
        self.events.iter().rev().find_map(|event| match event {
            SurfaceEvent::Stats(stats) => Some(stats),
            _ => None,
        })
    }

    pub fn contains(&self, expected: &SurfaceEvent) -> bool {
        self.events.iter().any(|event| event == expected)
    }

    fn record(&mut self, event: SurfaceEvent) {
        self.events.push(event);
    }
}

impl ChatSurface for RecordingSurface {
    fn append_user_message(&mut self, text: &str) {
        self.record(SurfaceEvent::UserMessage(text.to_string()));
    }

    fn append_assistant_message(&mut self, fragment: &Fragment) {
        self.record(SurfaceEvent::AssistantMessage(fragment.clone()));
    }

    fn begin_assistant_reply(&mut self) {
        self.record(SurfaceEvent::BeginReply);
    }

    fn update_assistant_reply(&mut self, fragment: &Fragment) {
        self.record(SurfaceEvent::UpdateReply(fragment.clone()));
    }

    fn replace_assistant_reply(&mut self, notice: &str) {
        self.record(SurfaceEvent::ReplaceReply(notice.to_string()));
    }

    fn end_assistant_reply(&mut self) {
        self.record(SurfaceEvent::EndReply);
    }

    fn clear_messages(&mut self) {
        self.record(SurfaceEvent::ClearMessages);
    }

    fn scroll_to_bottom(&mut self) {
        self.record(SurfaceEvent::ScrollToBottom);
    }

    fn set_busy(&mut self, busy: bool) {
        self.record(SurfaceEvent::Busy(busy));
    }

    fn set_sending_enabled(&mut self, enabled: bool) {
        self.record(SurfaceEvent::SendingEnabled(enabled));
    }

    fn focus_input(&mut self) {
        self.record(SurfaceEvent::FocusInput);
    }

    fn set_status(&mut self, status: &str) {
        self.record(SurfaceEvent::Status(status.to_string()));
    }

    fn show_stats(&mut self, stats: &ChatStats) {
        self.record(SurfaceEvent::Stats(*stats));
    }

    fn show_inline_error(&mut self, message: &str) {
        self.record(SurfaceEvent::InlineError(message.to_string()));
    }

    fn show_blocking_notice(&mut self, message: &str) {
        self.record(SurfaceEvent::BlockingNotice(message.to_string()));
    }

    fn dismiss_blocking_notice(&mut self) {
        self.record(SurfaceEvent::DismissNotice);
    }

    fn show_models(&mut self, models: &[Model], selected: Option<&str>) {
        self.record(SurfaceEvent::Models {
            ids: models.iter().map(|model| model.id.clone()).collect(),
            selected: selected.map(str::to_string),
        });
    }
}
