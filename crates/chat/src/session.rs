use murmur_llm::TurnId;

use crate::message::{
    ConversationWindow, Message, PhaseRejection, PhaseResult, PhaseTransition, RequestCounter,
    TurnPhase,
};

/// Mutable per-process chat state owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub window: ConversationWindow,
    pub requests: RequestCounter,
    pub phase: TurnPhase,
    /// Set while a blocking notice is shown or the engine is unavailable.
    pub input_locked: bool,
    next_turn: u64,
}

impl SessionContext {
    pub fn new(max_history: usize) -> Self {
        Self {
            window: ConversationWindow::new(max_history),
            requests: RequestCounter::default(),
            phase: TurnPhase::Idle,
            input_locked: false,
            next_turn: 0,
        }
    }

    /// Applies a deterministic phase transition.
    pub fn apply_transition(&mut self, transition: PhaseTransition) -> PhaseResult {
        let next_phase = self.phase.apply(transition)?;
        self.phase = next_phase;
        Ok(next_phase)
    }

    /// Claims a fresh turn id and moves to `AwaitingFirstToken`.
    pub fn begin_turn(&mut self) -> Result<TurnId, PhaseRejection> {
        let turn = TurnId::new(self.next_turn.saturating_add(1));
        self.apply_transition(PhaseTransition::Begin(turn))?;
        self.next_turn = turn.0;
        Ok(turn)
    }

    pub fn record_message(&mut self, message: Message) {
        let evicted = self.window.push(message);
        if evicted > 0 {
            tracing::debug!(evicted, bound = self.window.bound(), "trimmed conversation window");
        }
    }

    /// Starts a fresh context for another model. The request counter survives
    /// so switching models cannot reset the quota.
    pub fn reset_for_model_switch(&mut self) {
        self.window.clear();
        self.phase = TurnPhase::Idle;
    }
}
