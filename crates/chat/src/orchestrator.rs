use std::sync::Arc;

use murmur_llm::{
    CapabilityFactory, InferenceCapability, Model, ModelWhitelist, ProviderEventStream,
    ProviderStreamHandle, StreamEventPayload, StreamRequest, TurnId,
};
use murmur_storage::MessageLog;
use snafu::{ResultExt, ensure};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::commands::{Command, CommandOutcome, TurnOutcome};
use crate::config::ChatConfig;
use crate::error::{
    CapabilityInitFailureSnafu, CapabilityNotReadySnafu, CapabilityUnavailableSnafu, ChatError,
    ChatResult, EMPTY_REPLY_MESSAGE, GENERIC_ERROR_MESSAGE, INIT_FAILURE_MESSAGE, InputLockedSnafu,
    QuotaExceededSnafu, RequestTimeoutSnafu, StorageUnavailableSnafu, StreamingFailureSnafu,
    TIMEOUT_MESSAGE, TurnInProgressSnafu, UNAVAILABLE_MESSAGE, UnknownModelSnafu, ValidationSnafu,
};
use crate::guard::{QuotaCheck, Validation, check_quota, is_known_model, validate_outgoing};
use crate::markdown::{Fragment, MarkdownCache};
use crate::message::{ChatStats, Message, PhaseTransition, Role, TurnPhase};
use crate::session::SessionContext;
use crate::surface::ChatSurface;
use crate::throttle::StreamRenderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityState {
    NotLoaded,
    Ready,
    /// Model failed to load; another model may still work.
    InitFailed,
    /// Engine missing; only a restart helps.
    Unavailable,
}

/// Full text of a stream that ended gracefully.
struct StreamedReply {
    text: String,
    stats: Option<ChatStats>,
}

/// Aborts the provider worker when the turn is over, however it ended.
struct WorkerGuard(JoinHandle<()>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives request/response turns between the user, the model and the store.
pub struct ChatOrchestrator<S: ChatSurface> {
    config: ChatConfig,
    whitelist: ModelWhitelist,
    store: MessageLog,
    factory: Arc<dyn CapabilityFactory>,
    capability: Option<Arc<dyn InferenceCapability>>,
    capability_state: CapabilityState,
    selected_model: Option<Model>,
    session: SessionContext,
    markdown: MarkdownCache,
    last_stats: Option<ChatStats>,
    clear_requested: bool,
    surface: S,
}

impl<S: ChatSurface> ChatOrchestrator<S> {
    pub fn new(
        config: ChatConfig,
        store: MessageLog,
        factory: Arc<dyn CapabilityFactory>,
        surface: S,
    ) -> Self {
        let whitelist = config.model_whitelist();
        let session = SessionContext::new(config.max_history);
        let markdown = MarkdownCache::new(config.markdown_cache_capacity);
        Self {
            config,
            whitelist,
            store,
            factory,
            capability: None,
            capability_state: CapabilityState::NotLoaded,
            selected_model: None,
            session,
            markdown,
            last_stats: None,
            clear_requested: false,
            surface,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn capability_state(&self) -> CapabilityState {
        self.capability_state
    }

    pub fn selected_model(&self) -> Option<&Model> {
        self.selected_model.as_ref()
    }

    pub fn last_stats(&self) -> Option<&ChatStats> {
        self.last_stats.as_ref()
    }

    pub fn whitelist(&self) -> &ModelWhitelist {
        &self.whitelist
    }

    /// Restores persisted history, then loads the configured default model.
    pub async fn initialize(&mut self) -> ChatResult<()> {
        let history = match self.store.load_all().await {
            Ok(entries) => entries.into_iter().map(Message::from).collect::<Vec<_>>(),
            Err(error) => {
                tracing::warn!(stage = error.stage(), %error, "failed to load chat history");
                Vec::new()
            }
        };

        for message in &history {
            self.display_message(message);
        }
        tracing::info!(
            restored = history.len(),
            persistent = self.store.is_available(),
            "restored chat history"
        );
        self.session.window.replace_with(history);
        self.surface.scroll_to_bottom();

        let model = self
            .whitelist
            .find(&self.config.default_model)
            .or_else(|| self.whitelist.models().first())
            .cloned()
            .unwrap_or_else(|| Model::from_id(self.config.default_model.clone()));
        self.load_model(model).await
    }

    pub async fn dispatch(&mut self, command: Command) -> ChatResult<CommandOutcome> {
        let confirming = matches!(command, Command::ConfirmClearHistory);
        let result = match command {
            Command::Send(text) => self.send(&text).await.map(CommandOutcome::Turn),
            Command::SelectModel(model_id) => self
                .select_model(&model_id)
                .await
                .map(|()| CommandOutcome::ModelSelected(model_id)),
            Command::ListModels => {
                self.list_models();
                Ok(CommandOutcome::ModelsListed)
            }
            Command::ClearHistory => Ok(self.request_clear_history()),
            Command::ConfirmClearHistory => self.confirm_clear_history().await,
            Command::DismissNotice => {
                self.dismiss_notice();
                Ok(CommandOutcome::NoticeDismissed)
            }
        };

        if !confirming && !matches!(result, Ok(CommandOutcome::NeedsConfirmation)) {
            self.clear_requested = false;
        }
        if let Err(error) = &result {
            if error.is_rejection() {
                self.surface.show_inline_error(&error.user_message());
            }
        }
        result
    }

    /// Runs one complete turn. Guard failures are returned before anything changes.
    pub async fn send(&mut self, text: &str) -> ChatResult<TurnOutcome> {
        let capability = self.check_send(text)?;
        let turn = self.session.begin_turn().map_err(|rejection| {
            tracing::warn!(?rejection, "turn rejected by phase guard");
            TurnInProgressSnafu {
                stage: "begin-turn",
                turn: self.session.phase.active_turn().unwrap_or(TurnId::new(0)),
            }
            .build()
        })?;

        let user_message = Message::user(text);
        if let Err(error) = self.store.append(user_message.to_entry()).await {
            tracing::warn!(stage = error.stage(), %error, "failed to persist user message");
        }
        self.session.record_message(user_message);
        self.surface.append_user_message(text);
        self.surface.scroll_to_bottom();
        self.surface.set_busy(true);
        self.surface.set_sending_enabled(false);
        self.surface.set_status(self.session.phase.label());
        let request_count = self.session.requests.increment();
        tracing::info!(
            ?turn,
            request_count,
            window = self.session.window.len(),
            model = %capability.model().id,
            "starting chat turn"
        );

        let request = self.build_request(turn, capability.model());
        let result = self.run_turn(capability.as_ref(), request).await;
        let outcome = self.finish_turn(turn, result).await;
        self.exit_turn();
        Ok(outcome)
    }

    pub async fn select_model(&mut self, model_id: &str) -> ChatResult<()> {
        ensure!(
            !self.session.input_locked,
            InputLockedSnafu {
                stage: "select-model"
            }
        );
        ensure!(
            is_known_model(model_id, &self.whitelist),
            UnknownModelSnafu {
                stage: "select-model",
                model_id: model_id.to_string(),
            }
        );
        if let Some(turn) = self.session.phase.active_turn() {
            return TurnInProgressSnafu {
                stage: "select-model",
                turn,
            }
            .fail();
        }

        let Some(model) = self.whitelist.find(model_id).cloned() else {
            return UnknownModelSnafu {
                stage: "select-model",
                model_id: model_id.to_string(),
            }
            .fail();
        };
        tracing::info!(
            from = self.selected_model.as_ref().map(|model| model.id.as_str()),
            to = %model.id,
            "switching model"
        );
        self.capability = None;
        self.capability_state = CapabilityState::NotLoaded;
        self.session.reset_for_model_switch();
        self.load_model(model).await
    }

    pub fn list_models(&mut self) {
        let selected = self.selected_model.as_ref().map(|model| model.id.as_str());
        self.surface.show_models(self.whitelist.models(), selected);
    }

    /// Clearing is destructive; it only happens after a confirmation.
    pub fn request_clear_history(&mut self) -> CommandOutcome {
        self.clear_requested = true;
        CommandOutcome::NeedsConfirmation
    }

    pub async fn confirm_clear_history(&mut self) -> ChatResult<CommandOutcome> {
        if !std::mem::take(&mut self.clear_requested) {
            return Ok(CommandOutcome::NothingToConfirm);
        }
        if let Some(turn) = self.session.phase.active_turn() {
            return TurnInProgressSnafu {
                stage: "clear-history",
                turn,
            }
            .fail();
        }

        if let Err(error) = self.store.clear().await.context(StorageUnavailableSnafu {
            stage: "clear-history",
        }) {
            tracing::error!(stage = error.stage(), %error, "failed to clear chat history");
            self.surface.show_inline_error(&error.user_message());
            return Err(error);
        }

        self.session.window.clear();
        self.surface.clear_messages();
        self.surface.set_status(&self.ready_status());
        tracing::info!("cleared chat history");
        Ok(CommandOutcome::HistoryCleared)
    }

    /// Closes the notice. Input stays locked while the engine is unavailable.
    pub fn dismiss_notice(&mut self) {
        self.surface.dismiss_blocking_notice();
        self.session.input_locked = self.capability_state == CapabilityState::Unavailable;
        if !self.session.input_locked {
            self.surface.focus_input();
        }
    }

    fn check_send(&self, text: &str) -> ChatResult<Arc<dyn InferenceCapability>> {
        ensure!(
            !self.session.input_locked,
            InputLockedSnafu { stage: "send-guard" }
        );
        if let Validation::Invalid(reason) =
            validate_outgoing(text, self.config.max_message_length)
        {
            return ValidationSnafu {
                stage: "validate-outgoing",
                reason,
            }
            .fail();
        }
        if let QuotaCheck::Denied(reason) = check_quota(
            self.session.requests.value(),
            self.config.daily_request_quota,
        ) {
            return QuotaExceededSnafu {
                stage: "check-quota",
                reason,
            }
            .fail();
        }
        if let Some(turn) = self.session.phase.active_turn() {
            return TurnInProgressSnafu {
                stage: "send-guard",
                turn,
            }
            .fail();
        }
        match (&self.capability, self.capability_state) {
            (Some(capability), CapabilityState::Ready) => Ok(Arc::clone(capability)),
            _ => CapabilityNotReadySnafu { stage: "send-guard" }.fail(),
        }
    }

    async fn load_model(&mut self, model: Model) -> ChatResult<()> {
        self.surface.set_sending_enabled(false);
        self.surface.set_status(&format!("Loading {}…", model.name));

        let loaded = match self.factory.create(&model) {
            Ok(capability) => {
                let initialized = capability.initialize().await;
                initialized.map(|()| capability)
            }
            Err(error) => Err(error),
        };

        match loaded {
            Ok(capability) => {
                tracing::info!(model = %model.id, capability = capability.id(), "model ready");
                self.capability = Some(capability);
                self.capability_state = CapabilityState::Ready;
                self.selected_model = Some(model);
                self.surface.set_status(&self.ready_status());
                self.surface.set_sending_enabled(true);
                self.surface.focus_input();
                Ok(())
            }
            Err(error) if error.is_unavailable() => {
                tracing::error!(model = %model.id, %error, "inference engine unavailable");
                self.capability_state = CapabilityState::Unavailable;
                self.session.input_locked = true;
                self.selected_model = Some(model);
                self.surface.show_blocking_notice(UNAVAILABLE_MESSAGE);
                self.surface.set_status("Inference engine unavailable");
                Err(error).context(CapabilityUnavailableSnafu {
                    stage: "initialize-capability",
                })
            }
            Err(error) => {
                tracing::error!(model = %model.id, %error, "failed to initialize model");
                self.capability_state = CapabilityState::InitFailed;
                self.selected_model = Some(model.clone());
                self.surface.show_inline_error(INIT_FAILURE_MESSAGE);
                self.surface.set_status(&format!("{} failed to load", model.name));
                Err(error).context(CapabilityInitFailureSnafu {
                    stage: "initialize-capability",
                    model_id: model.id,
                })
            }
        }
    }

    fn build_request(&self, turn: TurnId, model: &Model) -> StreamRequest {
        let request =
            StreamRequest::new(turn, model.id.clone(), self.session.window.to_provider_messages());
        let request = match self.config.temperature {
            Some(temperature) => request.with_temperature(temperature),
            None => request,
        };
        match self.config.max_tokens {
            Some(max_tokens) => request.with_max_tokens(max_tokens),
            None => request,
        }
    }

    /// Races stream consumption against the request timeout.
    async fn run_turn(
        &mut self,
        capability: &dyn InferenceCapability,
        request: StreamRequest,
    ) -> ChatResult<StreamedReply> {
        let turn = request.turn;
        self.surface.begin_assistant_reply();

        let ProviderStreamHandle { stream, worker } =
            capability
                .stream_chat(request)
                .map_err(|error| {
                    StreamingFailureSnafu {
                        stage: "open-stream",
                        details: error.to_string(),
                    }
                    .build()
                })?;
        let _worker = WorkerGuard(tokio::spawn(worker));

        let timeout = self.config.request_timeout();
        // Losing the race drops the consumer and with it the event stream, so
        // nothing produced after the deadline reaches the display.
        tokio::select! {
            result = self.consume_stream(stream, turn) => result,
            () = tokio::time::sleep(timeout) => RequestTimeoutSnafu {
                stage: "await-stream",
                timeout,
            }
            .fail(),
        }
    }

    async fn consume_stream(
        &mut self,
        mut stream: ProviderEventStream,
        turn: TurnId,
    ) -> ChatResult<StreamedReply> {
        let mut renderer = StreamRenderer::new(
            self.config.render_interval(),
            self.config.scroll_interval(),
        );
        let mut stats = None;

        loop {
            let Some(event) = stream.recv().await else {
                return StreamingFailureSnafu {
                    stage: "consume-stream",
                    details: "stream closed before a terminal event".to_string(),
                }
                .fail();
            };
            if event.turn != turn || !self.session.phase.accepts_stream_event(turn) {
                tracing::debug!(event_turn = ?event.turn, ?turn, "ignoring stale stream event");
                continue;
            }

            match event.payload {
                StreamEventPayload::Delta(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    if matches!(self.session.phase, TurnPhase::AwaitingFirstToken(_)) {
                        self.transition(PhaseTransition::FirstToken(turn));
                        self.surface.set_status(self.session.phase.label());
                    }
                    let decision = renderer.push_delta(&delta, Instant::now());
                    if decision.render {
                        let fragment = self.markdown.preview(renderer.buffer());
                        self.surface.update_assistant_reply(&fragment);
                    }
                    if decision.scroll {
                        self.surface.scroll_to_bottom();
                    }
                }
                StreamEventPayload::Usage(report) => {
                    let turn_stats = ChatStats::from(report);
                    self.last_stats = Some(turn_stats);
                    self.surface.show_stats(&turn_stats);
                    stats = Some(turn_stats);
                }
                StreamEventPayload::Done => {
                    tracing::debug!(
                        ?turn,
                        deferred_render = renderer.has_deferred_render(),
                        "completion stream ended"
                    );
                    self.transition(PhaseTransition::StreamEnded(turn));
                    return Ok(StreamedReply {
                        text: renderer.finish(Instant::now()),
                        stats,
                    });
                }
                StreamEventPayload::Error(details) => {
                    return StreamingFailureSnafu {
                        stage: "consume-stream",
                        details,
                    }
                    .fail();
                }
            }
        }
    }

    async fn finish_turn(
        &mut self,
        turn: TurnId,
        result: ChatResult<StreamedReply>,
    ) -> TurnOutcome {
        let outcome = match result {
            Ok(reply) if reply.text.is_empty() => {
                tracing::warn!(?turn, "model returned an empty reply, nothing committed");
                self.surface.replace_assistant_reply(EMPTY_REPLY_MESSAGE);
                TurnOutcome::EmptyReply
            }
            Ok(StreamedReply { text, stats }) => {
                let fragment = self.markdown.render(&text);
                self.surface.update_assistant_reply(&fragment);
                self.surface.scroll_to_bottom();

                let message = Message::assistant(text.clone());
                if let Err(error) = self.store.append(message.to_entry()).await {
                    tracing::warn!(stage = error.stage(), %error, "failed to persist reply");
                }
                self.session.record_message(message);
                tracing::info!(?turn, chars = text.chars().count(), "chat turn completed");
                TurnOutcome::Completed { reply: text, stats }
            }
            Err(error @ ChatError::RequestTimeout { .. }) => {
                self.transition(PhaseTransition::TimeOut(turn));
                tracing::warn!(?turn, stage = error.stage(), %error, "chat turn timed out");
                self.surface.replace_assistant_reply(TIMEOUT_MESSAGE);
                TurnOutcome::TimedOut
            }
            Err(error) => {
                self.transition(PhaseTransition::Fail(turn));
                tracing::error!(?turn, stage = error.stage(), %error, "chat turn failed");
                self.surface.replace_assistant_reply(GENERIC_ERROR_MESSAGE);
                TurnOutcome::Failed
            }
        };
        self.surface.end_assistant_reply();
        outcome
    }

    fn exit_turn(&mut self) {
        if self.transition(PhaseTransition::Settle).is_none() {
            self.session.phase = TurnPhase::Idle;
        }
        self.surface.set_busy(false);
        self.surface
            .set_sending_enabled(!self.session.input_locked && self.capability.is_some());
        self.surface.focus_input();
        self.surface.set_status(&self.ready_status());
    }

    fn transition(&mut self, transition: PhaseTransition) -> Option<TurnPhase> {
        match self.session.apply_transition(transition) {
            Ok(phase) => Some(phase),
            Err(rejection) => {
                tracing::warn!(
                    ?transition,
                    ?rejection,
                    phase = ?self.session.phase,
                    "rejected phase transition"
                );
                None
            }
        }
    }

    fn display_message(&mut self, message: &Message) {
        match message.role {
            Role::User => self.surface.append_user_message(&message.content),
            Role::Assistant => {
                let fragment: Fragment = self.markdown.render(&message.content);
                self.surface.append_assistant_message(&fragment);
            }
        }
    }

    fn ready_status(&self) -> String {
        let model = self
            .selected_model
            .as_ref()
            .map_or("no model", |model| model.name.as_str());
        format!(
            "{} · {} · {}/{} requests",
            self.session.phase.label(),
            model,
            self.session.requests.value(),
            self.config.daily_request_quota
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use std::sync::atomic::{AtomicBool, Ordering};

    use murmur_llm::{ProviderResult, StreamEventMapped, UsageReport, make_event_stream};
    use murmur_storage::{
        BoxFuture, ConversationStore, MemoryStore, MessageEntry, StorageError, StorageResult,
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::ModelSettings;
    use crate::error::CLEAR_FAILURE_MESSAGE;
    use crate::surface::{RecordingSurface, SurfaceEvent};

    const DEFAULT_MODEL: &str = "tiny";
    const OTHER_MODEL: &str = "small";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum InitBehavior {
        Ready,
        Unavailable,
        NotServed,
    }

    #[derive(Debug, Clone)]
    struct Script {
        events: Vec<StreamEventPayload>,
        step: Duration,
        /// Keep the stream open after the scripted events until cancelled.
        hang: bool,
    }

    impl Script {
        fn reply(events: Vec<StreamEventPayload>) -> Self {
            Self {
                events,
                step: Duration::ZERO,
                hang: false,
            }
        }
    }

    #[derive(Default)]
    struct Probe {
        created: Mutex<Vec<String>>,
        requests: Mutex<Vec<StreamRequest>>,
    }

    struct ScriptedCapability {
        model: Model,
        init: InitBehavior,
        scripts: Arc<Mutex<Vec<Script>>>,
        probe: Arc<Probe>,
    }

    impl InferenceCapability for ScriptedCapability {
        fn id(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &Model {
            &self.model
        }

        fn initialize<'a>(&'a self) -> murmur_llm::BoxFuture<'a, ProviderResult<()>> {
            Box::pin(async move {
                match self.init {
                    InitBehavior::Ready => Ok(()),
                    InitBehavior::Unavailable => murmur_llm::CapabilityUnavailableSnafu {
                        stage: "test-init",
                        details: "connection refused".to_string(),
                    }
                    .fail(),
                    InitBehavior::NotServed => murmur_llm::ModelNotServedSnafu {
                        stage: "test-init",
                        model_id: self.model.id.clone(),
                    }
                    .fail(),
                }
            })
        }

        fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
            let turn = request.turn;
            self.probe.requests.lock().unwrap().push(request);
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() {
                    Script::reply(vec![StreamEventPayload::Done])
                } else {
                    scripts.remove(0)
                }
            };

            let (event_tx, stream, cancel_rx) = make_event_stream(turn);
            let worker = Box::pin(async move {
                for payload in script.events {
                    if !script.step.is_zero() {
                        tokio::time::sleep(script.step).await;
                    }
                    if event_tx.send(StreamEventMapped { turn, payload }).is_err() {
                        return;
                    }
                }
                if script.hang {
                    let _ = cancel_rx.await;
                }
            });
            Ok(ProviderStreamHandle { stream, worker })
        }
    }

    struct ScriptedFactory {
        init: HashMap<String, InitBehavior>,
        scripts: Arc<Mutex<Vec<Script>>>,
        probe: Arc<Probe>,
    }

    impl CapabilityFactory for ScriptedFactory {
        fn create(&self, model: &Model) -> ProviderResult<Arc<dyn InferenceCapability>> {
            self.probe.created.lock().unwrap().push(model.id.clone());
            Ok(Arc::new(ScriptedCapability {
                model: model.clone(),
                init: self
                    .init
                    .get(&model.id)
                    .copied()
                    .unwrap_or(InitBehavior::Ready),
                scripts: Arc::clone(&self.scripts),
                probe: Arc::clone(&self.probe),
            }))
        }
    }

    struct Harness {
        chat: ChatOrchestrator<RecordingSurface>,
        store: Arc<MemoryStore>,
        scripts: Arc<Mutex<Vec<Script>>>,
        probe: Arc<Probe>,
    }

    impl Harness {
        fn new(config: ChatConfig) -> Self {
            Self::with_init(config, HashMap::new(), Arc::new(MemoryStore::new(None)))
        }

        fn with_init(
            config: ChatConfig,
            init: HashMap<String, InitBehavior>,
            store: Arc<MemoryStore>,
        ) -> Self {
            Self::with_log(config, init, MessageLog::new(store.clone()), store)
        }

        /// `log` may wrap `store`; `stored()` always reads `store`.
        fn with_log(
            config: ChatConfig,
            init: HashMap<String, InitBehavior>,
            log: MessageLog,
            store: Arc<MemoryStore>,
        ) -> Self {
            let scripts = Arc::new(Mutex::new(Vec::new()));
            let probe = Arc::new(Probe::default());
            let factory = ScriptedFactory {
                init,
                scripts: Arc::clone(&scripts),
                probe: Arc::clone(&probe),
            };
            let chat =
                ChatOrchestrator::new(config, log, Arc::new(factory), RecordingSurface::new());
            Self {
                chat,
                store,
                scripts,
                probe,
            }
        }

        fn script(&self, script: Script) {
            self.scripts.lock().unwrap().push(script);
        }

        async fn stored(&self) -> Vec<MessageEntry> {
            self.store.load_all().await.unwrap()
        }

        fn request_count(&self) -> usize {
            self.probe.requests.lock().unwrap().len()
        }
    }

    /// Working backend whose writes can be switched to fail.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        fail_append: AtomicBool,
        fail_clear: AtomicBool,
    }

    impl FlakyStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                fail_append: AtomicBool::new(false),
                fail_clear: AtomicBool::new(false),
            }
        }

        fn rejection(stage: &'static str) -> StorageError {
            StorageError::CorruptHistory {
                stage,
                details: "disk is read-only".to_string(),
            }
        }
    }

    impl ConversationStore for FlakyStore {
        fn append<'a>(&'a self, entry: MessageEntry) -> BoxFuture<'a, StorageResult<()>> {
            Box::pin(async move {
                if self.fail_append.load(Ordering::SeqCst) {
                    return Err(Self::rejection("test-append"));
                }
                self.inner.append(entry).await
            })
        }

        fn load_all<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<MessageEntry>>> {
            self.inner.load_all()
        }

        fn clear<'a>(&'a self) -> BoxFuture<'a, StorageResult<()>> {
            Box::pin(async move {
                if self.fail_clear.load(Ordering::SeqCst) {
                    return Err(Self::rejection("test-clear"));
                }
                self.inner.clear().await
            })
        }
    }

    fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
        let store = Arc::new(MemoryStore::new(None));
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let harness = Harness::with_log(
            test_config(),
            HashMap::new(),
            MessageLog::new(flaky.clone()),
            store,
        );
        (harness, flaky)
    }

    fn test_config() -> ChatConfig {
        ChatConfig {
            models: vec![
                ModelSettings {
                    id: DEFAULT_MODEL.to_string(),
                    name: Some("Tiny".to_string()),
                    description: None,
                },
                ModelSettings {
                    id: OTHER_MODEL.to_string(),
                    name: Some("Small".to_string()),
                    description: None,
                },
            ],
            default_model: DEFAULT_MODEL.to_string(),
            ..ChatConfig::default()
        }
        .normalized()
    }

    fn window_contents(chat: &ChatOrchestrator<RecordingSurface>) -> Vec<(Role, String)> {
        chat.session()
            .window
            .iter()
            .map(|message| (message.role, message.content.clone()))
            .collect()
    }

    fn delta(text: &str) -> StreamEventPayload {
        StreamEventPayload::Delta(text.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn hello_turn_streams_renders_and_commits() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();
        harness.script(Script::reply(vec![
            delta("Hi"),
            delta(" there"),
            StreamEventPayload::Usage(
                UsageReport::new(12, 2)
                    .with_timing(Some(Duration::from_millis(500)), None),
            ),
            StreamEventPayload::Done,
        ]));

        let outcome = harness.chat.send("Hello").await.unwrap();

        let stats = ChatStats {
            prompt_tokens: 12,
            completion_tokens: 2,
            prefill_speed: Some(24.0),
            decoding_speed: None,
        };
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                reply: "Hi there".to_string(),
                stats: Some(stats),
            }
        );
        assert_eq!(
            harness.stored().await,
            vec![MessageEntry::user("Hello"), MessageEntry::assistant("Hi there")]
        );
        assert_eq!(
            window_contents(&harness.chat),
            vec![
                (Role::User, "Hello".to_string()),
                (Role::Assistant, "Hi there".to_string())
            ]
        );

        let surface = harness.chat.surface();
        let updates = surface.reply_updates();
        assert_eq!(
            updates.last().map(|fragment| fragment.to_html()),
            Some("<p>Hi there</p>".to_string())
        );
        // Both deltas arrive within one render interval.
        assert_eq!(updates.len(), 2);
        assert_eq!(surface.last_stats(), Some(&stats));
        assert_eq!(
            surface.last_stats().map(ToString::to_string),
            Some("prompt 12 · completion 2 · total 14 · prefill 24.0 tok/s · decoding —".to_string())
        );
        assert!(surface.contains(&SurfaceEvent::Busy(true)));
        assert_eq!(
            surface.events().iter().rev().find(|event| matches!(event, SurfaceEvent::Busy(_))),
            Some(&SurfaceEvent::Busy(false))
        );
        assert_eq!(harness.chat.session().phase, TurnPhase::Idle);
        assert_eq!(harness.chat.session().requests.value(), 1);

        let requests = harness.probe.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].include_usage);
        assert_eq!(requests[0].model_id, DEFAULT_MODEL);
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].content, "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn over_long_message_is_rejected_without_side_effects() {
        let config = ChatConfig {
            max_message_length: 5,
            ..test_config()
        };
        let mut harness = Harness::new(config);
        harness.chat.initialize().await.unwrap();
        harness.chat.surface_mut().take_events();

        let error = harness
            .chat
            .dispatch(Command::Send("toolong".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(error, ChatError::Validation { .. }));
        assert!(harness.stored().await.is_empty());
        assert_eq!(harness.request_count(), 0);
        assert_eq!(harness.chat.session().requests.value(), 0);
        assert!(harness.chat.session().window.is_empty());
        assert_eq!(
            harness.chat.surface().events(),
            &[SurfaceEvent::InlineError(
                "Message is too long (7 characters, limit is 5).".to_string()
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_discards_partial_reply() {
        let config = ChatConfig {
            request_timeout_secs: 5,
            ..test_config()
        };
        let mut harness = Harness::new(config);
        harness.chat.initialize().await.unwrap();
        harness.script(Script {
            events: vec![delta("Once"), delta(" upon"), delta(" a")],
            step: Duration::from_millis(10),
            hang: true,
        });

        let started = Instant::now();
        let outcome = harness.chat.send("Tell me a story").await.unwrap();

        assert_eq!(outcome, TurnOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(
            harness.stored().await,
            vec![MessageEntry::user("Tell me a story")]
        );
        assert_eq!(
            window_contents(&harness.chat),
            vec![(Role::User, "Tell me a story".to_string())]
        );

        let surface = harness.chat.surface();
        assert!(surface.contains(&SurfaceEvent::ReplaceReply(TIMEOUT_MESSAGE.to_string())));
        assert!(!surface.contains(&SurfaceEvent::ReplaceReply(
            GENERIC_ERROR_MESSAGE.to_string()
        )));
        assert_eq!(
            surface.events().last(),
            Some(&SurfaceEvent::Status(harness.chat.ready_status()))
        );
        assert!(surface.contains(&SurfaceEvent::SendingEnabled(true)));
        assert_eq!(harness.chat.session().phase, TurnPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn model_switch_clears_window_but_keeps_store_and_quota() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();
        harness.script(Script::reply(vec![delta("Hi"), StreamEventPayload::Done]));
        harness.chat.send("Hello").await.unwrap();

        let outcome = harness
            .chat
            .dispatch(Command::SelectModel(OTHER_MODEL.to_string()))
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::ModelSelected(OTHER_MODEL.to_string()));
        assert!(harness.chat.session().window.is_empty());
        assert_eq!(harness.stored().await.len(), 2);
        assert_eq!(harness.chat.session().requests.value(), 1);
        assert_eq!(
            harness.chat.selected_model().map(|model| model.id.as_str()),
            Some(OTHER_MODEL)
        );
        assert_eq!(
            *harness.probe.created.lock().unwrap(),
            vec![DEFAULT_MODEL.to_string(), OTHER_MODEL.to_string()]
        );

        harness.chat.send("Again").await.unwrap();
        let requests = harness.probe.requests.lock().unwrap();
        assert_eq!(requests[1].model_id, OTHER_MODEL);
        assert_eq!(requests[1].messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_model_is_rejected() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();

        let error = harness
            .chat
            .dispatch(Command::SelectModel("huge".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(error, ChatError::UnknownModel { .. }));
        assert_eq!(*harness.probe.created.lock().unwrap(), vec![DEFAULT_MODEL.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_blocks_further_sends() {
        let config = ChatConfig {
            daily_request_quota: 1,
            ..test_config()
        };
        let mut harness = Harness::new(config);
        harness.chat.initialize().await.unwrap();
        harness.script(Script::reply(vec![delta("ok"), StreamEventPayload::Done]));
        harness.chat.send("first").await.unwrap();

        let error = harness.chat.send("second").await.unwrap_err();

        assert!(matches!(error, ChatError::QuotaExceeded { .. }));
        assert_eq!(harness.stored().await.len(), 2);
        assert_eq!(harness.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_shows_generic_notice_and_commits_nothing() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();
        harness.script(Script::reply(vec![
            delta("partial"),
            StreamEventPayload::Error("kv cache exhausted".to_string()),
        ]));

        let outcome = harness.chat.send("Hello").await.unwrap();

        assert_eq!(outcome, TurnOutcome::Failed);
        assert_eq!(harness.stored().await, vec![MessageEntry::user("Hello")]);
        let surface = harness.chat.surface();
        assert!(surface.contains(&SurfaceEvent::ReplaceReply(GENERIC_ERROR_MESSAGE.to_string())));
        let leaks_cause = |event: &SurfaceEvent| {
            matches!(event, SurfaceEvent::InlineError(text) if text.contains("kv cache"))
        };
        assert!(!surface.events().iter().any(leaks_cause));
        assert_eq!(harness.chat.session().phase, TurnPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_closing_without_terminal_event_fails_turn() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();
        harness.script(Script::reply(vec![delta("cut")]));

        let outcome = harness.chat.send("Hello").await.unwrap();

        assert_eq!(outcome, TurnOutcome::Failed);
        assert_eq!(window_contents(&harness.chat).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_commits_nothing() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();
        harness.script(Script::reply(vec![StreamEventPayload::Done]));

        let outcome = harness.chat.send("Hello").await.unwrap();

        assert_eq!(outcome, TurnOutcome::EmptyReply);
        assert_eq!(harness.stored().await, vec![MessageEntry::user("Hello")]);
        assert_eq!(window_contents(&harness.chat).len(), 1);
        assert!(
            harness
                .chat
                .surface()
                .contains(&SurfaceEvent::ReplaceReply(EMPTY_REPLY_MESSAGE.to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn whitespace_reply_is_still_committed() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();
        harness.script(Script::reply(vec![delta("\n\n"), StreamEventPayload::Done]));

        let outcome = harness.chat.send("Hello").await.unwrap();

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                reply: "\n\n".to_string(),
                stats: None,
            }
        );
        assert_eq!(
            harness.stored().await,
            vec![MessageEntry::user("Hello"), MessageEntry::assistant("\n\n")]
        );
        assert_eq!(window_contents(&harness.chat).len(), 2);
        assert!(
            !harness
                .chat
                .surface()
                .contains(&SurfaceEvent::ReplaceReply(EMPTY_REPLY_MESSAGE.to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_deltas_still_end_with_full_render() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();
        let mut events = (0..20).map(|index| delta(&format!("w{index} "))).collect::<Vec<_>>();
        events.push(StreamEventPayload::Done);
        harness.script(Script::reply(events));

        harness.chat.send("Count").await.unwrap();

        let updates = harness.chat.surface().reply_updates();
        let expected = (0..20).map(|index| format!("w{index} ")).collect::<String>();
        assert!(updates.len() < 20);
        assert_eq!(
            updates.last().map(|fragment| fragment.text_content()),
            Some(expected.trim_end().to_string())
        );
        // Partial buffers are previewed, only the final text is cached.
        assert!(harness.chat.markdown.contains(&expected));
        assert!(!harness.chat.markdown.contains("w0 "));
        assert_eq!(harness.chat.markdown.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_engine_locks_input() {
        let init = HashMap::from([(DEFAULT_MODEL.to_string(), InitBehavior::Unavailable)]);
        let mut harness =
            Harness::with_init(test_config(), init, Arc::new(MemoryStore::new(None)));

        let error = harness.chat.initialize().await.unwrap_err();
        assert!(matches!(error, ChatError::CapabilityUnavailable { .. }));
        assert_eq!(harness.chat.capability_state(), CapabilityState::Unavailable);
        assert!(
            harness
                .chat
                .surface()
                .contains(&SurfaceEvent::BlockingNotice(UNAVAILABLE_MESSAGE.to_string()))
        );

        harness.chat.dispatch(Command::DismissNotice).await.unwrap();
        let error = harness.chat.send("Hello").await.unwrap_err();
        assert!(matches!(error, ChatError::InputLocked { .. }));
        let error = harness
            .chat
            .select_model(OTHER_MODEL)
            .await
            .unwrap_err();
        assert!(matches!(error, ChatError::InputLocked { .. }));
        assert!(harness.stored().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn init_failure_allows_switching_models() {
        let init = HashMap::from([(DEFAULT_MODEL.to_string(), InitBehavior::NotServed)]);
        let mut harness =
            Harness::with_init(test_config(), init, Arc::new(MemoryStore::new(None)));

        let error = harness.chat.initialize().await.unwrap_err();
        assert!(matches!(error, ChatError::CapabilityInitFailure { .. }));
        assert!(
            harness
                .chat
                .surface()
                .contains(&SurfaceEvent::InlineError(INIT_FAILURE_MESSAGE.to_string()))
        );
        let error = harness.chat.send("Hello").await.unwrap_err();
        assert!(matches!(error, ChatError::CapabilityNotReady { .. }));

        harness.chat.select_model(OTHER_MODEL).await.unwrap();
        assert_eq!(harness.chat.capability_state(), CapabilityState::Ready);
        harness.script(Script::reply(vec![delta("Hi"), StreamEventPayload::Done]));
        assert!(matches!(
            harness.chat.send("Hello").await.unwrap(),
            TurnOutcome::Completed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_restores_history_and_seeds_trimmed_window() {
        let store = Arc::new(MemoryStore::new(None));
        store.append(MessageEntry::user("one")).await.unwrap();
        store.append(MessageEntry::assistant("**two**")).await.unwrap();
        store.append(MessageEntry::user("three")).await.unwrap();
        let config = ChatConfig {
            max_history: 2,
            ..test_config()
        };
        let mut harness = Harness::with_init(config, HashMap::new(), store);

        harness.chat.initialize().await.unwrap();

        assert_eq!(
            window_contents(&harness.chat),
            vec![
                (Role::Assistant, "**two**".to_string()),
                (Role::User, "three".to_string())
            ]
        );
        let surface = harness.chat.surface();
        assert!(surface.contains(&SurfaceEvent::UserMessage("one".to_string())));
        let bold_two = "<p><strong>two</strong></p>";
        assert!(surface.events().iter().any(|event| matches!(
            event,
            SurfaceEvent::AssistantMessage(fragment) if fragment.to_html() == bold_two
        )));
        assert!(surface.contains(&SurfaceEvent::SendingEnabled(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_history_requires_confirmation() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();
        harness.script(Script::reply(vec![delta("Hi"), StreamEventPayload::Done]));
        harness.chat.send("Hello").await.unwrap();

        assert_eq!(
            harness.chat.dispatch(Command::ConfirmClearHistory).await.unwrap(),
            CommandOutcome::NothingToConfirm
        );
        assert_eq!(
            harness.chat.dispatch(Command::ClearHistory).await.unwrap(),
            CommandOutcome::NeedsConfirmation
        );
        assert_eq!(harness.stored().await.len(), 2);

        assert_eq!(
            harness.chat.dispatch(Command::ConfirmClearHistory).await.unwrap(),
            CommandOutcome::HistoryCleared
        );
        assert!(harness.stored().await.is_empty());
        assert!(harness.chat.session().window.is_empty());
        assert!(harness.chat.surface().contains(&SurfaceEvent::ClearMessages));
    }

    #[tokio::test(start_paused = true)]
    async fn other_commands_cancel_a_pending_clear() {
        let mut harness = Harness::new(test_config());
        harness.chat.initialize().await.unwrap();

        harness.chat.dispatch(Command::ClearHistory).await.unwrap();
        harness.chat.dispatch(Command::ListModels).await.unwrap();

        assert_eq!(
            harness.chat.dispatch(Command::ConfirmClearHistory).await.unwrap(),
            CommandOutcome::NothingToConfirm
        );
        assert!(harness.chat.surface().contains(&SurfaceEvent::Models {
            ids: vec![DEFAULT_MODEL.to_string(), OTHER_MODEL.to_string()],
            selected: Some(DEFAULT_MODEL.to_string()),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_store_keeps_chat_working() {
        let scripts = Arc::new(Mutex::new(vec![Script::reply(vec![
            delta("Hi"),
            StreamEventPayload::Done,
        ])]));
        let probe = Arc::new(Probe::default());
        let factory = ScriptedFactory {
            init: HashMap::new(),
            scripts,
            probe,
        };
        let mut chat = ChatOrchestrator::new(
            test_config(),
            MessageLog::unavailable(),
            Arc::new(factory),
            RecordingSurface::new(),
        );

        chat.initialize().await.unwrap();
        let outcome = chat.send("Hello").await.unwrap();

        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(chat.session().window.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_clear_keeps_window_and_display() {
        let (mut harness, flaky) = flaky_harness();
        harness.chat.initialize().await.unwrap();
        harness.script(Script::reply(vec![delta("Hi"), StreamEventPayload::Done]));
        harness.chat.send("Hello").await.unwrap();
        flaky.fail_clear.store(true, Ordering::SeqCst);
        harness.chat.surface_mut().take_events();

        harness.chat.dispatch(Command::ClearHistory).await.unwrap();
        let error = harness
            .chat
            .dispatch(Command::ConfirmClearHistory)
            .await
            .unwrap_err();

        assert!(matches!(error, ChatError::StorageUnavailable { .. }));
        assert_eq!(error.user_message(), CLEAR_FAILURE_MESSAGE);
        let surface = harness.chat.surface();
        assert!(surface.contains(&SurfaceEvent::InlineError(CLEAR_FAILURE_MESSAGE.to_string())));
        assert!(!surface.contains(&SurfaceEvent::ClearMessages));
        assert_eq!(
            window_contents(&harness.chat),
            vec![
                (Role::User, "Hello".to_string()),
                (Role::Assistant, "Hi".to_string())
            ]
        );
        assert_eq!(harness.stored().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_appends_do_not_abort_the_turn() {
        let (mut harness, flaky) = flaky_harness();
        harness.chat.initialize().await.unwrap();
        flaky.fail_append.store(true, Ordering::SeqCst);
        harness.script(Script::reply(vec![delta("Hi"), StreamEventPayload::Done]));

        let outcome = harness.chat.send("Hello").await.unwrap();

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                reply: "Hi".to_string(),
                stats: None,
            }
        );
        assert!(harness.stored().await.is_empty());
        assert_eq!(window_contents(&harness.chat).len(), 2);
        assert_eq!(harness.chat.session().phase, TurnPhase::Idle);
    }
}
