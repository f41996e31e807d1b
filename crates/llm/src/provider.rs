use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use super::model::Model;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub api_key: String,
}

impl ProviderConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
        }
    }
}

/// Identifies one generation request so events from an abandoned turn can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub turn: TurnId,
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Ask for the end-of-stream usage report.
    pub include_usage: bool,
}

impl StreamRequest {
    /// Streamed request that also asks for end-of-stream usage statistics.
    pub fn new(turn: TurnId, model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            turn,
            model_id: model_id.into(),
            messages,
            temperature: None,
            max_tokens: None,
            include_usage: true,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token accounting reported once per completed generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageReport {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Prompt tokens per second; `None` when the engine reported no timing.
    pub prefill_speed: Option<f64>,
    /// Generated tokens per second; `None` when the engine reported no timing.
    pub decoding_speed: Option<f64>,
}

impl UsageReport {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            prefill_speed: None,
            decoding_speed: None,
        }
    }

    /// Derives throughput from time-to-first-token and first-token-to-end durations.
    pub fn with_timing(mut self, prefill: Option<Duration>, decoding: Option<Duration>) -> Self {
        self.prefill_speed = tokens_per_second(self.prompt_tokens, prefill);
        self.decoding_speed = tokens_per_second(self.completion_tokens, decoding);
        self
    }
}

fn tokens_per_second(tokens: u64, elapsed: Option<Duration>) -> Option<f64> {
    let seconds = elapsed?.as_secs_f64();
    if tokens == 0 || seconds <= 0.0 {
        return None;
    }
    Some(tokens as f64 / seconds)
}

/// Provider-agnostic stream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventPayload {
    Delta(String),
    Usage(UsageReport),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEventMapped {
    pub turn: TurnId,
    pub payload: StreamEventPayload,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderError {
    #[snafu(display("missing API key for endpoint '{endpoint}'"))]
    MissingApiKey {
        stage: &'static str,
        endpoint: String,
    },
    #[snafu(display("inference engine is unavailable: {details}"))]
    CapabilityUnavailable {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("model '{model_id}' is not served by the inference engine"))]
    ModelNotServed {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("stream request for {turn:?} has no messages"))]
    EmptyMessageSet { stage: &'static str, turn: TurnId },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse model list: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl ProviderError {
    /// True when the engine itself is missing, as opposed to a model failing to load.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::CapabilityUnavailable { .. })
    }
}

pub struct ProviderEventStream {
    turn: TurnId,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        turn: TurnId,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            turn,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// A loaded model that can stream completions.
pub trait InferenceCapability: Send + Sync {
    fn id(&self) -> &str;
    fn model(&self) -> &Model;
    /// Loads or probes the model. Must succeed before `stream_chat` is used.
    fn initialize<'a>(&'a self) -> BoxFuture<'a, ProviderResult<()>>;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Builds a fresh capability for a model selection.
pub trait CapabilityFactory: Send + Sync {
    fn create(&self, model: &Model) -> ProviderResult<Arc<dyn InferenceCapability>>;
}

/// Channel triple for capability implementations: event sender, the
/// consumer-facing stream, and the cancel signal the worker should watch.
pub fn make_event_stream(
    turn: TurnId,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(turn, event_rx, cancel_tx),
        cancel_rx,
    )
}
