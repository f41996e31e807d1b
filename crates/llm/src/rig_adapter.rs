use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use rig::completion::{CompletionModel, GetTokenUsage, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use serde::Deserialize;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::model::Model;
use super::provider::{
    BoxFuture, CapabilityFactory, CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu,
    InferenceCapability, MissingApiKeySnafu, ModelFetchStatusSnafu, ModelNotServedSnafu,
    ModelPayloadParseSnafu, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped, StreamEventPayload,
    StreamRequest, TurnId, UsageReport, make_event_stream,
};

pub const RIG_LOCAL_CAPABILITY_ID: &str = "rig-openai-compatible";

// Local OpenAI-compatible servers serve `/chat/completions`, not `/responses`.
type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    openai::completion::streaming::StreamingCompletionResponse,
>;

/// Streams completions from a local OpenAI-compatible inference server.
pub struct RigCapability {
    config: ProviderConfig,
    model: Model,
}

impl RigCapability {
    pub fn new(config: ProviderConfig, model: Model) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-capability-new",
                endpoint: config.endpoint.clone(),
            }
        );

        Ok(Self { config, model })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn fetch_served_model_ids(&self) -> ProviderResult<Vec<String>> {
        let client = Self::build_client(&self.config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        // A failed send means nothing is listening: the engine itself is absent.
        let response = client
            .send(request)
            .await
            .map_err(|source| ProviderError::CapabilityUnavailable {
                stage: "send-model-request",
                details: source.to_string(),
            })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        parse_served_model_ids(&payload)
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let (history, prompt) = match request.messages.split_last() {
            Some((prompt, history)) => (history, Self::to_rig_message(prompt)),
            None => {
                return EmptyMessageSetSnafu {
                    stage: "open-stream-split-prompt",
                    turn: request.turn,
                }
                .fail();
            }
        };

        let client = Self::build_client(config)?.completions_api();
        let completion = client
            .completion_model(request.model_id.clone())
            .completion_request(prompt)
            .messages(history.iter().map(Self::to_rig_message).collect::<Vec<_>>());
        let completion = match request.temperature {
            Some(temperature) => completion.temperature(temperature),
            None => completion,
        };
        let completion = match request.max_tokens {
            Some(max_tokens) => completion.max_tokens(max_tokens),
            None => completion,
        };

        completion.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn send_failure(
        events: &mpsc::UnboundedSender<StreamEventMapped>,
        turn: TurnId,
        error: &ProviderError,
    ) {
        let _ = events.send(StreamEventMapped {
            turn,
            payload: StreamEventPayload::Error(error.to_string()),
        });
    }

    fn map_stream_item<R>(
        turn: TurnId,
        item: StreamedAssistantContent<R>,
        include_usage: bool,
        timing: &mut StreamTiming,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin + GetTokenUsage,
    {
        let payload = match item {
            StreamedAssistantContent::Text(text) => {
                if text.text.is_empty() {
                    return None;
                }
                timing.mark_first_token();
                StreamEventPayload::Delta(text.text)
            }
            StreamedAssistantContent::Final(response) => {
                let usage = response.token_usage()?;
                usage_payload(include_usage, usage.input_tokens, usage.output_tokens, timing)?
            }
            // Reasoning traces and tool calls are not part of the displayed reply.
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. } => return None,
        };

        Some(StreamEventMapped { turn, payload })
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        events: mpsc::UnboundedSender<StreamEventMapped>,
        cancel_rx: oneshot::Receiver<()>,
    ) {
        let turn = request.turn;
        let timing = StreamTiming::start();
        let stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    ?turn,
                    endpoint = %config.endpoint,
                    model_id = %request.model_id,
                    %error,
                    "failed to open completion stream"
                );
                Self::send_failure(&events, turn, &error);
                return;
            }
        };

        let end = Self::pump_stream(
            turn,
            request.include_usage,
            stream,
            timing,
            &events,
            cancel_rx,
        )
        .await;
        tracing::debug!(?turn, ?end, "completion stream finished");
        if end == StreamEnd::Exhausted {
            let _ = events.send(StreamEventMapped {
                turn,
                payload: StreamEventPayload::Done,
            });
        }
    }

    /// Forwards mapped chunks until the stream ends, fails or is cancelled.
    async fn pump_stream(
        turn: TurnId,
        include_usage: bool,
        mut stream: RigStreamingResponse,
        mut timing: StreamTiming,
        events: &mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) -> StreamEnd {
        loop {
            let item = tokio::select! {
                _ = &mut cancel_rx => {
                    stream.cancel();
                    return StreamEnd::Cancelled;
                }
                item = stream.next() => item,
            };

            match item {
                None => return StreamEnd::Exhausted,
                Some(Err(source)) => {
                    let error = ProviderError::CompletionsFailed {
                        stage: "stream-chunk",
                        source,
                    };
                    tracing::warn!(?turn, %error, "completion stream failed mid-reply");
                    Self::send_failure(events, turn, &error);
                    return StreamEnd::Failed;
                }
                Some(Ok(chunk)) => {
                    let mapped = Self::map_stream_item(turn, chunk, include_usage, &mut timing);
                    let Some(mapped) = mapped else {
                        continue;
                    };
                    if events.send(mapped).is_err() {
                        return StreamEnd::ReceiverGone;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Exhausted,
    Cancelled,
    Failed,
    ReceiverGone,
}

impl InferenceCapability for RigCapability {
    fn id(&self) -> &str {
        RIG_LOCAL_CAPABILITY_ID
    }

    fn model(&self) -> &Model {
        &self.model
    }

    fn initialize<'a>(&'a self) -> BoxFuture<'a, ProviderResult<()>> {
        Box::pin(async move {
            let served = self.fetch_served_model_ids().await?;
            ensure!(
                served.iter().any(|id| *id == self.model.id),
                ModelNotServedSnafu {
                    stage: "initialize-check-model",
                    model_id: self.model.id.clone(),
                }
            );

            tracing::info!(
                endpoint = %self.config.endpoint,
                model_id = %self.model.id,
                served_model_count = served.len(),
                "inference capability ready"
            );
            Ok(())
        })
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                turn: request.turn,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.turn);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

/// Builds [`RigCapability`] instances against one configured endpoint.
#[derive(Debug, Clone)]
pub struct RigCapabilityFactory {
    config: ProviderConfig,
}

impl RigCapabilityFactory {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

impl CapabilityFactory for RigCapabilityFactory {
    fn create(&self, model: &Model) -> ProviderResult<Arc<dyn InferenceCapability>> {
        Ok(Arc::new(RigCapability::new(
            self.config.clone(),
            model.clone(),
        )?))
    }
}

/// Wall-clock markers used to derive prefill and decoding throughput.
struct StreamTiming {
    opened_at: Instant,
    first_token_at: Option<Instant>,
}

impl StreamTiming {
    fn start() -> Self {
        Self {
            opened_at: Instant::now(),
            first_token_at: None,
        }
    }

    fn mark_first_token(&mut self) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
    }

    fn prefill(&self) -> Option<std::time::Duration> {
        self.first_token_at
            .map(|first| first.duration_since(self.opened_at))
    }

    fn decoding(&self) -> Option<std::time::Duration> {
        self.first_token_at.map(|first| first.elapsed())
    }
}

/// Usage the caller asked for, with throughput derived from stream timing.
fn usage_payload(
    include_usage: bool,
    prompt_tokens: u64,
    completion_tokens: u64,
    timing: &StreamTiming,
) -> Option<StreamEventPayload> {
    include_usage.then(|| {
        StreamEventPayload::Usage(
            UsageReport::new(prompt_tokens, completion_tokens)
                .with_timing(timing.prefill(), timing.decoding()),
        )
    })
}

#[derive(Debug, Deserialize)]
struct ModelListPayload {
    #[serde(default)]
    data: Vec<ServedModel>,
}

#[derive(Debug, Deserialize)]
struct ServedModel {
    id: String,
}

/// Reads an OpenAI-style `/models` listing into sorted, unique ids.
fn parse_served_model_ids(payload: &str) -> ProviderResult<Vec<String>> {
    let listing = serde_json::from_str::<ModelListPayload>(payload).map_err(|source| {
        ProviderError::ModelPayloadParse {
            stage: "parse-model-response",
            details: source.to_string(),
        }
    })?;

    let mut ids = listing
        .data
        .into_iter()
        .map(|model| model.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    ensure!(
        !ids.is_empty(),
        ModelPayloadParseSnafu {
            stage: "parse-model-response",
            details: "engine reported no served models".to_string(),
        }
    );
    Ok(ids)
}
