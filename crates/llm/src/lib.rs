mod model;
mod provider;
mod rig_adapter;

pub use model::{DEFAULT_LOCAL_MODEL, Model, ModelWhitelist, default_local_models};
pub use provider::{
    BoxFuture, CapabilityFactory, CapabilityUnavailableSnafu, InferenceCapability,
    ModelNotServedSnafu, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEventMapped,
    StreamEventPayload, StreamRequest, TurnId, UsageReport, make_event_stream,
};
pub use rig_adapter::{RIG_LOCAL_CAPABILITY_ID, RigCapability, RigCapabilityFactory};
