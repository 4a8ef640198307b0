//! Channel webhook ingestion for public-platform messaging accounts.
//!
//! Covers envelope authentication and decoding, multi-account path routing, delivery
//! dedup, inbound debounce, and the post-response pipeline that resolves access and
//! hands messages to the agent runtime.

pub mod account;
pub mod agent_dispatch;
pub mod channel_api;
pub mod debounce;
pub mod dedup;
pub mod envelope;
pub mod envelope_crypto;
pub mod pending_media;
pub mod pipeline;
pub mod routing;

pub use account::{
    resolve_accounts, ChannelAccountConfig, ResolvedAccount, SharedAccount, UnpairedPolicy,
};
pub use agent_dispatch::{
    AgentDispatchRequest, AgentDispatcher, HttpAgentDispatcher, NoopAgentDispatcher,
};
pub use channel_api::{ChannelApiClient, ChannelApiError, ChannelReplySender};
pub use debounce::{DebounceSink, DebouncedBatch, DebouncerRegistry, InboundDebouncer};
pub use dedup::MessageDeduplicator;
pub use envelope::{open_envelope, verify_handshake, EnvelopeError, InboundEvent, WebhookQuery};
pub use envelope_crypto::{compute_signature, EnvelopeCipher};
pub use pending_media::{PendingImage, PendingImageStore};
pub use pipeline::{ChannelPipeline, PipelineDependencies};
pub use routing::{
    normalize_webhook_path, select_handshake_target, select_post_target, RouteMatch,
    WebhookTarget, WebhookTargetRegistry,
};
