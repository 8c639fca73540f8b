//! Coordination core for collaborative crop-disease diagnosis sessions.
//!
//! Three components, leaves first:
//! - [`registry`]: session lifecycle, participant roster, and the
//!   append-only recommendation/annotation log.
//! - [`broadcast`]: fans workspace updates out to connected participants.
//! - [`signaling`]: network-quality classification and relay of peer
//!   connection-negotiation payloads, with timeout-driven fallback.
//!
//! Sessions are in-memory, process-lifetime state. Every mutation of one
//! session is serialized by that session's lock; sessions on different
//! shards never contend.

pub mod broadcast;
pub mod error;
pub mod models;
pub mod registry;
pub mod signaling;

pub use broadcast::{DeliverySnapshot, DeliveryStats, WorkspaceBroadcaster};
pub use error::{RegistryError, SignalingError};
pub use models::{
    Participant, Recommendation, Role, SessionEvent, SessionSnapshot, SessionStatus,
    SessionSummary, WorkspaceEvent, WorkspaceEventKind,
};
pub use registry::{Outbox, RegistryConfig, SessionRegistry, new_session_id};
pub use signaling::{
    CoordinatorMetrics, CoordinatorSnapshot, FallbackOption, MediaProfile, MediaSettings,
    NegotiationState, NetworkQuality, QualityLevel, QualityTier, SignalPayload, SignalingConfig,
    SignalingCoordinator, assess, classify,
};
