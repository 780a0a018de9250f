//! # jotter-collab — Real-time collaboration layer for Jotter notes
//!
//! Per-note multiplayer sessions: CRDT document sync over WebSocket plus an
//! ephemeral awareness channel driving the collaborator presence list.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   WebSocket    ┌──────────────┐
//! │ ConnectionSupervisor │ ◄─────────────► │ collab server│
//! │ (one per open note)  │  Binary Proto   └──────────────┘
//! └──────┬───────────────┘
//!        │ owns
//!        ├────────────────────┐
//!        ▼                    ▼
//! ┌──────────────┐    ┌──────────────────┐
//! │DocumentHandle│    │ AwarenessChannel │◄── ActivityBroadcaster
//! │ (yrs Doc)    │    │ (peer slots)     │     (local throttle)
//! └──────────────┘    └──────┬───────────┘
//!                            │ change notifications
//!                            ▼
//!                  ┌───────────────────┐
//!                  │ PresenceProjector │──► watch<PresenceView>
//!                  └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`document`] — yrs document handles and the refcounted arena
//! - [`identity`] — user identity and the [`IdentityProvider`] seam
//! - [`transport`] — pluggable transport, WebSocket by default
//! - [`awareness`] — per-peer slot map shared by session and presence
//! - [`activity`] — throttled local activity writes
//! - [`presence`] — projection of slots into a sorted collaborator list
//! - [`session`] — connection lifecycle supervision
//!
//! Connection outcomes are observable, not returned: `connect()` starts an
//! attempt and the result arrives as state changes and events. Nothing in
//! this crate retries a failed connection on its own.

pub mod activity;
pub mod awareness;
pub mod document;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use activity::{ActivityBroadcaster, RateLimiter, DEFAULT_ACTIVITY_INTERVAL};
pub use awareness::AwarenessChannel;
pub use document::{DocumentArena, DocumentError, DocumentHandle};
pub use identity::{IdentityProvider, StaticIdentity, UserIdentity};
pub use presence::{
    PresenceEntry, PresenceProjector, PresenceView, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_RECHECK_INTERVAL,
};
pub use protocol::{PeerSlot, ProtocolError, UserState, WireMessage};
pub use session::{
    ConnectionState, ConnectionSupervisor, SessionConfig, SessionError, SessionEvent,
};
pub use transport::{
    SessionTransport, TransportError, TransportEvent, TransportLink, WebSocketTransport,
};
