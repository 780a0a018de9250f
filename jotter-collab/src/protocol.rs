//! Binary wire protocol for the collaborative session.
//!
//! Wire format (bincode-encoded `WireMessage`):
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ variant │ payload                                      │
//! │ tag     │ (varies: token, client id, CRDT update, slot)│
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The session is joined by sending [`WireMessage::Hello`] with a bearer
//! credential. The server answers with [`WireMessage::Welcome`] carrying the
//! ephemeral per-connection identifier that keys this peer's awareness slot.
//! That identifier is NOT the application user id — two tabs of the same user
//! hold two distinct slots.

use serde::{Deserialize, Serialize};

/// Graceful close. Never surfaced as an error.
pub const CLOSE_NORMAL: u16 = 1000;
/// Non-graceful termination without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// The server rejected the session credential.
pub const CLOSE_AUTH_FAILED: u16 = 4401;

/// Per-peer awareness payload, the `user` field of a slot.
///
/// All fields are tolerated missing: peers occasionally publish a bare slot
/// before their profile is loaded, and the presence layer substitutes safe
/// defaults rather than dropping them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserState {
    /// Display name.
    pub name: Option<String>,
    /// Any valid CSS color token, e.g. `hsl(120, 70%, 60%)`.
    pub color: Option<String>,
    /// Avatar URL.
    pub avatar: Option<String>,
    /// Last interaction timestamp, epoch milliseconds (wall clock, so that
    /// idle classification agrees across peers without a central clock).
    pub last_activity: Option<u64>,
}

/// One slot of the awareness channel.
///
/// A slot with `user: None` belongs to a peer whose session is open but which
/// has not yet published its identity; presence excludes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerSlot {
    pub user: Option<UserState>,
}

/// Top-level protocol message, bincode-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Client → server: join the named session with a bearer credential.
    Hello { token: String, session: String },
    /// Server → client: handshake accepted, slot identifier assigned.
    Welcome { client_id: u64 },
    /// Client → server: request the history diff against our state vector.
    SyncRequest { state_vector: Vec<u8> },
    /// Server → client: history replay. Receipt marks the session synced.
    SyncReply { update: Vec<u8> },
    /// Incremental CRDT update, either direction.
    Update { update: Vec<u8> },
    /// Overwrite of a single awareness slot.
    AwarenessWrite { client_id: u64, user: UserState },
    /// Server-driven slot removal when a peer disconnects.
    AwarenessClear { client_id: u64 },
    /// Server → client on join: current contents of the channel.
    AwarenessSnapshot { slots: Vec<(u64, Option<UserState>)> },
}

impl WireMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
