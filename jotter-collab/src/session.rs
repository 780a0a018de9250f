//! Connection supervision for one note's collaboration session.
//!
//! ```text
//! Disconnected ──connect() & authenticated──► Connecting
//! Connecting ──handshake ok──► Connected
//! Connected ──history replayed──► Synced
//! {Connecting, Connected, Synced}
//!     ──disconnect() │ auth failure │ note change──► Disconnected
//! ```
//!
//! The supervisor owns at most one live session per document handle. All
//! network outcomes arrive through asynchronous events; `connect()` only
//! starts the attempt. Nothing here retries on its own — reconnecting after
//! a failure is a caller decision.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::activity::{user_state_now, ActivityBroadcaster, DEFAULT_ACTIVITY_INTERVAL};
use crate::awareness::AwarenessChannel;
use crate::document::{DocumentArena, DocumentHandle};
use crate::identity::{IdentityProvider, UserIdentity};
use crate::presence::{
    PresenceProjector, PresenceView, DEFAULT_IDLE_TIMEOUT, DEFAULT_RECHECK_INTERVAL,
};
use crate::protocol::{WireMessage, CLOSE_AUTH_FAILED, CLOSE_NORMAL};
use crate::transport::{SessionTransport, TransportEvent, TransportLink, WebSocketTransport};

/// Default collaboration endpoint.
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:9090";
/// Environment override for the collaboration endpoint.
pub const ENV_SERVER_URL: &str = "JOTTER_COLLAB_URL";
/// Wait between tearing down an old session and opening a new one on a note
/// change, so the old teardown finishes before the new subscription starts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Connection state of the session.
///
/// `Synced` implies `Connected` implies a live session exists;
/// `Disconnected` implies none does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Synced,
}

/// Events emitted by the supervisor.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Errored(SessionError),
}

/// Connection-path errors, also readable via
/// [`ConnectionSupervisor::last_error`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// `connect()` precondition: no authenticated user.
    NotAuthenticated,
    /// `connect()` precondition: authenticated, but no credential token.
    MissingToken,
    /// The server rejected the credential mid-session. No automatic retry.
    AuthRejected(String),
    /// Non-graceful close with a non-normal code.
    AbnormalClose { code: u16, reason: String },
    /// The session could not be constructed.
    Transport(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAuthenticated => {
                write!(f, "cannot open collaboration session: no authenticated user")
            }
            Self::MissingToken => {
                write!(f, "cannot open collaboration session: missing credential token")
            }
            Self::AuthRejected(reason) => {
                write!(f, "collaboration server rejected credentials: {reason}")
            }
            Self::AbnormalClose { code, reason } => {
                write!(f, "connection closed abnormally (code {code}): {reason}")
            }
            Self::Transport(e) => write!(f, "session transport failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Supervisor configuration.
///
/// The timing fields feed the presence and activity components built through
/// [`ConnectionSupervisor::presence_projector`] and
/// [`ConnectionSupervisor::activity_broadcaster`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub reconnect_delay: Duration,
    pub idle_timeout: Duration,
    pub recheck_interval: Duration,
    pub activity_interval: Duration,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
            activity_interval: DEFAULT_ACTIVITY_INTERVAL,
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Defaults, with the endpoint taken from `JOTTER_COLLAB_URL` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var(ENV_SERVER_URL) {
            if !url.is_empty() {
                config.server_url = url;
            }
        }
        config
    }
}

/// State observable by the presentation layer, shared with the driver task.
struct SessionShared {
    state: RwLock<ConnectionState>,
    error: RwLock<Option<SessionError>>,
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl SessionShared {
    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        let _ = self.event_tx.try_send(SessionEvent::StateChanged(state));
    }

    fn last_error(&self) -> Option<SessionError> {
        self.error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_error(&self, error: SessionError) {
        *self.error.write().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
        let _ = self.event_tx.try_send(SessionEvent::Errored(error));
    }

    fn clear_error(&self) {
        *self.error.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn set_outgoing(&self, sender: Option<mpsc::Sender<Vec<u8>>>) {
        *self
            .outgoing
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sender;
    }

    fn outgoing(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.outgoing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct LiveSession {
    driver: JoinHandle<()>,
}

/// Owns the network session bound to one [`DocumentHandle`].
///
/// Acquire on mount, release on every exit path: dropping the supervisor
/// tears the session down and returns the document to the arena.
pub struct ConnectionSupervisor {
    config: SessionConfig,
    identity: Arc<dyn IdentityProvider>,
    transport: Arc<dyn SessionTransport>,
    arena: Arc<DocumentArena>,
    note_id: Uuid,
    doc: Arc<DocumentHandle>,
    channel: Arc<AwarenessChannel>,
    shared: Arc<SessionShared>,
    live: Option<LiveSession>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl ConnectionSupervisor {
    pub fn new(
        arena: Arc<DocumentArena>,
        note_id: Uuid,
        config: SessionConfig,
        identity: Arc<dyn IdentityProvider>,
        transport: Arc<dyn SessionTransport>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let doc = arena.acquire(note_id);
        Self {
            config,
            identity,
            transport,
            arena,
            note_id,
            doc,
            channel: Arc::new(AwarenessChannel::new()),
            shared: Arc::new(SessionShared {
                state: RwLock::new(ConnectionState::Disconnected),
                error: RwLock::new(None),
                outgoing: RwLock::new(None),
                event_tx,
            }),
            live: None,
            event_rx: Some(event_rx),
        }
    }

    /// Environment config, default WebSocket transport, private arena.
    pub fn with_defaults(note_id: Uuid, identity: Arc<dyn IdentityProvider>) -> Self {
        Self::new(
            Arc::new(DocumentArena::new()),
            note_id,
            SessionConfig::from_env(),
            identity,
            Arc::new(WebSocketTransport),
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.last_error()
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    pub fn document(&self) -> Arc<DocumentHandle> {
        self.doc.clone()
    }

    pub fn awareness(&self) -> Arc<AwarenessChannel> {
        self.channel.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Presence projector over this session's channel, using the configured
    /// idle timeout and recheck interval.
    pub fn presence_projector(&self) -> (PresenceProjector, watch::Receiver<PresenceView>) {
        PresenceProjector::with_timing(
            self.channel.clone(),
            self.config.idle_timeout,
            self.config.recheck_interval,
        )
    }

    /// Activity broadcaster bound to this session's channel and identity,
    /// using the configured throttle window.
    pub fn activity_broadcaster(&self) -> ActivityBroadcaster {
        ActivityBroadcaster::with_interval(
            self.channel.clone(),
            self.identity.clone(),
            self.config.activity_interval,
        )
    }

    /// Start connecting. No-op while a connection attempt or session is
    /// already underway. Precondition failures (no identity, no token) leave
    /// the state Disconnected and are recorded in [`last_error`].
    ///
    /// Returns immediately; handshake, sync and failure outcomes arrive via
    /// events and the observable state.
    ///
    /// [`last_error`]: Self::last_error
    pub fn connect(&mut self) -> Result<(), SessionError> {
        match self.state() {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Synced => return Ok(()),
            ConnectionState::Disconnected => {}
        }

        let Some(user) = self.identity.current() else {
            let err = SessionError::NotAuthenticated;
            self.shared.set_error(err.clone());
            return Err(err);
        };
        let Some(token) = user.token.clone() else {
            let err = SessionError::MissingToken;
            self.shared.set_error(err.clone());
            return Err(err);
        };

        // A previous attempt may have died without ever reaching the driver
        // teardown; make sure its task is gone before starting another.
        if let Some(stale) = self.live.take() {
            stale.driver.abort();
        }

        self.shared.clear_error();
        self.shared.set_state(ConnectionState::Connecting);
        log::info!("connecting to session {}", self.doc.session_name());

        let driver = tokio::spawn(drive(
            self.shared.clone(),
            self.transport.clone(),
            self.config.server_url.clone(),
            self.doc.clone(),
            self.channel.clone(),
            user,
            token,
        ));
        self.live = Some(LiveSession { driver });
        Ok(())
    }

    /// Tear down the session unconditionally: abort the driver, clear every
    /// awareness slot, set Disconnected. Safe to call when already down.
    pub fn disconnect(&mut self) {
        if let Some(live) = self.live.take() {
            live.driver.abort();
        }
        self.shared.set_outgoing(None);
        self.channel.detach();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Switch the supervisor to a different note.
    ///
    /// The old session is always torn down before the new document handle is
    /// acquired; if a session was underway, reconnection happens after a
    /// short delay so the old teardown cannot race the new subscription.
    pub async fn change_note(&mut self, note_id: Uuid) -> Result<(), SessionError> {
        if note_id == self.note_id {
            return Ok(());
        }

        let was_live = self.state() != ConnectionState::Disconnected;
        self.disconnect();
        self.arena.release(self.note_id);
        self.note_id = note_id;
        self.doc = self.arena.acquire(note_id);
        log::info!("switched to session {}", self.doc.session_name());

        if was_live {
            tokio::time::sleep(self.config.reconnect_delay).await;
            self.connect()?;
        }
        Ok(())
    }

    /// Push a local CRDT update into the live session. The seam used by the
    /// editor binding layer; best-effort, silently dropped while down (the
    /// document re-syncs on the next connect).
    pub fn send_update(&self, update: Vec<u8>) {
        if let Some(outgoing) = self.shared.outgoing() {
            if let Ok(frame) = (WireMessage::Update { update }).encode() {
                let _ = outgoing.try_send(frame);
            }
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.driver.abort();
        }
        self.channel.detach();
        self.arena.release(self.note_id);
    }
}

async fn send_frame(outgoing: &mpsc::Sender<Vec<u8>>, msg: &WireMessage) -> Result<(), ()> {
    let frame = msg.encode().map_err(|_| ())?;
    outgoing.send(frame).await.map_err(|_| ())
}

/// One session attempt, from transport open to teardown.
///
/// Every exit path — construction failure, close, stream end — detaches the
/// awareness channel and lands on Disconnected. Aborts (explicit
/// `disconnect()`) skip this function's teardown; the supervisor performs
/// the same steps synchronously instead.
async fn drive(
    shared: Arc<SessionShared>,
    transport: Arc<dyn SessionTransport>,
    url: String,
    doc: Arc<DocumentHandle>,
    channel: Arc<AwarenessChannel>,
    user: UserIdentity,
    token: String,
) {
    let session = doc.session_name();
    let link = match transport.open(&url, &session).await {
        Ok(link) => link,
        Err(e) => {
            log::warn!("session {session} failed to open: {e}");
            shared.set_error(SessionError::Transport(e.0));
            shared.set_state(ConnectionState::Disconnected);
            return;
        }
    };
    let TransportLink {
        outgoing,
        mut incoming,
    } = link;
    shared.set_outgoing(Some(outgoing.clone()));

    let hello = WireMessage::Hello {
        token,
        session: session.clone(),
    };
    let mut failed_to_send = send_frame(&outgoing, &hello).await.is_err();

    while !failed_to_send {
        let Some(event) = incoming.recv().await else {
            // Transport went away without a close event.
            break;
        };
        match event {
            TransportEvent::Frame(bytes) => match WireMessage::decode(&bytes) {
                Ok(WireMessage::Welcome { client_id }) => {
                    channel.attach(client_id, outgoing.clone());
                    shared.set_state(ConnectionState::Connected);
                    log::info!("session {session} connected as slot {client_id}");

                    // Announce immediately so peers see us without waiting
                    // out the first activity throttle window.
                    channel.write_local(user_state_now(&user));

                    let request = WireMessage::SyncRequest {
                        state_vector: doc.state_vector(),
                    };
                    failed_to_send = send_frame(&outgoing, &request).await.is_err();
                }
                Ok(WireMessage::SyncReply { update }) => {
                    // A reply is only meaningful after the handshake; servers
                    // must not be able to jump the state machine past
                    // Connected.
                    if shared.state() != ConnectionState::Connected {
                        log::debug!("session {session}: sync reply before handshake, ignoring");
                        continue;
                    }
                    if let Err(e) = doc.apply_update(&update) {
                        log::warn!("session {session}: bad history replay: {e}");
                    }
                    shared.set_state(ConnectionState::Synced);
                    log::info!("session {session} synced");
                }
                Ok(WireMessage::Update { update }) => {
                    if let Err(e) = doc.apply_update(&update) {
                        log::warn!("session {session}: dropping bad update: {e}");
                    }
                }
                Ok(WireMessage::AwarenessWrite { client_id, user }) => {
                    channel.apply_remote(client_id, Some(user));
                }
                Ok(WireMessage::AwarenessClear { client_id }) => {
                    channel.apply_remote(client_id, None);
                }
                Ok(WireMessage::AwarenessSnapshot { slots }) => {
                    channel.apply_snapshot(slots);
                }
                Ok(other) => {
                    log::debug!("session {session}: unexpected server frame {other:?}");
                }
                Err(e) => {
                    log::warn!("session {session}: undecodable frame: {e}");
                }
            },
            TransportEvent::Closed { code, reason } => {
                match code {
                    CLOSE_NORMAL => {
                        log::info!("session {session} closed normally");
                    }
                    CLOSE_AUTH_FAILED => {
                        shared.set_error(SessionError::AuthRejected(reason));
                    }
                    code => {
                        shared.set_error(SessionError::AbnormalClose { code, reason });
                    }
                }
                break;
            }
        }
    }

    shared.set_outgoing(None);
    channel.detach();
    shared.set_state(ConnectionState::Disconnected);
}
