//! Shared test support: an in-memory collaboration server.
//!
//! [`CollabHub`] implements the server side of the wire protocol over plain
//! channels, so integration tests exercise the full session pipeline
//! (handshake, sync, awareness fan-out, close codes) without sockets.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::ReadTxn;

use jotter_collab::{
    ConnectionState, ConnectionSupervisor, DocumentArena, IdentityProvider, SessionConfig,
    SessionTransport, TransportError, TransportEvent, TransportLink, UserState, WireMessage,
};
use jotter_collab::protocol::CLOSE_AUTH_FAILED;

/// Credential the hub rejects with an auth close.
pub const BAD_TOKEN: &str = "expired-token";

struct Room {
    doc: yrs::Doc,
    slots: HashMap<u64, Option<UserState>>,
    peers: HashMap<u64, mpsc::Sender<TransportEvent>>,
}

impl Room {
    fn new() -> Self {
        Self {
            doc: yrs::Doc::new(),
            slots: HashMap::new(),
            peers: HashMap::new(),
        }
    }
}

struct HubInner {
    next_client_id: u64,
    rooms: HashMap<String, Room>,
    connections_opened: usize,
    awareness_writes: usize,
}

/// In-memory collaboration server shared by all connections of one test.
#[derive(Clone)]
pub struct CollabHub {
    inner: Arc<Mutex<HubInner>>,
}

impl CollabHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                next_client_id: 1,
                rooms: HashMap::new(),
                connections_opened: 0,
                awareness_writes: 0,
            })),
        }
    }

    /// How many transport connections were ever opened.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// How many awareness slot writes the hub has received.
    pub fn awareness_write_count(&self) -> usize {
        self.lock().awareness_writes
    }

    /// Connected peer count in a session's room.
    pub fn peer_count(&self, session: &str) -> usize {
        self.lock()
            .rooms
            .get(session)
            .map(|r| r.peers.len())
            .unwrap_or(0)
    }

    pub fn transport(&self) -> Arc<dyn SessionTransport> {
        Arc::new(HubTransport { hub: self.clone() })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve one connection until the client side hangs up.
    async fn serve(
        self,
        session: String,
        mut from_client: mpsc::Receiver<Vec<u8>>,
        to_client: mpsc::Sender<TransportEvent>,
    ) {
        // Handshake: the first frame must be a Hello.
        let client_id = loop {
            let Some(frame) = from_client.recv().await else {
                return;
            };
            let Ok(WireMessage::Hello { token, .. }) = WireMessage::decode(&frame) else {
                continue;
            };
            if token == BAD_TOKEN {
                let _ = to_client
                    .send(TransportEvent::Closed {
                        code: CLOSE_AUTH_FAILED,
                        reason: "invalid token".into(),
                    })
                    .await;
                return;
            }
            break self.register(&session, to_client.clone());
        };

        send_msg(&to_client, &WireMessage::Welcome { client_id }).await;
        let snapshot = {
            let mut inner = self.lock();
            let room = inner.rooms.entry(session.clone()).or_insert_with(Room::new);
            room.slots
                .iter()
                .map(|(id, user)| (*id, user.clone()))
                .collect()
        };
        send_msg(&to_client, &WireMessage::AwarenessSnapshot { slots: snapshot }).await;

        while let Some(frame) = from_client.recv().await {
            let Ok(msg) = WireMessage::decode(&frame) else {
                continue;
            };
            match msg {
                WireMessage::SyncRequest { state_vector } => {
                    let update = {
                        let mut inner = self.lock();
                        let room = inner.rooms.entry(session.clone()).or_insert_with(Room::new);
                        let sv = yrs::StateVector::decode_v1(&state_vector).unwrap_or_default();
                        let txn = yrs::Transact::transact(&room.doc);
                        txn.encode_diff_v1(&sv)
                    };
                    send_msg(&to_client, &WireMessage::SyncReply { update }).await;
                }
                WireMessage::Update { update } => {
                    let fanout = {
                        let mut inner = self.lock();
                        let room = inner.rooms.entry(session.clone()).or_insert_with(Room::new);
                        if let Ok(decoded) = yrs::Update::decode_v1(&update) {
                            let mut txn = yrs::Transact::transact_mut(&room.doc);
                            let _ = txn.apply_update(decoded);
                        }
                        other_peers(room, client_id)
                    };
                    broadcast(&fanout, &WireMessage::Update { update }).await;
                }
                WireMessage::AwarenessWrite { user, .. } => {
                    let fanout = {
                        let mut inner = self.lock();
                        inner.awareness_writes += 1;
                        let room = inner.rooms.entry(session.clone()).or_insert_with(Room::new);
                        room.slots.insert(client_id, Some(user.clone()));
                        other_peers(room, client_id)
                    };
                    broadcast(&fanout, &WireMessage::AwarenessWrite { client_id, user }).await;
                }
                WireMessage::AwarenessClear { .. } => {
                    let fanout = {
                        let mut inner = self.lock();
                        let room = inner.rooms.entry(session.clone()).or_insert_with(Room::new);
                        room.slots.remove(&client_id);
                        other_peers(room, client_id)
                    };
                    broadcast(&fanout, &WireMessage::AwarenessClear { client_id }).await;
                }
                _ => {}
            }
        }

        // Client hung up: remove its slot and tell the rest of the room.
        let fanout = {
            let mut inner = self.lock();
            if let Some(room) = inner.rooms.get_mut(&session) {
                room.peers.remove(&client_id);
                room.slots.remove(&client_id);
                other_peers(room, client_id)
            } else {
                Vec::new()
            }
        };
        broadcast(&fanout, &WireMessage::AwarenessClear { client_id }).await;
    }

    fn register(&self, session: &str, sender: mpsc::Sender<TransportEvent>) -> u64 {
        let mut inner = self.lock();
        let client_id = inner.next_client_id;
        inner.next_client_id += 1;
        let room = inner
            .rooms
            .entry(session.to_string())
            .or_insert_with(Room::new);
        room.peers.insert(client_id, sender);
        client_id
    }
}

fn other_peers(room: &Room, except: u64) -> Vec<mpsc::Sender<TransportEvent>> {
    room.peers
        .iter()
        .filter(|(id, _)| **id != except)
        .map(|(_, tx)| tx.clone())
        .collect()
}

async fn send_msg(to_client: &mpsc::Sender<TransportEvent>, msg: &WireMessage) {
    if let Ok(frame) = msg.encode() {
        let _ = to_client.send(TransportEvent::Frame(frame)).await;
    }
}

async fn broadcast(peers: &[mpsc::Sender<TransportEvent>], msg: &WireMessage) {
    for peer in peers {
        send_msg(peer, msg).await;
    }
}

/// Transport that connects supervisors to a [`CollabHub`].
pub struct HubTransport {
    hub: CollabHub,
}

impl SessionTransport for HubTransport {
    fn open(
        &self,
        _url: &str,
        session: &str,
    ) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        let hub = self.hub.clone();
        let session = session.to_string();
        Box::pin(async move {
            hub.lock().connections_opened += 1;
            let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(256);
            let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(256);
            tokio::spawn(hub.serve(session, out_rx, in_tx));
            Ok(TransportLink {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

/// Supervisor wired to the hub with test-friendly timings.
pub fn hub_supervisor(
    hub: &CollabHub,
    note_id: Uuid,
    identity: Arc<dyn IdentityProvider>,
) -> ConnectionSupervisor {
    let config = SessionConfig {
        reconnect_delay: Duration::from_millis(20),
        ..SessionConfig::default()
    };
    ConnectionSupervisor::new(
        Arc::new(DocumentArena::new()),
        note_id,
        config,
        identity,
        hub.transport(),
    )
}

/// Poll until the supervisor reaches `state` or the deadline passes.
pub async fn wait_for_state(sup: &ConnectionSupervisor, state: ConnectionState) -> bool {
    for _ in 0..200 {
        if sup.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
