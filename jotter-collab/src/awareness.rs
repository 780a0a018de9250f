//! The awareness channel: one ephemeral key-value slot per connected peer.
//!
//! ```text
//! local interaction            remote frames (session driver)
//!       │                                  │
//!       ▼                                  ▼
//!  write_local()              apply_remote() / apply_snapshot()
//!       │                                  │
//!       └───────────► slots: {client_id → PeerSlot} ◄──────────┘
//!                              │
//!                              ▼ change notifications
//!                      PresenceProjector::run()
//! ```
//!
//! Ownership discipline: each peer writes only its own slot. The local path
//! ([`AwarenessChannel::write_local`]) touches exactly the slot keyed by the
//! server-assigned connection id; every other slot is mutated only by frames
//! the server fans out. No locks are needed beyond a short-held map guard.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, mpsc};

use crate::protocol::{PeerSlot, UserState, WireMessage};

struct ChannelInner {
    /// Our slot key, assigned by the server on handshake. `None` while the
    /// session is down — the channel then ignores local writes.
    local_id: Option<u64>,
    /// Outgoing frame sender of the live session.
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    slots: HashMap<u64, PeerSlot>,
}

/// Shared mutable peer state for one session.
///
/// Detached (no live session) is a valid steady state: reads see an empty
/// map and writes are silently dropped.
pub struct AwarenessChannel {
    inner: RwLock<ChannelInner>,
    changes: broadcast::Sender<()>,
    detach_hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl AwarenessChannel {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(ChannelInner {
                local_id: None,
                outgoing: None,
                slots: HashMap::new(),
            }),
            changes,
            detach_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback run synchronously on every [`detach`], after the
    /// slots are cleared and while the map lock is still held. Derived views
    /// register here so they empty in the same call rather than on their
    /// next wakeup. Hooks must not call back into the channel.
    ///
    /// [`detach`]: Self::detach
    pub fn on_detach(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.detach_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(hook));
    }

    /// Bind the channel to a live session. Stale slots from a previous
    /// attachment are discarded.
    pub fn attach(&self, local_id: u64, outgoing: mpsc::Sender<Vec<u8>>) {
        {
            let mut inner = self.write();
            inner.local_id = Some(local_id);
            inner.outgoing = Some(outgoing);
            inner.slots.clear();
        }
        self.notify();
    }

    /// Tear the channel down, clearing every slot and running the registered
    /// detach hooks synchronously so that no ghost collaborators survive a
    /// disconnect. Idempotent.
    pub fn detach(&self) {
        {
            let mut inner = self.write();
            inner.local_id = None;
            inner.outgoing = None;
            inner.slots.clear();
            // Hooks run under the lock: a view computed from a pre-clear
            // snapshot (see `with_snapshot`) can never be published after
            // the hooks have emptied it.
            for hook in self
                .detach_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
            {
                hook();
            }
        }
        self.notify();
    }

    pub fn is_attached(&self) -> bool {
        self.read().local_id.is_some()
    }

    pub fn local_id(&self) -> Option<u64> {
        self.read().local_id
    }

    /// Overwrite our own slot and forward it to the session. Detached
    /// channels drop the write silently.
    pub fn write_local(&self, user: UserState) {
        {
            let mut inner = self.write();
            let (Some(id), Some(outgoing)) = (inner.local_id, inner.outgoing.clone()) else {
                return;
            };
            inner.slots.insert(
                id,
                PeerSlot {
                    user: Some(user.clone()),
                },
            );
            if let Ok(frame) = (WireMessage::AwarenessWrite {
                client_id: id,
                user,
            })
            .encode()
            {
                // Best-effort: a congested or closing session just misses
                // one activity beat.
                let _ = outgoing.try_send(frame);
            }
        }
        self.notify();
    }

    /// Apply a server-fanned slot overwrite (`Some`) or removal (`None`).
    /// Our own slot is never driven by the remote path.
    pub fn apply_remote(&self, client_id: u64, user: Option<UserState>) {
        {
            let mut inner = self.write();
            if inner.local_id == Some(client_id) {
                return;
            }
            match user {
                Some(user) => {
                    inner
                        .slots
                        .insert(client_id, PeerSlot { user: Some(user) });
                }
                None => {
                    inner.slots.remove(&client_id);
                }
            }
        }
        self.notify();
    }

    /// Apply the initial slot snapshot received on join.
    pub fn apply_snapshot(&self, slots: Vec<(u64, Option<UserState>)>) {
        {
            let mut inner = self.write();
            let local = inner.local_id;
            for (client_id, user) in slots {
                if local == Some(client_id) {
                    continue;
                }
                inner.slots.insert(client_id, PeerSlot { user });
            }
        }
        self.notify();
    }

    /// Consistent read of `(local slot id, all slots)` for projection.
    pub fn snapshot(&self) -> (Option<u64>, HashMap<u64, PeerSlot>) {
        let inner = self.read();
        (inner.local_id, inner.slots.clone())
    }

    /// Run `f` over the slots while the map lock is held. Publishing a
    /// derived view inside `f` cannot interleave with a concurrent detach,
    /// whose hooks run under the same lock. `f` must not call back into the
    /// channel.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(Option<u64>, &HashMap<u64, PeerSlot>) -> R) -> R {
        let inner = self.read();
        f(inner.local_id, &inner.slots)
    }

    /// Subscribe to mutation notifications. Receivers that lag simply
    /// recompute from the latest snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    fn notify(&self) {
        let _ = self.changes.send(());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ChannelInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ChannelInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AwarenessChannel {
    fn default() -> Self {
        Self::new()
    }
}
