//! Presence: who is connected to the session, and who is actively editing.
//!
//! ```text
//! channel mutation ──┐
//!                    ├──► project(snapshot, now) ──► watch<PresenceView>
//! recheck tick ──────┘
//! ```
//!
//! Two independent trigger sources feed one idempotent recompute: channel
//! mutation notifications (bursty, event-driven) and a fixed recheck tick,
//! because time alone can flip a peer from active to idle with no channel
//! traffic at all. [`project`] is pure — snapshot plus wall clock in,
//! ordered peer list out — so both triggers exercise the same code path and
//! tests can call it directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::activity::epoch_ms;
use crate::awareness::AwarenessChannel;
use crate::protocol::PeerSlot;

/// How long since the last recorded activity before a peer reads as idle.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);
/// How often idle classification is re-evaluated without channel traffic.
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_millis(5_000);

/// Placeholder identity for peers that joined before publishing a profile.
pub const ANONYMOUS_NAME: &str = "Anonymous";
/// Color token for peers without one.
pub const DEFAULT_PEER_COLOR: &str = "hsl(210, 15%, 55%)";

/// One visible peer. Derived, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    /// Server-assigned connection id, not the application user id.
    pub client_id: u64,
    pub name: String,
    pub color: String,
    pub avatar: Option<String>,
    pub is_active: bool,
    pub last_activity: Option<u64>,
}

/// The derived peer list. `count` excludes the local peer by construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceView {
    pub peers: Vec<PresenceEntry>,
    pub count: usize,
}

/// Pure projection of an awareness snapshot into the visible peer list.
///
/// Drops our own slot (matched by connection id) and slots with no `user`
/// payload; everything else is kept with safe defaults. A peer with no
/// activity timestamp is idle, never active. Active peers sort first, ties
/// break on case-insensitive name.
pub fn project(
    slots: &HashMap<u64, PeerSlot>,
    local_id: Option<u64>,
    now_ms: u64,
    idle_timeout: Duration,
) -> PresenceView {
    let idle_ms = idle_timeout.as_millis() as u64;
    let mut peers: Vec<PresenceEntry> = slots
        .iter()
        .filter(|(client_id, _)| Some(**client_id) != local_id)
        .filter_map(|(client_id, slot)| {
            let user = slot.user.as_ref()?;
            let is_active = match user.last_activity {
                Some(last) => now_ms.saturating_sub(last) < idle_ms,
                None => false,
            };
            Some(PresenceEntry {
                client_id: *client_id,
                name: user
                    .name
                    .clone()
                    .unwrap_or_else(|| ANONYMOUS_NAME.to_string()),
                color: user
                    .color
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PEER_COLOR.to_string()),
                avatar: user.avatar.clone(),
                is_active,
                last_activity: user.last_activity,
            })
        })
        .collect();

    peers.sort_by(|a, b| {
        b.is_active
            .cmp(&a.is_active)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    let count = peers.len();
    PresenceView { peers, count }
}

/// Recomputes the presence view on channel mutations and on a recheck tick,
/// publishing into a `watch` channel for the presentation layer.
pub struct PresenceProjector {
    channel: Arc<AwarenessChannel>,
    idle_timeout: Duration,
    recheck_interval: Duration,
    view_tx: Arc<watch::Sender<PresenceView>>,
}

impl PresenceProjector {
    pub fn new(channel: Arc<AwarenessChannel>) -> (Self, watch::Receiver<PresenceView>) {
        Self::with_timing(channel, DEFAULT_IDLE_TIMEOUT, DEFAULT_RECHECK_INTERVAL)
    }

    /// Custom idle timeout and recheck interval (for testing).
    pub fn with_timing(
        channel: Arc<AwarenessChannel>,
        idle_timeout: Duration,
        recheck_interval: Duration,
    ) -> (Self, watch::Receiver<PresenceView>) {
        let (view_tx, view_rx) = watch::channel(PresenceView::default());
        let view_tx = Arc::new(view_tx);

        // Channel teardown must empty the published view in the same call:
        // a reader polling right after a disconnect must never see ghosts.
        let teardown_tx = view_tx.clone();
        channel.on_detach(move || {
            teardown_tx.send_replace(PresenceView::default());
        });

        (
            Self {
                channel,
                idle_timeout,
                recheck_interval,
                view_tx,
            },
            view_rx,
        )
    }

    /// One recompute from the current snapshot and wall clock.
    ///
    /// Snapshot and publish happen under the channel's map lock so a view
    /// computed before a teardown cannot land after the teardown emptied it.
    pub fn recompute(&self) {
        let now = epoch_ms();
        self.channel.with_snapshot(|local_id, slots| {
            let view = project(slots, local_id, now, self.idle_timeout);
            self.view_tx.send_replace(view);
        });
    }

    /// Drive recomputation until the channel itself is dropped.
    pub async fn run(self) {
        let mut changes = self.channel.subscribe();
        let mut ticker = tokio::time::interval(self.recheck_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.recompute();
        loop {
            tokio::select! {
                changed = changes.recv() => match changed {
                    Ok(()) => self.recompute(),
                    // Bursts may overflow the notification buffer; the
                    // snapshot is authoritative, so just recompute.
                    Err(broadcast::error::RecvError::Lagged(_)) => self.recompute(),
                    Err(broadcast::error::RecvError::Closed) => {
                        self.view_tx.send_replace(PresenceView::default());
                        break;
                    }
                },
                _ = ticker.tick() => self.recompute(),
            }
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
