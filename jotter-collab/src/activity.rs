//! Local activity broadcasting into the awareness channel.
//!
//! `record_activity()` is wired by the embedder to a deliberately small set
//! of interaction signals (key input, pointer press, touch start — never
//! pointer movement) and throttled, because peers only need an eventually
//! consistent answer to "is this user active", not every keystroke.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::awareness::AwarenessChannel;
use crate::identity::{IdentityProvider, UserIdentity};
use crate::protocol::UserState;

/// Minimum interval between activity writes.
pub const DEFAULT_ACTIVITY_INTERVAL: Duration = Duration::from_millis(1000);

/// Wall-clock now in epoch milliseconds.
///
/// Activity timestamps must be wall clock (not monotonic) so that peers can
/// classify each other's idleness without a shared clock.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Write throttle: at most one write per `min_interval`.
///
/// The decision is a pure function of `now`, so the throttle boundary is
/// testable without timers.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    last_write: Option<Instant>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_write: None,
            min_interval,
        }
    }

    /// Whether a write at `now` is allowed.
    pub fn should_write(&self, now: Instant) -> bool {
        match self.last_write {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        }
    }

    /// Record that a write happened at `now`.
    pub fn mark(&mut self, now: Instant) {
        self.last_write = Some(now);
    }
}

/// The local identity's slot payload, stamped with the current wall clock.
pub fn user_state_now(user: &UserIdentity) -> UserState {
    UserState {
        name: Some(user.name.clone()),
        color: Some(user.color.clone()),
        avatar: user.avatar.clone(),
        last_activity: Some(epoch_ms()),
    }
}

/// Publishes this peer's display identity and last-active timestamp into its
/// own awareness slot.
pub struct ActivityBroadcaster {
    channel: Arc<AwarenessChannel>,
    identity: Arc<dyn IdentityProvider>,
    limiter: RateLimiter,
}

impl ActivityBroadcaster {
    pub fn new(channel: Arc<AwarenessChannel>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self::with_interval(channel, identity, DEFAULT_ACTIVITY_INTERVAL)
    }

    /// Custom throttle window (for testing).
    pub fn with_interval(
        channel: Arc<AwarenessChannel>,
        identity: Arc<dyn IdentityProvider>,
        min_interval: Duration,
    ) -> Self {
        Self {
            channel,
            identity,
            limiter: RateLimiter::new(min_interval),
        }
    }

    /// Record a local interaction. Calls inside the throttle window are
    /// silently dropped — not queued, not batched.
    pub fn record_activity(&mut self) {
        let now = Instant::now();
        if !self.limiter.should_write(now) {
            return;
        }
        self.limiter.mark(now);
        self.write_slot();
    }

    /// Immediate write bypassing the throttle, used on (re)connect so peers
    /// see the new participant without waiting out the first window.
    pub fn announce(&mut self) {
        self.limiter.mark(Instant::now());
        self.write_slot();
    }

    fn write_slot(&self) {
        // Signed-out mid-session: nothing sensible to publish.
        if let Some(user) = self.identity.current() {
            self.channel.write_local(user_state_now(&user));
        }
    }
}
