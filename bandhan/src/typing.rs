//! Typing-indicator coordination: local broadcast debounce and remote
//! signal expiry.
//!
//! The local side emits a `Started` signal on the leading edge of input
//! and refreshes it at most once per debounce window while typing
//! continues. The remote side is self-expiring: a peer's `Started` state
//! reverts to not-typing once no refresh arrives within the expiry
//! timeout, guarding against lost stop signals (app killed mid-type).
//! All methods take explicit `now` timestamps so the machine is testable
//! without timers.

use std::collections::HashMap;
use std::time::Duration;

use bandhan_proto::message::{Timestamp, UserId};
use bandhan_proto::typing::{TypingAction, TypingSignal};

/// Default minimum gap between outbound `Started` refreshes.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(3);

/// Default lifetime of a remote `Started` signal with no refresh.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(6);

/// Coordinates typing signals for one conversation.
#[derive(Debug)]
pub struct TypingCoordinator {
    debounce: Duration,
    expiry: Duration,
    /// When we last emitted `Started`; `None` when not signaling.
    last_emit: Option<Timestamp>,
    /// Last `Started` signal per remote user.
    peers: HashMap<UserId, Timestamp>,
}

impl TypingCoordinator {
    /// Creates a coordinator with the given debounce and expiry windows.
    #[must_use]
    pub fn new(debounce: Duration, expiry: Duration) -> Self {
        Self {
            debounce,
            expiry,
            last_emit: None,
            peers: HashMap::new(),
        }
    }

    /// The user's input changed. Returns the action to broadcast, if any:
    /// an immediate `Started` when not yet signaling, a refreshed
    /// `Started` when the debounce window has elapsed, or nothing.
    pub fn on_input(&mut self, now: Timestamp) -> Option<TypingAction> {
        match self.last_emit {
            None => {
                self.last_emit = Some(now);
                Some(TypingAction::Started)
            }
            Some(last) if now.millis_since(last) >= duration_millis(self.debounce) => {
                self.last_emit = Some(now);
                Some(TypingAction::Started)
            }
            Some(_) => None,
        }
    }

    /// The user sent, cleared the input, or blurred the composer.
    /// Returns `Stopped` to broadcast if we were signaling.
    pub fn on_stop(&mut self) -> Option<TypingAction> {
        self.last_emit.take().map(|_| TypingAction::Stopped)
    }

    /// Returns `true` while an outbound `Started` is live.
    #[must_use]
    pub const fn is_signaling(&self) -> bool {
        self.last_emit.is_some()
    }

    /// Applies a remote signal from the poll cycle.
    ///
    /// Returns `true` if the peer's visible typing state changed.
    pub fn apply_signal(&mut self, signal: &TypingSignal, now: Timestamp) -> bool {
        match signal.action {
            TypingAction::Started => self.peers.insert(signal.user_id.clone(), now).is_none(),
            TypingAction::Stopped => self.peers.remove(&signal.user_id).is_some(),
        }
    }

    /// Expires remote `Started` states with no refresh inside the expiry
    /// window. Run on every poll tick. Returns the users whose indicator
    /// just cleared.
    pub fn sweep_expired(&mut self, now: Timestamp) -> Vec<UserId> {
        let expiry = duration_millis(self.expiry);
        let expired: Vec<UserId> = self
            .peers
            .iter()
            .filter(|(_, last)| now.millis_since(**last) > expiry)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            self.peers.remove(user);
            tracing::debug!(user = %user, "typing indicator expired without stop signal");
        }
        expired
    }

    /// Returns `true` if the given peer currently shows as typing.
    #[must_use]
    pub fn peer_typing(&self, user: &UserId) -> bool {
        self.peers.contains_key(user)
    }

    /// Users currently showing as typing.
    #[must_use]
    pub fn typing_peers(&self) -> Vec<UserId> {
        self.peers.keys().cloned().collect()
    }
}

impl Default for TypingCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE, DEFAULT_EXPIRY)
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
