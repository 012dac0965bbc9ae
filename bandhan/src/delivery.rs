//! Per-message delivery-state tracking and temp-id reconciliation.
//!
//! [`DeliveryTracker`] owns the state machine of every message the local
//! user has sent, plus the `TempId -> MessageId` map that the stream's
//! de-duplication merge consults. Reconciliation is an in-place id swap:
//! the entry is renamed, never removed and re-inserted, so list length
//! and positions observed by [`crate::stream::MessageStream`] are stable.

use std::collections::HashMap;

use bandhan_proto::message::{DeliveryState, MessageId, MessageRef, TempId, Transition};

/// Tracks delivery state per message and temp-to-real id reconciliation.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    /// Delivery state keyed by the message's current identifier.
    states: HashMap<MessageRef, DeliveryState>,
    /// Provisional ids already reconciled to server ids.
    reconciled: HashMap<TempId, MessageId>,
}

impl DeliveryTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an optimistic send in the `Sending` state.
    ///
    /// Minting the same temp id twice is a caller bug; the second call is
    /// ignored so an overlapping re-entrant send cannot reset state.
    pub fn begin_send(&mut self, temp: TempId) -> Transition {
        let key = MessageRef::Temp(temp);
        if self.states.contains_key(&key) {
            tracing::debug!(id = %key, "begin_send for already-tracked message ignored");
            return Transition::Ignored;
        }
        self.states.insert(key, DeliveryState::Sending);
        Transition::Applied
    }

    /// Reconciles a confirmed send: renames `temp` to `real` in place and
    /// moves the state to `Sent`.
    ///
    /// Idempotent: confirming an already-reconciled send again is a no-op.
    pub fn confirm_sent(&mut self, temp: &TempId, real: MessageId) -> Transition {
        if self.reconciled.contains_key(temp) {
            return Transition::Ignored;
        }
        let Some(mut state) = self.states.remove(&MessageRef::Temp(temp.clone())) else {
            tracing::warn!(temp = %temp, real = %real, "confirm for unknown send rejected");
            return Transition::Rejected;
        };
        state.advance(DeliveryState::Sent);
        self.states.insert(MessageRef::Server(real.clone()), state);
        self.reconciled.insert(temp.clone(), real);
        Transition::Applied
    }

    /// Registers a message already accepted by the backend (history load)
    /// at the `Sent` baseline, without disturbing an existing entry.
    pub fn observe_sent(&mut self, id: MessageId) {
        self.states
            .entry(MessageRef::Server(id))
            .or_insert(DeliveryState::Sent);
    }

    /// Applies a delivered receipt. Idempotent against replayed polls.
    pub fn mark_delivered(&mut self, id: &MessageId) -> Transition {
        self.advance_server(id, DeliveryState::Delivered)
    }

    /// Applies a read receipt. Idempotent against replayed polls.
    ///
    /// Read state only ever comes from the recipient's receipt — the
    /// sender never infers it locally.
    pub fn mark_read(&mut self, id: &MessageId) -> Transition {
        self.advance_server(id, DeliveryState::Read)
    }

    /// Marks an in-flight send as failed, retaining the reason for the
    /// retry affordance. Only a `Sending` message can fail.
    pub fn mark_failed(&mut self, temp: &TempId, reason: impl Into<String>) -> Transition {
        let key = MessageRef::Temp(temp.clone());
        match self.states.get_mut(&key) {
            Some(state) => state.advance(DeliveryState::Failed {
                reason: reason.into(),
            }),
            None => {
                tracing::warn!(temp = %temp, "failure for unknown send rejected");
                Transition::Rejected
            }
        }
    }

    /// Puts a failed send back into `Sending` for a retry attempt.
    pub fn retry(&mut self, temp: &TempId) -> Transition {
        let key = MessageRef::Temp(temp.clone());
        match self.states.get_mut(&key) {
            Some(state) => state.advance(DeliveryState::Sending),
            None => Transition::Rejected,
        }
    }

    /// The server id a temp id was reconciled to, if any.
    #[must_use]
    pub fn resolve(&self, temp: &TempId) -> Option<&MessageId> {
        self.reconciled.get(temp)
    }

    /// Current state under the message's current identifier.
    #[must_use]
    pub fn state(&self, id: &MessageRef) -> Option<&DeliveryState> {
        match self.states.get(id) {
            Some(state) => Some(state),
            // A caller may still hold the temp ref after reconciliation.
            None => match id {
                MessageRef::Temp(temp) => {
                    let real = self.reconciled.get(temp)?;
                    self.states.get(&MessageRef::Server(real.clone()))
                }
                MessageRef::Server(_) => None,
            },
        }
    }

    /// Number of tracked messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns `true` when no message is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn advance_server(&mut self, id: &MessageId, next: DeliveryState) -> Transition {
        match self.states.get_mut(&MessageRef::Server(id.clone())) {
            Some(state) => {
                let outcome = state.advance(next);
                if outcome == Transition::Rejected {
                    tracing::debug!(id = %id, "receipt would move state backward, ignored");
                }
                outcome
            }
            None => {
                // Receipts can reference messages sent from another device.
                tracing::debug!(id = %id, "receipt for untracked message ignored");
                Transition::Rejected
            }
        }
    }
}
