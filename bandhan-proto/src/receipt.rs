//! Delivery and read receipts exchanged with the backend.

use serde::{Deserialize, Serialize};

use crate::message::{DeliveryState, MessageId, Timestamp};

/// The stage a receipt reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// The message reached the recipient's device.
    Delivered,
    /// The recipient saw the message in their viewport.
    Read,
}

impl ReceiptStatus {
    /// The delivery state this receipt moves a message to.
    #[must_use]
    pub const fn as_delivery_state(self) -> DeliveryState {
        match self {
            Self::Delivered => DeliveryState::Delivered,
            Self::Read => DeliveryState::Read,
        }
    }
}

/// A receipt for one message, observed by the recipient's client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// The message the receipt is for. Always a server id — receipts are
    /// only issued for messages the backend has accepted.
    pub message_id: MessageId,
    /// Delivered or read.
    pub status: ReceiptStatus,
    /// When the recipient's client observed the message.
    pub observed_at: Timestamp,
}
