//! Send-eligibility policy for subscription tiers.
//!
//! [`can_send`] is a pure decision function: given the tier, the
//! conversation facts, and the day's usage, it either allows a send or
//! names the reason it is denied. It mutates nothing — callers record
//! usage separately after a confirmed send.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use bandhan_proto::message::{MessageKind, Timestamp};

/// Default number of messages a free-tier user may send per day.
pub const DEFAULT_DAILY_FREE_LIMIT: u32 = 5;

/// Subscription tier of the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Unpaid account: limited daily sends, no initiating, no voice.
    Free,
    /// Paid account: no messaging restrictions.
    Premium,
}

/// Facts about the conversation a send is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationFacts {
    /// Either participant has blocked the other.
    pub blocked: bool,
    /// At least one message exists in the conversation (in either
    /// direction). When `false`, a send would be an initiating message.
    pub has_any_message: bool,
}

/// Why a send was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The conversation is blocked in at least one direction.
    Blocked,
    /// Free tier cannot start a conversation.
    UpgradeRequiredToInitiate,
    /// The free daily send allowance is used up.
    QuotaExceeded {
        /// The configured daily limit.
        limit: u32,
    },
    /// Voice messages need a paid tier.
    UpgradeRequiredForVoice,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocked => write!(f, "this conversation is unavailable"),
            Self::UpgradeRequiredToInitiate => {
                write!(f, "upgrade to start conversations")
            }
            Self::QuotaExceeded { limit } => {
                write!(f, "daily limit of {limit} messages reached")
            }
            Self::UpgradeRequiredForVoice => {
                write!(f, "upgrade to send voice messages")
            }
        }
    }
}

/// Outcome of the send-eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendVerdict {
    /// The send may proceed.
    Allow,
    /// The send is not permitted; the reason is user-facing.
    Deny(DenyReason),
}

impl SendVerdict {
    /// Returns `true` when the send may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Calendar date keying one quota period.
///
/// Computed from a single agreed clock: the UTC calendar date. The
/// observed client mixed device-local dates with server-normalized date
/// strings, which lets a quota straddle two different day boundaries;
/// here every call site derives the key the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodKey(NaiveDate);

impl PeriodKey {
    /// The period key for the current instant.
    #[must_use]
    pub fn today() -> Self {
        Self(Utc::now().date_naive())
    }

    /// The period key a given timestamp falls in.
    #[must_use]
    pub fn from_timestamp(ts: Timestamp) -> Self {
        let millis = i64::try_from(ts.as_millis()).unwrap_or(i64::MAX);
        let date = DateTime::from_timestamp_millis(millis)
            .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
            .date_naive();
        Self(date)
    }

    /// Builds a key from a calendar date (tests, fixtures).
    #[must_use]
    pub const fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }
}

impl std::fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-user send counter for one quota period.
///
/// The count belongs to `period`; reading or recording against a later
/// period key rolls the count back to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageQuota {
    period: PeriodKey,
    sent: u32,
}

impl UsageQuota {
    /// An empty quota for the given period.
    #[must_use]
    pub const fn new(period: PeriodKey) -> Self {
        Self { period, sent: 0 }
    }

    /// A quota seeded from a backend-reported count for the given period.
    #[must_use]
    pub const fn with_count(period: PeriodKey, sent: u32) -> Self {
        Self { period, sent }
    }

    /// Sends recorded against `today`. Zero if the stored period is older.
    #[must_use]
    pub fn count(&self, today: PeriodKey) -> u32 {
        if self.period == today { self.sent } else { 0 }
    }

    /// Records one send against `today`, rolling the period if it changed.
    pub fn record(&mut self, today: PeriodKey) {
        if self.period != today {
            self.period = today;
            self.sent = 0;
        }
        self.sent = self.sent.saturating_add(1);
    }
}

/// Decides whether a send is permitted.
///
/// Rules, in order: blocked conversations deny everything; free tier
/// cannot initiate; free tier is capped at `daily_limit` sends per
/// period; free tier cannot send voice. Everything else is allowed.
#[must_use]
pub fn can_send(
    tier: Tier,
    kind: MessageKind,
    facts: ConversationFacts,
    quota: &UsageQuota,
    today: PeriodKey,
    daily_limit: u32,
) -> SendVerdict {
    if facts.blocked {
        return SendVerdict::Deny(DenyReason::Blocked);
    }
    if tier == Tier::Free && !facts.has_any_message {
        return SendVerdict::Deny(DenyReason::UpgradeRequiredToInitiate);
    }
    if tier == Tier::Free && quota.count(today) >= daily_limit {
        return SendVerdict::Deny(DenyReason::QuotaExceeded { limit: daily_limit });
    }
    if kind == MessageKind::Voice && tier == Tier::Free {
        return SendVerdict::Deny(DenyReason::UpgradeRequiredForVoice);
    }
    SendVerdict::Allow
}
