use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachChannel {
    Whatsapp,
    Sms,
    Push,
    Email,
}

impl OutreachChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            OutreachChannel::Whatsapp => "whatsapp",
            OutreachChannel::Sms => "sms",
            OutreachChannel::Push => "push",
            OutreachChannel::Email => "email",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachType {
    GapFill,
    NoShowPrevention,
    WaitlistPromotion,
    DiscountOffer,
    Retention,
    Rebooking,
}

/// Delivery lifecycle of a single customer message.
///
/// The graph is monotone: `pending → sent → delivered → read → responded`,
/// with `failed` reachable from the non-read states and `expired` from any
/// non-terminal state. `responded` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Responded,
    Failed,
    Expired,
}

impl OutreachStatus {
    /// Position on the forward delivery path; terminal failure states sort
    /// above everything so they can never be overwritten.
    fn rank(self) -> u8 {
        match self {
            OutreachStatus::Pending => 0,
            OutreachStatus::Sent => 1,
            OutreachStatus::Delivered => 2,
            OutreachStatus::Read => 3,
            OutreachStatus::Responded => 4,
            OutreachStatus::Failed | OutreachStatus::Expired => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OutreachStatus::Responded | OutreachStatus::Failed | OutreachStatus::Expired
        )
    }

    /// Whether moving to `next` is a forward transition. Duplicate and
    /// out-of-order provider callbacks fail this check and are dropped.
    pub fn accepts(self, next: OutreachStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            OutreachStatus::Expired => true,
            OutreachStatus::Failed => self != OutreachStatus::Responded,
            _ => next.rank() > self.rank(),
        }
    }
}

/// Classified customer reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    Accept,
    Decline,
    Select(u8),
}

impl ReplyAction {
    pub fn as_label(self) -> String {
        match self {
            ReplyAction::Accept => "accept".to_string(),
            ReplyAction::Decline => "decline".to_string(),
            ReplyAction::Select(n) => format!("select_{n}"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delivery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutreachResponse {
    pub received: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
}

/// One outbound customer message and its delivery/response lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outreach {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub outreach_type: OutreachType,
    pub channel: OutreachChannel,
    pub status: OutreachStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_kind: Option<String>,
    #[serde(default)]
    pub offer_details: Value,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivery: Delivery,
    pub response: OutreachResponse,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Outreach {
    pub const DEFAULT_EXPIRY_MINUTES: i64 = 15;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: impl Into<String>,
        customer_id: impl Into<String>,
        customer_name: impl Into<String>,
        customer_phone: impl Into<String>,
        outreach_type: OutreachType,
        channel: OutreachChannel,
        message: impl Into<String>,
        trigger_id: Option<String>,
        trigger_kind: Option<String>,
        offer_details: Value,
        expires_in_minutes: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            tenant_id: tenant_id.into(),
            customer_id: customer_id.into(),
            customer_name: customer_name.into(),
            customer_phone: customer_phone.into(),
            outreach_type,
            channel,
            status: OutreachStatus::Pending,
            message: message.into(),
            trigger_id,
            trigger_kind,
            offer_details,
            attempts: 0,
            last_attempt_at: None,
            delivery: Delivery::default(),
            response: OutreachResponse::default(),
            expires_at: now + Duration::minutes(expires_in_minutes),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expiry_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_accepted() {
        use OutreachStatus::*;
        assert!(Pending.accepts(Sent));
        assert!(Sent.accepts(Delivered));
        assert!(Delivered.accepts(Read));
        assert!(Read.accepts(Responded));
        assert!(Sent.accepts(Read)); // provider may skip `delivered`
    }

    #[test]
    fn backward_and_duplicate_transitions_are_dropped() {
        use OutreachStatus::*;
        assert!(!Delivered.accepts(Sent));
        assert!(!Delivered.accepts(Delivered));
        assert!(!Read.accepts(Delivered));
        assert!(!Responded.accepts(Read));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        use OutreachStatus::*;
        for next in [Pending, Sent, Delivered, Read, Responded, Failed, Expired] {
            assert!(!Responded.accepts(next));
            assert!(!Failed.accepts(next));
            assert!(!Expired.accepts(next));
        }
    }

    #[test]
    fn expired_reachable_from_any_live_state() {
        use OutreachStatus::*;
        for state in [Pending, Sent, Delivered, Read] {
            assert!(state.accepts(Expired));
        }
    }

    #[test]
    fn reply_action_labels() {
        assert_eq!(ReplyAction::Accept.as_label(), "accept");
        assert_eq!(ReplyAction::Select(3).as_label(), "select_3");
    }
}
