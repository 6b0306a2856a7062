//! Log-derived send permission. The allowance is recomputed from the full
//! message list on every check instead of being tracked in a counter field,
//! so there is no second piece of mutable state that can drift away from the
//! log.

use crate::error::{QuotaReason, StoreError};
use crate::models::Message;

/// Messages I may send before the partner has ever replied.
pub const BEFORE_REPLY_LIMIT: usize = 3;
/// Messages I may send after the partner's most recent reply.
pub const AFTER_REPLY_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendQuota {
    pub limit: usize,
    pub used: usize,
    pub remaining: usize,
    pub reason: QuotaReason,
}

/// Computes the current allowance for `me` in a room whose resolved partner
/// is `partner`. `messages` must be the room's log in creation order.
pub fn send_quota(messages: &[Message], me: &str, partner: Option<&str>) -> SendQuota {
    let Some(partner) = partner else {
        // Malformed room: fall back to the most restrictive case.
        return SendQuota {
            limit: BEFORE_REPLY_LIMIT,
            used: 0,
            remaining: BEFORE_REPLY_LIMIT,
            reason: QuotaReason::MissingPartner,
        };
    };

    let partner_replied = messages.iter().any(|m| m.sender_id == partner);
    if !partner_replied {
        let used = messages.iter().filter(|m| m.sender_id == me).count();
        return SendQuota {
            limit: BEFORE_REPLY_LIMIT,
            used,
            remaining: BEFORE_REPLY_LIMIT.saturating_sub(used),
            reason: QuotaReason::BeforeReply,
        };
    }

    let last_partner_idx = messages
        .iter()
        .rposition(|m| m.sender_id == partner)
        .unwrap_or(0);
    let used = messages[last_partner_idx + 1..]
        .iter()
        .filter(|m| m.sender_id == me)
        .count();
    SendQuota {
        limit: AFTER_REPLY_LIMIT,
        used,
        remaining: AFTER_REPLY_LIMIT.saturating_sub(used),
        reason: QuotaReason::AfterReply,
    }
}

/// Gate applied before any write: a send with zero remaining allowance is
/// rejected locally.
pub fn check_send(messages: &[Message], me: &str, partner: Option<&str>) -> Result<SendQuota, StoreError> {
    let quota = send_quota(messages, me, partner);
    if quota.remaining == 0 {
        let reason = match quota.reason {
            QuotaReason::AfterReply => QuotaReason::AfterReply,
            _ => QuotaReason::BeforeReply,
        };
        return Err(StoreError::QuotaExceeded(reason));
    }
    Ok(quota)
}
