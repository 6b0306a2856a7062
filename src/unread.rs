//! Unread accounting derived from per-message read-receipt sets.

use chrono::Utc;
use log::warn;
use serde_json::json;
use std::collections::HashMap;

use crate::models::{Collection, Profile, Readable};
use crate::store::{fields, Store};

/// Messages addressed to me that I have not read yet.
pub fn unread_count<M: Readable>(messages: &[M], me: &str) -> usize {
    messages
        .iter()
        .filter(|m| m.sender_id() != me && !m.read_by().iter().any(|r| r == me))
        .count()
}

/// Stamps `me` into the read set of every currently unread message.
///
/// Each message is updated independently; a partial failure leaves a mixed
/// state, which is harmless because the operation is idempotent and runs
/// again on the next view cycle. Returns how many messages were marked.
pub async fn mark_read<M: Readable>(
    store: &Store,
    collection: Collection,
    messages: &[M],
    me: &str,
) -> usize {
    let now = Utc::now().to_rfc3339();
    let mut marked = 0;
    for message in messages {
        if message.sender_id() == me || message.read_by().iter().any(|r| r == me) {
            continue;
        }
        let mut read_by: Vec<String> = message.read_by().to_vec();
        read_by.push(me.to_string());
        let result = store
            .update(
                collection,
                message.id(),
                fields(&[
                    ("read_by", json!(read_by)),
                    ("read_at", json!(now.clone())),
                ]),
            )
            .await;
        match result {
            Ok(_) => marked += 1,
            // Leave the message unread; the next cycle retries.
            Err(err) => warn!("mark_read: {} {} failed: {}", collection, message.id(), err),
        }
    }
    marked
}

/// Stable unread-first ordering: profiles with more unread messages sort
/// before those with fewer, ties keep their prior relative order.
pub fn order_by_unread(profiles: Vec<Profile>, counts: &HashMap<String, usize>) -> Vec<Profile> {
    let mut ordered = profiles;
    ordered.sort_by(|a, b| {
        let ua = counts.get(&a.id).copied().unwrap_or(0);
        let ub = counts.get(&b.id).copied().unwrap_or(0);
        ub.cmp(&ua)
    });
    ordered
}
