//! Heartbeat-driven liveness. `is_online` on a profile is advisory only;
//! readers always recompute effective state from the staleness window so
//! ghost profiles (crashed tabs that never logged out) read as offline.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::StoreError;
use crate::models::{Collection, Profile};
use crate::store::{fields, Store};

/// How long a user counts as online without a fresh heartbeat.
pub const ONLINE_STALE_MS: i64 = 60 * 1000;
/// How long an offline user stays visible in listings.
pub const OFFLINE_VISIBLE_MS: i64 = 3 * 60 * 1000;
/// Name-reservation cooldown after an explicit logout.
pub const LOGOUT_BLOCK_MS: i64 = 5 * 60 * 1000;

fn age_ms(timestamp: &Option<String>, now: DateTime<Utc>) -> Option<i64> {
    let raw = timestamp.as_deref()?;
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
    Some(now.signed_duration_since(parsed.with_timezone(&Utc)).num_milliseconds())
}

/// Computed liveness: stored flag AND a heartbeat younger than the staleness
/// window. A missing or garbled timestamp means offline.
pub fn effective_online(profile: &Profile, now: DateTime<Utc>) -> bool {
    if !profile.is_online {
        return false;
    }
    match age_ms(&profile.last_activity, now) {
        Some(age) => age < ONLINE_STALE_MS,
        None => false,
    }
}

/// Grace period: not effectively online, but the last heartbeat is recent
/// enough to keep the user listed.
pub fn recently_offline(profile: &Profile, now: DateTime<Utc>) -> bool {
    if effective_online(profile, now) {
        return false;
    }
    match age_ms(&profile.last_activity, now) {
        Some(age) => age < OFFLINE_VISIBLE_MS,
        None => false,
    }
}

/// Splits visible profiles into (online, recently offline); everyone else is
/// dropped. Input order is preserved within each partition.
pub fn partition_visible(profiles: &[Profile], now: DateTime<Utc>) -> (Vec<Profile>, Vec<Profile>) {
    let mut online = Vec::new();
    let mut grace = Vec::new();
    for profile in profiles {
        if effective_online(profile, now) {
            online.push(profile.clone());
        } else if recently_offline(profile, now) {
            grace.push(profile.clone());
        }
    }
    (online, grace)
}

/// Periodic liveness refresh for an active session.
pub async fn heartbeat(store: &Store, profile_id: &str) -> Result<(), StoreError> {
    store
        .update(
            Collection::Profile,
            profile_id,
            fields(&[
                ("is_online", json!(true)),
                ("last_activity", json!(Utc::now().to_rfc3339())),
            ]),
        )
        .await?;
    Ok(())
}

/// Best-effort offline mark, used on logout and on shutdown. If it never
/// runs, the staleness window makes the profile read offline anyway.
pub async fn mark_offline(store: &Store, profile_id: &str) -> Result<(), StoreError> {
    store
        .update(
            Collection::Profile,
            profile_id,
            fields(&[
                ("is_online", json!(false)),
                ("is_typing", json!(false)),
                ("last_activity", json!(Utc::now().to_rfc3339())),
            ]),
        )
        .await?;
    Ok(())
}

pub async fn set_typing(store: &Store, profile_id: &str, typing: bool) -> Result<(), StoreError> {
    store
        .update(
            Collection::Profile,
            profile_id,
            fields(&[("is_typing", json!(typing))]),
        )
        .await?;
    Ok(())
}

/// A display name is reserved while any non-banned profile with a
/// case-insensitive match is effectively online or inside its logout
/// cooldown. Best-effort under racing registrations; true uniqueness is not
/// guaranteed.
pub async fn name_taken(
    store: &Store,
    candidate: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let trimmed = candidate.trim();
    if trimmed.chars().count() < 3 {
        return Ok(false);
    }
    let needle = trimmed.to_lowercase();

    let profiles = store.list(Collection::Profile, "-last_activity", 300).await?;
    for raw in &profiles {
        let Some(profile) = crate::models::decode::<Profile>(raw) else {
            continue;
        };
        if profile.is_banned {
            continue;
        }
        if profile.display_name.trim().to_lowercase() != needle {
            continue;
        }
        if effective_online(&profile, now) {
            return Ok(true);
        }
        if let Some(until) = profile
            .logout_block_until
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            if now < until.with_timezone(&Utc) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
