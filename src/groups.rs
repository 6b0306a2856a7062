//! Ephemeral group lifecycle: active -> inactive -> deleted, driven by member
//! presence. Inactive groups come back to life as soon as any member shows a
//! fresh heartbeat; groups with no online members for the whole inactivity
//! window are deleted for good.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{json, Value};

use crate::models::{decode, Collection, Group, GroupStatus, Profile};
use crate::presence;
use crate::store::{fields, Store};

/// Groups with no online members are deleted after this long.
pub const GROUP_INACTIVE_DELETE_MS: i64 = 3 * 60 * 1000;

fn parse_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn any_member_online(group: &Group, profiles: &[Profile], now: DateTime<Utc>) -> bool {
    group.member_ids.iter().any(|member| {
        profiles
            .iter()
            .any(|p| &p.id == member && presence::effective_online(p, now))
    })
}

/// Advances every group one lifecycle step against the polled presence
/// picture and returns the surviving groups in their post-tick state.
///
/// When the backend predates the liveness columns (no fetched record carries
/// `status` or `inactive_since`), the group's `updated_date` stands in as the
/// inactivity marker; coarser, but still convergent.
pub async fn lifecycle_tick(
    store: &Store,
    raw_groups: &[Value],
    profiles: &[Profile],
    now: DateTime<Utc>,
) -> Vec<Group> {
    let supports_liveness = raw_groups.iter().any(|g| {
        g.get("status").is_some() || g.get("inactive_since").is_some()
    });

    let mut surviving = Vec::new();
    for raw in raw_groups {
        let Some(group) = decode::<Group>(raw) else {
            continue;
        };

        if any_member_online(&group, profiles, now) {
            if supports_liveness
                && (group.status == GroupStatus::Inactive || group.inactive_since.is_some())
            {
                match store
                    .update(
                        Collection::Group,
                        &group.id,
                        fields(&[("status", json!("active")), ("inactive_since", Value::Null)]),
                    )
                    .await
                {
                    Ok(_) => surviving.push(Group {
                        status: GroupStatus::Active,
                        inactive_since: None,
                        ..group
                    }),
                    Err(err) => {
                        warn!("group {} reactivation failed: {}", group.id, err);
                        surviving.push(group);
                    }
                }
            } else {
                surviving.push(group);
            }
            continue;
        }

        // Zero members online.
        if supports_liveness {
            let marked_since = parse_ts(group.inactive_since.as_deref());
            let since = marked_since.unwrap_or(now);
            let elapsed = now.signed_duration_since(since).num_milliseconds();

            if elapsed >= GROUP_INACTIVE_DELETE_MS {
                delete_group(store, &group).await;
                continue;
            }

            if group.status != GroupStatus::Inactive || marked_since.is_none() {
                let since_iso = since.to_rfc3339();
                match store
                    .update(
                        Collection::Group,
                        &group.id,
                        fields(&[
                            ("status", json!("inactive")),
                            ("inactive_since", json!(since_iso.clone())),
                        ]),
                    )
                    .await
                {
                    Ok(_) => surviving.push(Group {
                        status: GroupStatus::Inactive,
                        inactive_since: Some(since_iso),
                        ..group
                    }),
                    Err(err) => {
                        warn!("group {} deactivation failed: {}", group.id, err);
                        surviving.push(group);
                    }
                }
            } else {
                surviving.push(group);
            }
        } else {
            // Degraded mode: updated_date approximates the inactivity start.
            let since = parse_ts(group.updated_date.as_deref());
            match since {
                Some(since)
                    if now.signed_duration_since(since).num_milliseconds()
                        >= GROUP_INACTIVE_DELETE_MS =>
                {
                    delete_group(store, &group).await;
                }
                _ => surviving.push(group),
            }
        }
    }
    surviving
}

/// Permanent deletion, including the group's message log. Orphaned messages
/// would otherwise pile up forever under the auto-delete policy.
async fn delete_group(store: &Store, group: &Group) {
    info!("deleting inactive group {} ({})", group.name, group.id);
    if let Err(err) = store.delete(Collection::Group, &group.id).await {
        warn!("group {} deletion failed: {}", group.id, err);
        return;
    }

    match store
        .filter(
            Collection::GroupMessage,
            fields(&[("group_id", json!(group.id))]),
            "",
            usize::MAX,
        )
        .await
    {
        Ok(messages) => {
            for message in messages {
                if let Some(id) = message.get("id").and_then(Value::as_str) {
                    if let Err(err) = store.delete(Collection::GroupMessage, id).await {
                        warn!("cascade delete of message {} failed: {}", id, err);
                    }
                }
            }
        }
        Err(err) => warn!("cascade lookup for group {} failed: {}", group.id, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteBackend;
    use chrono::Duration;

    fn online_profile(id: &str, now: DateTime<Utc>) -> Profile {
        Profile {
            id: id.to_string(),
            is_online: true,
            last_activity: Some(now.to_rfc3339()),
            ..Profile::default()
        }
    }

    fn offline_profile(id: &str) -> Profile {
        Profile {
            id: id.to_string(),
            is_online: false,
            ..Profile::default()
        }
    }

    async fn create_group(store: &Store, members: &[&str]) -> String {
        let created = store
            .create(
                Collection::Group,
                fields(&[
                    ("name", json!("owls")),
                    ("creator_id", json!(members[0])),
                    ("member_ids", json!(members)),
                    ("member_count", json!(members.len())),
                    ("status", json!("active")),
                ]),
            )
            .await
            .unwrap();
        created["id"].as_str().unwrap().to_string()
    }

    async fn raw_groups(store: &Store) -> Vec<Value> {
        store.list(Collection::Group, "-created_date", 100).await.unwrap()
    }

    #[tokio::test]
    async fn test_group_goes_inactive_when_all_members_offline() {
        let store = Store::open(SqliteBackend::open_in_memory().unwrap());
        create_group(&store, &["a", "b"]).await;
        let now = Utc::now();
        let profiles = vec![offline_profile("a"), offline_profile("b")];

        let groups = lifecycle_tick(&store, &raw_groups(&store).await, &profiles, now).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].status, GroupStatus::Inactive);
        let since = parse_ts(groups[0].inactive_since.as_deref()).unwrap();
        assert!((now - since).num_milliseconds().abs() < 1000);
    }

    #[tokio::test]
    async fn test_inactive_group_survives_inside_window_then_deletes() {
        let store = Store::open(SqliteBackend::open_in_memory().unwrap());
        let id = create_group(&store, &["a", "b"]).await;
        let t0 = Utc::now();
        let profiles = vec![offline_profile("a"), offline_profile("b")];

        lifecycle_tick(&store, &raw_groups(&store).await, &profiles, t0).await;

        // 179 s after going inactive: still there, still inactive.
        let groups = lifecycle_tick(
            &store,
            &raw_groups(&store).await,
            &profiles,
            t0 + Duration::seconds(179),
        )
        .await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].status, GroupStatus::Inactive);

        // 181 s: gone.
        let groups = lifecycle_tick(
            &store,
            &raw_groups(&store).await,
            &profiles,
            t0 + Duration::seconds(181),
        )
        .await;
        assert!(groups.is_empty());
        assert!(raw_groups(&store).await.is_empty());
        let _ = id;
    }

    #[tokio::test]
    async fn test_member_coming_back_reactivates_group() {
        let store = Store::open(SqliteBackend::open_in_memory().unwrap());
        create_group(&store, &["a", "b"]).await;
        let t0 = Utc::now();
        let offline = vec![offline_profile("a"), offline_profile("b")];
        lifecycle_tick(&store, &raw_groups(&store).await, &offline, t0).await;

        let t1 = t0 + Duration::seconds(100);
        let back = vec![online_profile("a", t1), offline_profile("b")];
        let groups = lifecycle_tick(&store, &raw_groups(&store).await, &back, t1).await;
        assert_eq!(groups[0].status, GroupStatus::Active);
        assert!(groups[0].inactive_since.is_none());

        // And the window restarts from scratch if everyone leaves again.
        let t2 = t1 + Duration::seconds(200);
        let groups = lifecycle_tick(&store, &raw_groups(&store).await, &offline, t2).await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].status, GroupStatus::Inactive);
    }

    #[tokio::test]
    async fn test_deletion_cascades_group_messages() {
        let store = Store::open(SqliteBackend::open_in_memory().unwrap());
        let id = create_group(&store, &["a"]).await;
        for text in ["one", "two"] {
            store
                .create(
                    Collection::GroupMessage,
                    fields(&[
                        ("group_id", json!(id)),
                        ("sender_id", json!("a")),
                        ("content", json!(text)),
                        ("read_by", json!(["a"])),
                    ]),
                )
                .await
                .unwrap();
        }

        let t0 = Utc::now();
        let profiles = vec![offline_profile("a")];
        lifecycle_tick(&store, &raw_groups(&store).await, &profiles, t0).await;
        lifecycle_tick(
            &store,
            &raw_groups(&store).await,
            &profiles,
            t0 + Duration::seconds(181),
        )
        .await;

        let leftover = store
            .filter(
                Collection::GroupMessage,
                fields(&[("group_id", json!(id))]),
                "",
                100,
            )
            .await
            .unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_mode_uses_updated_date() {
        // Backend predating the liveness columns: rows carry no status or
        // inactive_since at all.
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE chat_groups (
                id TEXT PRIMARY KEY,
                created_date TEXT,
                updated_date TEXT,
                name TEXT,
                creator_id TEXT,
                member_ids TEXT,
                member_count TEXT
            )",
            [],
        )
        .unwrap();
        let now = Utc::now();
        let stale = (now - Duration::seconds(200)).to_rfc3339();
        let fresh = (now - Duration::seconds(10)).to_rfc3339();
        for (id, ts) in [("g_old", &stale), ("g_new", &fresh)] {
            conn.execute(
                "INSERT INTO chat_groups (id, created_date, updated_date, name, creator_id, member_ids, member_count)
                 VALUES (?1, ?2, ?2, '\"room\"', '\"a\"', '[\"a\"]', '1')",
                rusqlite::params![id, serde_json::to_string(ts).unwrap()],
            )
            .unwrap();
        }

        let store = Store::open(SqliteBackend::with_connection(conn).unwrap());
        let profiles = vec![offline_profile("a")];
        let groups = lifecycle_tick(&store, &raw_groups(&store).await, &profiles, now).await;
        let ids: Vec<&str> = groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, ["g_new"]);
    }
}
