use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use crate::groups;
use crate::models::{decode_all, Collection, Group, Message, Profile, Room};
use crate::presence;
use crate::store::Store;
use crate::unread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

/// Best-effort local notification, published on every local mutation.
/// Consumers use it only to wake the poll loop early; missing one never
/// breaks convergence because the next tick re-reads everything.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub action: ChangeAction,
    pub id: String,
    pub room_id: Option<String>,
    pub group_id: Option<String>,
}

/// One converged view of the world, produced by a poll tick.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub profiles: Vec<Profile>,
    /// Profiles currently online, unread-first.
    pub online: Vec<Profile>,
    /// Profiles within the offline grace window, unread-first.
    pub recently_offline: Vec<Profile>,
    pub rooms: Vec<Room>,
    pub groups: Vec<Group>,
    pub unread_by_profile: HashMap<String, usize>,
    pub unread_by_group: HashMap<String, usize>,
    pub tick: u64,
}

pub struct SyncEngine {
    snapshots: watch::Receiver<Snapshot>,
    shutdown: watch::Sender<bool>,
}

impl SyncEngine {
    /// Spawns the poll loop for the given viewer. Polling is the sole source
    /// of truth; store change events merely trigger an early tick.
    pub fn start(store: Store, me: String, poll_interval: Duration) -> SyncEngine {
        let (snap_tx, snap_rx) = watch::channel(Snapshot::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = store.subscribe();

        tokio::spawn(poll_loop(store, me, poll_interval, events, snap_tx, shutdown_rx));

        SyncEngine {
            snapshots: snap_rx,
            shutdown: shutdown_tx,
        }
    }

    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Stops the poll loop. In-flight store calls finish on their own; their
    /// results are discarded because the loop observes the shutdown flag
    /// before publishing.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    store: Store,
    me: String,
    poll_interval: Duration,
    mut events: broadcast::Receiver<ChangeEvent>,
    snap_tx: watch::Sender<Snapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            event = events.recv() => {
                match event {
                    Ok(ev) => {
                        debug!("change event {:?} on {} ({}), polling early", ev.action, ev.collection, ev.id);
                        interval.reset();
                    }
                    // Lagged receivers just fall back to the regular tick.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        tick += 1;
        match build_snapshot(&store, &me, tick).await {
            Ok(snapshot) => {
                // Stale-result discard: a tick that completed after stop()
                // must not resurrect state.
                if *shutdown.borrow() {
                    return;
                }
                if snap_tx.send(snapshot).is_err() {
                    return;
                }
            }
            // A failed tick never halts the loop; the next tick retries.
            Err(err) => warn!("poll tick {} failed: {}", tick, err),
        }
    }
}

async fn build_snapshot(store: &Store, me: &str, tick: u64) -> Result<Snapshot, crate::error::StoreError> {
    let now = Utc::now();

    let raw_profiles = store.list(Collection::Profile, "-last_activity", 300).await?;
    let raw_rooms = store.list(Collection::Room, "-updated_date", 100).await?;
    let raw_groups = store.list(Collection::Group, "-updated_date", 100).await?;

    let profiles: Vec<Profile> = decode_all(&raw_profiles)
        .into_iter()
        .filter(|p: &Profile| !p.is_banned)
        .collect();

    // Group lifecycle runs against the freshly polled presence picture.
    let groups = groups::lifecycle_tick(store, &raw_groups, &profiles, now).await;

    let rooms: Vec<Room> = decode_all(&raw_rooms);
    let my_rooms: Vec<&Room> = rooms
        .iter()
        .filter(|r| r.participant_ids.iter().any(|p| p == me))
        .collect();

    let mut unread_by_profile: HashMap<String, usize> = HashMap::new();
    for room in &my_rooms {
        let Some(partner) = room.partner_of(me) else {
            continue;
        };
        let raw = store
            .filter(
                Collection::Message,
                crate::store::fields(&[("room_id", Value::String(room.id.clone()))]),
                "created_date",
                200,
            )
            .await?;
        let messages: Vec<Message> = decode_all(&raw);
        let count = unread::unread_count(&messages, me);
        if count > 0 {
            *unread_by_profile.entry(partner.to_string()).or_insert(0) += count;
        }
    }

    let mut unread_by_group: HashMap<String, usize> = HashMap::new();
    for group in groups.iter().filter(|g| g.member_ids.iter().any(|m| m == me)) {
        let raw = store
            .filter(
                Collection::GroupMessage,
                crate::store::fields(&[("group_id", Value::String(group.id.clone()))]),
                "created_date",
                200,
            )
            .await?;
        let messages: Vec<crate::models::GroupMessage> = decode_all(&raw);
        let count = unread::unread_count(&messages, me);
        if count > 0 {
            unread_by_group.insert(group.id.clone(), count);
        }
    }

    let visible: Vec<Profile> = profiles
        .iter()
        .filter(|p| p.id != me)
        .cloned()
        .collect();
    let (online, recently_offline) = presence::partition_visible(&visible, now);
    let online = unread::order_by_unread(online, &unread_by_profile);
    let recently_offline = unread::order_by_unread(recently_offline, &unread_by_profile);

    Ok(Snapshot {
        profiles,
        online,
        recently_offline,
        rooms,
        groups,
        unread_by_profile,
        unread_by_group,
        tick,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteBackend;
    use serde_json::json;

    async fn test_store() -> Store {
        Store::open(SqliteBackend::open_in_memory().unwrap())
    }

    fn obj(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_snapshot_reflects_polled_state() {
        let store = test_store().await;
        let me = store
            .create(Collection::Profile, obj(json!({
                "display_name": "me",
                "is_online": true,
                "last_activity": Utc::now().to_rfc3339(),
            })))
            .await
            .unwrap();
        let me_id = me["id"].as_str().unwrap().to_string();
        store
            .create(Collection::Profile, obj(json!({
                "display_name": "peer",
                "is_online": true,
                "last_activity": Utc::now().to_rfc3339(),
            })))
            .await
            .unwrap();

        let engine = SyncEngine::start(store, me_id, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        let snapshot = engine.latest();
        assert!(snapshot.tick > 0);
        assert_eq!(snapshot.online.len(), 1);
        assert_eq!(snapshot.online[0].display_name, "peer");
        engine.stop();
    }

    #[tokio::test]
    async fn test_change_event_wakes_loop_early() {
        let store = test_store().await;
        let engine = SyncEngine::start(store.clone(), "viewer".into(), Duration::from_secs(3600));
        // First tick fires immediately; wait for it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = engine.latest().tick;

        store
            .create(Collection::Profile, obj(json!({
                "display_name": "late joiner",
                "is_online": true,
                "last_activity": Utc::now().to_rfc3339(),
            })))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let after = engine.latest();
        assert!(after.tick > before, "mutation should trigger an early poll");
        assert_eq!(after.online.len(), 1);
        engine.stop();
    }

    #[tokio::test]
    async fn test_stop_halts_ticking() {
        let store = test_store().await;
        let engine = SyncEngine::start(store, "viewer".into(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let frozen = engine.latest().tick;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.latest().tick, frozen);
    }
}
