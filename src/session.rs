//! Session lifecycle: registration, the heartbeat task, the idle watchdog
//! with its cancellable countdown, and the two ways out (logout, account
//! deletion).

use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{decode, Collection, Profile};
use crate::presence::{self, LOGOUT_BLOCK_MS};
use crate::store::{fields, Store};
use crate::sync::{Snapshot, SyncEngine};

/// How long a session may sit without activity before the warning fires.
pub const IDLE_WARN_AFTER: Duration = Duration::from_secs(14 * 60);
/// Countdown between the warning and the forced logout. Any activity during
/// the countdown cancels it.
pub const IDLE_COUNTDOWN: Duration = Duration::from_secs(30);

const AVATAR_COLORS: [&str; 6] = [
    "#e57373", "#64b5f6", "#81c784", "#ffb74d", "#ba68c8", "#4db6ac",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The idle countdown has started.
    Warning { countdown: Duration },
    /// The countdown expired; the profile has been marked offline and its
    /// name put under the logout cooldown.
    LoggedOut,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub idle_warn_after: Duration,
    pub idle_countdown: Duration,
    /// How often the watchdog re-evaluates idleness.
    pub idle_check_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            idle_warn_after: IDLE_WARN_AFTER,
            idle_countdown: IDLE_COUNTDOWN,
            idle_check_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub display_name: String,
    pub birth_year: Option<i32>,
    pub gender: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub bio: Option<String>,
}

/// Creates a profile for a new session. Fails when the display name is
/// currently reserved by an online user or one inside the logout cooldown.
/// The reservation check is best-effort; two racing registrations can both
/// pass it.
pub async fn register(store: &Store, reg: &Registration) -> Result<Profile, StoreError> {
    let name = reg.display_name.trim();
    if name.chars().count() < 3 {
        return Err(StoreError::Validation(
            "display name must be at least 3 characters".into(),
        ));
    }
    let now = Utc::now();
    if presence::name_taken(store, name, now).await? {
        return Err(StoreError::Validation(format!(
            "display name '{name}' is currently taken"
        )));
    }

    let color = AVATAR_COLORS[name.bytes().map(usize::from).sum::<usize>() % AVATAR_COLORS.len()];
    let created = store
        .create(
            Collection::Profile,
            fields(&[
                ("display_name", json!(name)),
                ("birth_year", json!(reg.birth_year)),
                ("gender", json!(reg.gender)),
                ("country", json!(reg.country)),
                ("city", json!(reg.city)),
                ("bio", json!(reg.bio)),
                ("avatar_color", json!(color)),
                ("is_online", json!(true)),
                ("last_activity", json!(now.to_rfc3339())),
                ("blocked_users", json!([])),
                ("session_id", json!(Uuid::new_v4().to_string())),
            ]),
        )
        .await?;
    let profile: Profile = decode(&created)
        .ok_or_else(|| StoreError::Persistence("created profile did not decode".into()))?;

    // The login audit record is best-effort and never blocks the session.
    if let Err(err) = store
        .create(
            Collection::LoginEvent,
            fields(&[
                ("profile_id", json!(profile.id)),
                ("profile_name", json!(profile.display_name)),
            ]),
        )
        .await
    {
        warn!("login event for {} not recorded: {}", profile.id, err);
    }

    info!("registered profile {} ({})", profile.display_name, profile.id);
    Ok(profile)
}

/// Adds `target` to my blocked list. Blocking twice is a no-op.
pub async fn block_user(store: &Store, me: &str, target: &str) -> Result<Profile, StoreError> {
    let rows = store
        .filter(Collection::Profile, fields(&[("id", json!(me))]), "", 1)
        .await?;
    let profile: Profile = rows
        .first()
        .and_then(decode)
        .ok_or_else(|| StoreError::NotFound {
            collection: "Profile",
            id: me.to_string(),
        })?;

    let mut blocked = profile.blocked_users.clone();
    if blocked.iter().any(|b| b == target) {
        return Ok(profile);
    }
    blocked.push(target.to_string());
    let updated = store
        .update(
            Collection::Profile,
            me,
            fields(&[("blocked_users", json!(blocked))]),
        )
        .await?;
    decode(&updated).ok_or_else(|| StoreError::Persistence("updated profile did not decode".into()))
}

/// A running session: the sync engine, the heartbeat, and the idle watchdog,
/// all bound to one profile. Dropping the session stops everything; the
/// staleness window then takes the profile offline for other viewers.
pub struct Session {
    store: Store,
    profile_id: String,
    sync: SyncEngine,
    shutdown: watch::Sender<bool>,
    activity: watch::Sender<Instant>,
    idle_events: Option<mpsc::UnboundedReceiver<IdleEvent>>,
}

impl Session {
    pub fn start(store: Store, profile_id: String, config: SessionConfig) -> Session {
        let sync = SyncEngine::start(store.clone(), profile_id.clone(), config.poll_interval);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(session_loop(
            store.clone(),
            profile_id.clone(),
            config,
            activity_rx,
            shutdown_rx,
            events_tx,
        ));

        Session {
            store,
            profile_id,
            sync,
            shutdown: shutdown_tx,
            activity: activity_tx,
            idle_events: Some(events_rx),
        }
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.sync.snapshots()
    }

    pub fn latest(&self) -> Snapshot {
        self.sync.latest()
    }

    /// Marks user activity: resets the idle clock and cancels a running
    /// countdown.
    pub fn touch(&self) {
        let _ = self.activity.send(Instant::now());
    }

    /// The "stay online" answer to an idle warning.
    pub fn keep_alive(&self) {
        self.touch();
    }

    /// Idle notifications, consumable once.
    pub fn take_idle_events(&mut self) -> Option<mpsc::UnboundedReceiver<IdleEvent>> {
        self.idle_events.take()
    }

    /// Halts the heartbeat, the watchdog and the sync engine without touching
    /// the profile record.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.sync.stop();
    }

    /// Explicit logout: stops the session, marks the profile offline, and
    /// reserves the display name for the cooldown window.
    pub async fn logout(self) -> Result<(), StoreError> {
        self.stop();
        end_session(&self.store, &self.profile_id).await
    }

    /// Ungraceful shutdown: stops the tasks and makes a best-effort offline
    /// mark, without the name cooldown. If the mark never lands, the
    /// staleness window takes the profile offline for other viewers.
    pub async fn disconnect(self) {
        self.stop();
        if let Err(err) = presence::mark_offline(&self.store, &self.profile_id).await {
            warn!("offline mark for {} failed: {}", self.profile_id, err);
        }
    }

    /// Logout that also removes the profile record entirely.
    pub async fn delete_account(self) -> Result<(), StoreError> {
        self.stop();
        store_delete_profile(&self.store, &self.profile_id).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn end_session(store: &Store, profile_id: &str) -> Result<(), StoreError> {
    presence::mark_offline(store, profile_id).await?;
    let until = (Utc::now() + chrono::Duration::milliseconds(LOGOUT_BLOCK_MS)).to_rfc3339();
    store
        .update(
            Collection::Profile,
            profile_id,
            fields(&[
                ("logout_block_until", json!(until)),
                ("session_id", Value::Null),
            ]),
        )
        .await?;
    info!("profile {} logged out", profile_id);
    Ok(())
}

async fn store_delete_profile(store: &Store, profile_id: &str) -> Result<(), StoreError> {
    store.delete(Collection::Profile, profile_id).await?;
    info!("profile {} deleted", profile_id);
    Ok(())
}

/// One task carries both the heartbeat and the idle watchdog, so a forced
/// logout stops the heartbeat in the same breath.
async fn session_loop(
    store: Store,
    profile_id: String,
    config: SessionConfig,
    mut activity: watch::Receiver<Instant>,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<IdleEvent>,
) {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut check = tokio::time::interval(config.idle_check_interval);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut warned_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                // A failed heartbeat is retried on the next tick; the profile
                // only reads offline after the staleness window.
                if let Err(err) = presence::heartbeat(&store, &profile_id).await {
                    warn!("heartbeat for {} failed: {}", profile_id, err);
                }
            }
            _ = check.tick() => {
                let idle = activity.borrow().elapsed();
                match warned_at {
                    None if idle >= config.idle_warn_after => {
                        warned_at = Some(Instant::now());
                        let _ = events.send(IdleEvent::Warning {
                            countdown: config.idle_countdown,
                        });
                    }
                    Some(since) if since.elapsed() >= config.idle_countdown => {
                        if let Err(err) = end_session(&store, &profile_id).await {
                            warn!("idle logout for {} failed: {}", profile_id, err);
                        }
                        let _ = events.send(IdleEvent::LoggedOut);
                        return;
                    }
                    _ => {}
                }
            }
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
                // Activity cancels a pending countdown.
                warned_at = None;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteBackend;
    use chrono::DateTime;

    fn store() -> Store {
        Store::open(SqliteBackend::open_in_memory().unwrap())
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(50),
            idle_warn_after: Duration::from_millis(150),
            idle_countdown: Duration::from_millis(400),
            idle_check_interval: Duration::from_millis(20),
        }
    }

    async fn fetch_profile(store: &Store, id: &str) -> Profile {
        let rows = store
            .filter(Collection::Profile, fields(&[("id", json!(id))]), "", 1)
            .await
            .unwrap();
        decode(&rows[0]).unwrap()
    }

    #[tokio::test]
    async fn test_register_creates_online_profile_and_login_event() {
        let store = store();
        let profile = register(
            &store,
            &Registration {
                display_name: "  alice  ".into(),
                country: Some("NL".into()),
                ..Registration::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(profile.display_name, "alice");
        assert!(profile.is_online);
        assert!(profile.session_id.is_some());
        assert!(!profile.avatar_color.clone().unwrap_or_default().is_empty());

        let events = store
            .list(Collection::LoginEvent, "-created_date", 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["profile_id"], json!(profile.id));
    }

    #[tokio::test]
    async fn test_register_rejects_taken_and_short_names() {
        let store = store();
        register(
            &store,
            &Registration {
                display_name: "alice".into(),
                ..Registration::default()
            },
        )
        .await
        .unwrap();

        let err = register(
            &store,
            &Registration {
                display_name: "ALICE".into(),
                ..Registration::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let err = register(
            &store,
            &Registration {
                display_name: "al".into(),
                ..Registration::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_logout_sets_cooldown_and_clears_session() {
        let store = store();
        let profile = register(
            &store,
            &Registration {
                display_name: "alice".into(),
                ..Registration::default()
            },
        )
        .await
        .unwrap();
        let session = Session::start(store.clone(), profile.id.clone(), fast_config());
        session.logout().await.unwrap();

        let after = fetch_profile(&store, &profile.id).await;
        assert!(!after.is_online);
        assert!(after.session_id.is_none());
        let until = after.logout_block_until.as_deref().unwrap();
        let until = DateTime::parse_from_rfc3339(until).unwrap();
        assert!(until.timestamp_millis() > Utc::now().timestamp_millis());

        // The name stays reserved during the cooldown.
        assert!(presence::name_taken(&store, "alice", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_idle_warning_then_forced_logout() {
        let store = store();
        let profile = register(
            &store,
            &Registration {
                display_name: "alice".into(),
                ..Registration::default()
            },
        )
        .await
        .unwrap();
        let mut session = Session::start(store.clone(), profile.id.clone(), fast_config());
        let mut events = session.take_idle_events().unwrap();

        let warning = events.recv().await.unwrap();
        assert!(matches!(warning, IdleEvent::Warning { .. }));

        let next = events.recv().await.unwrap();
        assert_eq!(next, IdleEvent::LoggedOut);

        let after = fetch_profile(&store, &profile.id).await;
        assert!(!after.is_online);
        assert!(after.logout_block_until.is_some());
    }

    #[tokio::test]
    async fn test_keep_alive_cancels_the_countdown() {
        let store = store();
        let profile = register(
            &store,
            &Registration {
                display_name: "alice".into(),
                ..Registration::default()
            },
        )
        .await
        .unwrap();
        let mut session = Session::start(store.clone(), profile.id.clone(), fast_config());
        let mut events = session.take_idle_events().unwrap();

        let warning = events.recv().await.unwrap();
        assert!(matches!(warning, IdleEvent::Warning { .. }));
        session.keep_alive();

        // Past the original countdown deadline: no forced logout happened.
        tokio::time::sleep(Duration::from_millis(450)).await;
        let mut logged_out = false;
        while let Ok(event) = events.try_recv() {
            if event == IdleEvent::LoggedOut {
                logged_out = true;
            }
        }
        assert!(!logged_out);
        let after = fetch_profile(&store, &profile.id).await;
        assert!(after.logout_block_until.is_none());
        session.stop();
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_profile_effectively_online() {
        let store = store();
        let profile = register(
            &store,
            &Registration {
                display_name: "alice".into(),
                ..Registration::default()
            },
        )
        .await
        .unwrap();
        let session = Session::start(store.clone(), profile.id.clone(), fast_config());
        tokio::time::sleep(Duration::from_millis(120)).await;

        let after = fetch_profile(&store, &profile.id).await;
        assert!(presence::effective_online(&after, Utc::now()));
        session.stop();
    }

    #[tokio::test]
    async fn test_block_user_dedups() {
        let store = store();
        let profile = register(
            &store,
            &Registration {
                display_name: "alice".into(),
                ..Registration::default()
            },
        )
        .await
        .unwrap();

        let updated = block_user(&store, &profile.id, "troll").await.unwrap();
        assert_eq!(updated.blocked_users, vec!["troll".to_string()]);
        let updated = block_user(&store, &profile.id, "troll").await.unwrap();
        assert_eq!(updated.blocked_users, vec!["troll".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_account_removes_profile() {
        let store = store();
        let profile = register(
            &store,
            &Registration {
                display_name: "alice".into(),
                ..Registration::default()
            },
        )
        .await
        .unwrap();
        let session = Session::start(store.clone(), profile.id.clone(), fast_config());
        session.delete_account().await.unwrap();

        let rows = store
            .filter(Collection::Profile, fields(&[("id", json!(profile.id))]), "", 1)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }
}
