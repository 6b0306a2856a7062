use dotenv::dotenv;
use log::{info, warn};

use peermesh::config::Settings;
use peermesh::session::{self, Registration, Session, SessionConfig};
use peermesh::store::sqlite::SqliteBackend;
use peermesh::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let settings = Settings::from_env();
    info!("opening database at {}", settings.database_url);
    let store = Store::open(SqliteBackend::open(&settings.database_url)?);

    let name =
        std::env::var("DISPLAY_NAME").unwrap_or_else(|_| format!("guest-{}", std::process::id()));
    let profile = session::register(
        &store,
        &Registration {
            display_name: name,
            ..Registration::default()
        },
    )
    .await?;

    let config = SessionConfig {
        heartbeat_interval: settings.heartbeat_interval,
        poll_interval: settings.poll_interval,
        ..SessionConfig::default()
    };
    let mut session = Session::start(store.clone(), profile.id.clone(), config);

    if let Some(mut idle_events) = session.take_idle_events() {
        tokio::spawn(async move {
            while let Some(event) = idle_events.recv().await {
                warn!("idle watchdog: {:?}", event);
            }
        });
    }

    let mut snapshots = session.snapshots();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow().clone();
            info!(
                "tick {}: {} online, {} recently offline, {} groups, {} unread peers",
                snapshot.tick,
                snapshot.online.len(),
                snapshot.recently_offline.len(),
                snapshot.groups.len(),
                snapshot.unread_by_profile.len()
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    session.logout().await?;
    Ok(())
}
