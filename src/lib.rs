//! Synchronization and liveness core for a peer-matching chat client.
//!
//! Everything converges through polling: the [`sync::SyncEngine`] re-reads
//! the shared store on an interval and derives presence, unread counts and
//! group lifecycle from what it finds. Local mutations additionally publish
//! best-effort change events that only make the next poll happen sooner.

pub mod config;
pub mod error;
pub mod groups;
pub mod models;
pub mod presence;
pub mod quota;
pub mod rooms;
pub mod session;
pub mod store;
pub mod sync;
pub mod unread;
pub mod upload;
