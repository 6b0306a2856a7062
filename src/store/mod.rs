//! Persistence adapter: uniform CRUD over named collections.
//!
//! Records are `serde_json` objects so fields unknown to this build of the
//! client survive round-trips. All operations are funnelled through a single
//! writer task owning the backend connection (see `writer`), which makes
//! read-modify-write sequences within one process strictly FIFO. Nothing here
//! coordinates across processes; concurrent writers on other devices follow
//! last-write-wins.

pub mod sqlite;
mod writer;

use chrono::{DateTime, Utc};
use log::warn;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::Collection;
use crate::sync::ChangeEvent;

pub type JsonMap = Map<String, Value>;

/// How many times a rejected write is retried after stripping the offending
/// unknown field.
pub const SCHEMA_RETRY_LIMIT: usize = 5;

const EVENT_BUS_CAPACITY: usize = 256;

/// Raw storage surface the writer task drives. Implementations are
/// synchronous; the writer owns the only handle.
pub trait Backend: Send + 'static {
    fn load(&mut self, collection: Collection) -> Result<Vec<Value>, StoreError>;
    fn get(&mut self, collection: Collection, id: &str) -> Result<Option<Value>, StoreError>;
    /// May fail with `StoreError::UnknownField` naming one field the backend
    /// schema does not recognize.
    fn insert(&mut self, collection: Collection, record: &JsonMap) -> Result<(), StoreError>;
    /// Writes the given fields of an existing record. Same `UnknownField`
    /// contract as `insert`.
    fn write(&mut self, collection: Collection, id: &str, fields: &JsonMap) -> Result<bool, StoreError>;
    fn remove(&mut self, collection: Collection, id: &str) -> Result<bool, StoreError>;
}

/// Cloneable handle to the store. Dropping every clone shuts the writer task
/// down.
#[derive(Clone)]
pub struct Store {
    commands: mpsc::Sender<writer::Command>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Store {
    /// Spawns the writer task for `backend` and returns the handle.
    pub fn open(backend: impl Backend) -> Store {
        let (commands, rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        tokio::spawn(writer::run(backend, rx, events.clone()));
        Store { commands, events }
    }

    /// Local notification channel. Best-effort: events may be missed under
    /// lag and must only ever be used to poll earlier, never as the sole
    /// trigger for a state change.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub async fn list(
        &self,
        collection: Collection,
        order_by: &str,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        self.roundtrip(|reply| writer::Command::List {
            collection,
            order_by: order_by.to_string(),
            limit,
            reply,
        })
        .await
    }

    pub async fn filter(
        &self,
        collection: Collection,
        criteria: JsonMap,
        order_by: &str,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        self.roundtrip(|reply| writer::Command::Filter {
            collection,
            criteria,
            order_by: order_by.to_string(),
            limit,
            reply,
        })
        .await
    }

    /// Creates a record. The store stamps `id`, `created_date` and
    /// `updated_date`; caller fields win over nothing, but the envelope wins
    /// over caller-supplied envelope fields.
    pub async fn create(&self, collection: Collection, data: JsonMap) -> Result<Value, StoreError> {
        self.roundtrip(|reply| writer::Command::Create {
            collection,
            data,
            reply,
        })
        .await
    }

    pub async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: JsonMap,
    ) -> Result<Value, StoreError> {
        if id.is_empty() {
            return Err(StoreError::Validation("update requires an id".into()));
        }
        self.roundtrip(|reply| writer::Command::Update {
            collection,
            id: id.to_string(),
            patch,
            reply,
        })
        .await
    }

    pub async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::Validation("delete requires an id".into()));
        }
        self.roundtrip(|reply| writer::Command::Delete {
            collection,
            id: id.to_string(),
            reply,
        })
        .await
    }

    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, StoreError>>) -> writer::Command,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }
}

/// Convenience for building record payloads and equality criteria maps.
pub fn fields(pairs: &[(&str, Value)]) -> JsonMap {
    let mut map = JsonMap::new();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn stamp_envelope(collection: Collection, data: &mut JsonMap) {
    let now = now_iso();
    data.insert(
        "id".into(),
        Value::String(format!(
            "{}_{}",
            collection.name().to_lowercase(),
            Uuid::new_v4().simple()
        )),
    );
    data.insert("created_date".into(), Value::String(now.clone()));
    data.insert("updated_date".into(), Value::String(now));
}

/// Runs one write attempt, stripping the offending field on `UnknownField`
/// rejections, bounded by `SCHEMA_RETRY_LIMIT`. Any other error surfaces
/// immediately and is never retried.
pub(crate) fn with_schema_retries<T>(
    collection: Collection,
    payload: &mut JsonMap,
    mut attempt: impl FnMut(&JsonMap) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    for _ in 0..SCHEMA_RETRY_LIMIT {
        match attempt(payload) {
            Ok(value) => return Ok(value),
            Err(StoreError::UnknownField(field)) => {
                if payload.remove(&field).is_none() {
                    return Err(StoreError::Persistence(format!(
                        "{collection}: backend rejected field '{field}' that is not in the payload"
                    )));
                }
                warn!("{collection}: backend does not know field '{field}', retrying without it");
            }
            Err(other) => return Err(other),
        }
    }
    Err(StoreError::Persistence(format!(
        "{collection}: write kept being rejected after {SCHEMA_RETRY_LIMIT} schema-compatibility attempts"
    )))
}

/// `undefined` filters are represented as JSON null and ignored.
pub(crate) fn matches_criteria(record: &Value, criteria: &JsonMap) -> bool {
    for (key, expected) in criteria {
        if expected.is_null() {
            continue;
        }
        match record.get(key) {
            Some(actual) if actual == expected => {}
            _ => return false,
        }
    }
    true
}

/// Sort key mirroring the backend contract: ISO date-times by instant,
/// strings case-insensitively, booleans as 0/1, everything else by its
/// serialized form. `None` (null/missing) sorts last regardless of
/// direction.
#[derive(Debug, PartialEq)]
enum SortKey {
    Num(f64),
    Str(String),
}

fn sort_key(value: Option<&Value>) -> Option<SortKey> {
    let value = value?;
    match value {
        Value::Null => None,
        Value::Number(n) => n.as_f64().map(SortKey::Num),
        Value::Bool(b) => Some(SortKey::Num(if *b { 1.0 } else { 0.0 })),
        Value::String(s) => {
            if looks_like_iso_datetime(s) {
                if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                    return Some(SortKey::Num(t.timestamp_millis() as f64));
                }
            }
            Some(SortKey::Str(s.to_lowercase()))
        }
        other => Some(SortKey::Str(other.to_string())),
    }
}

fn looks_like_iso_datetime(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 11
        && bytes[0..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(u8::is_ascii_digit)
        && bytes[10] == b'T'
}

fn compare_keys(a: &SortKey, b: &SortKey) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (SortKey::Num(x), SortKey::Num(y)) => x.total_cmp(y),
        (SortKey::Str(x), SortKey::Str(y)) => x.cmp(y),
        // Mixed-type fields: numbers group before strings, stably.
        (SortKey::Num(_), SortKey::Str(_)) => Ordering::Less,
        (SortKey::Str(_), SortKey::Num(_)) => Ordering::Greater,
    }
}

pub(crate) fn sort_records(records: &mut Vec<Value>, order_by: &str) {
    if order_by.is_empty() {
        return;
    }
    let descending = order_by.starts_with('-');
    let field = if descending { &order_by[1..] } else { order_by };
    if field.is_empty() {
        return;
    }
    // Vec::sort_by is stable, so ties keep their original relative order.
    records.sort_by(|a, b| {
        let ka = sort_key(a.get(field));
        let kb = sort_key(b.get(field));
        match (ka, kb) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = compare_keys(&x, &y);
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        }
    });
}
