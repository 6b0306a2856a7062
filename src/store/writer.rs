//! Write serializer: one task owns the backend and applies commands strictly
//! in arrival order, so no two read-modify-write sequences interleave within
//! this process.

use log::debug;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::StoreError;
use crate::models::Collection;
use crate::sync::{ChangeAction, ChangeEvent};

use super::{
    matches_criteria, now_iso, sort_records, stamp_envelope, with_schema_retries, Backend, JsonMap,
};

pub(super) enum Command {
    List {
        collection: Collection,
        order_by: String,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<Value>, StoreError>>,
    },
    Filter {
        collection: Collection,
        criteria: JsonMap,
        order_by: String,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<Value>, StoreError>>,
    },
    Create {
        collection: Collection,
        data: JsonMap,
        reply: oneshot::Sender<Result<Value, StoreError>>,
    },
    Update {
        collection: Collection,
        id: String,
        patch: JsonMap,
        reply: oneshot::Sender<Result<Value, StoreError>>,
    },
    Delete {
        collection: Collection,
        id: String,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

pub(super) async fn run(
    mut backend: impl Backend,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<ChangeEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::List {
                collection,
                order_by,
                limit,
                reply,
            } => {
                let _ = reply.send(list(&mut backend, collection, None, &order_by, limit));
            }
            Command::Filter {
                collection,
                criteria,
                order_by,
                limit,
                reply,
            } => {
                let _ = reply.send(list(&mut backend, collection, Some(&criteria), &order_by, limit));
            }
            Command::Create {
                collection,
                data,
                reply,
            } => {
                let result = create(&mut backend, collection, data);
                if let Ok(record) = &result {
                    publish(&events, collection, ChangeAction::Create, record);
                }
                let _ = reply.send(result);
            }
            Command::Update {
                collection,
                id,
                patch,
                reply,
            } => {
                let result = update(&mut backend, collection, &id, patch);
                if let Ok(record) = &result {
                    publish(&events, collection, ChangeAction::Update, record);
                }
                let _ = reply.send(result);
            }
            Command::Delete {
                collection,
                id,
                reply,
            } => {
                let result = delete(&mut backend, collection, &id);
                if result.is_ok() {
                    let _ = events.send(ChangeEvent {
                        collection,
                        action: ChangeAction::Delete,
                        id: id.clone(),
                        room_id: None,
                        group_id: None,
                    });
                }
                let _ = reply.send(result);
            }
        }
    }
    debug!("store writer shutting down");
}

fn list(
    backend: &mut impl Backend,
    collection: Collection,
    criteria: Option<&JsonMap>,
    order_by: &str,
    limit: usize,
) -> Result<Vec<Value>, StoreError> {
    let mut records = backend.load(collection)?;
    if let Some(criteria) = criteria {
        records.retain(|r| matches_criteria(r, criteria));
    }
    sort_records(&mut records, order_by);
    records.truncate(limit);
    Ok(records)
}

fn create(
    backend: &mut impl Backend,
    collection: Collection,
    mut data: JsonMap,
) -> Result<Value, StoreError> {
    stamp_envelope(collection, &mut data);
    with_schema_retries(collection, &mut data, |payload| {
        backend.insert(collection, payload)
    })?;
    Ok(Value::Object(data))
}

fn update(
    backend: &mut impl Backend,
    collection: Collection,
    id: &str,
    mut patch: JsonMap,
) -> Result<Value, StoreError> {
    let existing = backend.get(collection, id)?.ok_or(StoreError::NotFound {
        collection: collection.name(),
        id: id.to_string(),
    })?;

    patch.remove("id");
    patch.insert("updated_date".into(), Value::String(now_iso()));

    with_schema_retries(collection, &mut patch, |fields| {
        backend.write(collection, id, fields).map(|_| ())
    })?;

    // Merge the fields that survived the schema retries over the stored
    // record, so the caller sees the post-write state.
    let mut merged = match existing {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    };
    for (key, value) in patch {
        merged.insert(key, value);
    }
    Ok(Value::Object(merged))
}

fn delete(backend: &mut impl Backend, collection: Collection, id: &str) -> Result<(), StoreError> {
    if backend.remove(collection, id)? {
        Ok(())
    } else {
        Err(StoreError::NotFound {
            collection: collection.name(),
            id: id.to_string(),
        })
    }
}

fn publish(
    events: &broadcast::Sender<ChangeEvent>,
    collection: Collection,
    action: ChangeAction,
    record: &Value,
) {
    let id = record
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let scope = |key: &str| {
        record
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    // Send only fails when nobody is subscribed, which is fine: the bus is a
    // wake-early hint, not a delivery guarantee.
    let _ = events.send(ChangeEvent {
        collection,
        action,
        id,
        room_id: scope("room_id"),
        group_id: scope("group_id"),
    });
}
