//! File-backed storage on rusqlite. One table per collection with explicit
//! columns; every cell holds the JSON encoding of its field value. Opening a
//! database created by an older build leaves that table's column set as it
//! was, which is exactly the schema drift the adapter's strip-and-retry path
//! absorbs.

use std::collections::HashMap;

use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::StoreError;
use crate::models::Collection;

use super::{Backend, JsonMap};

fn current_columns(collection: Collection) -> &'static [&'static str] {
    match collection {
        Collection::Profile => &[
            "id",
            "created_date",
            "updated_date",
            "display_name",
            "birth_year",
            "gender",
            "country",
            "city",
            "bio",
            "avatar_color",
            "avatar_url",
            "gallery_images",
            "is_online",
            "last_activity",
            "is_typing",
            "blocked_users",
            "is_banned",
            "is_admin",
            "logout_block_until",
            "session_id",
        ],
        Collection::Room => &[
            "id",
            "created_date",
            "updated_date",
            "participant_ids",
            "participant_names",
            "status",
            "last_message",
        ],
        Collection::Message => &[
            "id",
            "created_date",
            "updated_date",
            "room_id",
            "sender_id",
            "sender_name",
            "content",
            "file_url",
            "file_name",
            "image_url",
            "read_by",
            "read_at",
        ],
        Collection::Group => &[
            "id",
            "created_date",
            "updated_date",
            "name",
            "description",
            "creator_id",
            "creator_name",
            "member_ids",
            "member_count",
            "is_public",
            "status",
            "inactive_since",
        ],
        Collection::GroupMessage => &[
            "id",
            "created_date",
            "updated_date",
            "group_id",
            "sender_id",
            "sender_name",
            "content",
            "image_url",
            "read_by",
            "read_at",
        ],
        Collection::SupportMessage => &[
            "id",
            "created_date",
            "updated_date",
            "sender_id",
            "sender_name",
            "subject",
            "body",
            "kind",
        ],
        Collection::LoginEvent => &[
            "id",
            "created_date",
            "updated_date",
            "profile_id",
            "profile_name",
            "kind",
        ],
    }
}

pub struct SqliteBackend {
    conn: Connection,
    /// Actual column sets of the opened database, which may lag behind
    /// `current_columns` for pre-existing tables.
    columns: HashMap<Collection, Vec<String>>,
}

impl SqliteBackend {
    pub fn open(path: &str) -> Result<SqliteBackend, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<SqliteBackend, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing connection. Tables missing entirely are created with
    /// the current schema; tables that already exist are left untouched.
    pub fn with_connection(conn: Connection) -> Result<SqliteBackend, StoreError> {
        for collection in Collection::ALL {
            let cols: Vec<String> = current_columns(collection)
                .iter()
                .map(|c| {
                    if *c == "id" {
                        format!("\"{c}\" TEXT PRIMARY KEY")
                    } else {
                        format!("\"{c}\" TEXT")
                    }
                })
                .collect();
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
                    collection.table(),
                    cols.join(", ")
                ),
                [],
            )?;
        }

        let mut columns = HashMap::new();
        for collection in Collection::ALL {
            let mut stmt =
                conn.prepare(&format!("PRAGMA table_info(\"{}\")", collection.table()))?;
            let names: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<_, _>>()?;
            columns.insert(collection, names);
        }
        Ok(SqliteBackend { conn, columns })
    }

    fn columns(&self, collection: Collection) -> &[String] {
        self.columns
            .get(&collection)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First payload field the opened schema does not know, if any.
    fn unknown_field(&self, collection: Collection, payload: &JsonMap) -> Option<String> {
        let known = self.columns(collection);
        payload
            .keys()
            .find(|key| !known.iter().any(|c| c == *key))
            .cloned()
    }

    fn row_to_value(&self, collection: Collection, row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
        let mut map = JsonMap::new();
        for (idx, column) in self.columns(collection).iter().enumerate() {
            let cell: Option<String> = row.get(idx)?;
            if let Some(text) = cell {
                let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
                map.insert(column.clone(), value);
            }
        }
        Ok(Value::Object(map))
    }

    fn select_clause(&self, collection: Collection) -> String {
        self.columns(collection)
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn encode(value: &Value) -> Option<String> {
    if value.is_null() {
        return None;
    }
    Some(value.to_string())
}

impl Backend for SqliteBackend {
    fn load(&mut self, collection: Collection) -> Result<Vec<Value>, StoreError> {
        let sql = format!(
            "SELECT {} FROM \"{}\"",
            self.select_clause(collection),
            collection.table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| self.row_to_value(collection, row))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn get(&mut self, collection: Collection, id: &str) -> Result<Option<Value>, StoreError> {
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE id = ?1",
            self.select_clause(collection),
            collection.table()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let record = stmt
            .query_row([id], |row| self.row_to_value(collection, row))
            .optional()?;
        Ok(record)
    }

    fn insert(&mut self, collection: Collection, record: &JsonMap) -> Result<(), StoreError> {
        if let Some(field) = self.unknown_field(collection, record) {
            return Err(StoreError::UnknownField(field));
        }
        let keys: Vec<&String> = record.keys().collect();
        let placeholders: Vec<String> = (1..=keys.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            collection.table(),
            keys.iter()
                .map(|k| format!("\"{k}\""))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders.join(", ")
        );
        let params: Vec<Option<String>> = keys.iter().map(|k| encode(&record[k.as_str()])).collect();
        self.conn.execute(&sql, params_from_iter(params))?;
        Ok(())
    }

    fn write(
        &mut self,
        collection: Collection,
        id: &str,
        fields: &JsonMap,
    ) -> Result<bool, StoreError> {
        if let Some(field) = self.unknown_field(collection, fields) {
            return Err(StoreError::UnknownField(field));
        }
        if fields.is_empty() {
            return Ok(true);
        }
        let keys: Vec<&String> = fields.keys().collect();
        let assignments: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| format!("\"{k}\" = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE id = ?{}",
            collection.table(),
            assignments.join(", "),
            keys.len() + 1
        );
        let mut params: Vec<Option<String>> =
            keys.iter().map(|k| encode(&fields[k.as_str()])).collect();
        params.push(Some(id.to_string()));
        let changed = self.conn.execute(&sql, params_from_iter(params))?;
        Ok(changed > 0)
    }

    fn remove(&mut self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            &format!("DELETE FROM \"{}\" WHERE id = ?1", collection.table()),
            [id],
        )?;
        Ok(changed > 0)
    }
}
