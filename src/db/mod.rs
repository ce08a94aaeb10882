use crate::errors::{EngineError, EngineResult};
use crate::models::EngineSettings;
use crate::storage::{KvStore, SyncStore};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const MAX_COPY_CHUNK_SIZE: usize = 1_000;

/// SQLite-backed persistent tier. Serves as the async key-value store, the
/// synchronous first-paint store and the settings table at once.
#[derive(Debug)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| EngineError::Storage(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn)
    }

    /// Runs `op` on the blocking pool so SQLite I/O stays off the async workers.
    async fn with_connection<T, F>(&self, op: F) -> EngineResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> EngineResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_connection(&conn)?;
            op(&mut guard)
        })
        .await
        .map_err(|err| EngineError::Internal(format!("database task failed: {}", err)))?
    }

    pub fn get_settings(&self) -> EngineResult<EngineSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'engine'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<EngineSettings>(&raw).unwrap_or_default()),
            None => Ok(EngineSettings::default()),
        }
    }

    pub fn update_settings(&self, update: Value) -> EngineResult<EngineSettings> {
        let settings = apply_settings_patch(&self.get_settings()?, update)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('engine', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> EngineResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = 'engine'",
            [],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('engine', ?1, ?2)",
                params![
                    serde_json::to_string(&EngineSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }

    fn read_entry(conn: &Connection, key: &str) -> EngineResult<Option<Value>> {
        let raw = conn
            .query_row(
                "SELECT value_json FROM kv_entries WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|err| EngineError::Storage(format!("Corrupt entry {}: {}", key, err))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl KvStore for Database {
    async fn get(&self, key: &str) -> EngineResult<Option<Value>> {
        let key = key.to_string();
        self.with_connection(move |conn| Self::read_entry(conn, &key)).await
    }

    async fn get_many(&self, keys: &[String]) -> EngineResult<BTreeMap<String, Value>> {
        let keys = keys.to_vec();
        self.with_connection(move |conn| {
            let mut found = BTreeMap::new();
            for key in keys {
                if let Some(value) = Self::read_entry(conn, &key)? {
                    found.insert(key, value);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn get_all(&self) -> EngineResult<BTreeMap<String, Value>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT key, value_json FROM kv_entries ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut entries = BTreeMap::new();
            for row in rows {
                let (key, raw) = row?;
                match serde_json::from_str(&raw) {
                    Ok(value) => {
                        entries.insert(key, value);
                    }
                    Err(error) => {
                        tracing::warn!(key = %key, error = %error, "skipping corrupt kv entry");
                    }
                }
            }
            Ok(entries)
        })
        .await
    }

    async fn set(&self, entries: BTreeMap<String, Value>) -> EngineResult<()> {
        self.with_connection(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            for (key, value) in entries {
                tx.execute(
                    "INSERT INTO kv_entries (key, value_json, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
                    params![key, serde_json::to_string(&value)?, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, keys: &[String]) -> EngineResult<()> {
        let keys = keys.to_vec();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            for key in &keys {
                tx.execute("DELETE FROM kv_entries WHERE key = ?1", [key])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

impl SyncStore for Database {
    fn get_item(&self, key: &str) -> EngineResult<Option<String>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row("SELECT value FROM local_items WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?)
    }

    fn set_item(&self, key: &str, value: &str) -> EngineResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO local_items (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> EngineResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM local_items WHERE key = ?1", [key])?;
        Ok(())
    }
}

fn lock_connection(conn: &Mutex<Connection>) -> EngineResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| EngineError::Internal("database mutex poisoned".to_string()))
}

/// Deep-merges `patch` over `current` and validates the result.
pub(crate) fn apply_settings_patch(current: &EngineSettings, patch: Value) -> EngineResult<EngineSettings> {
    let mut merged = serde_json::to_value(current)?;
    merge_json(&mut merged, patch);
    let settings: EngineSettings = serde_json::from_value(merged)
        .map_err(|err| EngineError::Validation(format!("Invalid settings: {}", err)))?;
    validate_settings(settings)
}

fn validate_settings(mut settings: EngineSettings) -> EngineResult<EngineSettings> {
    settings.copy_chunk_size = settings.copy_chunk_size.clamp(1, MAX_COPY_CHUNK_SIZE);
    if settings.min_items_for_classification > settings.max_items_for_classification {
        return Err(EngineError::Validation(format!(
            "minItemsForClassification ({}) must not exceed maxItemsForClassification ({})",
            settings.min_items_for_classification, settings.max_items_for_classification
        )));
    }
    Ok(settings)
}

fn merge_json(target: &mut Value, update: Value) {
    match (target, update) {
        (Value::Object(target_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
