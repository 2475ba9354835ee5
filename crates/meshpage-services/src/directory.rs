//! Node directory — what we know about each node on the channel.
//!
//! One `nodes` table holds every channel; rows are keyed by
//! `(channel, node_id)`. Upserts merge: only supplied fields overwrite,
//! everything else keeps its previous value. Each upsert is a single
//! `INSERT … ON CONFLICT DO UPDATE` statement on a connection guarded by a
//! mutex, so a record never holds a mix of two concurrent updates.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    channel        TEXT NOT NULL,
    node_id        TEXT NOT NULL,
    long_name      TEXT,
    short_name     TEXT,
    macaddr        TEXT,
    latitude_i     INTEGER,
    longitude_i    INTEGER,
    altitude       INTEGER,
    precision_bits INTEGER,
    last_updated   TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (channel, node_id)
);
";

const UPSERT: &str = "
INSERT INTO nodes (channel, node_id, long_name, short_name,
                   latitude_i, longitude_i, altitude, precision_bits)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT (channel, node_id) DO UPDATE SET
    long_name      = COALESCE(excluded.long_name, nodes.long_name),
    short_name     = COALESCE(excluded.short_name, nodes.short_name),
    latitude_i     = COALESCE(excluded.latitude_i, nodes.latitude_i),
    longitude_i    = COALESCE(excluded.longitude_i, nodes.longitude_i),
    altitude       = COALESCE(excluded.altitude, nodes.altitude),
    precision_bits = COALESCE(excluded.precision_bits, nodes.precision_bits),
    last_updated   = CURRENT_TIMESTAMP
";

/// Partial update for one node. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeUpdate {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub latitude_i: Option<i32>,
    pub longitude_i: Option<i32>,
    pub altitude: Option<i32>,
    pub precision_bits: Option<u32>,
}

impl NodeUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A stored node row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub node_id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub macaddr: Option<String>,
    pub latitude_i: Option<i32>,
    pub longitude_i: Option<i32>,
    pub altitude: Option<i32>,
    pub precision_bits: Option<u32>,
    pub last_updated: String,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("node storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<rusqlite::Error> for DirectoryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

/// SQLite-backed node directory for one channel. Cheap to clone.
#[derive(Clone)]
pub struct NodeDirectory {
    conn: Arc<Mutex<Connection>>,
    channel: Arc<str>,
}

impl NodeDirectory {
    /// Open (or create) the directory database at `path`.
    pub fn open(path: impl AsRef<Path>, channel: &str) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DirectoryError::StorageUnavailable(format!(
                    "failed to create {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        tracing::info!(path = %path.display(), channel, "node directory opened");
        Self::with_connection(conn, channel)
    }

    /// In-memory directory, for tests and dry runs.
    pub fn open_in_memory(channel: &str) -> Result<Self, DirectoryError> {
        Self::with_connection(Connection::open_in_memory()?, channel)
    }

    fn with_connection(conn: Connection, channel: &str) -> Result<Self, DirectoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            channel: Arc::from(channel),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, DirectoryError> {
        self.conn
            .lock()
            .map_err(|_| DirectoryError::StorageUnavailable("connection lock poisoned".into()))
    }

    /// Merge `update` into the record for `node_id`, creating it if needed.
    pub fn upsert(&self, node_id: &str, update: &NodeUpdate) -> Result<(), DirectoryError> {
        if update.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        conn.execute(
            UPSERT,
            params![
                &*self.channel,
                node_id,
                update.long_name,
                update.short_name,
                update.latitude_i,
                update.longitude_i,
                update.altitude,
                update.precision_bits,
            ],
        )?;
        tracing::debug!(node = node_id, ?update, "node record upserted");
        Ok(())
    }

    /// Long name for a node, if known and non-empty.
    pub fn display_name(&self, node_id: &str) -> Result<Option<String>, DirectoryError> {
        let conn = self.lock()?;
        let name: Option<Option<String>> = conn
            .query_row(
                "SELECT long_name FROM nodes WHERE channel = ?1 AND node_id = ?2",
                params![&*self.channel, node_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name.flatten().filter(|n| !n.trim().is_empty()))
    }

    /// Full record for a node.
    pub fn get(&self, node_id: &str) -> Result<Option<NodeRecord>, DirectoryError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT node_id, long_name, short_name, macaddr, latitude_i, longitude_i,
                        altitude, precision_bits, last_updated
                 FROM nodes WHERE channel = ?1 AND node_id = ?2",
                params![&*self.channel, node_id],
                |row| {
                    Ok(NodeRecord {
                        node_id: row.get(0)?,
                        long_name: row.get(1)?,
                        short_name: row.get(2)?,
                        macaddr: row.get(3)?,
                        latitude_i: row.get(4)?,
                        longitude_i: row.get(5)?,
                        altitude: row.get(6)?,
                        precision_bits: row.get(7)?,
                        last_updated: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Number of nodes known on this channel.
    pub fn count(&self) -> Result<usize, DirectoryError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE channel = ?1",
            params![&*self.channel],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// `upsert` on the blocking pool. SQLite may sit in its busy timeout;
    /// async callers must not hold a runtime worker for that long.
    pub async fn upsert_async(
        &self,
        node_id: String,
        update: NodeUpdate,
    ) -> Result<(), DirectoryError> {
        let directory = self.clone();
        tokio::task::spawn_blocking(move || directory.upsert(&node_id, &update))
            .await
            .map_err(|e| DirectoryError::StorageUnavailable(e.to_string()))?
    }

    /// `display_name` on the blocking pool.
    pub async fn display_name_async(&self, node_id: String) -> Result<Option<String>, DirectoryError> {
        let directory = self.clone();
        tokio::task::spawn_blocking(move || directory.display_name(&node_id))
            .await
            .map_err(|e| DirectoryError::StorageUnavailable(e.to_string()))?
    }

    /// Drop the backing table so every later call fails.
    #[cfg(test)]
    pub(crate) fn break_storage(&self) {
        if let Ok(conn) = self.conn.lock() {
            let _ = conn.execute_batch("DROP TABLE nodes");
        }
    }
}
