//! Watermark Store
//!
//! Persists, per remote node and storage kind, the position up to which the
//! local stores have been replicated to that node. Values are 8-byte
//! big-endian counters under `lastsync:{kind}:{node}` keys and never go down.

use crate::cluster::types::{NodeId, NodeState, NodeSyncState, StorageKind};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const KEY_PREFIX: &str = "lastsync";

/// Build the key of one watermark.
pub fn watermark_key(kind: StorageKind, node_id: &NodeId) -> String {
    format!("{}:{}:{}", KEY_PREFIX, kind.as_str(), node_id.as_str())
}

fn decode_value(bytes: &[u8]) -> anyhow::Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("corrupt watermark value of {} bytes", bytes.len()))?;
    Ok(u64::from_be_bytes(raw))
}

/// SQLite-backed watermark persistence.
pub struct WatermarkStore {
    conn: Mutex<Connection>,
}

impl WatermarkStore {
    /// Open (or create) the cluster state database at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cluster_state (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read one watermark; a missing entry reads as 0.
    pub fn get(&self, node_id: &NodeId, kind: StorageKind) -> anyhow::Result<u64> {
        let conn = self.conn.lock();
        Self::read(&conn, &watermark_key(kind, node_id))
    }

    /// Read the three watermarks of a peer.
    pub fn get_all(&self, node_id: &NodeId) -> anyhow::Result<NodeSyncState> {
        let conn = self.conn.lock();
        let mut state = NodeSyncState::default();
        for kind in StorageKind::ALL {
            state.set(kind, Self::read(&conn, &watermark_key(kind, node_id))?);
        }
        Ok(state)
    }

    /// Record a successful transfer. Lower values are ignored.
    ///
    /// Returns the value stored after the call.
    pub fn advance(&self, node_id: &NodeId, kind: StorageKind, value: u64) -> anyhow::Result<u64> {
        let key = watermark_key(kind, node_id);
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::read(&tx, &key)?;
        if value <= current {
            tx.commit()?;
            return Ok(current);
        }

        tx.execute(
            "INSERT INTO cluster_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.to_be_bytes().to_vec()],
        )?;
        tx.commit()?;

        tracing::debug!("watermark {} advanced {} -> {}", key, current, value);
        Ok(value)
    }

    /// Assemble the replication snapshot for the given peers.
    pub fn node_state(&self, local: &NodeId, peers: &[NodeId]) -> anyhow::Result<NodeState> {
        let mut state = NodeState {
            node_id: local.0.clone(),
            ..Default::default()
        };
        for peer in peers {
            state.last_sync.insert(peer.0.clone(), self.get_all(peer)?);
        }
        Ok(state)
    }

    fn read(conn: &Connection, key: &str) -> anyhow::Result<u64> {
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM cluster_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(bytes) => decode_value(&bytes),
            None => Ok(0),
        }
    }
}
