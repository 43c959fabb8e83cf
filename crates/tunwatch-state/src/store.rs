//! StateStore: redb-backed tunnel state persistence for tunwatch.
//!
//! Provides whole-record CRUD plus the field-level accessors the health
//! scheduler reads and writes through. Every accessor write is a single
//! read-modify-write transaction, so concurrent writers cannot lose each
//! other's fields. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TUNNELS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Whole records ──────────────────────────────────────────────

    /// Insert or replace a tunnel record.
    pub fn put_tunnel(&self, state: &TunnelState) -> StateResult<()> {
        let key = state.table_key();
        let value = serde_json::to_vec(state).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TUNNELS).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "tunnel stored");
        Ok(())
    }

    /// Get a tunnel record by name.
    pub fn get_tunnel(&self, name: &str) -> StateResult<Option<TunnelState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TUNNELS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let state: TunnelState =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Get a tunnel record, or the default state if it was never stored.
    pub fn tunnel_or_default(&self, name: &str) -> StateResult<TunnelState> {
        Ok(self
            .get_tunnel(name)?
            .unwrap_or_else(|| TunnelState::new(name)))
    }

    /// List all tunnels.
    pub fn list_tunnels(&self) -> StateResult<Vec<TunnelState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TUNNELS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let state: TunnelState =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(state);
        }
        Ok(results)
    }

    /// Delete a tunnel by name. Returns true if it existed.
    pub fn delete_tunnel(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TUNNELS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, existed, "tunnel deleted");
        Ok(existed)
    }

    // ── Field accessors ────────────────────────────────────────────

    /// Current public URL of the tunnel. Empty when no tunnel is active.
    pub fn public_url(&self, name: &str) -> StateResult<String> {
        Ok(self.tunnel_or_default(name)?.public_url)
    }

    /// Epoch milliseconds of the last completed check, 0 if never checked.
    pub fn last_pinged_timestamp(&self, name: &str) -> StateResult<u64> {
        Ok(self.tunnel_or_default(name)?.last_pinged_timestamp)
    }

    pub fn check_interval(&self, name: &str) -> StateResult<CheckInterval> {
        Ok(self.tunnel_or_default(name)?.check_interval)
    }

    /// Publish the scheduler's current interval bucket.
    pub fn set_check_interval(&self, name: &str, interval: CheckInterval) -> StateResult<()> {
        self.update(name, |state| state.check_interval = interval)?;
        Ok(())
    }

    /// Record a completed check at `timestamp_ms`.
    ///
    /// The stored timestamp never moves backwards; an older value is ignored.
    /// Returns the timestamp now stored.
    pub fn record_ping(&self, name: &str, timestamp_ms: u64) -> StateResult<u64> {
        let state = self.update(name, |state| {
            state.last_pinged_timestamp = state.last_pinged_timestamp.max(timestamp_ms);
        })?;
        Ok(state.last_pinged_timestamp)
    }

    /// Point the tunnel at a new public URL.
    ///
    /// A changed URL is a new tunnel session, so the reported status and
    /// last error are reset. Timing state is kept.
    pub fn set_public_url(&self, name: &str, url: &str) -> StateResult<()> {
        self.update(name, |state| {
            if state.public_url != url {
                state.public_url = url.to_string();
                state.tunnel_status = TunnelStatus::Inactive;
                state.last_error = None;
            }
        })?;
        Ok(())
    }

    /// Record the tunnel status reported by the last check.
    pub fn set_tunnel_status(
        &self,
        name: &str,
        status: TunnelStatus,
        error: Option<TunnelError>,
    ) -> StateResult<()> {
        self.update(name, |state| {
            state.tunnel_status = status;
            state.last_error = error;
        })?;
        Ok(())
    }

    /// Apply `f` to the stored record (or a default one) in one write transaction.
    fn update<F>(&self, name: &str, f: F) -> StateResult<TunnelState>
    where
        F: FnOnce(&mut TunnelState),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let state = {
            let mut table = txn.open_table(TUNNELS).map_err(map_err!(Table))?;
            let mut state = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice::<TunnelState>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => TunnelState::new(name),
            };
            f(&mut state);
            let value = serde_json::to_vec(&state).map_err(map_err!(Serialize))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
            state
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(state)
    }
}
