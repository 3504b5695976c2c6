//! StateStore: redb-backed persistence for fleet membership.
//!
//! Keeps every member the controller is responsible for plus a bounded
//! history of scaling activities. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

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

    /// Create an ephemeral in-memory state store (for testing and simulation).
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

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        txn.open_table(ACTIVITIES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Members ────────────────────────────────────────────────────

    /// Insert or update a tracked member.
    pub fn put_member(&self, member: &FleetMember) -> StateResult<()> {
        let value = serde_json::to_vec(member).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            table
                .insert(member.table_key(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a member by id.
    pub fn get_member(&self, id: &str) -> StateResult<Option<FleetMember>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let member: FleetMember =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(member))
            }
            None => Ok(None),
        }
    }

    /// List every tracked member.
    pub fn list_members(&self) -> StateResult<Vec<FleetMember>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let member: FleetMember =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(member);
        }
        Ok(results)
    }

    /// Delete a member by id. Returns true if it existed.
    pub fn delete_member(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(MEMBERS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(member = %id, existed, "member deleted");
        Ok(existed)
    }

    // ── Activities ─────────────────────────────────────────────────

    /// Append a scaling activity, assigning its sequence number, and prune
    /// the history down to the newest `keep` entries. Returns the sequence.
    pub fn record_activity(&self, activity: &ScalingActivity, keep: usize) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(ACTIVITIES).map_err(map_err!(Table))?;
            let last = match table.last().map_err(map_err!(Read))? {
                Some((key, _)) => key.value().parse::<u64>().unwrap_or(0),
                None => 0,
            };
            seq = last + 1;

            let mut stored = activity.clone();
            stored.seq = seq;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(stored.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            let keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    Some(key.value().to_string())
                })
                .collect();
            let excess = keys.len().saturating_sub(keep);
            for key in keys.iter().take(excess) {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq, cause = %activity.cause, "scaling activity recorded");
        Ok(seq)
    }

    /// List up to `limit` activities, newest first.
    pub fn list_activities(&self, limit: usize) -> StateResult<Vec<ScalingActivity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIVITIES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let activity: ScalingActivity =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(activity);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_member(id: &str) -> FleetMember {
        FleetMember {
            id: id.to_string(),
            address: format!("10.0.0.{}:8080", id.len()),
            launch_time: 1000,
            health_state: HealthState::Unknown,
            registered: false,
            terminating: false,
        }
    }

    fn test_activity(cause: &str) -> ScalingActivity {
        ScalingActivity {
            seq: 0,
            cause: cause.to_string(),
            from_desired: 2,
            to_desired: 3,
            launched: vec!["i-1".to_string()],
            terminated: vec![],
            degraded: false,
            started_at: 1000,
            finished_at: 1001,
        }
    }

    #[test]
    fn put_get_and_delete_member() {
        let store = StateStore::open_in_memory().unwrap();
        let member = test_member("i-1");
        store.put_member(&member).unwrap();

        assert_eq!(store.get_member("i-1").unwrap(), Some(member));
        assert!(store.delete_member("i-1").unwrap());
        assert!(!store.delete_member("i-1").unwrap());
        assert_eq!(store.get_member("i-1").unwrap(), None);
    }

    #[test]
    fn put_member_overwrites() {
        let store = StateStore::open_in_memory().unwrap();
        let mut member = test_member("i-1");
        store.put_member(&member).unwrap();

        member.health_state = HealthState::Healthy;
        member.registered = true;
        store.put_member(&member).unwrap();

        let members = store.list_members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].health_state, HealthState::Healthy);
        assert!(members[0].registered);
    }

    #[test]
    fn activities_get_increasing_sequence_numbers() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.record_activity(&test_activity("first"), 10).unwrap();
        let b = store.record_activity(&test_activity("second"), 10).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        let listed = store.list_activities(10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].cause, "second");
        assert_eq!(listed[0].seq, 2);
        assert_eq!(listed[1].cause, "first");
    }

    #[test]
    fn activity_history_is_pruned() {
        let store = StateStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .record_activity(&test_activity(&format!("op-{i}")), 3)
                .unwrap();
        }

        let listed = store.list_activities(10).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].cause, "op-4");
        assert_eq!(listed[2].cause, "op-2");
        // Sequence keeps counting after pruning.
        let next = store.record_activity(&test_activity("op-5"), 3).unwrap();
        assert_eq!(next, 6);
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put_member(&test_member("i-7")).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        let members = store.list_members().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, "i-7");
    }
}
