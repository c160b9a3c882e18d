//! Concurrent record store backing one collection.
//!
//! Holds two parallel [`DashMap`]s: `key -> value` and
//! `key -> last-modification nanoseconds`. The second map is the LWW clock
//! table consulted when remote packets are applied; entries in it outlive
//! deletions so a stale replicated write cannot resurrect a removed key.
//!
//! Writes raise a single-slot dirty signal consumed by the persistence loop;
//! repeated raises coalesce into one pending wake.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nanokv_core::StoredRecord;
use tokio::sync::Notify;

use crate::error::ApplyError;

/// One pending wake suffices: an [`AtomicBool`] carries the pending state and
/// the [`Notify`] is only rung on the false-to-true transition.
#[derive(Debug, Default)]
struct DirtySignal {
    pending: AtomicBool,
    wake: Notify,
}

impl DirtySignal {
    fn raise(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    /// Consumes the pending state, returning whether a wake was pending.
    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Completes once a wake is pending. The caller must `take()` before
    /// flushing, otherwise the next wait returns immediately.
    async fn wait(&self) {
        loop {
            if self.pending.load(Ordering::Acquire) {
                return;
            }
            self.wake.notified().await;
        }
    }
}

/// Concurrent `key -> value` mapping plus the per-key LWW clock table.
#[derive(Default)]
pub(crate) struct RecordStore {
    data: DashMap<String, StoredRecord>,
    last_modified: DashMap<String, i64>,
    dirty: DirtySignal,
    count: AtomicI64,
}

impl RecordStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Non-blocking concurrent read.
    pub(crate) fn get(&self, key: &str) -> Option<StoredRecord> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    pub(crate) fn exists(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Records the local write clock for `key`.
    ///
    /// Must happen before the data mutation it belongs to, so a reflected
    /// packet arriving later cannot overwrite the just-written local value.
    pub(crate) fn record_write_ns(&self, key: &str, ts: i64) {
        self.last_modified.insert(key.to_string(), ts);
    }

    pub(crate) fn last_modified_ns(&self, key: &str) -> Option<i64> {
        self.last_modified.get(key).map(|entry| *entry.value())
    }

    /// Publishes `value` under `key` and raises the dirty signal.
    pub(crate) fn set(&self, key: &str, value: StoredRecord) {
        self.data.insert(key.to_string(), value);
        self.dirty.raise();
    }

    /// Removes `key`, returning whether it existed. The LWW clock entry is
    /// kept so later stale packets for the key still lose.
    pub(crate) fn delete(&self, key: &str) -> bool {
        let existed = self.data.remove(key).is_some();
        self.dirty.raise();
        existed
    }

    /// Stores a record during snapshot load without touching the LWW clock
    /// or the dirty signal. Load is initialization, not a write.
    pub(crate) fn insert_loaded(&self, key: String, value: StoredRecord) {
        self.data.insert(key, value);
    }

    /// Applies a replicated write under the LWW rule.
    ///
    /// Accepted iff the packet timestamp is at least the local clock entry
    /// for the key (equal timestamps re-apply idempotently). The clock entry
    /// is updated to the applied timestamp.
    pub(crate) fn apply_set(
        &self,
        key: &str,
        value: StoredRecord,
        ts: i64,
    ) -> Result<(), ApplyError> {
        match self.last_modified.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let local_ns = *entry.get();
                if ts < local_ns {
                    return Err(ApplyError::OutdatedPacket {
                        packet_ns: ts,
                        local_ns,
                    });
                }
                self.data.insert(key.to_string(), value);
                entry.insert(ts);
            }
            Entry::Vacant(entry) => {
                self.data.insert(key.to_string(), value);
                entry.insert(ts);
            }
        }
        self.dirty.raise();
        Ok(())
    }

    /// Applies a replicated removal under the LWW rule.
    pub(crate) fn apply_delete(&self, key: &str, ts: i64) -> Result<(), ApplyError> {
        match self.last_modified.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let local_ns = *entry.get();
                if ts < local_ns {
                    return Err(ApplyError::OutdatedPacket {
                        packet_ns: ts,
                        local_ns,
                    });
                }
                self.data.remove(key);
                entry.insert(ts);
            }
            Entry::Vacant(entry) => {
                self.data.remove(key);
                entry.insert(ts);
            }
        }
        self.dirty.raise();
        Ok(())
    }

    /// Removes all entries and clock state, resets the cached count, and
    /// raises the dirty signal.
    pub(crate) fn clear(&self) {
        self.data.clear();
        self.last_modified.clear();
        self.count.store(0, Ordering::Relaxed);
        self.dirty.raise();
    }

    /// Every value once, order unspecified. Safe under concurrent mutation;
    /// a mix of before/after states may be observed.
    pub(crate) fn values(&self) -> Vec<StoredRecord> {
        self.data.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of all `(key, value)` pairs, order unspecified.
    pub(crate) fn snapshot(&self) -> Vec<(String, StoredRecord)> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Cached element-count estimate, set by the last flush or load.
    pub(crate) fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_count(&self, count: i64) {
        self.count.store(count, Ordering::Relaxed);
    }

    pub(crate) async fn dirty_wait(&self) {
        self.dirty.wait().await;
    }

    pub(crate) fn dirty_take(&self) -> bool {
        self.dirty.take()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn record(id: i64) -> StoredRecord {
        Arc::new(id)
    }

    fn unwrap_id(value: &StoredRecord) -> i64 {
        *value.downcast_ref::<i64>().expect("i64 record")
    }

    #[test]
    fn set_get_delete_round_trip() {
        let store = RecordStore::new();

        assert!(store.get("1").is_none());
        store.set("1", record(1));
        assert_eq!(unwrap_id(&store.get("1").expect("present")), 1);
        assert!(store.exists("1"));

        assert!(store.delete("1"));
        assert!(!store.delete("1"));
        assert!(store.get("1").is_none());
    }

    #[test]
    fn clear_empties_data_and_clock() {
        let store = RecordStore::new();
        store.record_write_ns("1", 10);
        store.set("1", record(1));
        store.set("2", record(2));
        store.set_count(2);

        store.clear();
        assert_eq!(store.len(), 0);
        assert_eq!(store.count(), 0);
        assert!(store.last_modified_ns("1").is_none());
        assert!(store.values().is_empty());
    }

    #[test]
    fn values_yields_every_record_once() {
        let store = RecordStore::new();
        for i in 0..100 {
            store.set(&i.to_string(), record(i));
        }

        let mut ids: Vec<i64> = store.values().iter().map(unwrap_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn apply_set_accepts_newer_and_equal_timestamps() {
        let store = RecordStore::new();

        store.apply_set("k", record(1), 100).expect("first apply");
        assert_eq!(store.last_modified_ns("k"), Some(100));

        // Equal timestamp: idempotent re-apply.
        store.apply_set("k", record(1), 100).expect("equal ts");
        assert_eq!(store.last_modified_ns("k"), Some(100));

        store.apply_set("k", record(2), 200).expect("newer ts");
        assert_eq!(unwrap_id(&store.get("k").expect("present")), 2);
        assert_eq!(store.last_modified_ns("k"), Some(200));
    }

    #[test]
    fn apply_set_drops_outdated_packets() {
        let store = RecordStore::new();
        store.record_write_ns("k", 1_000);
        store.set("k", record(9));

        let result = store.apply_set("k", record(1), 500);
        assert!(matches!(
            result,
            Err(ApplyError::OutdatedPacket {
                packet_ns: 500,
                local_ns: 1_000
            })
        ));
        // Stored value and clock untouched.
        assert_eq!(unwrap_id(&store.get("k").expect("present")), 9);
        assert_eq!(store.last_modified_ns("k"), Some(1_000));
    }

    #[test]
    fn apply_delete_respects_clock_and_removes() {
        let store = RecordStore::new();
        store.apply_set("k", record(1), 100).expect("apply");

        assert!(matches!(
            store.apply_delete("k", 50),
            Err(ApplyError::OutdatedPacket { .. })
        ));
        assert!(store.exists("k"));

        store.apply_delete("k", 150).expect("newer delete");
        assert!(!store.exists("k"));
        // Clock entry survives the deletion.
        assert_eq!(store.last_modified_ns("k"), Some(150));
    }

    #[test]
    fn stale_set_after_delete_is_dropped() {
        let store = RecordStore::new();
        store.apply_set("k", record(1), 100).expect("apply");
        store.apply_delete("k", 200).expect("delete");

        assert!(matches!(
            store.apply_set("k", record(1), 150),
            Err(ApplyError::OutdatedPacket { .. })
        ));
        assert!(!store.exists("k"));
    }

    #[test]
    fn insert_loaded_skips_clock_and_dirty() {
        let store = RecordStore::new();
        store.insert_loaded("k".to_string(), record(1));

        assert!(store.exists("k"));
        assert!(store.last_modified_ns("k").is_none());
        assert!(!store.dirty_take());
    }

    #[tokio::test]
    async fn dirty_signal_coalesces_raises() {
        let store = RecordStore::new();

        store.set("a", record(1));
        store.set("b", record(2));
        store.set("c", record(3));

        // One pending wake regardless of the number of writes.
        store.dirty_wait().await;
        assert!(store.dirty_take());
        assert!(!store.dirty_take());
    }

    #[tokio::test]
    async fn dirty_wait_sees_raise_after_wait_started() {
        let store = Arc::new(RecordStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store.dirty_wait().await;
                store.dirty_take()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set("k", record(1));

        let took = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("waiter task");
        assert!(took);
    }
}

/// Property-based checks of the LWW acceptance rule.
#[cfg(test)]
mod proptests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    fn final_value(store: &RecordStore, key: &str) -> Option<i64> {
        store
            .get(key)
            .map(|value| *value.downcast_ref::<i64>().expect("i64 record"))
    }

    proptest! {
        /// Applying the same writes in any two orders converges to the
        /// highest-timestamp value per key.
        #[test]
        fn apply_order_is_irrelevant(
            writes in proptest::collection::vec((0_i64..1_000, any::<i64>()), 1..20),
        ) {
            let forward = RecordStore::new();
            for (ts, id) in &writes {
                let _ = forward.apply_set("k", Arc::new(*id) as StoredRecord, *ts);
            }

            let reverse = RecordStore::new();
            for (ts, id) in writes.iter().rev() {
                let _ = reverse.apply_set("k", Arc::new(*id) as StoredRecord, *ts);
            }

            // Both stores agree on the winning timestamp.
            prop_assert_eq!(forward.last_modified_ns("k"), reverse.last_modified_ns("k"));

            // When a single write carries the strictly-highest timestamp, both
            // stores hold exactly its value. (With duplicate winning timestamps
            // the last applied wins, which may differ between orders.)
            let max_ts = writes.iter().map(|(ts, _)| *ts).max().expect("non-empty");
            let winners: Vec<i64> = writes
                .iter()
                .filter(|(ts, _)| *ts == max_ts)
                .map(|(_, id)| *id)
                .collect();
            if winners.len() == 1 {
                prop_assert_eq!(final_value(&forward, "k"), Some(winners[0]));
                prop_assert_eq!(final_value(&reverse, "k"), Some(winners[0]));
            }
        }

        /// Re-applying any accepted write is idempotent in data and clock.
        #[test]
        fn apply_is_idempotent(ts in any::<i64>(), id in any::<i64>()) {
            let store = RecordStore::new();
            store.apply_set("k", Arc::new(id) as StoredRecord, ts).expect("first");
            store.apply_set("k", Arc::new(id) as StoredRecord, ts).expect("second");

            prop_assert_eq!(final_value(&store, "k"), Some(id));
            prop_assert_eq!(store.last_modified_ns("k"), Some(ts));
        }

        /// A packet older than the local clock never changes the stored value.
        #[test]
        fn outdated_packets_never_win(
            local_ts in 0_i64..i64::MAX,
            behind in 1_i64..1_000_000,
        ) {
            let store = RecordStore::new();
            store.record_write_ns("k", local_ts);
            store.set("k", Arc::new(7_i64) as StoredRecord);

            let stale_ts = local_ts.saturating_sub(behind);
            if stale_ts < local_ts {
                let result = store.apply_set("k", Arc::new(8_i64) as StoredRecord, stale_ts);
                prop_assert!(result.is_err());
                prop_assert_eq!(final_value(&store, "k"), Some(7));
                prop_assert_eq!(store.last_modified_ns("k"), Some(local_ts));
            }
        }
    }
}
