//! Durable measurement store with a cache of each device's latest value.
//!
//! Writes insert a measurement only if its key is new, then refresh the latest-value cache
//! before reporting success. Reads of the latest value go to the cache first and fall back to
//! the database; range reads are chained sub-queries over the database.

pub mod backend;
pub mod scan;
pub mod sqlite;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{cache_key_latest, CacheError, LatestCache};
use crate::measurement::{ConversionError, StorableMeasurement};

pub use backend::{Backend, Cursor, OrderField, Page, RangeQuery, StoreError};
pub use scan::{DeviceSeries, RangeScan};
pub use sqlite::{SqliteBackend, DEFAULT_PAGE_LIMIT};

/// Result of a successful [`MeasurementStore::save`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// A measurement with the same key was already stored; nothing changed.
    AlreadyExists,
}

pub struct MeasurementStore {
    backend: Arc<dyn Backend>,
    cache: Arc<dyn LatestCache>,
}

impl MeasurementStore {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<dyn LatestCache>) -> Self {
        Self { backend, cache }
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Store a measurement unless one with the same key exists, then refresh the device's
    /// latest-value cache entry.
    ///
    /// Content of an existing row is not compared; a key match counts as already stored and is
    /// not an error. Cache failures are logged and never fail the save.
    #[tracing::instrument(name = "store_save", skip_all, fields(device_id = %m.device_id))]
    pub fn save(&self, m: &StorableMeasurement) -> Result<SaveOutcome, StoreError> {
        if m.has_zero_timestamp() {
            return Err(ConversionError::ZeroTimestamp.into());
        }

        let key = m.db_key();
        let outcome = if self.backend.insert_if_absent(&key, m)? {
            SaveOutcome::Inserted
        } else {
            SaveOutcome::AlreadyExists
        };
        debug!(key = %key, ?outcome, "saved measurement");

        self.refresh_latest(m);
        Ok(outcome)
    }

    /// `set` the device's cache entry unless it already holds something newer, so a late
    /// replay of an old measurement doesn't replace a fresher latest value.
    fn refresh_latest(&self, m: &StorableMeasurement) {
        let key = cache_key_latest(&m.device_id);

        match self.cache.get(&key) {
            Ok(cached) if cached.timestamp > m.timestamp => return,
            Ok(_) | Err(CacheError::Miss) => {}
            Err(e) => warn!(cache_key = %key, error = %e, "cache read failed before update"),
        }

        if let Err(e) = self.cache.set(&key, m) {
            warn!(cache_key = %key, error = %e, "failed to update latest measurement cache");
        }
    }

    /// Latest measurement for each device ID that has one. IDs with nothing stored are left
    /// out of the result.
    ///
    /// Stops at the first database error and returns it, discarding results already gathered
    /// for earlier IDs.
    #[tracing::instrument(name = "store_get_latest", skip_all, fields(devices = device_ids.len()))]
    pub fn get_latest<S: AsRef<str>>(
        &self,
        device_ids: &[S],
    ) -> Result<BTreeMap<String, StorableMeasurement>, StoreError> {
        let mut latest = BTreeMap::new();

        for id in device_ids {
            let id: &str = id.as_ref();
            if latest.contains_key(id) {
                continue;
            }
            let key = cache_key_latest(id);

            match self.cache.get(&key) {
                Ok(m) => {
                    latest.insert(id.to_string(), m);
                    continue;
                }
                Err(CacheError::Miss) => {}
                Err(e) => warn!(cache_key = %key, error = %e, "cache read failed, using store"),
            }

            let Some(m) = self.backend.latest(id)? else {
                continue;
            };

            match self.cache.add(&key, &m) {
                Ok(()) | Err(CacheError::NotStored) => {}
                Err(e) => warn!(cache_key = %key, error = %e, "failed to warm latest cache"),
            }
            latest.insert(id.to_string(), m);
        }

        Ok(latest)
    }

    /// Lazily scan a range, a page at a time.
    pub fn scan(&self, query: RangeQuery) -> RangeScan<'_> {
        RangeScan::new(self.backend.as_ref(), query)
    }

    #[tracing::instrument(name = "store_query_range", skip(self))]
    pub fn query_range(&self, query: RangeQuery) -> Result<DeviceSeries, StoreError> {
        let mut scan = self.scan(query);
        let series = DeviceSeries::collect(scan.by_ref())?;
        debug!(
            devices = series.len(),
            measurements = series.total(),
            pages = scan.pages_fetched(),
            "range query complete"
        );
        Ok(series)
    }

    /// Measurements taken at or after `start`.
    pub fn since(&self, start: DateTime<Utc>) -> Result<DeviceSeries, StoreError> {
        self.query_range(RangeQuery::since(start))
    }

    /// Measurements taken in `[start, end]`.
    pub fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DeviceSeries, StoreError> {
        self.query_range(RangeQuery::between(start, end))
    }

    /// Late measurements uploaded at or after `start`, ordered by upload time.
    pub fn delayed_since(&self, start: DateTime<Utc>) -> Result<DeviceSeries, StoreError> {
        self.query_range(RangeQuery::delayed_since(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::measurement::tests::ts;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn store_with(page_limit: usize) -> (MeasurementStore, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let backend = Arc::new(SqliteBackend::in_memory(page_limit).unwrap());
        (MeasurementStore::new(backend, cache.clone()), cache)
    }

    #[test]
    fn save_twice_is_idempotent() {
        let (store, _) = store_with(10);
        let m = StorableMeasurement::new("foo", ts(1, 0), 18.5);

        assert_eq!(store.save(&m).unwrap(), SaveOutcome::Inserted);
        assert_eq!(store.save(&m).unwrap(), SaveOutcome::AlreadyExists);
        assert_eq!(store.backend().count().unwrap(), 1);
    }

    #[test]
    fn save_rejects_zero_timestamp() {
        let (store, _) = store_with(10);
        let m = StorableMeasurement {
            device_id: "foo".into(),
            ..Default::default()
        };
        assert!(matches!(
            store.save(&m),
            Err(StoreError::Conversion(ConversionError::ZeroTimestamp))
        ));
    }

    #[test]
    fn save_updates_cache_before_returning() {
        let (store, cache) = store_with(10);
        let m = StorableMeasurement::new("foo", ts(1, 0), 18.5);

        store.save(&m).unwrap();

        assert_eq!(cache.get("foo#latest").unwrap(), m);
    }

    #[test]
    fn late_replay_does_not_replace_newer_cached_value() {
        let (store, cache) = store_with(10);
        let newer = StorableMeasurement::new("foo", ts(5, 0), 20.0);
        let late = StorableMeasurement::new("foo", ts(1, 0), 18.0).with_upload_timestamp(ts(6, 0));

        store.save(&newer).unwrap();
        store.save(&late).unwrap();

        assert_eq!(cache.get("foo#latest").unwrap(), newer);
        assert_eq!(store.get_latest(&["foo"]).unwrap()["foo"], newer);
    }

    #[test]
    fn get_latest_omits_unknown_devices_and_picks_max_timestamp() {
        let (store, cache) = store_with(10);
        for hour in [3, 1, 7, 2] {
            store
                .save(&StorableMeasurement::new("foo", ts(hour, 0), hour as f32))
                .unwrap();
        }
        store
            .save(&StorableMeasurement::new("bar", ts(4, 0), 4.0))
            .unwrap();
        // Force the "foo" read through the database.
        cache.delete("foo#latest").unwrap();

        let latest = store.get_latest(&["foo", "bar", "baz", "foo"]).unwrap();

        assert_eq!(latest.len(), 2);
        assert_eq!(latest["foo"].timestamp, ts(7, 0));
        assert_eq!(latest["bar"].timestamp, ts(4, 0));
        assert!(!latest.contains_key("baz"));
        assert_eq!(cache.get("foo#latest").unwrap().timestamp, ts(7, 0));
    }

    #[test]
    fn get_latest_prefers_cache() {
        let (store, cache) = store_with(10);
        let stored = StorableMeasurement::new("foo", ts(1, 0), 18.0);
        store.save(&stored).unwrap();
        let cached = StorableMeasurement::new("foo", ts(9, 0), 99.0);
        cache.set("foo#latest", &cached).unwrap();

        assert_eq!(store.get_latest(&["foo"]).unwrap()["foo"], cached);
    }

    struct FailingCache;

    impl LatestCache for FailingCache {
        fn get(&self, _: &str) -> Result<StorableMeasurement, CacheError> {
            Err(CacheError::Poisoned)
        }
        fn set(&self, _: &str, _: &StorableMeasurement) -> Result<(), CacheError> {
            Err(CacheError::Poisoned)
        }
        fn add(&self, _: &str, _: &StorableMeasurement) -> Result<(), CacheError> {
            Err(CacheError::Poisoned)
        }
    }

    #[test]
    fn cache_failures_never_fail_store_operations() {
        let backend = Arc::new(SqliteBackend::in_memory(10).unwrap());
        let store = MeasurementStore::new(backend, Arc::new(FailingCache));
        let m = StorableMeasurement::new("foo", ts(1, 0), 18.0);

        assert_eq!(store.save(&m).unwrap(), SaveOutcome::Inserted);
        assert_eq!(store.get_latest(&["foo"]).unwrap()["foo"], m);
    }

    /// Backend whose `latest` fails for one device.
    struct FlakyBackend {
        inner: SqliteBackend,
        failing_device: &'static str,
        failed: AtomicBool,
    }

    impl Backend for FlakyBackend {
        fn insert_if_absent(&self, key: &str, m: &StorableMeasurement) -> Result<bool, StoreError> {
            self.inner.insert_if_absent(key, m)
        }
        fn latest(&self, device_id: &str) -> Result<Option<StorableMeasurement>, StoreError> {
            if device_id == self.failing_device {
                self.failed.store(true, Ordering::SeqCst);
                return Err(StoreError::Poisoned);
            }
            self.inner.latest(device_id)
        }
        fn run(
            &self,
            query: &RangeQuery,
            start: Option<&Cursor>,
            limit: usize,
        ) -> Result<Page, StoreError> {
            self.inner.run(query, start, limit)
        }
        fn max_page_size(&self) -> usize {
            self.inner.max_page_size()
        }
        fn count(&self) -> Result<usize, StoreError> {
            self.inner.count()
        }
    }

    #[test]
    fn get_latest_aborts_on_first_store_error() {
        let backend = Arc::new(FlakyBackend {
            inner: SqliteBackend::in_memory(10).unwrap(),
            failing_device: "bad",
            failed: AtomicBool::new(false),
        });
        let store = MeasurementStore::new(backend.clone(), Arc::new(crate::cache::NoopCache));
        store
            .save(&StorableMeasurement::new("foo", ts(1, 0), 18.0))
            .unwrap();

        let result = store.get_latest(&["foo", "bad", "baz"]);

        assert!(result.is_err());
        assert!(backend.failed.load(Ordering::SeqCst));
    }

    #[test]
    fn range_query_spans_pages() {
        let (store, _) = store_with(3);
        for i in 0..10u32 {
            let device = ["a", "b", "c"][i as usize % 3];
            store
                .save(&StorableMeasurement::new(device, ts(i, 0), i as f32))
                .unwrap();
        }

        let mut scan = store.scan(RangeQuery::since(ts(0, 0)));
        let all: Vec<_> = scan.by_ref().collect::<Result<_, _>>().unwrap();
        assert_eq!(all.len(), 10);
        assert!(scan.pages_fetched() > 1);
        let keys: HashSet<_> = all.iter().map(|m| m.db_key()).collect();
        assert_eq!(keys.len(), 10);

        let series = store.since(ts(0, 0)).unwrap();
        assert_eq!(series.total(), 10);
        assert_eq!(series.device_ids().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        let a: Vec<_> = series.get("a").unwrap().iter().map(|m| m.timestamp).collect();
        assert_eq!(a, vec![ts(0, 0), ts(3, 0), ts(6, 0), ts(9, 0)]);
    }

    #[test]
    fn between_and_delayed_since() {
        let (store, _) = store_with(2);
        for i in 0..6u32 {
            store
                .save(&StorableMeasurement::new("foo", ts(i, 0), i as f32))
                .unwrap();
        }
        store
            .save(&StorableMeasurement::new("bar", ts(2, 30), 1.0).with_upload_timestamp(ts(8, 0)))
            .unwrap();
        store
            .save(&StorableMeasurement::new("bar", ts(0, 30), 1.0).with_upload_timestamp(ts(7, 0)))
            .unwrap();

        let between = store.between(ts(1, 0), ts(3, 0)).unwrap();
        assert_eq!(between.get("foo").unwrap().len(), 3);
        assert_eq!(between.get("bar").unwrap().len(), 1);

        let delayed = store.delayed_since(ts(7, 0)).unwrap();
        assert_eq!(delayed.device_ids().collect::<Vec<_>>(), vec!["bar"]);
        let uploads: Vec<_> = delayed
            .get("bar")
            .unwrap()
            .iter()
            .map(|m| m.upload_timestamp.unwrap())
            .collect();
        assert_eq!(uploads, vec![ts(7, 0), ts(8, 0)]);

        assert!(store.delayed_since(ts(9, 0)).unwrap().is_empty());
    }
}
