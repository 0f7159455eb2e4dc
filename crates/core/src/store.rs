//! Saved moments: durable storage plus a synchronous in-memory view.
//!
//! Every mutation writes to storage first and only touches the cache once
//! the write succeeded, so a storage failure leaves the cache as it was.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{Moment, MomentPatch};

/// Durable backend for moments, keyed by id.
pub trait MomentStorage {
    fn insert(&self, moment: &Moment) -> Result<()>;
    /// All rows, newest `created_at` first.
    fn select_all(&self) -> Result<Vec<Moment>>;
    fn select_by_id(&self, id: &str) -> Result<Option<Moment>>;
    /// Returns false when no row has `id`.
    fn update(&self, id: &str, patch: &MomentPatch) -> Result<bool>;
    /// Returns false when no row has `id`.
    fn delete(&self, id: &str) -> Result<bool>;
    /// Substring match over name and description, newest first.
    fn search(&self, query: &str) -> Result<Vec<Moment>>;
    fn count(&self) -> Result<u64>;
    fn clear(&self) -> Result<()>;
}

pub struct MomentStore<S> {
    storage: S,
    cache: Option<Vec<Moment>>,
}

impl<S: MomentStorage> MomentStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            cache: None,
        }
    }

    /// Loads (or reloads) the cache from storage.
    pub fn initialize(&mut self) -> Result<()> {
        let moments = self.storage.select_all()?;
        info!(count = moments.len(), "moment store loaded");
        self.cache = Some(moments);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.cache.is_some()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Newest first.
    pub fn list(&self) -> Result<&[Moment]> {
        Ok(self.cached()?.as_slice())
    }

    pub fn get_by_id(&self, id: &str) -> Result<&Moment> {
        self.cached()?
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.cached()?.len())
    }

    /// The caller supplies the id; it must not already exist.
    pub fn append(&mut self, moment: Moment) -> Result<()> {
        if self.cached()?.iter().any(|m| m.id == moment.id) {
            return Err(Error::DuplicateId(moment.id));
        }
        self.storage.insert(&moment)?;

        debug!(id = %moment.id, "moment appended");
        let cache = self.cached_mut()?;
        let at = cache.partition_point(|m| {
            m.created_at > moment.created_at
                || (m.created_at == moment.created_at && m.id < moment.id)
        });
        cache.insert(at, moment);
        Ok(())
    }

    pub fn update(&mut self, id: &str, patch: &MomentPatch) -> Result<&Moment> {
        let patch = patch.normalized()?;
        let index = self
            .cached()?
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !patch.is_empty() && !self.storage.update(id, &patch)? {
            return Err(Error::NotFound(id.to_string()));
        }

        debug!(id, "moment updated");
        let cache = self.cached_mut()?;
        cache[index].apply(&patch);
        Ok(&cache[index])
    }

    /// Permanent; there is no soft delete.
    pub fn remove(&mut self, id: &str) -> Result<Moment> {
        let index = self
            .cached()?
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !self.storage.delete(id)? {
            return Err(Error::NotFound(id.to_string()));
        }

        debug!(id, "moment removed");
        Ok(self.cached_mut()?.remove(index))
    }

    pub fn search(&self, query: &str) -> Result<Vec<Moment>> {
        self.cached()?;
        self.storage.search(query.trim())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        self.cached()?;
        self.storage.clear()?;
        self.cached_mut()?.clear();
        Ok(())
    }

    fn cached(&self) -> Result<&Vec<Moment>> {
        self.cache.as_ref().ok_or(Error::NotInitialized)
    }

    fn cached_mut(&mut self) -> Result<&mut Vec<Moment>> {
        self.cache.as_mut().ok_or(Error::NotInitialized)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::Cell;

    use super::*;
    use crate::db::SqliteMomentStorage;

    /// SQLite storage whose next `failures` writes fail.
    pub struct FlakyStorage {
        pub inner: SqliteMomentStorage,
        pub failures: Cell<u32>,
        pub write_attempts: Cell<u32>,
    }

    impl FlakyStorage {
        pub fn new(failures: u32) -> Self {
            Self {
                inner: SqliteMomentStorage::open_in_memory().unwrap(),
                failures: Cell::new(failures),
                write_attempts: Cell::new(0),
            }
        }

        fn write(&self) -> Result<()> {
            self.write_attempts.set(self.write_attempts.get() + 1);
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(Error::Io(std::io::Error::other("disk unplugged")));
            }
            Ok(())
        }
    }

    impl MomentStorage for FlakyStorage {
        fn insert(&self, moment: &Moment) -> Result<()> {
            self.write()?;
            self.inner.insert(moment)
        }
        fn select_all(&self) -> Result<Vec<Moment>> {
            self.inner.select_all()
        }
        fn select_by_id(&self, id: &str) -> Result<Option<Moment>> {
            self.inner.select_by_id(id)
        }
        fn update(&self, id: &str, patch: &MomentPatch) -> Result<bool> {
            self.write()?;
            self.inner.update(id, patch)
        }
        fn delete(&self, id: &str) -> Result<bool> {
            self.write()?;
            self.inner.delete(id)
        }
        fn search(&self, query: &str) -> Result<Vec<Moment>> {
            self.inner.search(query)
        }
        fn count(&self) -> Result<u64> {
            self.inner.count()
        }
        fn clear(&self) -> Result<()> {
            self.write()?;
            self.inner.clear()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::testing::FlakyStorage;
    use super::*;
    use crate::db::SqliteMomentStorage;

    fn moment(id: &str, minutes: i64) -> Moment {
        Moment {
            id: id.into(),
            name: format!("Moment {id}"),
            description: "a walk".into(),
            original_uri: "file:///videos/source.mov".into(),
            cropped_uri: format!("file:///clips/{id}.mov"),
            start_time_secs: 3.0,
            end_time_secs: 8.0,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                + Duration::minutes(minutes),
            thumbnail_uri: None,
        }
    }

    fn store() -> MomentStore<SqliteMomentStorage> {
        let mut store = MomentStore::new(SqliteMomentStorage::open_in_memory().unwrap());
        store.initialize().unwrap();
        store
    }

    #[test]
    fn requires_initialize() {
        let mut store = MomentStore::new(SqliteMomentStorage::open_in_memory().unwrap());
        assert!(matches!(store.list(), Err(Error::NotInitialized)));
        assert!(matches!(
            store.append(moment("a", 0)),
            Err(Error::NotInitialized)
        ));
        assert_eq!(store.storage().count().unwrap(), 0);
    }

    #[test]
    fn append_then_get_returns_equal_moment() {
        let mut store = store();
        let m = moment("a", 0);
        store.append(m.clone()).unwrap();
        assert_eq!(store.get_by_id("a").unwrap(), &m);
        assert_eq!(store.storage().select_by_id("a").unwrap(), Some(m));
    }

    #[test]
    fn remove_then_get_is_not_found() {
        let mut store = store();
        store.append(moment("a", 0)).unwrap();
        let removed = store.remove("a").unwrap();
        assert_eq!(removed.id, "a");
        assert!(matches!(store.get_by_id("a"), Err(Error::NotFound(_))));
        assert!(matches!(store.remove("a"), Err(Error::NotFound(_))));
        assert_eq!(store.storage().count().unwrap(), 0);
    }

    #[test]
    fn list_is_newest_first() {
        let mut store = store();
        store.append(moment("first", 0)).unwrap();
        store.append(moment("second", 5)).unwrap();
        store.append(moment("backdated", -5)).unwrap();
        let ids: Vec<_> = store.list().unwrap().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["second", "first", "backdated"]);
    }

    #[test]
    fn equal_timestamps_keep_reload_order() {
        let mut store = store();
        store.append(moment("b", 0)).unwrap();
        store.append(moment("c", 0)).unwrap();
        store.append(moment("a", 0)).unwrap();
        store.append(moment("later", 1)).unwrap();
        let ids = |store: &MomentStore<SqliteMomentStorage>| -> Vec<String> {
            store.list().unwrap().iter().map(|m| m.id.clone()).collect()
        };
        let cached = ids(&store);
        assert_eq!(cached, ["later", "a", "b", "c"]);

        store.initialize().unwrap();
        assert_eq!(ids(&store), cached);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut store = store();
        store.append(moment("a", 0)).unwrap();
        assert!(matches!(
            store.append(moment("a", 3)),
            Err(Error::DuplicateId(_))
        ));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn edit_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moments.db");
        {
            let mut store = MomentStore::new(SqliteMomentStorage::open(&path).unwrap());
            store.initialize().unwrap();
            store.append(moment("a", 0)).unwrap();
            let patch = MomentPatch {
                name: Some("  Renamed  ".into()),
                description: None,
            };
            let updated = store.update("a", &patch).unwrap();
            assert_eq!(updated.name, "Renamed");
        }

        let mut store = MomentStore::new(SqliteMomentStorage::open(&path).unwrap());
        store.initialize().unwrap();
        let reloaded = store.get_by_id("a").unwrap();
        assert_eq!(reloaded.name, "Renamed");
        assert_eq!(reloaded.description, "a walk");
        assert_eq!(reloaded.created_at, moment("a", 0).created_at);
    }

    #[test]
    fn invalid_edit_is_rejected_before_storage() {
        let mut store = MomentStore::new(FlakyStorage::new(0));
        store.initialize().unwrap();
        store.append(moment("a", 0)).unwrap();
        let attempts = store.storage().write_attempts.get();

        let patch = MomentPatch {
            name: Some("   ".into()),
            description: None,
        };
        assert!(matches!(store.update("a", &patch), Err(Error::Metadata(_))));
        assert!(matches!(
            store.update("nope", &MomentPatch::default()),
            Err(Error::NotFound(_))
        ));
        assert_eq!(store.storage().write_attempts.get(), attempts);
    }

    #[test]
    fn storage_failure_leaves_cache_unchanged() {
        let mut store = MomentStore::new(FlakyStorage::new(0));
        store.initialize().unwrap();
        store.append(moment("a", 0)).unwrap();

        store.storage().failures.set(1);
        assert!(store.append(moment("b", 1)).is_err());
        assert_eq!(store.count().unwrap(), 1);

        store.storage().failures.set(1);
        let patch = MomentPatch {
            name: Some("Changed".into()),
            description: None,
        };
        assert!(store.update("a", &patch).is_err());
        assert_eq!(store.get_by_id("a").unwrap().name, "Moment a");

        store.storage().failures.set(1);
        assert!(store.remove("a").is_err());
        assert!(store.get_by_id("a").is_ok());

        store.storage().failures.set(1);
        assert!(store.clear_all().is_err());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn search_goes_to_storage() {
        let mut store = store();
        store.append(moment("a", 0)).unwrap();
        let mut other = moment("b", 1);
        other.name = "Birthday".into();
        other.description = "cake".into();
        store.append(other).unwrap();

        let hits = store.search("  cake ").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");

        store.clear_all().unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(store.search("walk").unwrap().is_empty());
    }
}
