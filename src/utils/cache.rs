//! In-process progress store

use crate::error::ArchiveError;
use crate::report::redis::ProgressStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CachedValue {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, CachedValue>,
    sets: HashMap<String, HashSet<String>>,
}

/// TTL-aware key/value store with sets, for tests and single-host runs
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a key immediately, as if its TTL had run out
    pub fn expire(&self, key: &str) {
        self.lock().values.remove(key);
    }

    fn live_value(inner: &mut Inner, key: &str) -> Option<String> {
        match inner.values.get(key) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.value.clone()),
            Some(_) => {
                inner.values.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ArchiveError> {
        self.lock().values.insert(
            key.to_string(),
            CachedValue {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ArchiveError> {
        Ok(Self::live_value(&mut self.lock(), key))
    }

    async fn exists(&self, key: &str) -> Result<bool, ArchiveError> {
        Ok(Self::live_value(&mut self.lock(), key).is_some())
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), ArchiveError> {
        self.lock()
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), ArchiveError> {
        if let Some(members) = self.lock().sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, ArchiveError> {
        let mut members: Vec<String> = self
            .lock()
            .sets
            .get(set)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_expire() {
        let store = MemoryStore::new();

        store.set_with_ttl("key1", "value1", Duration::from_millis(100)).await.unwrap();
        store.set_with_ttl("key2", "value2", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("key1").await.unwrap().as_deref(), Some("value1"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!store.exists("key1").await.unwrap());
        assert!(store.exists("key2").await.unwrap());

        store.expire("key2");
        assert_eq!(store.get("key2").await.unwrap(), None);
    }

    #[test]
    fn test_sets() {
        let store = MemoryStore::new();

        tokio_test::block_on(async {
            store.add_to_set("active", "b").await.unwrap();
            store.add_to_set("active", "a").await.unwrap();
            store.add_to_set("active", "a").await.unwrap();
            assert_eq!(store.set_members("active").await.unwrap(), vec!["a", "b"]);

            store.remove_from_set("active", "a").await.unwrap();
            store.remove_from_set("missing", "a").await.unwrap();
            assert_eq!(store.set_members("active").await.unwrap(), vec!["b"]);
            assert!(store.set_members("missing").await.unwrap().is_empty());
        });
    }
}
