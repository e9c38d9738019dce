// 💾 Local Entitlement Cache - offline "is this owned?" answers
//
// The purchased product identifiers are a JSON array of strings stored under
// one fixed key in a key/value store. Reads never fail from the caller's point
// of view: missing or unreadable state is an empty set.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Default key for the purchased-items array in the shared container
pub const DEFAULT_PURCHASED_ITEMS_KEY: &str = "com.app.widget.purchasedItems";

// ============================================================================
// KEY / VALUE STORE
// ============================================================================

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store, for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        values.remove(key);
        Ok(())
    }
}

// ============================================================================
// ENTITLEMENT CACHE
// ============================================================================

pub struct EntitlementCache {
    store: Arc<dyn KeyValueStore>,
    key: String,

    /// Serializes read-modify-write cycles on the purchased-items array
    write_lock: Mutex<()>,
}

impl EntitlementCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(store, DEFAULT_PURCHASED_ITEMS_KEY)
    }

    pub fn with_key(store: Arc<dyn KeyValueStore>, key: &str) -> Self {
        Self {
            store,
            key: key.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// All purchased product ids, in the order they were recorded
    pub fn purchased_items(&self) -> Vec<String> {
        match self.load() {
            Ok(items) => items,
            Err(e) => {
                warn!(key = %self.key, error = %e, "unreadable entitlement state, treating as empty");
                Vec::new()
            }
        }
    }

    pub fn is_purchased(&self, product_id: &str) -> bool {
        self.purchased_items().iter().any(|id| id == product_id)
    }

    /// Add `product_id` to the persisted set. Returns true if it was not there yet.
    pub fn record_purchase(&self, product_id: &str) -> Result<bool> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("entitlement cache lock poisoned"))?;

        let mut items = self.purchased_items();
        if items.iter().any(|id| id == product_id) {
            return Ok(false);
        }

        items.push(product_id.to_string());
        self.persist(&items)?;
        debug!(product_id, "entitlement recorded");
        Ok(true)
    }

    /// Revoke a local record. Returns true if it was present.
    pub fn remove(&self, product_id: &str) -> Result<bool> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("entitlement cache lock poisoned"))?;

        let mut items = self.purchased_items();
        let before = items.len();
        items.retain(|id| id != product_id);
        if items.len() == before {
            return Ok(false);
        }

        self.persist(&items)?;
        debug!(product_id, "entitlement removed");
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("entitlement cache lock poisoned"))?;

        self.store.remove(&self.key)?;
        debug!(key = %self.key, "entitlements cleared");
        Ok(())
    }

    fn load(&self) -> Result<Vec<String>> {
        match self.store.get(&self.key)? {
            Some(json) => serde_json::from_str(&json)
                .with_context(|| format!("Invalid purchased items under {}", self.key)),
            None => Ok(Vec::new()),
        }
    }

    fn persist(&self, items: &[String]) -> Result<()> {
        let json = serde_json::to_string(items)?;
        self.store
            .set(&self.key, &json)
            .with_context(|| format!("Failed to persist purchased items under {}", self.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn memory_cache() -> (Arc<MemoryKeyValueStore>, EntitlementCache) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let cache = EntitlementCache::new(store.clone());
        (store, cache)
    }

    #[test]
    fn test_empty_state_means_nothing_owned() {
        let (_, cache) = memory_cache();
        assert!(!cache.is_purchased("com.app.widget.premium_clock_1"));
        assert!(cache.purchased_items().is_empty());
    }

    #[test]
    fn test_record_purchase_is_idempotent() {
        let (_, cache) = memory_cache();

        assert!(cache.record_purchase("p1").unwrap());
        assert!(!cache.record_purchase("p1").unwrap());
        assert!(!cache.record_purchase("p1").unwrap());

        for _ in 0..3 {
            assert!(cache.is_purchased("p1"));
        }
        assert_eq!(cache.purchased_items(), vec!["p1".to_string()]);
    }

    #[test]
    fn test_persisted_as_json_array_under_fixed_key() {
        let (store, cache) = memory_cache();
        cache.record_purchase("p1").unwrap();
        cache.record_purchase("p2").unwrap();

        let raw = store.get(DEFAULT_PURCHASED_ITEMS_KEY).unwrap().unwrap();
        assert_eq!(raw, "[\"p1\",\"p2\"]");
    }

    #[test]
    fn test_remove_and_clear() {
        let (_, cache) = memory_cache();
        cache.record_purchase("p1").unwrap();
        cache.record_purchase("p2").unwrap();

        assert!(cache.remove("p1").unwrap());
        assert!(!cache.remove("p1").unwrap());
        assert!(!cache.is_purchased("p1"));
        assert!(cache.is_purchased("p2"));

        cache.clear().unwrap();
        assert!(cache.purchased_items().is_empty());
    }

    #[test]
    fn test_corrupt_state_reads_as_empty() {
        let (store, cache) = memory_cache();
        store.set(DEFAULT_PURCHASED_ITEMS_KEY, "not json").unwrap();

        assert!(!cache.is_purchased("p1"));

        // The next write replaces the corrupt value
        cache.record_purchase("p1").unwrap();
        assert!(cache.is_purchased("p1"));
    }

    #[test]
    fn test_custom_key_is_isolated() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let app = EntitlementCache::with_key(store.clone(), "group.a.purchased");
        let other = EntitlementCache::with_key(store, "group.b.purchased");

        app.record_purchase("p1").unwrap();
        assert!(app.is_purchased("p1"));
        assert!(!other.is_purchased("p1"));
    }

    #[test]
    fn test_sqlite_container_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");

        let app = EntitlementCache::new(Arc::new(Database::open(&path).unwrap()));
        app.record_purchase("com.app.widget.premium_clock_1").unwrap();

        // A widget extension opens the same container independently
        let widget = EntitlementCache::new(Arc::new(Database::open(&path).unwrap()));
        assert!(widget.is_purchased("com.app.widget.premium_clock_1"));

        println!("✅ Shared container test PASSED");
    }
}
