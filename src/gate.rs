// 🔐 Content Gate - locked or unlocked?
//
// Cache-aside read: free content is always unlocked, a local entitlement
// answers immediately, and only a cache miss asks the platform (which writes
// through to the cache when it confirms ownership).

use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::cache::EntitlementCache;
use crate::catalog::{ContentCatalog, PurchasableItem};
use crate::verifier::EntitlementVerifier;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnlockState {
    Free,
    Unlocked,
    Locked { item: PurchasableItem },
}

impl UnlockState {
    pub fn is_unlocked(&self) -> bool {
        !matches!(self, UnlockState::Locked { .. })
    }
}

pub struct ContentGate {
    catalog: Arc<ContentCatalog>,
    cache: Arc<EntitlementCache>,
    verifier: Arc<EntitlementVerifier>,
}

impl ContentGate {
    pub fn new(
        catalog: Arc<ContentCatalog>,
        cache: Arc<EntitlementCache>,
        verifier: Arc<EntitlementVerifier>,
    ) -> Self {
        Self {
            catalog,
            cache,
            verifier,
        }
    }

    pub fn catalog(&self) -> &ContentCatalog {
        &self.catalog
    }

    pub fn is_premium(&self, content_id: &str) -> bool {
        self.catalog.is_premium(content_id)
    }

    pub fn to_purchasable_item(&self, content_id: &str) -> Option<PurchasableItem> {
        self.catalog.to_purchasable_item(content_id)
    }

    /// A verification failure reads as locked; the user can retry or restore.
    pub async fn is_unlocked(&self, content_id: &str) -> bool {
        let Some(content) = self.catalog.get(content_id) else {
            return true;
        };

        if self.cache.is_purchased(&content.product_id) {
            return true;
        }

        match self.verifier.verify(&content.product_id).await {
            Ok(owned) => owned,
            Err(e) => {
                warn!(content_id, product_id = %content.product_id, error = %e, "treating content as locked");
                false
            }
        }
    }

    pub async fn unlock_state(&self, content_id: &str) -> UnlockState {
        let Some(item) = self.to_purchasable_item(content_id) else {
            return UnlockState::Free;
        };

        if self.is_unlocked(content_id).await {
            UnlockState::Unlocked
        } else {
            UnlockState::Locked { item }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKeyValueStore;
    use crate::sandbox::SandboxStore;

    const CLOCK_CONTENT: &str = "widget_premium_clock_1";
    const CLOCK: &str = "com.app.widget.premium_clock_1";

    fn setup() -> (Arc<SandboxStore>, Arc<EntitlementCache>, ContentGate) {
        let catalog = Arc::new(ContentCatalog::with_defaults());
        let store = Arc::new(SandboxStore::from_catalog("test-key", &catalog));
        let cache = Arc::new(EntitlementCache::new(Arc::new(MemoryKeyValueStore::new())));
        let verifier = Arc::new(EntitlementVerifier::new(store.clone(), cache.clone()));
        let gate = ContentGate::new(catalog, cache.clone(), verifier);
        (store, cache, gate)
    }

    #[tokio::test]
    async fn test_free_content_skips_remote() {
        let (store, _, gate) = setup();

        assert!(!gate.is_premium("widget_free_digital"));
        assert!(gate.is_unlocked("widget_free_digital").await);
        assert_eq!(gate.unlock_state("widget_free_digital").await, UnlockState::Free);
        assert_eq!(store.entitlement_queries(), 0);
    }

    #[tokio::test]
    async fn test_cached_entitlement_skips_remote() {
        let (store, cache, gate) = setup();
        cache.record_purchase(CLOCK).unwrap();

        assert!(gate.is_unlocked(CLOCK_CONTENT).await);
        assert_eq!(store.entitlement_queries(), 0);
    }

    #[tokio::test]
    async fn test_cache_miss_falls_back_to_verifier() {
        let (store, cache, gate) = setup();

        assert!(!gate.is_unlocked(CLOCK_CONTENT).await);
        assert_eq!(store.entitlement_queries(), 1);

        store.grant_external(CLOCK).unwrap();
        assert!(gate.is_unlocked(CLOCK_CONTENT).await);
        assert_eq!(store.entitlement_queries(), 2);
        assert!(cache.is_purchased(CLOCK), "verifier writes through");

        assert!(gate.is_unlocked(CLOCK_CONTENT).await);
        assert_eq!(store.entitlement_queries(), 2);
    }

    #[tokio::test]
    async fn test_verifier_failure_reads_as_locked() {
        let (store, _, gate) = setup();
        store.grant_external(CLOCK).unwrap();
        store.set_offline(true);

        assert!(!gate.is_unlocked(CLOCK_CONTENT).await);
    }

    #[tokio::test]
    async fn test_locked_state_carries_item() {
        let (_, _, gate) = setup();

        match gate.unlock_state(CLOCK_CONTENT).await {
            UnlockState::Locked { item } => {
                assert_eq!(item.product_id, CLOCK);
                assert_eq!(item.price, rust_decimal::Decimal::from(480));
            }
            other => panic!("expected locked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_checks_agree() {
        let (store, _, gate) = setup();
        store.grant_external(CLOCK).unwrap();
        let gate = Arc::new(gate);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move { gate.is_unlocked(CLOCK_CONTENT).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap());
        }
    }
}
