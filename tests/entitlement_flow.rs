// End-to-end: catalog → gate → purchase → shared container → widget read

use std::sync::Arc;
use std::time::Duration;

use widget_entitlements::{
    AppConfig, ContentCatalog, Database, EntitlementCache, EntitlementChange, EntitlementServices,
    PaymentStatus, PurchaseScript, SandboxStore, UnlockState, DEFAULT_PURCHASED_ITEMS_KEY,
};

const CLOCK_CONTENT: &str = "widget_premium_clock_1";
const CLOCK: &str = "com.app.widget.premium_clock_1";

fn services_at(path: &std::path::Path) -> (Arc<SandboxStore>, Arc<Database>, EntitlementServices) {
    let catalog = ContentCatalog::with_defaults();
    let store = Arc::new(SandboxStore::from_catalog("e2e-key", &catalog));
    let db = Arc::new(Database::open(path).unwrap());
    let services = EntitlementServices::new(
        catalog,
        db.clone(),
        DEFAULT_PURCHASED_ITEMS_KEY,
        store.clone(),
        Some(db.clone()),
    );
    (store, db, services)
}

#[tokio::test]
async fn test_purchase_unlocks_content_for_widgets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let (store, db, services) = services_at(&path);

    // Locked: cache miss falls back to the store once
    assert!(!services.gate.is_unlocked(CLOCK_CONTENT).await);
    assert_eq!(store.entitlement_queries(), 1);

    let item = services.gate.to_purchasable_item(CLOCK_CONTENT).unwrap();
    let receipt = services.purchases.purchase(&item).await.unwrap();
    assert_eq!(receipt.product_id, CLOCK);
    assert_eq!(services.purchases.status(), PaymentStatus::Purchased);
    assert!(store.is_finished(&receipt.transaction_id));

    // Unlocked from the cache, no further remote query
    assert!(services.gate.is_unlocked(CLOCK_CONTENT).await);
    assert_eq!(services.gate.unlock_state(CLOCK_CONTENT).await, UnlockState::Unlocked);
    assert_eq!(store.entitlement_queries(), 1);

    // A widget process opens the same container and sees the purchase
    let widget_cache = EntitlementCache::new(Arc::new(Database::open(&path).unwrap()));
    assert!(widget_cache.is_purchased(CLOCK));

    let payments = db.payments_for_product(CLOCK).unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, PaymentStatus::Purchased);

    println!("✅ Purchase → widget unlock PASSED");
}

#[tokio::test]
async fn test_cancelled_purchase_leaves_content_locked() {
    let dir = tempfile::tempdir().unwrap();
    let (store, db, services) = services_at(&dir.path().join("shared.db"));
    store.script(PurchaseScript::Cancel);

    let item = services.gate.to_purchasable_item(CLOCK_CONTENT).unwrap();
    let err = services.purchases.purchase(&item).await.unwrap_err();

    assert!(err.user_message().is_none());
    assert_eq!(services.purchases.status(), PaymentStatus::NotPurchased);
    assert!(!services.cache.is_purchased(CLOCK));

    let payments = db.payments_for_product(CLOCK).unwrap();
    assert_eq!(payments[0].status, PaymentStatus::NotPurchased);
}

#[tokio::test]
async fn test_restore_after_reinstall() {
    let dir = tempfile::tempdir().unwrap();
    let (store, _, services) = services_at(&dir.path().join("shared.db"));

    // Bought on another device; nothing local yet
    store.grant_external(CLOCK).unwrap();
    assert!(!services.cache.is_purchased(CLOCK));

    let restored = services.purchases.restore().await.unwrap();
    assert_eq!(restored, vec![CLOCK.to_string()]);
    assert_eq!(services.purchases.status(), PaymentStatus::Restored);
    assert!(services.cache.is_purchased(CLOCK));
}

#[tokio::test]
async fn test_refund_relocks_content() {
    let dir = tempfile::tempdir().unwrap();
    let (store, db, services) = services_at(&dir.path().join("shared.db"));
    let mut changes = services.purchases.entitlement_changes();
    let listener = services.purchases.spawn_transaction_listener();

    let item = services.gate.to_purchasable_item(CLOCK_CONTENT).unwrap();
    services.purchases.purchase(&item).await.unwrap();
    assert!(services.gate.is_unlocked(CLOCK_CONTENT).await);

    store.revoke(CLOCK).unwrap();

    let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        change,
        EntitlementChange::Revoked {
            product_id: CLOCK.to_string()
        }
    );

    assert!(!services.cache.is_purchased(CLOCK));
    assert!(!services.gate.is_unlocked(CLOCK_CONTENT).await);

    let events = db.events_for("product", CLOCK).unwrap();
    assert!(events.iter().any(|e| e.event_type == "entitlement_revoked"));

    listener.abort();
}

#[tokio::test]
async fn test_restore_finds_purchase_from_previous_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        database_path: dir.path().join("shared.db"),
        ..AppConfig::default()
    };

    {
        let (services, _) = EntitlementServices::from_config(&config).unwrap();
        let item = services.gate.to_purchasable_item(CLOCK_CONTENT).unwrap();
        services.purchases.purchase(&item).await.unwrap();
        services.cache.clear().unwrap();
    }

    let (services, _) = EntitlementServices::from_config(&config).unwrap();
    assert!(!services.cache.is_purchased(CLOCK));

    let restored = services.purchases.restore().await.unwrap();
    assert_eq!(restored, vec![CLOCK.to_string()]);
    assert!(services.gate.is_unlocked(CLOCK_CONTENT).await);
}
