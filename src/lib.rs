// Widget Entitlements - Core Library
// Premium catalog, entitlement cache, purchase flow and content gate,
// shared by the CLI, the API server and tests

pub mod error;
pub mod store;
pub mod cache;
pub mod db;
pub mod content;
pub mod catalog;
pub mod sandbox;   // In-process platform store (signed transactions)
pub mod verifier;
pub mod purchase;
pub mod gate;
pub mod config;
pub mod logging;
pub mod services;

// Re-export commonly used types
pub use error::PaymentError;
pub use store::{
    PlatformStore, Product, PurchaseResult, StoreError, StoreTransaction, VerificationResult,
};
pub use cache::{EntitlementCache, KeyValueStore, MemoryKeyValueStore, DEFAULT_PURCHASED_ITEMS_KEY};
pub use db::{
    Database, Event, PaymentRecord,
    setup_database, insert_event, get_events_for_entity, insert_payment, get_payments_for_product,
};
pub use content::{ContentConfig, ContentDescriptor, WidgetSize, WidgetStyle};
pub use catalog::{
    CatalogError, ContentCatalog, ContentType, PremiumContent, PurchasableItem, PurchaseCategory,
    product_id_for, PRODUCT_ID_PREFIX,
};
pub use sandbox::{PurchaseScript, SandboxStore};
pub use verifier::EntitlementVerifier;
pub use purchase::{EntitlementChange, PaymentStatus, PurchaseFlow, PurchaseReceipt};
pub use gate::{ContentGate, UnlockState};
pub use config::AppConfig;
pub use services::EntitlementServices;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
