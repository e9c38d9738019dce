// 🧩 Composition root
//
// Builds the cache, verifier, purchase flow and gate once and hands out
// shared handles. Binaries create one of these per process.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::cache::{EntitlementCache, KeyValueStore};
use crate::catalog::ContentCatalog;
use crate::config::AppConfig;
use crate::db::Database;
use crate::gate::ContentGate;
use crate::purchase::PurchaseFlow;
use crate::sandbox::SandboxStore;
use crate::store::PlatformStore;
use crate::verifier::EntitlementVerifier;

pub struct EntitlementServices {
    pub catalog: Arc<ContentCatalog>,
    pub cache: Arc<EntitlementCache>,
    pub verifier: Arc<EntitlementVerifier>,
    pub purchases: Arc<PurchaseFlow>,
    pub gate: Arc<ContentGate>,
}

impl EntitlementServices {
    pub fn new(
        catalog: ContentCatalog,
        kv: Arc<dyn KeyValueStore>,
        purchased_items_key: &str,
        store: Arc<dyn PlatformStore>,
        history: Option<Arc<Database>>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let cache = Arc::new(EntitlementCache::with_key(kv, purchased_items_key));
        let verifier = Arc::new(EntitlementVerifier::new(store.clone(), cache.clone()));

        let mut purchases = PurchaseFlow::new(store, cache.clone(), verifier.clone());
        if let Some(db) = history {
            purchases = purchases.with_history(db);
        }

        let gate = Arc::new(ContentGate::new(
            catalog.clone(),
            cache.clone(),
            verifier.clone(),
        ));

        Self {
            catalog,
            cache,
            verifier,
            purchases: Arc::new(purchases),
            gate,
        }
    }

    /// Services backed by the configured SQLite container and a sandbox store
    /// whose ledger is kept in the same container.
    /// Returns the database handle too, for history queries.
    pub fn from_config(config: &AppConfig) -> Result<(Self, Arc<Database>)> {
        let catalog = match &config.catalog_path {
            Some(path) => ContentCatalog::load(path)
                .with_context(|| format!("Failed to load catalog: {:?}", path))?,
            None => ContentCatalog::with_defaults(),
        };

        let db = Arc::new(Database::open(&config.database_path)?);
        let store = Arc::new(
            SandboxStore::from_catalog(&config.sandbox_signing_key, &catalog)
                .with_ledger(db.clone())
                .context("Failed to load sandbox ledger")?,
        );

        info!(
            database = ?config.database_path,
            premium = catalog.len(),
            "entitlement services ready"
        );

        let services = Self::new(
            catalog,
            db.clone(),
            &config.purchased_items_key,
            store,
            Some(db.clone()),
        );
        Ok((services, db))
    }
}
