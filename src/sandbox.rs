// 🧪 Sandbox Store - an in-process platform store
//
// Behaves like a store testing environment: it keeps a product table and a
// transaction ledger, signs every transaction, and lets the caller script the
// outcome of the next purchase. Used by the binaries when no real platform is
// attached, and by the test suites.
//
// With `with_ledger` the ledger (transactions, finished ids, deferred
// purchases) lives in the shared SQLite container, so it survives restarts.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

use crate::catalog::ContentCatalog;
use crate::db::Database;
use crate::store::{
    PlatformStore, Product, PurchaseResult, StoreError, StoreTransaction, VerificationResult,
};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Outcome the sandbox produces for the next purchase call
#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseScript {
    Approve,
    Cancel,
    /// Ask-to-buy: the purchase stays pending until `approve_deferred`
    Defer,
    Fail(StoreError),
    /// Deliver a transaction whose signature does not verify
    Tamper,
}

#[derive(Default)]
struct SandboxState {
    products: HashMap<String, Product>,
    ledger: Vec<StoreTransaction>,
    deferred: HashSet<String>,
    finished: HashSet<String>,
    scripts: VecDeque<PurchaseScript>,
}

pub struct SandboxStore {
    signing_key: String,
    state: Mutex<SandboxState>,
    ledger_db: Option<Arc<Database>>,
    updates: broadcast::Sender<VerificationResult>,
    offline: AtomicBool,
    entitlement_queries: AtomicUsize,
    purchase_calls: AtomicUsize,
}

impl SandboxStore {
    pub fn new(signing_key: &str) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            signing_key: signing_key.to_string(),
            state: Mutex::new(SandboxState::default()),
            ledger_db: None,
            updates,
            offline: AtomicBool::new(false),
            entitlement_queries: AtomicUsize::new(0),
            purchase_calls: AtomicUsize::new(0),
        }
    }

    /// A sandbox selling every premium product in the catalog
    pub fn from_catalog(signing_key: &str, catalog: &ContentCatalog) -> Self {
        let store = Self::new(signing_key);
        for content in catalog.premium_contents() {
            let item = content.to_purchasable_item();
            store.add_product(Product {
                id: item.product_id,
                display_name: item.title,
                description: item.description,
                price: item.price,
                currency: crate::store::default_currency(),
            });
        }
        store
    }

    /// Load the ledger from `db` and write every later change through to it
    pub fn with_ledger(mut self, db: Arc<Database>) -> anyhow::Result<Self> {
        let transactions = db.store_transactions()?;
        let deferred = db.deferred_products()?;

        let state = self
            .state
            .get_mut()
            .map_err(|_| anyhow::anyhow!("sandbox state lock poisoned"))?;
        for (tx, finished) in transactions {
            if finished {
                state.finished.insert(tx.id.clone());
            }
            state.ledger.push(tx);
        }
        state.deferred.extend(deferred);
        debug!(
            transactions = state.ledger.len(),
            deferred = state.deferred.len(),
            "sandbox ledger loaded"
        );

        self.ledger_db = Some(db);
        Ok(self)
    }

    fn state(&self) -> Result<MutexGuard<'_, SandboxState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Internal("sandbox state lock poisoned".to_string()))
    }

    pub fn add_product(&self, product: Product) {
        if let Ok(mut state) = self.state() {
            state.products.insert(product.id.clone(), product);
        }
    }

    /// Queue the outcome of a future purchase; unscripted purchases approve.
    pub fn script(&self, script: PurchaseScript) {
        if let Ok(mut state) = self.state() {
            state.scripts.push_back(script);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn entitlement_queries(&self) -> usize {
        self.entitlement_queries.load(Ordering::SeqCst)
    }

    pub fn purchase_calls(&self) -> usize {
        self.purchase_calls.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self, transaction_id: &str) -> bool {
        self.state()
            .map(|state| state.finished.contains(transaction_id))
            .unwrap_or(false)
    }

    pub fn ledger(&self) -> Vec<StoreTransaction> {
        self.state()
            .map(|state| state.ledger.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Out-of-session events
    // ------------------------------------------------------------------------

    /// Approve a deferred (ask-to-buy) purchase and push it as an update
    pub fn approve_deferred(&self, product_id: &str) -> Result<StoreTransaction, StoreError> {
        {
            let mut state = self.state()?;
            if !state.deferred.contains(product_id) {
                return Err(StoreError::Rejected(format!(
                    "no deferred purchase for {}",
                    product_id
                )));
            }
            self.persist(|db| db.remove_deferred_product(product_id))?;
            state.deferred.remove(product_id);
        }
        self.grant_external(product_id)
    }

    /// A purchase made elsewhere (another device, family sharing)
    pub fn grant_external(&self, product_id: &str) -> Result<StoreTransaction, StoreError> {
        let tx = self.append_transaction(product_id)?;
        self.push_update(VerificationResult::Verified(tx.clone()));
        Ok(tx)
    }

    /// Refund the latest purchase of `product_id` and push the revocation
    pub fn revoke(&self, product_id: &str) -> Result<StoreTransaction, StoreError> {
        let revoked = {
            let mut state = self.state()?;
            let tx = state
                .ledger
                .iter_mut()
                .rev()
                .find(|tx| tx.product_id == product_id && !tx.is_revoked())
                .ok_or_else(|| {
                    StoreError::Rejected(format!("no active purchase for {}", product_id))
                })?;

            let mut revoked = tx.clone();
            revoked.revocation_date = Some(Utc::now());
            revoked.sign(&self.signing_key);
            self.persist(|db| db.save_store_transaction(&revoked))?;
            *tx = revoked.clone();
            revoked
        };

        self.push_update(VerificationResult::Verified(revoked.clone()));
        Ok(revoked)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Network("sandbox is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn new_transaction(&self, state: &SandboxState, product_id: &str) -> StoreTransaction {
        let id = uuid::Uuid::new_v4().to_string();

        let original_id = state
            .ledger
            .iter()
            .find(|tx| tx.product_id == product_id)
            .map(|tx| tx.original_id.clone())
            .unwrap_or_else(|| id.clone());

        let mut tx = StoreTransaction {
            id,
            original_id,
            product_id: product_id.to_string(),
            purchase_date: Utc::now(),
            revocation_date: None,
            signature: String::new(),
        };
        tx.sign(&self.signing_key);
        tx
    }

    fn append_transaction(&self, product_id: &str) -> Result<StoreTransaction, StoreError> {
        let mut state = self.state()?;
        let tx = self.new_transaction(&state, product_id);
        self.persist(|db| db.save_store_transaction(&tx))?;
        state.ledger.push(tx.clone());
        Ok(tx)
    }

    /// Write-through to the persistent ledger, if there is one
    fn persist<F>(&self, write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Database) -> anyhow::Result<()>,
    {
        match &self.ledger_db {
            Some(db) => write(db)
                .map_err(|e| StoreError::Internal(format!("sandbox ledger write failed: {}", e))),
            None => Ok(()),
        }
    }

    fn verify(&self, tx: StoreTransaction) -> VerificationResult {
        if tx.has_valid_signature(&self.signing_key) {
            VerificationResult::Verified(tx)
        } else {
            VerificationResult::Unverified {
                transaction: tx,
                reason: "signature mismatch".to_string(),
            }
        }
    }

    fn push_update(&self, update: VerificationResult) {
        // No receivers is fine: nobody is listening yet
        let _ = self.updates.send(update);
    }
}

#[async_trait]
impl PlatformStore for SandboxStore {
    async fn products(&self, ids: &[String]) -> Result<Vec<Product>, StoreError> {
        self.ensure_online()?;
        let state = self.state()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.products.get(id).cloned())
            .collect())
    }

    async fn purchase(&self, product: &Product) -> Result<PurchaseResult, StoreError> {
        self.purchase_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;

        let script = {
            let mut state = self.state()?;
            if !state.products.contains_key(&product.id) {
                return Err(StoreError::ProductUnavailable(product.id.clone()));
            }
            state.scripts.pop_front().unwrap_or(PurchaseScript::Approve)
        };
        debug!(product_id = %product.id, ?script, "sandbox purchase");

        match script {
            PurchaseScript::Approve => {
                let tx = self.append_transaction(&product.id)?;
                Ok(PurchaseResult::Success(self.verify(tx)))
            }
            PurchaseScript::Cancel => Ok(PurchaseResult::UserCancelled),
            PurchaseScript::Defer => {
                let mut state = self.state()?;
                self.persist(|db| db.add_deferred_product(&product.id))?;
                state.deferred.insert(product.id.clone());
                Ok(PurchaseResult::Pending)
            }
            PurchaseScript::Fail(err) => Err(err),
            PurchaseScript::Tamper => {
                // Never reaches the ledger
                let mut tx = {
                    let state = self.state()?;
                    self.new_transaction(&state, &product.id)
                };
                tx.signature = "0".repeat(64);
                Ok(PurchaseResult::Success(self.verify(tx)))
            }
        }
    }

    async fn current_entitlements(&self) -> Result<Vec<VerificationResult>, StoreError> {
        self.entitlement_queries.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;

        let ledger = self.state()?.ledger.clone();
        Ok(ledger
            .into_iter()
            .filter(|tx| !tx.is_revoked())
            .map(|tx| self.verify(tx))
            .collect())
    }

    async fn finish(&self, transaction: &StoreTransaction) -> Result<(), StoreError> {
        let mut state = self.state()?;
        self.persist(|db| db.finish_store_transaction(&transaction.id))?;
        state.finished.insert(transaction.id.clone());
        Ok(())
    }

    async fn sync(&self) -> Result<(), StoreError> {
        self.ensure_online()
    }

    fn transaction_updates(&self) -> broadcast::Receiver<VerificationResult> {
        self.updates.subscribe()
    }
}
