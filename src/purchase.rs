// 🛒 Purchase Flow - the per-attempt state machine
//
//   NotPurchased ──purchase──▶ Purchasing ──▶ Purchased
//                                   │    ├──▶ Failed
//                                   │    ├──▶ NotPurchased  (cancelled)
//                                   │    └──▶ Purchasing    (pending approval)
//                                   └─restore─▶ Restored | Failed
//
// Every call returns its own typed result; the status channel only mirrors
// the latest transition for observers. This flow is the only writer of the
// status. The transaction listener applies platform-pushed transactions
// without touching the status of an in-flight attempt.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::EntitlementCache;
use crate::catalog::PurchasableItem;
use crate::db::{Database, Event, PaymentRecord};
use crate::error::PaymentError;
use crate::store::{PlatformStore, Product, PurchaseResult, StoreTransaction, VerificationResult};
use crate::verifier::EntitlementVerifier;

const CHANGE_CHANNEL_CAPACITY: usize = 64;
const LOCAL_USER: &str = "local";

// ============================================================================
// PAYMENT STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    NotPurchased,
    Purchasing,
    Purchased,
    Restored,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::NotPurchased => "not_purchased",
            PaymentStatus::Purchasing => "purchasing",
            PaymentStatus::Purchased => "purchased",
            PaymentStatus::Restored => "restored",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PaymentStatus::NotPurchased => "Not purchased",
            PaymentStatus::Purchasing => "Purchasing",
            PaymentStatus::Purchased => "Purchased",
            PaymentStatus::Restored => "Restored",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Refunded => "Refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_purchased" => Ok(PaymentStatus::NotPurchased),
            "purchasing" => Ok(PaymentStatus::Purchasing),
            "purchased" => Ok(PaymentStatus::Purchased),
            "restored" => Ok(PaymentStatus::Restored),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(anyhow::anyhow!("unknown payment status: {}", other)),
        }
    }
}

// ============================================================================
// RESULTS & NOTIFICATIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurchaseReceipt {
    pub product_id: String,
    pub transaction_id: String,
    pub original_transaction_id: String,
}

impl PurchaseReceipt {
    fn from_transaction(tx: &StoreTransaction) -> Self {
        Self {
            product_id: tx.product_id.clone(),
            transaction_id: tx.id.clone(),
            original_transaction_id: tx.original_id.clone(),
        }
    }
}

/// Entitlement change applied from a platform-pushed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntitlementChange {
    Granted { product_id: String },
    Revoked { product_id: String },
}

// ============================================================================
// PURCHASE FLOW
// ============================================================================

pub struct PurchaseFlow {
    store: Arc<dyn PlatformStore>,
    cache: Arc<EntitlementCache>,
    verifier: Arc<EntitlementVerifier>,
    status: watch::Sender<PaymentStatus>,
    changes: broadcast::Sender<EntitlementChange>,
    products: Mutex<HashMap<String, Product>>,
    history: Option<Arc<Database>>,
}

impl PurchaseFlow {
    pub fn new(
        store: Arc<dyn PlatformStore>,
        cache: Arc<EntitlementCache>,
        verifier: Arc<EntitlementVerifier>,
    ) -> Self {
        let (status, _) = watch::channel(PaymentStatus::NotPurchased);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            cache,
            verifier,
            status,
            changes,
            products: Mutex::new(HashMap::new()),
            history: None,
        }
    }

    /// Persist payment records and audit events to `db`
    pub fn with_history(mut self, db: Arc<Database>) -> Self {
        self.history = Some(db);
        self
    }

    pub fn status(&self) -> PaymentStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PaymentStatus> {
        self.status.subscribe()
    }

    pub fn entitlement_changes(&self) -> broadcast::Receiver<EntitlementChange> {
        self.changes.subscribe()
    }

    fn set_status(&self, status: PaymentStatus) {
        debug!(%status, "payment status");
        self.status.send_replace(status);
    }

    // ------------------------------------------------------------------------
    // Products
    // ------------------------------------------------------------------------

    pub async fn load_products(&self, ids: &[String]) -> Result<Vec<Product>, PaymentError> {
        let products = self.store.products(ids).await.map_err(|e| {
            warn!(error = %e, "product lookup failed");
            PaymentError::ProductNotFound
        })?;

        let mut cached = self.products.lock().await;
        for product in &products {
            cached.insert(product.id.clone(), product.clone());
        }
        Ok(products)
    }

    async fn product(&self, product_id: &str) -> Result<Product, PaymentError> {
        if let Some(product) = self.products.lock().await.get(product_id) {
            return Ok(product.clone());
        }

        self.load_products(&[product_id.to_string()])
            .await?
            .into_iter()
            .find(|p| p.id == product_id)
            .ok_or(PaymentError::ProductNotFound)
    }

    // ------------------------------------------------------------------------
    // Purchase
    // ------------------------------------------------------------------------

    pub async fn purchase(&self, item: &PurchasableItem) -> Result<PurchaseReceipt, PaymentError> {
        self.set_status(PaymentStatus::Purchasing);
        info!(product_id = %item.product_id, "purchase started");

        let result = self.run_purchase(item).await;
        let status = match &result {
            Ok(_) => PaymentStatus::Purchased,
            Err(PaymentError::Cancelled) => PaymentStatus::NotPurchased,
            Err(PaymentError::Pending) => PaymentStatus::Purchasing,
            Err(_) => PaymentStatus::Failed,
        };
        self.set_status(status);

        match &result {
            Ok(receipt) => info!(product_id = %receipt.product_id, transaction_id = %receipt.transaction_id, "purchase completed"),
            Err(e) if e.is_expected_outcome() => info!(product_id = %item.product_id, outcome = %e, "purchase not completed"),
            Err(e) => warn!(product_id = %item.product_id, error = %e, "purchase failed"),
        }

        let transaction_id = result.as_ref().ok().map(|r| r.transaction_id.as_str());
        self.record_payment(item, status, transaction_id);
        result
    }

    async fn run_purchase(&self, item: &PurchasableItem) -> Result<PurchaseReceipt, PaymentError> {
        let product = self.product(&item.product_id).await?;

        match self.store.purchase(&product).await? {
            PurchaseResult::Success(verification) => self.apply_verified(verification).await,
            PurchaseResult::UserCancelled => Err(PaymentError::Cancelled),
            PurchaseResult::Pending => Err(PaymentError::Pending),
        }
    }

    /// Record → finish for a verified transaction
    async fn apply_verified(
        &self,
        verification: VerificationResult,
    ) -> Result<PurchaseReceipt, PaymentError> {
        let tx = match verification {
            VerificationResult::Verified(tx) => tx,
            VerificationResult::Unverified { transaction, reason } => {
                warn!(product_id = %transaction.product_id, reason = %reason, "unverified transaction");
                return Err(PaymentError::VerificationFailed);
            }
        };

        self.cache.record_purchase(&tx.product_id).map_err(|e| {
            error!(product_id = %tx.product_id, error = %e, "failed to record purchase");
            PaymentError::Unknown
        })?;

        // The entitlement is already recorded; an unfinished transaction is
        // redelivered by the platform and finished by the listener.
        if let Err(e) = self.store.finish(&tx).await {
            warn!(transaction_id = %tx.id, error = %e, "failed to finish transaction");
        }
        Ok(PurchaseReceipt::from_transaction(&tx))
    }

    // ------------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------------

    pub async fn restore(&self) -> Result<Vec<String>, PaymentError> {
        self.set_status(PaymentStatus::Purchasing);

        match self.verifier.restore().await {
            Ok(restored) => {
                self.set_status(PaymentStatus::Restored);
                self.record_event(
                    "purchases_restored",
                    "account",
                    LOCAL_USER,
                    serde_json::json!({ "product_ids": restored }),
                    "purchase_flow",
                );
                Ok(restored)
            }
            Err(e) => {
                self.set_status(PaymentStatus::Failed);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Transaction listener
    // ------------------------------------------------------------------------

    /// Apply platform-pushed transactions for as long as the store streams them
    pub fn spawn_transaction_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let flow = Arc::clone(self);
        let mut updates = self.store.transaction_updates();

        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => flow.handle_transaction_update(update).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transaction listener lagged; a restore will reconcile");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("transaction update stream closed");
                        break;
                    }
                }
            }
        })
    }

    pub async fn handle_transaction_update(&self, update: VerificationResult) {
        let tx = match update {
            VerificationResult::Verified(tx) => tx,
            VerificationResult::Unverified { transaction, reason } => {
                warn!(product_id = %transaction.product_id, reason = %reason, "ignoring unverified transaction update");
                return;
            }
        };

        if tx.is_revoked() {
            self.record_refund(&tx).await;

            if self.still_entitled(&tx.product_id).await {
                info!(
                    product_id = %tx.product_id,
                    transaction_id = %tx.id,
                    "transaction revoked; product still granted by another transaction"
                );
                return;
            }

            match self.cache.remove(&tx.product_id) {
                Ok(_) => {
                    info!(product_id = %tx.product_id, "entitlement revoked");
                    self.record_event(
                        "entitlement_revoked",
                        "product",
                        &tx.product_id,
                        serde_json::json!({ "transaction_id": tx.id }),
                        "transaction_listener",
                    );
                    self.notify(EntitlementChange::Revoked {
                        product_id: tx.product_id.clone(),
                    });
                }
                Err(e) => {
                    error!(product_id = %tx.product_id, error = %e, "failed to revoke entitlement")
                }
            }
            return;
        }

        if let Err(e) = self.cache.record_purchase(&tx.product_id) {
            error!(product_id = %tx.product_id, error = %e, "failed to record pushed transaction");
            return;
        }
        if let Err(e) = self.store.finish(&tx).await {
            warn!(transaction_id = %tx.id, error = %e, "failed to finish pushed transaction");
        }

        self.settle_pending_payment(&tx);
        info!(product_id = %tx.product_id, "entitlement granted from transaction update");
        self.record_event(
            "entitlement_granted",
            "product",
            &tx.product_id,
            serde_json::json!({ "transaction_id": tx.id }),
            "transaction_listener",
        );
        self.notify(EntitlementChange::Granted {
            product_id: tx.product_id.clone(),
        });
    }

    /// Any other verified, unrevoked transaction for `product_id`?
    /// If the platform cannot be asked, the revocation is applied.
    async fn still_entitled(&self, product_id: &str) -> bool {
        match self.store.current_entitlements().await {
            Ok(entitlements) => entitlements.iter().any(|result| result.grants(product_id)),
            Err(e) => {
                warn!(product_id, error = %e, "could not check remaining entitlements");
                false
            }
        }
    }

    fn notify(&self, change: EntitlementChange) {
        // Nobody subscribed is fine
        let _ = self.changes.send(change);
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    fn record_payment(
        &self,
        item: &PurchasableItem,
        status: PaymentStatus,
        transaction_id: Option<&str>,
    ) {
        let Some(db) = &self.history else {
            return;
        };

        let mut record = PaymentRecord::new(
            LOCAL_USER,
            &item.product_id,
            item.price,
            &crate::store::default_currency(),
            status,
        );
        if let Some(id) = transaction_id {
            record = record.with_transaction(id);
        }
        if let Err(e) = db.record_payment(&record) {
            warn!(product_id = %item.product_id, error = %e, "failed to write payment history");
        }
    }

    /// A deferred attempt approved out of session: its row becomes Purchased
    fn settle_pending_payment(&self, tx: &StoreTransaction) {
        let Some(db) = &self.history else {
            return;
        };

        let settled = db.pending_payment(&tx.product_id).and_then(|pending| match pending {
            Some(payment) => {
                db.update_payment_status(&payment.id, PaymentStatus::Purchased, Some(&tx.id))
            }
            None => Ok(false),
        });
        match settled {
            Ok(true) => debug!(product_id = %tx.product_id, "pending payment settled"),
            Ok(false) => {}
            Err(e) => warn!(product_id = %tx.product_id, error = %e, "failed to settle pending payment"),
        }
    }

    /// Mark the payment behind a revoked transaction as Refunded, or add a
    /// Refunded row when the purchase was made elsewhere.
    async fn record_refund(&self, tx: &StoreTransaction) {
        let Some(db) = &self.history else {
            return;
        };

        match db.payment_for_transaction(&tx.id) {
            Ok(Some(payment)) => {
                if let Err(e) = db.update_payment_status(&payment.id, PaymentStatus::Refunded, None) {
                    warn!(transaction_id = %tx.id, error = %e, "failed to mark payment refunded");
                }
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "failed to look up refunded payment");
                return;
            }
        }

        let product = match self.product(&tx.product_id).await {
            Ok(product) => product,
            Err(e) => {
                warn!(product_id = %tx.product_id, error = %e, "refund not recorded: unknown price");
                return;
            }
        };
        let record = PaymentRecord::new(
            LOCAL_USER,
            &tx.product_id,
            product.price,
            &product.currency,
            PaymentStatus::Refunded,
        )
        .with_transaction(&tx.id);
        if let Err(e) = db.record_payment(&record) {
            warn!(transaction_id = %tx.id, error = %e, "failed to write refund");
        }
    }

    fn record_event(
        &self,
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) {
        let Some(db) = &self.history else {
            return;
        };

        let event = Event::new(event_type, entity_type, entity_id, data, actor);
        if let Err(e) = db.record_event(&event) {
            warn!(event_type, error = %e, "failed to write audit event");
        }
    }
}
