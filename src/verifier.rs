// 🔍 Remote Entitlement Verifier
//
// Asks the platform for its authoritative view of what this account owns and
// writes confirmed entitlements into the local cache. The cache write always
// happens before `verify` returns true, so a following local read agrees.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::EntitlementCache;
use crate::error::PaymentError;
use crate::store::{PlatformStore, VerificationResult};

pub struct EntitlementVerifier {
    store: Arc<dyn PlatformStore>,
    cache: Arc<EntitlementCache>,
}

impl EntitlementVerifier {
    pub fn new(store: Arc<dyn PlatformStore>, cache: Arc<EntitlementCache>) -> Self {
        Self { store, cache }
    }

    /// Is `product_id` currently owned according to the platform?
    pub async fn verify(&self, product_id: &str) -> Result<bool, PaymentError> {
        let entitlements = self.store.current_entitlements().await.map_err(|e| {
            warn!(product_id, error = %e, "entitlement query failed");
            PaymentError::VerificationFailed
        })?;

        let owned = entitlements.iter().any(|result| result.grants(product_id));
        if !owned {
            debug!(product_id, "no verified entitlement");
            return Ok(false);
        }

        self.cache.record_purchase(product_id).map_err(|e| {
            error!(product_id, error = %e, "failed to record verified entitlement");
            PaymentError::Unknown
        })?;

        debug!(product_id, "entitlement verified");
        Ok(true)
    }

    /// Resynchronize with the platform, then record every verified entitlement.
    /// Returns the product ids that are owned after the restore.
    pub async fn restore(&self) -> Result<Vec<String>, PaymentError> {
        self.store.sync().await.map_err(|e| {
            warn!(error = %e, "store sync failed");
            PaymentError::RestoreFailed
        })?;

        let entitlements = self.store.current_entitlements().await.map_err(|e| {
            warn!(error = %e, "entitlement query after sync failed");
            PaymentError::RestoreFailed
        })?;

        let mut restored = Vec::new();
        for result in &entitlements {
            let tx = match result {
                VerificationResult::Verified(tx) if !tx.is_revoked() => tx,
                VerificationResult::Verified(_) => continue,
                VerificationResult::Unverified { transaction, reason } => {
                    warn!(
                        product_id = %transaction.product_id,
                        reason = %reason,
                        "skipping unverified transaction during restore"
                    );
                    continue;
                }
            };

            if restored.contains(&tx.product_id) {
                continue;
            }

            self.cache.record_purchase(&tx.product_id).map_err(|e| {
                error!(product_id = %tx.product_id, error = %e, "failed to record restored entitlement");
                PaymentError::RestoreFailed
            })?;
            restored.push(tx.product_id.clone());
        }

        info!(count = restored.len(), "purchases restored");
        Ok(restored)
    }
}
