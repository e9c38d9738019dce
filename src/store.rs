// 🏪 Platform Store - the external purchase ledger, seen through a trait
//
// Everything the entitlement code needs from the platform:
// - product lookup by identifier
// - starting a purchase
// - the current (authoritative) entitlements
// - finishing a transaction once it has been applied locally
// - a resync request (restore)
// - a stream of transactions pushed by the platform
//
// Concrete stores return StoreError; callers normalize it to PaymentError.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// STORE ERRORS (raw, platform-level)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("network unavailable: {0}")]
    Network(String),

    #[error("purchases are not authorized for this account")]
    NotAuthorized,

    #[error("product unavailable: {0}")]
    ProductUnavailable(String),

    #[error("purchase rejected: {0}")]
    Rejected(String),

    #[error("store internal error: {0}")]
    Internal(String),
}

// ============================================================================
// PRODUCT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub price: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
}

pub fn default_currency() -> String {
    "JPY".to_string()
}

// ============================================================================
// TRANSACTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreTransaction {
    /// Unique per transaction
    pub id: String,

    /// First transaction of this purchase (stable across restores)
    pub original_id: String,

    pub product_id: String,
    pub purchase_date: DateTime<Utc>,

    /// Set when the purchase was refunded or the family-sharing grant withdrawn
    #[serde(default)]
    pub revocation_date: Option<DateTime<Utc>>,

    /// Hex SHA-256 over the signing payload and the store key
    pub signature: String,
}

impl StoreTransaction {
    /// Fields covered by the signature, in a fixed order
    pub fn signing_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.id,
            self.original_id,
            self.product_id,
            self.purchase_date.to_rfc3339(),
            self.revocation_date
                .map(|d| d.to_rfc3339())
                .unwrap_or_default()
        )
    }

    pub fn compute_signature(&self, signing_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_payload());
        hasher.update(signing_key);
        format!("{:x}", hasher.finalize())
    }

    pub fn sign(&mut self, signing_key: &str) {
        self.signature = self.compute_signature(signing_key);
    }

    pub fn has_valid_signature(&self, signing_key: &str) -> bool {
        self.signature == self.compute_signature(signing_key)
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation_date.is_some()
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// A transaction as delivered by the platform, with its verification verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationResult {
    Verified(StoreTransaction),
    Unverified {
        transaction: StoreTransaction,
        reason: String,
    },
}

impl VerificationResult {
    pub fn transaction(&self) -> &StoreTransaction {
        match self {
            VerificationResult::Verified(tx) => tx,
            VerificationResult::Unverified { transaction, .. } => transaction,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationResult::Verified(_))
    }

    /// Verified transaction that still grants ownership of `product_id`
    pub fn grants(&self, product_id: &str) -> bool {
        match self {
            VerificationResult::Verified(tx) => tx.product_id == product_id && !tx.is_revoked(),
            VerificationResult::Unverified { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseResult {
    Success(VerificationResult),
    UserCancelled,
    /// Waiting on something outside the app (e.g. parental approval)
    Pending,
}

// ============================================================================
// PLATFORM STORE TRAIT
// ============================================================================

#[async_trait]
pub trait PlatformStore: Send + Sync {
    async fn products(&self, ids: &[String]) -> Result<Vec<Product>, StoreError>;

    async fn purchase(&self, product: &Product) -> Result<PurchaseResult, StoreError>;

    /// Every transaction currently entitling this account
    async fn current_entitlements(&self) -> Result<Vec<VerificationResult>, StoreError>;

    async fn finish(&self, transaction: &StoreTransaction) -> Result<(), StoreError>;

    /// Resynchronize purchase history with the platform (restore)
    async fn sync(&self) -> Result<(), StoreError>;

    /// Transactions the platform pushes outside of any purchase call
    fn transaction_updates(&self) -> broadcast::Receiver<VerificationResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction(product_id: &str) -> StoreTransaction {
        StoreTransaction {
            id: "tx-1".to_string(),
            original_id: "tx-1".to_string(),
            product_id: product_id.to_string(),
            purchase_date: Utc::now(),
            revocation_date: None,
            signature: String::new(),
        }
    }

    #[test]
    fn test_signature_detects_tampering() {
        let mut tx = transaction("com.app.widget.premium_clock_1");
        tx.sign("secret");

        assert_eq!(tx.signature.len(), 64, "SHA-256 should be 64 hex chars");
        assert!(tx.has_valid_signature("secret"));
        assert!(!tx.has_valid_signature("other-key"));

        tx.product_id = "com.app.widget.premium_wallpaper_1".to_string();
        assert!(!tx.has_valid_signature("secret"));
    }

    #[test]
    fn test_revoked_transaction_grants_nothing() {
        let mut tx = transaction("p1");
        assert!(VerificationResult::Verified(tx.clone()).grants("p1"));

        tx.revocation_date = Some(Utc::now());
        assert!(!VerificationResult::Verified(tx.clone()).grants("p1"));

        let unverified = VerificationResult::Unverified {
            transaction: transaction("p1"),
            reason: "bad signature".to_string(),
        };
        assert!(!unverified.grants("p1"));
    }
}
