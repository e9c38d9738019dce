// 🧾 Payment Errors - the closed taxonomy every caller sees
//
// Raw platform failures (StoreError) are normalized into PaymentError at the
// verifier / purchase flow boundary. Nothing above that boundary matches on
// platform error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum PaymentError {
    #[error("product not found")]
    ProductNotFound,

    #[error("purchase failed")]
    PurchaseFailed,

    #[error("purchase not authorized")]
    NotAuthorized,

    #[error("network error")]
    NetworkError,

    #[error("purchase verification failed")]
    VerificationFailed,

    #[error("purchase cancelled")]
    Cancelled,

    #[error("purchase pending")]
    Pending,

    #[error("restore failed")]
    RestoreFailed,

    #[error("unknown error")]
    Unknown,
}

impl PaymentError {
    /// Cancellation and pending approval are outcomes, not failures.
    pub fn is_expected_outcome(&self) -> bool {
        matches!(self, PaymentError::Cancelled | PaymentError::Pending)
    }

    /// Message to surface in an error dialog, `None` when nothing should be shown.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            PaymentError::ProductNotFound => Some("The product could not be found."),
            PaymentError::PurchaseFailed => Some("The purchase could not be completed."),
            PaymentError::NotAuthorized => Some("Purchases are not allowed on this device."),
            PaymentError::NetworkError => {
                Some("A network error occurred. Check your connection and try again.")
            }
            PaymentError::VerificationFailed => Some("The purchase could not be verified."),
            PaymentError::RestoreFailed => Some("Your purchases could not be restored."),
            PaymentError::Unknown => Some("An unknown error occurred."),
            PaymentError::Cancelled | PaymentError::Pending => None,
        }
    }

    /// Stable machine-readable code (matches the serde representation)
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::ProductNotFound => "product_not_found",
            PaymentError::PurchaseFailed => "purchase_failed",
            PaymentError::NotAuthorized => "not_authorized",
            PaymentError::NetworkError => "network_error",
            PaymentError::VerificationFailed => "verification_failed",
            PaymentError::Cancelled => "cancelled",
            PaymentError::Pending => "pending",
            PaymentError::RestoreFailed => "restore_failed",
            PaymentError::Unknown => "unknown",
        }
    }
}

/// Default normalization for failures during a purchase attempt.
/// Verification and restore paths map explicitly instead.
impl From<StoreError> for PaymentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Network(_) => PaymentError::NetworkError,
            StoreError::NotAuthorized => PaymentError::NotAuthorized,
            StoreError::ProductUnavailable(_) => PaymentError::ProductNotFound,
            StoreError::Rejected(_) => PaymentError::PurchaseFailed,
            StoreError::Internal(_) => PaymentError::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_outcomes_have_no_message() {
        for err in [PaymentError::Cancelled, PaymentError::Pending] {
            assert!(err.is_expected_outcome());
            assert!(err.user_message().is_none());
        }
    }

    #[test]
    fn test_failures_have_messages() {
        let failures = [
            PaymentError::ProductNotFound,
            PaymentError::PurchaseFailed,
            PaymentError::NotAuthorized,
            PaymentError::NetworkError,
            PaymentError::VerificationFailed,
            PaymentError::RestoreFailed,
            PaymentError::Unknown,
        ];

        for err in failures {
            assert!(!err.is_expected_outcome());
            assert!(err.user_message().is_some(), "{:?} needs a message", err);
        }
    }

    #[test]
    fn test_code_matches_serde() {
        let json = serde_json::to_string(&PaymentError::VerificationFailed).unwrap();
        assert_eq!(json, "\"verification_failed\"");
        assert_eq!(PaymentError::VerificationFailed.code(), "verification_failed");
    }

    #[test]
    fn test_store_error_normalization() {
        assert_eq!(
            PaymentError::from(StoreError::Network("offline".into())),
            PaymentError::NetworkError
        );
        assert_eq!(
            PaymentError::from(StoreError::ProductUnavailable("x".into())),
            PaymentError::ProductNotFound
        );
        assert_eq!(
            PaymentError::from(StoreError::NotAuthorized),
            PaymentError::NotAuthorized
        );
        assert_eq!(
            PaymentError::from(StoreError::Rejected("card declined".into())),
            PaymentError::PurchaseFailed
        );
    }
}
