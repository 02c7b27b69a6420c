//! Error types for ipafetch core

use ipafetch_types::{ManifestAction, ManifestKey, ManifestStatus};
use thiserror::Error;
use uuid::Uuid;

/// Well-known storefront failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseFailureKind {
    /// `2034`: the account's password token has expired
    PasswordTokenExpired,
    /// `9610`: the item has to be purchased/licensed first
    LicenseRequired,
    Other,
}

impl LicenseFailureKind {
    pub fn from_code(code: &str) -> Self {
        match code {
            "2034" => LicenseFailureKind::PasswordTokenExpired,
            "9610" => LicenseFailureKind::LicenseRequired,
            _ => LicenseFailureKind::Other,
        }
    }
}

/// Which required piece of a successful response was missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IncompleteReason {
    #[error("missing download URL")]
    MissingTransferUrl,
    #[error("missing metadata")]
    MissingMetadata,
    #[error("missing bundleShortVersionString")]
    MissingShortVersion,
    #[error("missing bundleVersion")]
    MissingBuildVersion,
    #[error("missing itemId")]
    MissingItemId,
    #[error("no license vouchers in response")]
    NoVouchers,
}

/// Failures of a single storefront acquisition exchange
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Storefront returned HTTP {status}")]
    Transport { status: u16 },

    #[error("Malformed storefront response: {0}")]
    MalformedResponse(String),

    #[error("{message}")]
    License {
        code: String,
        message: String,
        kind: LicenseFailureKind,
    },

    #[error("Storefront returned no items")]
    EmptyResult,

    #[error("Incomplete storefront response: {0}")]
    IncompleteResponse(IncompleteReason),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// What a user can do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Try again later
    Retry,
    /// Sign in again
    Reauthenticate,
    /// The item or version cannot be obtained with this account
    Unavailable,
}

impl AcquisitionError {
    pub fn category(&self) -> FailureCategory {
        match self {
            AcquisitionError::License { kind, .. } => match kind {
                LicenseFailureKind::PasswordTokenExpired => FailureCategory::Reauthenticate,
                LicenseFailureKind::LicenseRequired | LicenseFailureKind::Other => {
                    FailureCategory::Unavailable
                }
            },
            AcquisitionError::InvalidRequest(_) => FailureCategory::Unavailable,
            _ => FailureCategory::Retry,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == FailureCategory::Retry
    }
}

/// Errors that can occur in ipafetch core
#[derive(Debug, Error)]
pub enum IpafetchError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error("Transfer failed: {reason}")]
    Transfer { reason: String, status: Option<u16> },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Manifest not found: {0}")]
    NotFound(ManifestKey),

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Cannot move {key} from {from} to {to}")]
    InvalidTransition {
        key: ManifestKey,
        from: ManifestStatus,
        to: ManifestStatus,
    },

    #[error("{action} is not available for {key} while {status}")]
    ActionNotAvailable {
        key: ManifestKey,
        action: ManifestAction,
        status: ManifestStatus,
    },

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl IpafetchError {
    pub fn category(&self) -> FailureCategory {
        match self {
            IpafetchError::Acquisition(e) => e.category(),
            IpafetchError::Transfer { .. }
            | IpafetchError::Network(_)
            | IpafetchError::Integrity(_) => FailureCategory::Retry,
            _ => FailureCategory::Unavailable,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.category() == FailureCategory::Retry
    }
}

impl From<serde_json::Error> for IpafetchError {
    fn from(error: serde_json::Error) -> Self {
        IpafetchError::Serialization(error.to_string())
    }
}

impl From<plist::Error> for IpafetchError {
    fn from(error: plist::Error) -> Self {
        IpafetchError::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_license_codes_map_to_categories() {
        let expired = AcquisitionError::License {
            code: "2034".to_string(),
            message: "x".to_string(),
            kind: LicenseFailureKind::from_code("2034"),
        };
        assert_eq!(expired.category(), FailureCategory::Reauthenticate);
        assert!(!expired.is_retryable());

        let required = AcquisitionError::License {
            code: "9610".to_string(),
            message: "x".to_string(),
            kind: LicenseFailureKind::from_code("9610"),
        };
        assert_eq!(required.category(), FailureCategory::Unavailable);
    }

    #[test]
    fn test_transport_and_incomplete_are_retryable() {
        assert!(AcquisitionError::Transport { status: 503 }.is_retryable());
        assert!(AcquisitionError::EmptyResult.is_retryable());
        assert!(AcquisitionError::IncompleteResponse(IncompleteReason::NoVouchers).is_retryable());
        assert!(IpafetchError::Transfer {
            reason: "reset".to_string(),
            status: None
        }
        .is_retryable());
    }

    #[test]
    fn test_incomplete_reason_messages() {
        assert_eq!(
            AcquisitionError::IncompleteResponse(IncompleteReason::MissingItemId).to_string(),
            "Incomplete storefront response: missing itemId"
        );
        assert_eq!(
            IncompleteReason::NoVouchers.to_string(),
            "no license vouchers in response"
        );
    }
}
