use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use onchain_core::CoreError;
use serde_json::json;
use thiserror::Error;

use crate::indexer::IndexerError;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error("Wallet already exists: {0}")]
    WalletExists(String),

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("No wallet selected")]
    NoWalletSelected,

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// An input of the draft is no longer unspent
    #[error("UTXO set changed since the transaction was composed: {0}")]
    StaleUtxoSet(String),

    /// A network switch overtook this operation; its results were discarded
    #[error("Superseded by a network switch: {0}")]
    Superseded(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Wallet directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),
}

impl WalletError {
    /// Failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, WalletError::Indexer(IndexerError::Unreachable(_)))
    }

    /// Stable machine-readable error code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            WalletError::Core(core) => match core {
                CoreError::InvalidMnemonic(_) => "invalid_mnemonic",
                CoreError::InvalidAddress(_) => "invalid_address",
                CoreError::DustOutput { .. } => "dust_output",
                CoreError::InsufficientFunds { .. } => "insufficient_funds",
                CoreError::InsufficientFundsForFee { .. } => "insufficient_funds_for_fee",
                CoreError::NoEligibleInputsForBoost => "no_eligible_inputs_for_boost",
                CoreError::FeeRateTooLow { .. } => "fee_rate_too_low",
                CoreError::NotReplaceable(_) => "not_replaceable",
                CoreError::InvalidDraft(_) => "invalid_draft",
                CoreError::InvalidUri(_) => "invalid_uri",
                CoreError::UnsupportedNetwork(_) => "unsupported_network",
                CoreError::UnsupportedAddressType(_) => "unsupported_address_type",
                CoreError::Derivation(_) => "derivation_failed",
                CoreError::Signing(_) => "signing_failed",
                CoreError::Psbt(_) => "psbt_failed",
            },
            WalletError::Storage(_) => "storage_error",
            WalletError::Indexer(IndexerError::Unreachable(_)) => "indexer_unreachable",
            WalletError::Indexer(IndexerError::MalformedResponse(_)) => "indexer_malformed_response",
            WalletError::Indexer(IndexerError::Rejected(_)) => "transaction_rejected",
            WalletError::WalletExists(_) => "wallet_exists",
            WalletError::WalletNotFound(_) => "wallet_not_found",
            WalletError::NoWalletSelected => "no_wallet_selected",
            WalletError::SecretNotFound(_) => "secret_not_found",
            WalletError::TransactionNotFound(_) => "transaction_not_found",
            WalletError::StaleUtxoSet(_) => "stale_utxo_set",
            WalletError::Superseded(_) => "superseded",
            WalletError::Broadcast(_) => "broadcast_failed",
            WalletError::Telemetry(_) => "telemetry_failed",
            WalletError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            WalletError::Core(core) if core.is_validation() => StatusCode::BAD_REQUEST,
            WalletError::WalletNotFound(_)
            | WalletError::SecretNotFound(_)
            | WalletError::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            WalletError::WalletExists(_)
            | WalletError::StaleUtxoSet(_)
            | WalletError::Superseded(_) => StatusCode::CONFLICT,
            WalletError::NoWalletSelected | WalletError::Indexer(IndexerError::Rejected(_)) => {
                StatusCode::BAD_REQUEST
            }
            WalletError::Indexer(_) | WalletError::Broadcast(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WalletError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        }

        let body = Json(json!({
            "error": self.to_string(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let insufficient = WalletError::Core(CoreError::InsufficientFunds {
            needed: 10,
            available: 5,
        });
        let invalid = WalletError::Core(CoreError::InvalidAddress("x".to_string()));

        assert_eq!(insufficient.status(), StatusCode::BAD_REQUEST);
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_ne!(insufficient.code(), invalid.code());

        assert_eq!(
            WalletError::WalletNotFound("w".to_string()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WalletError::StaleUtxoSet("x".to_string()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            WalletError::Indexer(IndexerError::Unreachable("down".to_string())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            WalletError::Core(CoreError::Derivation("bad".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_only_unreachable_is_transient() {
        assert!(WalletError::Indexer(IndexerError::Unreachable("down".to_string())).is_transient());
        assert!(!WalletError::Indexer(IndexerError::MalformedResponse("?".to_string())).is_transient());
        assert!(!WalletError::Indexer(IndexerError::Rejected("fee".to_string())).is_transient());
        assert!(!WalletError::Core(CoreError::NoEligibleInputsForBoost).is_transient());
    }
}
