//! Error types for the wallet engine
//!
//! Every variant describes precisely what failed. Recovery (retrying,
//! prompting the user, wiping) is decided by the caller, never here.

use thiserror::Error;

/// Core error type for derivation, selection and transaction building
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Phrase failed wordlist or checksum validation
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(String),

    /// Impossible derivation state (bad path, corrupt key material)
    #[error("Key derivation failed: {0}")]
    Derivation(String),

    /// Checksum or network-prefix validation failed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Output of {value} sats is below the dust threshold of {threshold} sats")]
    DustOutput { value: u64, threshold: u64 },

    #[error("Insufficient funds: need {needed} sats, have {available} sats")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Insufficient funds for fee: inputs total {available} sats, fee is {fee} sats")]
    InsufficientFundsForFee { available: u64, fee: u64 },

    #[error("No wallet-owned output is available to boost this transaction")]
    NoEligibleInputsForBoost,

    /// Draft transaction is not in a state that allows the requested step
    #[error("Invalid draft transaction: {0}")]
    InvalidDraft(String),

    #[error("Fee rate must exceed {current} sat/vB (requested {requested} sat/vB)")]
    FeeRateTooLow { current: u64, requested: u64 },

    #[error("Transaction not replaceable: {0}")]
    NotReplaceable(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("PSBT error: {0}")]
    Psbt(String),

    #[error("Invalid payment URI: {0}")]
    InvalidUri(String),
}

impl CoreError {
    /// Create a derivation error
    pub fn derivation(msg: impl std::fmt::Display) -> Self {
        Self::Derivation(msg.to_string())
    }

    /// Create a signing error
    pub fn signing(msg: impl std::fmt::Display) -> Self {
        Self::Signing(msg.to_string())
    }

    /// True for errors caused by caller input that a user can correct
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidMnemonic(_)
                | Self::InvalidAddress(_)
                | Self::DustOutput { .. }
                | Self::InsufficientFunds { .. }
                | Self::InsufficientFundsForFee { .. }
                | Self::NoEligibleInputsForBoost
                | Self::InvalidDraft(_)
                | Self::FeeRateTooLow { .. }
                | Self::NotReplaceable(_)
                | Self::InvalidUri(_)
                | Self::UnsupportedNetwork(_)
                | Self::UnsupportedAddressType(_)
        )
    }
}
