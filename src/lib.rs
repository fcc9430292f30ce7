//! Onchain Core: deterministic Bitcoin wallet engine
//!
//! Pure, I/O-free building blocks of a non-custodial wallet. Everything here
//! is synchronous and deterministic; indexer traffic, persistence and secret
//! storage live in the `wallet` crate, which drives these types.
//!
//! # Architecture
//!
//! - **Key derivation**: BIP39 seed to per-type, per-chain, per-index keys and addresses
//! - **Address book**: normalized `(type, chain, index)` table with script-hash index and cursors
//! - **UTXO set / history**: balance with blacklist, idempotent history merge and search
//! - **Transaction builder**: coin selection, send-max, signing, PSBT, RBF and CPFP
//!
//! # Example
//!
//! ```ignore
//! use onchain_core::{AddressBook, AddressType, Chain, MasterKey, Network};
//!
//! let key = MasterKey::from_phrase(words, "", Network::Regtest)?;
//! let mut book = AddressBook::new(Network::Regtest);
//! let receive = book.get_or_create(&key, AddressType::P2wpkh, Chain::Receive, None)?;
//! println!("Pay to {}", receive.address);
//! ```

// Public modules
pub mod address;
pub mod address_book;
pub mod address_type;
pub mod bip21;
pub mod coin_selection;
pub mod derivation;
pub mod draft;
pub mod error;
pub mod fees;
pub mod history;
pub mod network;
pub mod psbt;
pub mod tx_builder;
pub mod utxo;

// Re-exports for convenience
pub use address::{address_script_hash, script_hash, validate_address, AddressEntry};
pub use address_book::{AddressBook, AddressKey, GapLimitScan, GeneratedAddresses, IndexCursors};
pub use address_type::{AddressType, Chain};
pub use bip21::PaymentUri;
pub use coin_selection::{select_coins, select_max, Selection, SelectionPreference, SelectionRequest};
pub use derivation::{
    derive_auxiliary_mnemonic, generate_mnemonic, parse_mnemonic, AuxiliaryPurpose, MasterKey,
};
pub use draft::{ComposeStage, PendingTransaction, Recipient};
pub use error::CoreError;
pub use fees::FeeEstimates;
pub use history::{filter, merge_incoming, TxRecord, TxType};
pub use network::Network;
pub use tx_builder::{BoostOptions, BuiltTransaction, FeeBumpRequest, TransactionBuilder};
pub use utxo::{Balance, Utxo, UtxoSet};

// Re-export the bitcoin crate so downstream crates use the same version
pub use bitcoin;

// Common result type
pub type Result<T> = std::result::Result<T, CoreError>;
