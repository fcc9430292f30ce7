//! Storage and persistence layer
//!
//! - File system operations
//! - Secret storage
//! - Data models

mod file_system;
mod models;
mod secrets;

pub use file_system::Storage;
pub use models::{
    BoostKind, BoostedTransaction, ImpactedAddress, ImpactedAddresses, NetworkState,
    StorageWarning, WalletMetadata,
};
pub use secrets::{mnemonic_key, passphrase_key, FileSecretStore, MemorySecretStore, SecretStore};
