//! Wallet service
//!
//! Async side of the wallet engine: configuration, JSON storage, secret
//! storage, indexer clients, synchronization, storage consistency checks,
//! telemetry and the HTTP API around [`wallet::WalletManager`].

pub mod api;
pub mod config;
pub mod error;
pub mod indexer;
pub mod storage;
pub mod telemetry;
pub mod wallet;

pub use config::WalletConfig;
pub use error::WalletError;
pub use wallet::WalletManager;
