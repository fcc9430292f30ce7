/// Wallet Core Module
///
/// Orchestrator plus free-function operation modules over the stored
/// per-(wallet, network) state:
///
/// - `manager.rs` - Orchestrator for all wallet operations
/// - `lifecycle_ops.rs` - Create, restore, list and wipe
/// - `sync_ops.rs` - Gap-limit scan, UTXO and history sync
/// - `storage_check.rs` - Stored address consistency check and repair
/// - `send_ops.rs` - Draft compose, sign, PSBT and broadcast
/// - `boost_ops.rs` - RBF and CPFP

// Operation modules
pub mod boost_ops;
pub mod lifecycle_ops;
pub mod send_ops;
pub mod storage_check;
pub mod sync_ops;

// Main manager (orchestrator)
pub mod manager;

// Re-export the manager as the main entry point
pub use manager::WalletManager;
pub use storage_check::StorageCheckReport;
pub use sync_ops::{GapLimits, RefreshOptions, RefreshSummary};
