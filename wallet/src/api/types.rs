use bitcoin::{OutPoint, Txid};
use onchain_core::{AddressEntry, AddressType, Network, Recipient, SelectionPreference, Utxo};
use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::storage::BoostKind;

// ============================================================================
// Wallet lifecycle
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateWalletRequest {
    pub name: String,
    /// 12 or 24, default 12
    #[serde(default)]
    pub word_count: Option<usize>,
    /// Addresses to pre-generate on each chain
    #[serde(default)]
    pub address_count: Option<u32>,
    #[serde(default)]
    pub network: Option<Network>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreWalletRequest {
    pub name: String,
    pub mnemonic: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Networks to scan before the restore completes; the first one is
    /// selected. Defaults to the configured network.
    #[serde(default)]
    pub networks: Vec<Network>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletInfo {
    pub name: String,
    /// Only returned when the wallet was created here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<String>,
    pub network: Network,
    pub address_type: AddressType,
    pub first_address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub name: String,
    pub created_at: String,
    pub network: Network,
    pub address_type: AddressType,
    pub last_synced_height: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchNetworkRequest {
    pub network: Network,
}

#[derive(Debug, Deserialize)]
pub struct AddressTypeRequest {
    pub address_type: AddressType,
    /// Defaults to the wallet's current network
    #[serde(default)]
    pub network: Option<Network>,
}

#[derive(Debug, Deserialize)]
pub struct IndexerUrlRequest {
    pub url: String,
    #[serde(default)]
    pub network: Option<Network>,
}

#[derive(Debug, Serialize)]
pub struct DeleteWalletResponse {
    pub wallet_name: String,
    pub status: String,
}

// ============================================================================
// Addresses, balance, history
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct AddressQuery {
    /// Hand out a fresh address and advance the receive cursor
    #[serde(default)]
    pub new: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressInfo {
    pub address: String,
    pub address_type: AddressType,
    pub index: u32,
    pub path: String,
    pub script_hash: String,
}

impl AddressInfo {
    pub fn new(address_type: AddressType, entry: AddressEntry) -> Self {
        Self {
            address: entry.address,
            address_type,
            index: entry.index,
            path: entry.path,
            script_hash: entry.script_hash,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceInfo {
    pub network: Network,
    pub confirmed_sats: u64,
    pub unconfirmed_sats: u64,
    pub total_sats: u64,
    pub utxo_count: usize,
    pub blacklisted_count: usize,
    pub last_synced_height: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UtxoInfo {
    #[serde(flatten)]
    pub utxo: Utxo,
    pub blacklisted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransactionQuery {
    #[serde(default)]
    pub search: String,
    /// Comma-separated `sent` / `received`; empty means all
    #[serde(default)]
    pub types: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutpointRequest {
    pub txid: String,
    pub vout: u32,
}

impl OutpointRequest {
    pub fn outpoint(&self) -> Result<OutPoint, WalletError> {
        let txid: Txid = self.txid.parse().map_err(|e| {
            WalletError::Core(onchain_core::CoreError::InvalidDraft(format!(
                "invalid txid {}: {}",
                self.txid, e
            )))
        })?;
        Ok(OutPoint::new(txid, self.vout))
    }
}

// ============================================================================
// Spending
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub recipients: Vec<Recipient>,
    pub fee_rate: u64,
    /// Sweep every spendable output to the single recipient
    #[serde(default)]
    pub send_max: bool,
    #[serde(default = "default_rbf")]
    pub rbf: bool,
    #[serde(default)]
    pub preference: Option<SelectionPreference>,
    /// Manual input selection
    #[serde(default)]
    pub utxos: Vec<OutpointRequest>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub label: String,
}

fn default_rbf() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct SendResponse {
    pub txid: String,
    pub fee_sats: u64,
    pub vsize: u64,
    pub change_sats: u64,
    pub sent_sats: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PsbtResponse {
    /// Base64 PSBT
    pub psbt: String,
    pub txid: String,
    pub fee_sats: u64,
}

#[derive(Debug, Deserialize)]
pub struct BoostRequest {
    pub txid: String,
    pub fee_rate: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoostResponse {
    /// Transaction that was boosted
    pub parent_txid: String,
    /// Replacement (RBF) or child (CPFP) transaction
    pub txid: String,
    pub kind: BoostKind,
    pub fee_sats: u64,
    pub vsize: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct StorageCheckRequest {
    /// Diff every stored index, not only the boundaries
    #[serde(default)]
    pub thorough: bool,
    #[serde(default)]
    pub scan_all_address_types: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PaymentUriRequest {
    #[serde(default)]
    pub amount_sats: Option<u64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub lightning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentUriResponse {
    pub uri: String,
    pub address: String,
}
