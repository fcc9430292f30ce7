//! Data models for wallet storage

use bitcoin::Txid;
use chrono::{DateTime, Utc};
use onchain_core::{AddressBook, AddressType, Network, PendingTransaction, TxRecord, UtxoSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-wallet settings, `metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletMetadata {
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Currently selected network
    pub network: Network,
    /// Address type preference per network; missing means the default type
    #[serde(default)]
    pub address_types: BTreeMap<Network, AddressType>,
    /// Indexer endpoint overrides per network
    #[serde(default)]
    pub indexer_urls: BTreeMap<Network, String>,
}

impl WalletMetadata {
    pub fn new(name: &str, network: Network) -> Self {
        Self {
            name: name.to_string(),
            created_at: Utc::now(),
            network,
            address_types: BTreeMap::new(),
            indexer_urls: BTreeMap::new(),
        }
    }

    pub fn address_type(&self, network: Network) -> AddressType {
        self.address_types.get(&network).copied().unwrap_or_default()
    }
}

/// Everything a wallet knows about one network, `<network>.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub book: AddressBook,
    #[serde(default)]
    pub utxos: UtxoSet,
    #[serde(default)]
    pub history: Vec<TxRecord>,
    #[serde(default)]
    pub draft: PendingTransaction,
    #[serde(default)]
    pub boosted: Vec<BoostedTransaction>,
    #[serde(default)]
    pub last_synced_height: Option<u32>,
}

impl NetworkState {
    pub fn new(network: Network) -> Self {
        Self {
            book: AddressBook::new(network),
            utxos: UtxoSet::default(),
            history: Vec::new(),
            draft: PendingTransaction::default(),
            boosted: Vec::new(),
            last_synced_height: None,
        }
    }

    pub fn network(&self) -> Network {
        self.book.network()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoostKind {
    Rbf,
    Cpfp,
}

/// A fee bump or CPFP child created for an unconfirmed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostedTransaction {
    pub parent_txid: Txid,
    pub child_txid: Txid,
    pub kind: BoostKind,
    pub fee_sats: u64,
    pub created_at: DateTime<Utc>,
}

/// One stored address that did not match its re-derived value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactedAddress {
    pub index: u32,
    pub path: String,
    /// Address that was stored
    pub stored: String,
    /// Address the seed derives at this index
    pub expected: String,
    /// Script hash of `expected`
    pub script_hash: String,
}

/// Mismatches of one address type, split by chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactedAddresses {
    pub address_type: AddressType,
    pub receive: Vec<ImpactedAddress>,
    pub change: Vec<ImpactedAddress>,
}

impl ImpactedAddresses {
    pub fn len(&self) -> usize {
        self.receive.len() + self.change.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receive.is_empty() && self.change.is_empty()
    }

    pub fn script_hashes(&self) -> Vec<String> {
        self.receive
            .iter()
            .chain(self.change.iter())
            .map(|a| a.script_hash.clone())
            .collect()
    }
}

/// A detected address derivation mismatch, kept until telemetry accepts it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageWarning {
    pub id: Uuid,
    pub warning_id: String,
    pub network: Network,
    pub data: Vec<ImpactedAddresses>,
    pub reported: bool,
    pub timestamp: DateTime<Utc>,
}

impl StorageWarning {
    pub const ADDRESS_MISMATCH: &'static str = "address-derivation-mismatch";

    pub fn address_mismatch(network: Network, data: Vec<ImpactedAddresses>) -> Self {
        Self {
            id: Uuid::new_v4(),
            warning_id: Self::ADDRESS_MISMATCH.to_string(),
            network,
            data,
            reported: false,
            timestamp: Utc::now(),
        }
    }

    /// Number of impacted addresses across all types and chains
    pub fn impacted(&self) -> usize {
        self.data.iter().map(ImpactedAddresses::len).sum()
    }

    pub fn script_hashes(&self) -> Vec<String> {
        self.data.iter().flat_map(ImpactedAddresses::script_hashes).collect()
    }
}
