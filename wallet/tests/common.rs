//! Common test utilities for wallet integration tests
//!
//! This module provides shared test infrastructure including:
//! - An in-memory indexer serving a scripted chain
//! - Test environment setup with a temporary storage root
//! - Funding, spending and mining helpers
#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use onchain_core::{script_hash, validate_address, AddressType, Chain, MasterKey, Network};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use wallet::api::types::RestoreWalletRequest;
use wallet::indexer::{HistoryItem, Indexer, IndexerError, UnspentItem};
use wallet::storage::{MemorySecretStore, Storage};
use wallet::{WalletConfig, WalletManager};

pub const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// Address outside the test wallet
pub const FOREIGN_ADDRESS: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

pub const GAP_LIMIT: u32 = 5;

/// Regtest address of the test phrase
pub fn test_address(address_type: AddressType, chain: Chain, index: u32) -> String {
    let key = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Regtest).unwrap();
    key.derive_address(address_type, chain, index).unwrap().address
}

#[derive(Default)]
struct ChainState {
    /// Every known transaction with its height (0 = mempool)
    txs: BTreeMap<Txid, (Transaction, u32)>,
    tip: u32,
    funding_nonce: u64,
    broadcasts: Vec<Txid>,
    malformed: HashSet<String>,
}

impl ChainState {
    fn script_hash_of(&self, outpoint: &OutPoint) -> Option<String> {
        self.txs
            .get(&outpoint.txid)
            .and_then(|(tx, _)| tx.output.get(outpoint.vout as usize))
            .map(|output| script_hash(&output.script_pubkey))
    }

    fn spender_of(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.txs
            .iter()
            .find(|(_, (tx, _))| tx.input.iter().any(|i| i.previous_output == *outpoint))
            .map(|(txid, _)| *txid)
    }

    fn touches(&self, tx: &Transaction, hash: &str) -> bool {
        tx.output.iter().any(|o| script_hash(&o.script_pubkey) == hash)
            || tx
                .input
                .iter()
                .any(|i| self.script_hash_of(&i.previous_output).as_deref() == Some(hash))
    }

    fn insert(&mut self, tx: Transaction, height: u32) -> Txid {
        let txid = tx.compute_txid();
        self.txs.insert(txid, (tx, height));
        txid
    }
}

/// Scripted Electrum-style indexer
///
/// Histories and unspent outputs are derived from the stored transactions.
pub struct MockIndexer {
    chain: Mutex<ChainState>,
    unreachable: AtomicBool,
    history_queries: AtomicUsize,
    paused: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl MockIndexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chain: Mutex::new(ChainState {
                tip: 200,
                ..ChainState::default()
            }),
            unreachable: AtomicBool::new(false),
            history_queries: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    fn chain(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.chain.lock().unwrap()
    }

    fn check_reachable(&self) -> Result<(), IndexerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(IndexerError::Unreachable("connection refused".to_string()));
        }
        Ok(())
    }

    /// Pay `value` to `address` from outside the wallet
    pub fn fund(&self, address: &str, value: u64, height: u32) -> OutPoint {
        let script_pubkey = validate_address(address, Network::Regtest)
            .unwrap()
            .script_pubkey();

        let mut chain = self.chain();
        chain.funding_nonce += 1;
        let mut seed = [0xab; 32];
        seed[..8].copy_from_slice(&chain.funding_nonce.to_le_bytes());

        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array(seed), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey,
            }],
        };
        let txid = chain.insert(tx, height);
        OutPoint::new(txid, 0)
    }

    /// Spend `outpoint` to a foreign address in a confirmed transaction
    pub fn spend_externally(&self, outpoint: OutPoint) -> Txid {
        let script_pubkey = validate_address(FOREIGN_ADDRESS, Network::Regtest)
            .unwrap()
            .script_pubkey();

        let mut chain = self.chain();
        let value = chain
            .txs
            .get(&outpoint.txid)
            .and_then(|(tx, _)| tx.output.get(outpoint.vout as usize))
            .map(|o| o.value)
            .unwrap();
        let height = chain.tip;

        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: value - Amount::from_sat(500),
                script_pubkey,
            }],
        };
        chain.insert(tx, height)
    }

    /// Confirm every mempool transaction in a new block
    pub fn mine(&self) -> u32 {
        let mut chain = self.chain();
        chain.tip += 1;
        let tip = chain.tip;
        for (_, height) in chain.txs.values_mut() {
            if *height == 0 {
                *height = tip;
            }
        }
        tip
    }

    pub fn transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.chain().txs.get(txid).map(|(tx, _)| tx.clone())
    }

    pub fn broadcasts(&self) -> Vec<Txid> {
        self.chain().broadcasts.clone()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Answer queries for the script hash of `address` with garbage
    pub fn set_malformed(&self, address: &str, malformed: bool) {
        let script_pubkey = validate_address(address, Network::Regtest)
            .unwrap()
            .script_pubkey();
        let hash = script_hash(&script_pubkey);
        let mut chain = self.chain();
        if malformed {
            chain.malformed.insert(hash);
        } else {
            chain.malformed.remove(&hash);
        }
    }

    pub fn history_queries(&self) -> usize {
        self.history_queries.load(Ordering::SeqCst)
    }

    /// Hold the next tip query until [`MockIndexer::release`]
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub async fn wait_paused(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }
}

#[async_trait]
impl Indexer for MockIndexer {
    async fn tip_height(&self) -> Result<u32, IndexerError> {
        if self.paused.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.check_reachable()?;
        Ok(self.chain().tip)
    }

    async fn get_history(&self, script_hash: &str) -> Result<Vec<HistoryItem>, IndexerError> {
        self.check_reachable()?;
        self.history_queries.fetch_add(1, Ordering::SeqCst);

        let chain = self.chain();
        if chain.malformed.contains(script_hash) {
            return Err(IndexerError::MalformedResponse(format!(
                "garbled history for {}",
                script_hash
            )));
        }
        Ok(chain
            .txs
            .iter()
            .filter(|(_, (tx, _))| chain.touches(tx, script_hash))
            .map(|(txid, (_, height))| HistoryItem {
                txid: *txid,
                height: *height,
            })
            .collect())
    }

    async fn get_unspent(&self, script_hash: &str) -> Result<Vec<UnspentItem>, IndexerError> {
        self.check_reachable()?;

        let chain = self.chain();
        if chain.malformed.contains(script_hash) {
            return Err(IndexerError::MalformedResponse(format!(
                "garbled unspent list for {}",
                script_hash
            )));
        }

        let mut unspent = Vec::new();
        for (txid, (tx, height)) in &chain.txs {
            for (vout, output) in tx.output.iter().enumerate() {
                let outpoint = OutPoint::new(*txid, vout as u32);
                if onchain_core::script_hash(&output.script_pubkey) == script_hash
                    && chain.spender_of(&outpoint).is_none()
                {
                    unspent.push(UnspentItem {
                        txid: *txid,
                        vout: vout as u32,
                        height: *height,
                        value: output.value.to_sat(),
                    });
                }
            }
        }
        Ok(unspent)
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, IndexerError> {
        self.check_reachable()?;
        self.transaction(txid)
            .ok_or_else(|| IndexerError::MalformedResponse(format!("unknown transaction {}", txid)))
    }

    /// Accepts anything spending known outputs; mempool conflicts are replaced
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, IndexerError> {
        self.check_reachable()?;

        let mut chain = self.chain();
        let mut replaced = Vec::new();
        for input in &tx.input {
            if !chain.txs.contains_key(&input.previous_output.txid) {
                return Err(IndexerError::Rejected(format!(
                    "missing input {}",
                    input.previous_output
                )));
            }
            if let Some(spender) = chain.spender_of(&input.previous_output) {
                match chain.txs.get(&spender) {
                    Some((_, 0)) => replaced.push(spender),
                    _ => {
                        return Err(IndexerError::Rejected(format!(
                            "input {} already spent",
                            input.previous_output
                        )))
                    }
                }
            }
        }

        for txid in replaced {
            chain.txs.remove(&txid);
        }
        let txid = chain.insert(tx.clone(), 0);
        chain.broadcasts.push(txid);
        Ok(txid)
    }

    async fn estimate_fee(&self, target_blocks: u16) -> Result<Option<u64>, IndexerError> {
        self.check_reachable()?;
        Ok(Some(match target_blocks {
            0..=1 => 20,
            2..=3 => 10,
            4..=6 => 5,
            _ => 1,
        }))
    }

    async fn block_time(&self, height: u32) -> Result<u64, IndexerError> {
        self.check_reachable()?;
        Ok(1_600_000_000 + u64::from(height) * 600)
    }
}

/// Test environment with automatic cleanup
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub manager: Arc<WalletManager>,
    pub indexer: Arc<MockIndexer>,
}

impl TestEnvironment {
    pub fn new() -> Self {
        env_logger::builder().is_test(true).try_init().ok();

        let temp_dir = TempDir::new().unwrap();
        log::info!("📁 Test directory: {:?}", temp_dir.path());

        let config = WalletConfig {
            data_dir: temp_dir.path().to_path_buf(),
            network: Network::Regtest,
            gap_limit_receive: GAP_LIMIT,
            gap_limit_change: GAP_LIMIT,
            refresh_retries: 1,
            refresh_backoff: Duration::from_millis(1),
            ..WalletConfig::default()
        };
        let storage = Storage::new_with_base_dir(temp_dir.path().to_path_buf());
        let manager = WalletManager::with_components(config, storage, Arc::new(MemorySecretStore::new()));

        let indexer = MockIndexer::new();
        manager.set_indexer(Network::Regtest, indexer.clone());

        Self {
            temp_dir,
            manager: Arc::new(manager),
            indexer,
        }
    }

    /// Restore the well-known test phrase on Regtest
    pub async fn restore(&self, name: &str) -> anyhow::Result<()> {
        self.manager
            .restore_wallet(RestoreWalletRequest {
                name: name.to_string(),
                mnemonic: TEST_MNEMONIC.to_string(),
                passphrase: None,
                networks: vec![Network::Regtest],
            })
            .await?;
        Ok(())
    }
}
