/// Synchronization operations
///
/// Brings one (wallet, network) state up to date with the indexer: gap-limit
/// address discovery, UTXO set refresh and transaction history sync. Works on
/// a caller-owned copy of the state; the caller persists it only when the
/// whole refresh succeeded.
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use futures::future::join_all;
use onchain_core::{
    merge_incoming, AddressBook, AddressKey, AddressType, Balance, Chain, GapLimitScan, MasterKey,
    Network, TxRecord, Utxo,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;

use crate::error::WalletError;
use crate::indexer::{HistoryItem, Indexer, IndexerError};
use crate::storage::NetworkState;

/// Indexer queries in flight at once during one refresh
pub const QUERY_CONCURRENCY: usize = 10;

/// Lookahead window per chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapLimits {
    pub receive: u32,
    pub change: u32,
}

impl GapLimits {
    pub fn for_chain(&self, chain: Chain) -> u32 {
        match chain {
            Chain::Receive => self.receive,
            Chain::Change => self.change,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOptions {
    /// Scan every address type instead of the selected one
    #[serde(default)]
    pub scan_all_address_types: bool,
    /// Run the storage consistency check after syncing
    #[serde(default = "default_storage_check")]
    pub storage_check: bool,
}

fn default_storage_check() -> bool {
    true
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            scan_all_address_types: false,
            storage_check: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub network: Network,
    pub tip_height: u32,
    /// Script hashes whose history was queried
    pub addresses_checked: usize,
    /// Script hashes with any on-chain history
    pub active_addresses: usize,
    pub utxo_count: usize,
    pub new_transactions: usize,
    pub balance: Balance,
    /// Addresses repaired by the storage check, 0 when it found nothing
    pub repaired_addresses: usize,
}

/// Run `query` for every key, at most [`QUERY_CONCURRENCY`] at a time
///
/// An unreachable indexer aborts the whole batch; any other failure is
/// returned next to its key.
pub(crate) async fn query_all<T, F, Fut>(
    keys: &[String],
    query: F,
) -> Result<Vec<(String, Result<T, IndexerError>)>, IndexerError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, IndexerError>>,
{
    let mut results = Vec::with_capacity(keys.len());

    for chunk in keys.chunks(QUERY_CONCURRENCY) {
        let outcomes = join_all(chunk.iter().map(|key| query(key.clone()))).await;
        for (key, outcome) in chunk.iter().zip(outcomes) {
            if let Err(IndexerError::Unreachable(reason)) = outcome {
                return Err(IndexerError::Unreachable(reason));
            }
            results.push((key.clone(), outcome));
        }
    }

    Ok(results)
}

/// Wallet UTXO for an output paying to a known script hash
pub(crate) fn owned_utxo(
    book: &AddressBook,
    script_hash: &str,
    outpoint: OutPoint,
    height: u32,
    value: u64,
) -> Option<Utxo> {
    let (key, entry) = book.lookup(script_hash)?;
    Some(Utxo {
        address: entry.address.clone(),
        script_hash: entry.script_hash.clone(),
        public_key: entry.public_key.clone(),
        address_type: key.address_type,
        index: key.index,
        path: entry.path.clone(),
        txid: outpoint.txid,
        vout: outpoint.vout,
        height,
        value,
    })
}

pub(crate) fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Results of the history queries of one refresh
#[derive(Default)]
struct HistoryScan {
    histories: BTreeMap<String, Vec<HistoryItem>>,
    /// Script hashes whose query failed; their state stays as it was
    uncertain: BTreeSet<String>,
}

impl HistoryScan {
    fn probed(&self, script_hash: &str) -> bool {
        self.histories.contains_key(script_hash) || self.uncertain.contains(script_hash)
    }

    fn absorb(&mut self, results: Vec<(String, Result<Vec<HistoryItem>, IndexerError>)>) {
        for (script_hash, outcome) in results {
            match outcome {
                Ok(items) => {
                    self.histories.insert(script_hash, items);
                }
                Err(e) => {
                    log::warn!("⚠️  History of {} unavailable: {}", script_hash, e);
                    self.uncertain.insert(script_hash);
                }
            }
        }
    }

    fn is_active(&self, script_hash: &str) -> bool {
        self.histories
            .get(script_hash)
            .is_some_and(|items| !items.is_empty())
    }

    /// Active, or unknown because its query failed
    fn may_be_active(&self, script_hash: &str) -> bool {
        self.is_active(script_hash) || self.uncertain.contains(script_hash)
    }

    fn active(&self) -> impl Iterator<Item = &String> + '_ {
        self.histories
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(hash, _)| hash)
    }
}

/// Probe one chain of one address type until a full window shows no activity
async fn scan_chain(
    indexer: &dyn Indexer,
    key: &MasterKey,
    book: &mut AddressBook,
    address_type: AddressType,
    chain: Chain,
    gap_limit: u32,
    scan: &mut HistoryScan,
) -> Result<(), WalletError> {
    let last_used = book.cursors(address_type).get(chain).last_used;
    let mut probe = GapLimitScan::new(last_used, gap_limit);

    while let Some(window) = probe.next_window() {
        book.materialize(key, address_type, chain, window.clone())?;

        let indexed: Vec<(u32, String)> = window
            .filter_map(|index| {
                book.get(&AddressKey::new(address_type, chain, index))
                    .map(|entry| (index, entry.script_hash.clone()))
            })
            .collect();
        let hashes: Vec<String> = indexed.iter().map(|(_, hash)| hash.clone()).collect();

        let results = query_all(&hashes, |hash| async move { indexer.get_history(&hash).await }).await?;
        scan.absorb(results);

        // An unanswered address keeps the window open; it is never marked used
        let active: Vec<u32> = indexed
            .iter()
            .filter(|(_, hash)| scan.may_be_active(hash))
            .map(|(index, _)| *index)
            .collect();
        probe.record(active);
    }

    log::debug!(
        "Scanned {} {} up to index {} (last active: {:?})",
        address_type,
        chain,
        probe.probed_end(),
        probe.last_active()
    );
    Ok(())
}

/// Refresh the UTXO set of the scanned script hashes
///
/// A successful query replaces what was known at that script hash, even
/// when it comes back empty. A failed one keeps the previous outputs.
/// Outputs of address types outside `types` are left alone.
async fn refresh_utxos(
    indexer: &dyn Indexer,
    state: &mut NetworkState,
    types: &[AddressType],
    scan: &HistoryScan,
) -> Result<(), WalletError> {
    let in_scope = |utxo: &Utxo| types.contains(&utxo.address_type);

    let mut targets: BTreeSet<String> = scan.active().cloned().collect();
    targets.extend(scan.uncertain.iter().cloned());
    targets.extend(
        state
            .utxos
            .all()
            .iter()
            .filter(|u| in_scope(u))
            .map(|u| u.script_hash.clone()),
    );
    let targets: Vec<String> = targets.into_iter().collect();

    let results = query_all(&targets, |hash| async move { indexer.get_unspent(&hash).await }).await?;

    let mut utxos: Vec<Utxo> = state
        .utxos
        .all()
        .iter()
        .filter(|u| !in_scope(u))
        .cloned()
        .collect();

    for (script_hash, outcome) in results {
        match outcome {
            Ok(items) => {
                for item in items {
                    let outpoint = OutPoint::new(item.txid, item.vout);
                    if let Some(utxo) =
                        owned_utxo(&state.book, &script_hash, outpoint, item.height, item.value)
                    {
                        utxos.push(utxo);
                    }
                }
            }
            Err(e) => {
                log::warn!("⚠️  Keeping last known UTXOs of {}: {}", script_hash, e);
                utxos.extend(
                    state
                        .utxos
                        .all()
                        .iter()
                        .filter(|u| u.script_hash == script_hash)
                        .cloned(),
                );
            }
        }
    }

    state.utxos.replace(utxos);
    Ok(())
}

async fn block_timestamp(
    indexer: &dyn Indexer,
    height: u32,
    cache: &mut HashMap<u32, u64>,
) -> Result<Option<u64>, IndexerError> {
    if let Some(time) = cache.get(&height) {
        return Ok(Some(*time));
    }
    match indexer.block_time(height).await {
        Ok(time) => {
            cache.insert(height, time);
            Ok(Some(time))
        }
        Err(IndexerError::MalformedResponse(e)) => {
            log::warn!("⚠️  No block time for height {}: {}", height, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Fetch `txid` and the outputs it spends, and build its wallet record
///
/// Inputs whose parent cannot be fetched stay unresolved.
async fn fetch_record(
    indexer: &dyn Indexer,
    book: &AddressBook,
    txid: Txid,
    height: u32,
    timestamp: u64,
    parents: &mut HashMap<Txid, Transaction>,
) -> Result<Option<TxRecord>, IndexerError> {
    let tx = match indexer.get_transaction(&txid).await {
        Ok(tx) => tx,
        Err(IndexerError::MalformedResponse(e)) => {
            log::warn!("⚠️  Skipping transaction {}: {}", txid, e);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let mut prevouts: HashMap<OutPoint, TxOut> = HashMap::new();
    for input in &tx.input {
        let outpoint = input.previous_output;
        if outpoint.is_null() {
            continue;
        }

        if !parents.contains_key(&outpoint.txid) {
            match indexer.get_transaction(&outpoint.txid).await {
                Ok(parent) => {
                    parents.insert(outpoint.txid, parent);
                }
                Err(IndexerError::MalformedResponse(e)) => {
                    log::debug!("Input {} of {} unresolved: {}", outpoint, txid, e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let spent = parents
            .get(&outpoint.txid)
            .and_then(|parent| parent.output.get(outpoint.vout as usize));
        if let Some(spent) = spent {
            prevouts.insert(outpoint, spent.clone());
        }
    }

    Ok(TxRecord::from_transaction(&tx, &prevouts, book, height, timestamp))
}

/// Build records for new transactions and height changes, then merge
///
/// Returns how many transactions were new to the history.
async fn sync_history(
    indexer: &dyn Indexer,
    state: &mut NetworkState,
    scan: &HistoryScan,
) -> Result<usize, WalletError> {
    let mut heights: BTreeMap<Txid, u32> = BTreeMap::new();
    for items in scan.histories.values() {
        for item in items {
            let height = heights.entry(item.txid).or_insert(item.height);
            *height = (*height).max(item.height);
        }
    }

    let known: HashMap<Txid, &TxRecord> = state.history.iter().map(|r| (r.txid, r)).collect();
    let now = unix_now();
    let mut block_times = HashMap::new();
    let mut parents = HashMap::new();
    let mut incoming = Vec::new();
    let mut new_transactions = 0;

    for (txid, height) in heights {
        let existing = known.get(&txid).copied();
        if existing.is_some_and(|record| record.height == height) {
            continue;
        }

        let first_seen = existing.map_or(now, |record| record.timestamp);
        let timestamp = if height > 0 {
            block_timestamp(indexer, height, &mut block_times)
                .await?
                .unwrap_or(first_seen)
        } else {
            first_seen
        };

        match existing {
            Some(record) => {
                log::debug!("Transaction {} moved to height {}", txid, height);
                incoming.push(TxRecord {
                    height,
                    timestamp,
                    ..record.clone()
                });
            }
            None => {
                let record =
                    fetch_record(indexer, &state.book, txid, height, timestamp, &mut parents).await?;
                if let Some(record) = record {
                    new_transactions += 1;
                    incoming.push(record);
                }
            }
        }
    }

    if !incoming.is_empty() {
        state.history = merge_incoming(&state.history, &incoming);
    }
    Ok(new_transactions)
}

/// Full refresh of one network state for the given address types
pub async fn refresh_state(
    indexer: &dyn Indexer,
    key: &MasterKey,
    state: &mut NetworkState,
    types: &[AddressType],
    gaps: GapLimits,
) -> Result<RefreshSummary, WalletError> {
    let network = state.network();
    let tip_height = indexer.tip_height().await?;
    log::info!("🔄 Refreshing {} at tip {} ({:?})", network, tip_height, types);

    let mut scan = HistoryScan::default();
    for address_type in types {
        for chain in Chain::ALL {
            scan_chain(
                indexer,
                key,
                &mut state.book,
                *address_type,
                chain,
                gaps.for_chain(chain),
                &mut scan,
            )
            .await?;
        }
    }

    // Stored addresses below the scan start (or pre-generated beyond it)
    let remaining: Vec<String> = state
        .book
        .script_hashes(types)
        .into_iter()
        .filter(|hash| !scan.probed(hash))
        .collect();
    if !remaining.is_empty() {
        log::debug!("Querying {} further stored addresses", remaining.len());
        let results =
            query_all(&remaining, |hash| async move { indexer.get_history(&hash).await }).await?;
        scan.absorb(results);
    }

    let active: HashSet<String> = scan.active().cloned().collect();
    for script_hash in &active {
        state.book.mark_script_hash_used(script_hash);
    }

    refresh_utxos(indexer, state, types, &scan).await?;
    let new_transactions = sync_history(indexer, state, &scan).await?;
    state.last_synced_height = Some(tip_height);

    let summary = RefreshSummary {
        network,
        tip_height,
        addresses_checked: scan.histories.len() + scan.uncertain.len(),
        active_addresses: active.len(),
        utxo_count: state.utxos.len(),
        new_transactions,
        balance: state.utxos.balance(),
        repaired_addresses: 0,
    };
    log::info!(
        "✅ {}: {} active addresses, {} UTXOs, {} new transactions, {} sats",
        network,
        summary.active_addresses,
        summary.utxo_count,
        summary.new_transactions,
        summary.balance.total()
    );
    Ok(summary)
}
