//! Transaction history records, merge and search

use bitcoin::{Address, OutPoint, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::address::script_hash;
use crate::{AddressBook, CoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Sent,
    Received,
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxType::Sent => f.write_str("sent"),
            TxType::Received => f.write_str("received"),
        }
    }
}

impl FromStr for TxType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sent" => Ok(TxType::Sent),
            "received" => Ok(TxType::Received),
            other => Err(CoreError::InvalidDraft(format!("unknown transaction type {}", other))),
        }
    }
}

/// Wallet-relative view of one transaction
///
/// The `matched_*` values are the parts attributable to the wallet's own
/// addresses; the remainder belongs to counterparties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub txid: Txid,
    /// Counterparty address for sends, receiving address for receives
    pub address: String,
    /// 0 while unconfirmed
    pub height: u32,
    pub script_hash: String,
    pub total_input_value: u64,
    pub matched_input_value: u64,
    pub total_output_value: u64,
    pub matched_output_value: u64,
    pub fee: u64,
    pub tx_type: TxType,
    /// Net amount that left (sent) or reached (received) the wallet, fee excluded
    pub value: u64,
    /// Unix seconds: block time once confirmed, first-seen before
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TxRecord {
    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }

    /// Build the wallet-relative record of `tx`
    ///
    /// `prevouts` must hold the spent output for every input the caller could
    /// resolve. The fee is only known when every input resolved; it is 0
    /// otherwise. Returns `None` when the transaction touches no wallet
    /// address.
    pub fn from_transaction(
        tx: &Transaction,
        prevouts: &HashMap<OutPoint, TxOut>,
        book: &AddressBook,
        height: u32,
        timestamp: u64,
    ) -> Option<Self> {
        let network = book.network().to_bitcoin();
        let mut total_input_value = 0u64;
        let mut matched_input_value = 0u64;
        let mut all_inputs_known = true;
        let mut input_match: Option<String> = None;

        for input in &tx.input {
            match prevouts.get(&input.previous_output) {
                Some(prevout) => {
                    total_input_value += prevout.value.to_sat();
                    let hash = script_hash(&prevout.script_pubkey);
                    if book.contains_script_hash(&hash) {
                        matched_input_value += prevout.value.to_sat();
                        input_match.get_or_insert(hash);
                    }
                }
                None => all_inputs_known = false,
            }
        }

        let mut total_output_value = 0u64;
        let mut matched_output_value = 0u64;
        let mut own_output: Option<(String, String)> = None;
        let mut external_output: Option<(String, String)> = None;

        for output in &tx.output {
            let value = output.value.to_sat();
            total_output_value += value;

            let hash = script_hash(&output.script_pubkey);
            let address = Address::from_script(&output.script_pubkey, network)
                .map(|a| a.to_string())
                .unwrap_or_default();

            if book.contains_script_hash(&hash) {
                matched_output_value += value;
                own_output.get_or_insert((address, hash));
            } else {
                external_output.get_or_insert((address, hash));
            }
        }

        if matched_input_value == 0 && matched_output_value == 0 {
            return None;
        }

        let fee = if all_inputs_known {
            total_input_value.saturating_sub(total_output_value)
        } else {
            0
        };

        let (tx_type, value, (address, hash)) = if matched_input_value > 0 {
            let value = matched_input_value
                .saturating_sub(matched_output_value)
                .saturating_sub(fee);
            // Self-transfers have no counterparty; report the receiving output
            let party = external_output
                .or(own_output)
                .unwrap_or_else(|| (String::new(), input_match.unwrap_or_default()));
            (TxType::Sent, value, party)
        } else {
            let value = matched_output_value - matched_input_value;
            (TxType::Received, value, own_output.unwrap_or_default())
        };

        Some(Self {
            txid: tx.compute_txid(),
            address,
            height,
            script_hash: hash,
            total_input_value,
            matched_input_value,
            total_output_value,
            matched_output_value,
            fee,
            tx_type,
            value,
            timestamp,
            message: None,
        })
    }
}

fn sort_records(records: &mut [TxRecord]) {
    records.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.txid.cmp(&b.txid))
    });
}

/// Merge a batch of indexer-derived records into the stored history
///
/// A record with a known txid supersedes the stored one (height changes as
/// it confirms); a user message on the stored record is carried over when
/// the incoming one has none. Within `incoming` the last record for a txid
/// wins. The result has one record per txid, newest first, ties broken by
/// txid, so merging the same batch twice changes nothing.
pub fn merge_incoming(existing: &[TxRecord], incoming: &[TxRecord]) -> Vec<TxRecord> {
    let mut latest: BTreeMap<Txid, &TxRecord> = BTreeMap::new();
    for record in incoming {
        latest.insert(record.txid, record);
    }

    let mut merged: Vec<TxRecord> = Vec::with_capacity(existing.len() + latest.len());
    let mut seen = std::collections::HashSet::new();

    for stored in existing {
        if !seen.insert(stored.txid) {
            continue;
        }
        match latest.remove(&stored.txid) {
            Some(newer) => {
                let mut record = newer.clone();
                if record.message.is_none() {
                    record.message = stored.message.clone();
                }
                merged.push(record);
            }
            None => merged.push(stored.clone()),
        }
    }

    merged.extend(latest.into_values().cloned());
    sort_records(&mut merged);
    merged
}

/// Case-insensitive substring search over txid, address and message,
/// restricted to `types`. Empty search and empty type set match everything.
pub fn filter(items: &[TxRecord], search: &str, types: &[TxType]) -> Vec<TxRecord> {
    let needle = search.trim().to_lowercase();

    items
        .iter()
        .filter(|record| types.is_empty() || types.contains(&record.tx_type))
        .filter(|record| {
            if needle.is_empty() {
                return true;
            }
            record.txid.to_string().contains(&needle)
                || record.address.to_lowercase().contains(&needle)
                || record
                    .message
                    .as_deref()
                    .is_some_and(|m| m.to_lowercase().contains(&needle))
        })
        .cloned()
        .collect()
}
