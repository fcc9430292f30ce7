/// Boost operations
///
/// Speeding up unconfirmed transactions: replace-by-fee for wallet-funded
/// sends, child-pays-for-parent for anything paying back to the wallet.
use bitcoin::{OutPoint, Transaction, Txid};
use chrono::Utc;
use onchain_core::{
    script_hash, validate_address, AddressType, BoostOptions, Chain, CoreError, FeeBumpRequest,
    MasterKey, TransactionBuilder, TxRecord, Utxo,
};
use std::collections::HashMap;

use super::send_ops::{apply_broadcast, submit};
use super::sync_ops::owned_utxo;
use crate::api::types::BoostResponse;
use crate::error::WalletError;
use crate::indexer::Indexer;
use crate::storage::{BoostKind, BoostedTransaction, NetworkState};

fn find_record<'a>(state: &'a NetworkState, txid: &Txid) -> Result<&'a TxRecord, WalletError> {
    state
        .history
        .iter()
        .find(|r| r.txid == *txid)
        .ok_or_else(|| WalletError::TransactionNotFound(txid.to_string()))
}

/// Which boosts `txid` allows right now
pub async fn can_boost(
    indexer: &dyn Indexer,
    state: &NetworkState,
    txid: &Txid,
) -> Result<BoostOptions, WalletError> {
    let record = find_record(state, txid)?;
    let tx = indexer.get_transaction(txid).await?;

    let wallet_funded =
        record.total_input_value > 0 && record.matched_input_value == record.total_input_value;
    let owned_unspent = state.utxos.spendable().any(|u| u.txid == *txid);

    Ok(BoostOptions::evaluate(
        &tx,
        record.is_confirmed(),
        wallet_funded,
        owned_unspent,
    ))
}

/// Wallet UTXOs spent by `tx`, in input order
///
/// Inputs that do not belong to the wallet are skipped, so the result is
/// shorter than `tx.input` for jointly funded transactions.
async fn spent_outputs(
    indexer: &dyn Indexer,
    state: &NetworkState,
    tx: &Transaction,
) -> Result<Vec<Utxo>, WalletError> {
    let heights: HashMap<Txid, u32> = state.history.iter().map(|r| (r.txid, r.height)).collect();
    let mut parents: HashMap<Txid, Transaction> = HashMap::new();
    let mut inputs = Vec::with_capacity(tx.input.len());

    for input in &tx.input {
        let outpoint = input.previous_output;
        if !parents.contains_key(&outpoint.txid) {
            parents.insert(outpoint.txid, indexer.get_transaction(&outpoint.txid).await?);
        }
        let Some(spent) = parents
            .get(&outpoint.txid)
            .and_then(|parent| parent.output.get(outpoint.vout as usize))
        else {
            continue;
        };

        let hash = script_hash(&spent.script_pubkey);
        let height = heights.get(&outpoint.txid).copied().unwrap_or(0);
        if let Some(utxo) = owned_utxo(&state.book, &hash, outpoint, height, spent.value.to_sat()) {
            inputs.push(utxo);
        }
    }

    Ok(inputs)
}

fn record_boost(state: &mut NetworkState, parent: Txid, child: Txid, kind: BoostKind, fee: u64) {
    state.boosted.push(BoostedTransaction {
        parent_txid: parent,
        child_txid: child,
        kind,
        fee_sats: fee,
        created_at: Utc::now(),
    });
}

/// Replace the unconfirmed `txid` with a version paying `fee_rate`
///
/// Recipients are kept; the change output pays the difference, topped up
/// from other spendable outputs when it is too small.
pub async fn bump_fee(
    indexer: &dyn Indexer,
    key: &MasterKey,
    state: &mut NetworkState,
    address_type: AddressType,
    txid: &Txid,
    fee_rate: u64,
) -> Result<BoostResponse, WalletError> {
    let record = find_record(state, txid)?.clone();
    if record.is_confirmed() {
        return Err(CoreError::NotReplaceable(format!("{} is already confirmed", txid)).into());
    }

    log::info!("🔄 Bumping fee of {} to {} sat/vB", txid, fee_rate);
    let original = indexer.get_transaction(txid).await?;
    let original_inputs = spent_outputs(indexer, state, &original).await?;

    let input_total: u64 = original_inputs.iter().map(|u| u.value).sum();
    let output_total: u64 = original.output.iter().map(|o| o.value.to_sat()).sum();
    let original_fee = input_total.saturating_sub(output_total);

    let change_vout = original.output.iter().position(|output| {
        state
            .book
            .lookup(&script_hash(&output.script_pubkey))
            .is_some_and(|(key, _)| key.chain == Chain::Change)
    });
    let change_entry = state
        .book
        .current_address(key, address_type, Chain::Change)?;
    let extra_candidates: Vec<Utxo> = state
        .utxos
        .spendable()
        .filter(|u| u.txid != *txid)
        .cloned()
        .collect();

    let builder = TransactionBuilder::new(state.network());
    let built = builder.bump_fee(FeeBumpRequest {
        original: &original,
        original_fee,
        original_inputs,
        change_vout,
        change_entry: &change_entry,
        change_type: address_type,
        extra_candidates,
        fee_rate,
    })?;
    let signed = builder.sign_transaction(built.tx, &built.inputs, key)?;
    let replacement = submit(indexer, &signed).await?;

    let replaced: Vec<OutPoint> = (0..original.output.len())
        .map(|vout| OutPoint::new(*txid, vout as u32))
        .collect();
    state.utxos.remove_spent(&replaced);
    state.history.retain(|r| r.txid != *txid);
    apply_broadcast(state, &signed, &built.inputs, record.message.clone())?;
    record_boost(state, *txid, replacement, BoostKind::Rbf, built.fee);

    log::info!("✅ {} replaced by {} (fee {} sats)", txid, replacement, built.fee);
    Ok(BoostResponse {
        parent_txid: txid.to_string(),
        txid: replacement.to_string(),
        kind: BoostKind::Rbf,
        fee_sats: built.fee,
        vsize: built.vsize,
    })
}

/// Spend the wallet's outputs of the unconfirmed `txid` in a child paying
/// enough for both to confirm at `fee_rate`
pub async fn boost_cpfp(
    indexer: &dyn Indexer,
    key: &MasterKey,
    state: &mut NetworkState,
    address_type: AddressType,
    txid: &Txid,
    fee_rate: u64,
) -> Result<BoostResponse, WalletError> {
    let record = find_record(state, txid)?.clone();
    if record.is_confirmed() {
        return Err(CoreError::NoEligibleInputsForBoost.into());
    }

    log::info!("🔄 CPFP boost of {} at {} sat/vB", txid, fee_rate);
    let parent = indexer.get_transaction(txid).await?;
    let owned: Vec<Utxo> = state
        .utxos
        .spendable()
        .filter(|u| u.txid == *txid)
        .cloned()
        .collect();

    let change = state
        .book
        .current_address(key, address_type, Chain::Change)?;
    let destination = validate_address(&change.address, state.network())?;

    let builder = TransactionBuilder::new(state.network());
    let built = builder.boost_cpfp(&parent, record.fee, &owned, &destination, fee_rate)?;
    let signed = builder.sign_transaction(built.tx, &built.inputs, key)?;
    let child = submit(indexer, &signed).await?;

    apply_broadcast(state, &signed, &built.inputs, None)?;
    record_boost(state, *txid, child, BoostKind::Cpfp, built.fee);

    log::info!("✅ {} boosted by child {} (fee {} sats)", txid, child, built.fee);
    Ok(BoostResponse {
        parent_txid: txid.to_string(),
        txid: child.to_string(),
        kind: BoostKind::Cpfp,
        fee_sats: built.fee,
        vsize: built.vsize,
    })
}
