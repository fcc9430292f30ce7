/// Send operations
///
/// Drives the draft transaction of one (wallet, network) state through
/// compose, sign or PSBT, and broadcast. Broadcasting re-syncs the spent
/// outputs first and refuses drafts whose inputs are gone.
use bitcoin::{Amount, OutPoint, Transaction, TxOut, Txid};
use onchain_core::{
    merge_incoming, validate_address, AddressType, Chain, ComposeStage, CoreError, MasterKey,
    PendingTransaction, TransactionBuilder, TxRecord, Utxo,
};
use std::collections::{BTreeSet, HashMap};

use super::sync_ops::{owned_utxo, refresh_state, unix_now, GapLimits};
use crate::api::types::{PsbtResponse, SendRequest, SendResponse};
use crate::error::WalletError;
use crate::indexer::Indexer;
use crate::storage::NetworkState;

/// Load a one-shot send request into a fresh draft
pub fn configure_draft(draft: &mut PendingTransaction, request: &SendRequest) -> Result<(), WalletError> {
    draft.reset();
    draft.set_outputs(request.recipients.clone())?;
    draft.set_fee_rate(request.fee_rate)?;
    draft.set_rbf(request.rbf)?;
    draft.set_max(request.send_max)?;

    if request.utxos.is_empty() {
        draft.set_preference(request.preference.unwrap_or_default())?;
    } else {
        let outpoints = request
            .utxos
            .iter()
            .map(|u| u.outpoint())
            .collect::<Result<Vec<_>, _>>()?;
        draft.select_inputs(outpoints)?;
    }

    draft.set_message(request.message.clone(), request.label.clone());
    Ok(())
}

/// Run coin selection over the spendable outputs
///
/// Change goes to the first unused change address of `address_type`.
pub fn compose(
    key: &MasterKey,
    state: &mut NetworkState,
    address_type: AddressType,
) -> Result<(), WalletError> {
    let change = state
        .book
        .current_address(key, address_type, Chain::Change)?;
    let spendable: Vec<Utxo> = state.utxos.spendable().cloned().collect();

    let builder = TransactionBuilder::new(state.network());
    builder.compose(&mut state.draft, &spendable, &change, address_type)?;

    log::info!(
        "🔧 Draft ready: {} inputs, fee {} sats, change {} sats",
        state.draft.utxos.len(),
        state.draft.fee,
        state.draft.change
    );
    Ok(())
}

pub fn sign(key: &MasterKey, state: &mut NetworkState) -> Result<Transaction, WalletError> {
    let builder = TransactionBuilder::new(state.network());
    let tx = builder.sign_draft(&mut state.draft, key)?;
    log::info!("Signed draft {}", tx.compute_txid());
    Ok(tx)
}

/// Unsigned PSBT of the ready draft for an external signer
///
/// Legacy inputs carry their full previous transaction, fetched here.
pub async fn create_psbt(
    indexer: &dyn Indexer,
    key: &MasterKey,
    state: &mut NetworkState,
    address_type: AddressType,
) -> Result<PsbtResponse, WalletError> {
    state.draft.expect_stage(ComposeStage::Ready)?;

    let legacy: BTreeSet<Txid> = state
        .draft
        .utxos
        .iter()
        .filter(|u| !u.address_type.is_segwit())
        .map(|u| u.txid)
        .collect();

    let mut previous_txs = HashMap::new();
    for txid in legacy {
        previous_txs.insert(txid, indexer.get_transaction(&txid).await?);
    }

    let builder = TransactionBuilder::new(state.network());
    let psbt = builder.create_draft_psbt(&mut state.draft, key, &previous_txs, address_type)?;
    let txid = psbt.unsigned_tx.compute_txid();

    log::info!("📝 PSBT created for {}", txid);
    Ok(PsbtResponse {
        psbt: psbt.to_string(),
        txid: txid.to_string(),
        fee_sats: state.draft.fee,
    })
}

/// Add outputs paying back to the wallet as unconfirmed UTXOs
pub(crate) fn track_own_outputs(state: &mut NetworkState, tx: &Transaction) {
    let txid = tx.compute_txid();
    for (vout, output) in tx.output.iter().enumerate() {
        let hash = onchain_core::script_hash(&output.script_pubkey);
        let outpoint = OutPoint::new(txid, vout as u32);
        if let Some(utxo) = owned_utxo(&state.book, &hash, outpoint, 0, output.value.to_sat()) {
            state.utxos.insert(utxo);
            state.book.mark_script_hash_used(&hash);
        }
    }
}

/// Record a transaction this wallet just broadcast
pub(crate) fn record_outgoing(
    state: &mut NetworkState,
    tx: &Transaction,
    inputs: &[Utxo],
    message: Option<String>,
) -> Result<(), WalletError> {
    let network = state.network();
    let mut prevouts = HashMap::new();
    for utxo in inputs {
        prevouts.insert(
            utxo.outpoint(),
            TxOut {
                value: Amount::from_sat(utxo.value),
                script_pubkey: validate_address(&utxo.address, network)?.script_pubkey(),
            },
        );
    }

    if let Some(mut record) = TxRecord::from_transaction(tx, &prevouts, &state.book, 0, unix_now()) {
        record.message = message.filter(|m| !m.is_empty());
        state.history = merge_incoming(&state.history, &[record]);
    }
    Ok(())
}

/// Spend the draft inputs, track change and history after a broadcast
pub(crate) fn apply_broadcast(
    state: &mut NetworkState,
    tx: &Transaction,
    inputs: &[Utxo],
    message: Option<String>,
) -> Result<(), WalletError> {
    let spent: Vec<OutPoint> = inputs.iter().map(Utxo::outpoint).collect();
    state.utxos.remove_spent(&spent);
    track_own_outputs(state, tx);
    record_outgoing(state, tx, inputs, message)
}

/// Submit `tx` and check the indexer agrees on its txid
pub(crate) async fn submit(indexer: &dyn Indexer, tx: &Transaction) -> Result<Txid, WalletError> {
    let expected = tx.compute_txid();
    log::info!("📡 Broadcasting {}", expected);

    let txid = indexer.broadcast(tx).await?;
    if txid != expected {
        return Err(WalletError::Broadcast(format!(
            "indexer returned txid {} for {}",
            txid, expected
        )));
    }
    Ok(txid)
}

/// Broadcast the signed draft
///
/// The address types of the draft inputs are re-synced first; any input
/// that is no longer unspent (or was blacklisted meanwhile) aborts with
/// [`WalletError::StaleUtxoSet`] and leaves the draft signed.
pub async fn broadcast(
    indexer: &dyn Indexer,
    key: &MasterKey,
    state: &mut NetworkState,
    address_type: AddressType,
    gaps: GapLimits,
) -> Result<SendResponse, WalletError> {
    state.draft.expect_stage(ComposeStage::Signed)?;
    let raw = state.draft.raw_tx.clone().ok_or_else(|| {
        WalletError::Core(CoreError::InvalidDraft(
            "signed draft has no transaction".to_string(),
        ))
    })?;
    let tx = crate::indexer::decode_transaction(&raw)?;

    let mut types: Vec<AddressType> = vec![address_type];
    for utxo in &state.draft.utxos {
        if !types.contains(&utxo.address_type) {
            types.push(utxo.address_type);
        }
    }
    refresh_state(indexer, key, state, &types, gaps).await?;

    let stale: Vec<String> = state
        .draft
        .outpoints()
        .into_iter()
        .filter(|op| !state.utxos.contains(op) || state.utxos.is_blacklisted(op))
        .map(|op| op.to_string())
        .collect();
    if !stale.is_empty() {
        log::warn!("⚠️  Draft inputs no longer spendable: {}", stale.join(", "));
        return Err(WalletError::StaleUtxoSet(stale.join(", ")));
    }

    let txid = submit(indexer, &tx).await?;

    let inputs = state.draft.utxos.clone();
    let message = Some(state.draft.message.clone());
    apply_broadcast(state, &tx, &inputs, message)?;

    let response = SendResponse {
        txid: txid.to_string(),
        fee_sats: state.draft.fee,
        vsize: state.draft.vsize,
        change_sats: state.draft.change,
        sent_sats: state.draft.target(),
    };

    state.draft.mark_broadcast()?;
    state.draft.reset();

    log::info!("✅ Broadcast {} ({} sats fee)", txid, response.fee_sats);
    Ok(response)
}
