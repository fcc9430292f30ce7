use axum::{
    extract::{Path, Query, State},
    Json,
};
use bitcoin::Txid;
use onchain_core::{BoostOptions, CoreError, FeeEstimates, TxRecord};
use std::sync::Arc;

use super::types::*;
use crate::error::WalletError;
use crate::storage::StorageWarning;
use crate::wallet::{RefreshOptions, RefreshSummary, StorageCheckReport, WalletManager};

fn parse_txid(raw: &str) -> Result<Txid, WalletError> {
    raw.parse()
        .map_err(|e| WalletError::Core(CoreError::InvalidDraft(format!("invalid txid {}: {}", raw, e))))
}

// ============================================================================
// Wallet lifecycle
// ============================================================================

pub async fn create_wallet_handler(
    State(manager): State<Arc<WalletManager>>,
    Json(req): Json<CreateWalletRequest>,
) -> Result<Json<WalletInfo>, WalletError> {
    let wallet_info = manager.create_wallet(req).await?;
    Ok(Json(wallet_info))
}

pub async fn restore_wallet_handler(
    State(manager): State<Arc<WalletManager>>,
    Json(req): Json<RestoreWalletRequest>,
) -> Result<Json<WalletInfo>, WalletError> {
    let wallet_info = manager.restore_wallet(req).await?;
    Ok(Json(wallet_info))
}

pub async fn list_wallets_handler(
    State(manager): State<Arc<WalletManager>>,
) -> Result<Json<Vec<WalletSummary>>, WalletError> {
    let wallets = manager.list_wallets()?;
    Ok(Json(wallets))
}

pub async fn delete_wallet_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
) -> Result<Json<DeleteWalletResponse>, WalletError> {
    Ok(Json(manager.wipe(&name)?))
}

pub async fn select_wallet_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
) -> Result<Json<WalletSummary>, WalletError> {
    Ok(Json(manager.select_wallet(&name)?))
}

pub async fn switch_network_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<SwitchNetworkRequest>,
) -> Result<Json<WalletSummary>, WalletError> {
    Ok(Json(manager.switch_network(&name, req.network)?))
}

pub async fn set_address_type_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<AddressTypeRequest>,
) -> Result<Json<WalletSummary>, WalletError> {
    Ok(Json(manager.set_address_type(&name, req)?))
}

pub async fn set_indexer_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<IndexerUrlRequest>,
) -> Result<Json<WalletSummary>, WalletError> {
    manager.set_indexer_url(&name, req)?;
    Ok(Json(manager.wallet_summary(&name)?))
}

// ============================================================================
// Sync & queries
// ============================================================================

pub async fn refresh_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    options: Option<Json<RefreshOptions>>,
) -> Result<Json<RefreshSummary>, WalletError> {
    let options = options.map(|Json(o)| o).unwrap_or_default();
    let summary = manager.refresh(&name, options).await?;
    Ok(Json(summary))
}

pub async fn get_balance_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
) -> Result<Json<BalanceInfo>, WalletError> {
    Ok(Json(manager.get_balance(&name)?))
}

pub async fn get_address_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Query(query): Query<AddressQuery>,
) -> Result<Json<AddressInfo>, WalletError> {
    let address = manager.get_receive_address(&name, query.new).await?;
    Ok(Json(address))
}

pub async fn get_transactions_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Query(query): Query<TransactionQuery>,
) -> Result<Json<Vec<TxRecord>>, WalletError> {
    Ok(Json(manager.get_transactions(&name, &query)?))
}

pub async fn get_utxos_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<UtxoInfo>>, WalletError> {
    Ok(Json(manager.get_utxos(&name)?))
}

pub async fn blacklist_utxo_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<OutpointRequest>,
) -> Result<Json<BalanceInfo>, WalletError> {
    let balance = manager.blacklist_utxo(&name, req.outpoint()?).await?;
    Ok(Json(balance))
}

pub async fn whitelist_utxo_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<OutpointRequest>,
) -> Result<Json<BalanceInfo>, WalletError> {
    let balance = manager.whitelist_utxo(&name, req.outpoint()?).await?;
    Ok(Json(balance))
}

// ============================================================================
// Spending
// ============================================================================

pub async fn estimate_fees_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
) -> Result<Json<FeeEstimates>, WalletError> {
    Ok(Json(manager.estimate_fees(&name).await?))
}

pub async fn send_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, WalletError> {
    log::info!("Send request for wallet '{}' ({} recipients)", name, req.recipients.len());
    let response = manager.send(&name, req).await?;
    Ok(Json(response))
}

/// Compose the given request into a PSBT instead of signing it
pub async fn create_psbt_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<SendRequest>,
) -> Result<Json<PsbtResponse>, WalletError> {
    manager.configure_draft(&name, &req).await?;
    manager.compose(&name).await?;
    Ok(Json(manager.create_psbt(&name).await?))
}

pub async fn bump_fee_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<BoostRequest>,
) -> Result<Json<BoostResponse>, WalletError> {
    let txid = parse_txid(&req.txid)?;
    Ok(Json(manager.bump_fee(&name, &txid, req.fee_rate).await?))
}

pub async fn boost_cpfp_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<BoostRequest>,
) -> Result<Json<BoostResponse>, WalletError> {
    let txid = parse_txid(&req.txid)?;
    Ok(Json(manager.boost_cpfp(&name, &txid, req.fee_rate).await?))
}

pub async fn can_boost_handler(
    State(manager): State<Arc<WalletManager>>,
    Path((name, txid)): Path<(String, String)>,
) -> Result<Json<BoostOptions>, WalletError> {
    let txid = parse_txid(&txid)?;
    Ok(Json(manager.can_boost(&name, &txid).await?))
}

// ============================================================================
// Maintenance
// ============================================================================

pub async fn storage_check_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    req: Option<Json<StorageCheckRequest>>,
) -> Result<Json<StorageCheckReport>, WalletError> {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(manager.storage_check(&name, req).await?))
}

pub async fn warnings_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<StorageWarning>>, WalletError> {
    Ok(Json(manager.storage_warnings(&name)?))
}

pub async fn payment_uri_handler(
    State(manager): State<Arc<WalletManager>>,
    Path(name): Path<String>,
    Json(req): Json<PaymentUriRequest>,
) -> Result<Json<PaymentUriResponse>, WalletError> {
    Ok(Json(manager.payment_uri(&name, req).await?))
}
