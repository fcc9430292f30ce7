use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;

use super::{decode_transaction, parse_txid, HistoryItem, Indexer, IndexerError, UnspentItem};

/// Confirmed transactions per page of `/scripthash/:hash/txs/chain`
const CHAIN_PAGE_SIZE: usize = 25;

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    #[serde(default)]
    block_height: Option<u32>,
}

impl TxStatus {
    fn height(&self) -> u32 {
        if self.confirmed {
            self.block_height.unwrap_or(0)
        } else {
            0
        }
    }
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    status: TxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: TxStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraBlock {
    timestamp: u64,
}

/// Esplora REST client (Blockstream / mempool.space API)
pub struct EsploraIndexer {
    client: reqwest::Client,
    base_url: String,
}

impl EsploraIndexer {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, IndexerError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| IndexerError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IndexerError::Unreachable(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(IndexerError::MalformedResponse(format!("{} returned {}", url, status)));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, IndexerError> {
        self.get(path)
            .await?
            .json()
            .await
            .map_err(|e| IndexerError::MalformedResponse(format!("{}: {}", path, e)))
    }

    async fn get_text(&self, path: &str) -> Result<String, IndexerError> {
        self.get(path)
            .await?
            .text()
            .await
            .map_err(|e| IndexerError::Unreachable(format!("{}: {}", path, e)))
    }
}

/// Pick the estimate for the largest published target not above `target`
fn pick_estimate(estimates: &HashMap<String, f64>, target: u16) -> Option<u64> {
    let mut parsed: Vec<(u16, f64)> = estimates
        .iter()
        .filter_map(|(blocks, rate)| Some((blocks.parse().ok()?, *rate)))
        .filter(|(_, rate)| rate.is_finite() && *rate > 0.0)
        .collect();
    parsed.sort_by_key(|(blocks, _)| *blocks);

    parsed
        .iter()
        .rev()
        .find(|(blocks, _)| *blocks <= target)
        .or_else(|| parsed.first())
        .map(|(_, rate)| rate.ceil() as u64)
}

#[async_trait]
impl Indexer for EsploraIndexer {
    async fn tip_height(&self) -> Result<u32, IndexerError> {
        let text = self.get_text("/blocks/tip/height").await?;
        text.trim()
            .parse()
            .map_err(|e| IndexerError::MalformedResponse(format!("tip height {}: {}", text, e)))
    }

    async fn get_history(&self, script_hash: &str) -> Result<Vec<HistoryItem>, IndexerError> {
        let mut items = Vec::new();
        let mut page: Vec<EsploraTx> = self
            .get_json(&format!("/scripthash/{}/txs", script_hash))
            .await?;

        loop {
            let mut last_confirmed = None;
            let mut confirmed = 0;
            for tx in &page {
                items.push(HistoryItem {
                    txid: parse_txid(&tx.txid)?,
                    height: tx.status.height(),
                });
                if tx.status.confirmed {
                    confirmed += 1;
                    last_confirmed = Some(tx.txid.clone());
                }
            }

            match last_confirmed {
                Some(last) if confirmed >= CHAIN_PAGE_SIZE => {
                    page = self
                        .get_json(&format!("/scripthash/{}/txs/chain/{}", script_hash, last))
                        .await?;
                }
                _ => break,
            }
        }

        log::debug!("Esplora history for {}: {} transactions", script_hash, items.len());
        Ok(items)
    }

    async fn get_unspent(&self, script_hash: &str) -> Result<Vec<UnspentItem>, IndexerError> {
        let utxos: Vec<EsploraUtxo> = self
            .get_json(&format!("/scripthash/{}/utxo", script_hash))
            .await?;

        utxos
            .into_iter()
            .map(|utxo| {
                Ok(UnspentItem {
                    txid: parse_txid(&utxo.txid)?,
                    vout: utxo.vout,
                    height: utxo.status.height(),
                    value: utxo.value,
                })
            })
            .collect()
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, IndexerError> {
        let raw = self.get_text(&format!("/tx/{}/hex", txid)).await?;
        decode_transaction(&raw)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, IndexerError> {
        let tx_hex = bitcoin::consensus::encode::serialize_hex(tx);
        let url = format!("{}/tx", self.base_url);
        log::debug!("Broadcasting transaction to: {}", url);

        let response = self
            .client
            .post(&url)
            .body(tx_hex)
            .send()
            .await
            .map_err(|e| IndexerError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        if status.is_server_error() {
            return Err(IndexerError::Unreachable(format!("broadcast returned {}: {}", status, body)));
        }
        if !status.is_success() {
            return Err(IndexerError::Rejected(body));
        }
        parse_txid(&body)
    }

    async fn estimate_fee(&self, target_blocks: u16) -> Result<Option<u64>, IndexerError> {
        let estimates: HashMap<String, f64> = self.get_json("/fee-estimates").await?;
        Ok(pick_estimate(&estimates, target_blocks))
    }

    async fn block_time(&self, height: u32) -> Result<u64, IndexerError> {
        let hash = self.get_text(&format!("/block-height/{}", height)).await?;
        let block: EsploraBlock = self.get_json(&format!("/block/{}", hash.trim())).await?;
        Ok(block.timestamp)
    }
}
