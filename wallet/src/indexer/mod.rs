//! Blockchain indexer clients
//!
//! The wallet queries chain state by Electrum-style script hash. Two
//! backends implement [`Indexer`]:
//!
//! - [`EsploraIndexer`]: Esplora REST API over HTTP (`http(s)://` URLs)
//! - [`ElectrumIndexer`]: Electrum JSON-RPC over TCP (`tcp://host:port` URLs)
//!
//! Failures are split by how the caller should react: `Unreachable` is
//! transient and retried, `MalformedResponse` concerns one query only and
//! leaves the affected address unchanged, `Rejected` is a definitive refusal.

mod electrum;
mod esplora;
mod headers;

pub use electrum::ElectrumIndexer;
pub use esplora::EsploraIndexer;
pub use headers::{HeaderWatcher, HeaderWatcherHandle};

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexerError {
    #[error("Indexer unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed indexer response: {0}")]
    MalformedResponse(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

/// One transaction touching a script hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryItem {
    pub txid: Txid,
    /// 0 while unconfirmed
    pub height: u32,
}

/// One unspent output paying to a script hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnspentItem {
    pub txid: Txid,
    pub vout: u32,
    /// 0 while unconfirmed
    pub height: u32,
    pub value: u64,
}

/// Query interface of an external blockchain indexer
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Height of the current chain tip
    async fn tip_height(&self) -> Result<u32, IndexerError>;

    async fn get_history(&self, script_hash: &str) -> Result<Vec<HistoryItem>, IndexerError>;

    async fn get_unspent(&self, script_hash: &str) -> Result<Vec<UnspentItem>, IndexerError>;

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, IndexerError>;

    /// Submit a signed transaction, returning its txid
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, IndexerError>;

    /// Fee rate in sat/vB for confirmation within `target_blocks`, `None` if unknown
    async fn estimate_fee(&self, target_blocks: u16) -> Result<Option<u64>, IndexerError>;

    /// Unix timestamp of the block at `height`
    async fn block_time(&self, height: u32) -> Result<u64, IndexerError>;
}

/// Build the backend an endpoint URL selects
pub fn connect(url: &str) -> Result<Arc<dyn Indexer>, IndexerError> {
    let parsed = Url::parse(url)
        .map_err(|e| IndexerError::Unreachable(format!("invalid indexer URL {}: {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => {
            log::debug!("Using Esplora indexer at {}", url);
            Ok(Arc::new(EsploraIndexer::new(url)))
        }
        "tcp" => {
            let host = parsed
                .host_str()
                .ok_or_else(|| IndexerError::Unreachable(format!("no host in {}", url)))?;
            let port = parsed
                .port()
                .ok_or_else(|| IndexerError::Unreachable(format!("no port in {}", url)))?;
            log::debug!("Using Electrum indexer at {}:{}", host, port);
            Ok(Arc::new(ElectrumIndexer::new(format!("{}:{}", host, port))))
        }
        other => Err(IndexerError::Unreachable(format!(
            "unsupported indexer scheme {}",
            other
        ))),
    }
}

/// Parse a hex-encoded transaction from an indexer
pub(crate) fn decode_transaction(raw: &str) -> Result<Transaction, IndexerError> {
    let bytes = hex::decode(raw.trim())
        .map_err(|e| IndexerError::MalformedResponse(format!("transaction hex: {}", e)))?;
    bitcoin::consensus::deserialize(&bytes)
        .map_err(|e| IndexerError::MalformedResponse(format!("transaction bytes: {}", e)))
}

pub(crate) fn parse_txid(raw: &str) -> Result<Txid, IndexerError> {
    raw.trim()
        .parse()
        .map_err(|e| IndexerError::MalformedResponse(format!("txid {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_selects_backend() {
        assert!(connect("https://mempool.space/api").is_ok());
        assert!(connect("tcp://127.0.0.1:60001").is_ok());
        assert!(connect("tcp://127.0.0.1").is_err());
        assert!(connect("ssl://electrum.example:50002").is_err());
        assert!(connect("not a url").is_err());
    }

    #[test]
    fn test_decode_transaction_rejects_garbage() {
        assert!(matches!(
            decode_transaction("zz"),
            Err(IndexerError::MalformedResponse(_))
        ));
        assert!(matches!(
            decode_transaction("0200"),
            Err(IndexerError::MalformedResponse(_))
        ));
    }
}
