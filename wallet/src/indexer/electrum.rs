use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{decode_transaction, parse_txid, HistoryItem, Indexer, IndexerError, UnspentItem};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CLIENT_NAME: &str = "onchain-wallet";
const PROTOCOL_VERSION: &str = "1.4";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ElectrumHistory {
    tx_hash: String,
    height: i64,
}

#[derive(Debug, Deserialize)]
struct ElectrumUnspent {
    tx_hash: String,
    tx_pos: u32,
    height: i64,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct ElectrumHeader {
    height: u32,
}

/// Mempool entries report 0 or -1
fn confirmed_height(height: i64) -> u32 {
    u32::try_from(height).unwrap_or(0)
}

/// `blockchain.estimatefee` answers in BTC/kB, -1 when unknown
fn btc_per_kb_to_sat_per_vb(rate: f64) -> Option<u64> {
    if !rate.is_finite() || rate <= 0.0 {
        return None;
    }
    Some((rate * 100_000.0).ceil() as u64)
}

fn parse<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T, IndexerError> {
    serde_json::from_value(value)
        .map_err(|e| IndexerError::MalformedResponse(format!("{}: {}", method, e)))
}

/// One newline-delimited JSON-RPC session
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, IndexerError> {
        log::debug!("🔗 Connecting to Electrum server {}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| IndexerError::Unreachable(format!("{}: {}", addr, e)))?;
        let (read_half, write_half) = stream.into_split();

        let mut connection = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_id: 0,
        };
        let version = connection
            .call("server.version", json!([CLIENT_NAME, PROTOCOL_VERSION]))
            .await?;
        log::debug!("Electrum server {} speaks {}", addr, version);

        Ok(connection)
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value, IndexerError> {
        self.next_id += 1;
        let id = self.next_id;

        let mut line = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();
        line.push('\n');

        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| IndexerError::Unreachable(format!("{}: {}", method, e)))?;

        loop {
            let mut buf = String::new();
            let read = self
                .reader
                .read_line(&mut buf)
                .await
                .map_err(|e| IndexerError::Unreachable(format!("{}: {}", method, e)))?;
            if read == 0 {
                return Err(IndexerError::Unreachable(format!(
                    "{}: connection closed by server",
                    method
                )));
            }

            let response: RpcResponse = serde_json::from_str(&buf)
                .map_err(|e| IndexerError::MalformedResponse(format!("{}: {}", method, e)))?;

            // Subscription notifications carry no id
            if response.id.as_ref().and_then(Value::as_u64) != Some(id) {
                continue;
            }

            if let Some(error) = response.error {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(if method == "blockchain.transaction.broadcast" {
                    IndexerError::Rejected(message)
                } else {
                    IndexerError::MalformedResponse(format!("{}: {}", method, message))
                });
            }

            return Ok(response.result.unwrap_or(Value::Null));
        }
    }
}

/// Electrum protocol client over plain TCP
///
/// Connects lazily and reconnects after any transport failure. Requests
/// share one connection and are serialized.
pub struct ElectrumIndexer {
    addr: String,
    connection: Mutex<Option<Connection>>,
}

impl ElectrumIndexer {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            connection: Mutex::new(None),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, IndexerError> {
        let mut guard = self.connection.lock().await;

        if guard.is_none() {
            let opened = timeout(REQUEST_TIMEOUT, Connection::open(&self.addr))
                .await
                .map_err(|_| {
                    IndexerError::Unreachable(format!("timed out connecting to {}", self.addr))
                })??;
            *guard = Some(opened);
        }
        let connection = guard
            .as_mut()
            .ok_or_else(|| IndexerError::Unreachable(format!("no connection to {}", self.addr)))?;

        match timeout(REQUEST_TIMEOUT, connection.call(method, params)).await {
            Err(_) => {
                log::warn!("⚠️  Electrum request {} timed out, dropping connection", method);
                *guard = None;
                Err(IndexerError::Unreachable(format!("{} timed out", method)))
            }
            Ok(Err(IndexerError::Unreachable(reason))) => {
                log::warn!("⚠️  Electrum connection to {} lost: {}", self.addr, reason);
                *guard = None;
                Err(IndexerError::Unreachable(reason))
            }
            Ok(result) => result,
        }
    }
}

#[async_trait]
impl Indexer for ElectrumIndexer {
    async fn tip_height(&self) -> Result<u32, IndexerError> {
        let method = "blockchain.headers.subscribe";
        let header: ElectrumHeader = parse(method, self.request(method, json!([])).await?)?;
        Ok(header.height)
    }

    async fn get_history(&self, script_hash: &str) -> Result<Vec<HistoryItem>, IndexerError> {
        let method = "blockchain.scripthash.get_history";
        let entries: Vec<ElectrumHistory> =
            parse(method, self.request(method, json!([script_hash])).await?)?;

        entries
            .into_iter()
            .map(|entry| {
                Ok(HistoryItem {
                    txid: parse_txid(&entry.tx_hash)?,
                    height: confirmed_height(entry.height),
                })
            })
            .collect()
    }

    async fn get_unspent(&self, script_hash: &str) -> Result<Vec<UnspentItem>, IndexerError> {
        let method = "blockchain.scripthash.listunspent";
        let entries: Vec<ElectrumUnspent> =
            parse(method, self.request(method, json!([script_hash])).await?)?;

        entries
            .into_iter()
            .map(|entry| {
                Ok(UnspentItem {
                    txid: parse_txid(&entry.tx_hash)?,
                    vout: entry.tx_pos,
                    height: confirmed_height(entry.height),
                    value: entry.value,
                })
            })
            .collect()
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, IndexerError> {
        let method = "blockchain.transaction.get";
        let raw: String = parse(method, self.request(method, json!([txid.to_string()])).await?)?;
        decode_transaction(&raw)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, IndexerError> {
        let method = "blockchain.transaction.broadcast";
        let tx_hex = bitcoin::consensus::encode::serialize_hex(tx);
        let txid: String = parse(method, self.request(method, json!([tx_hex])).await?)?;
        parse_txid(&txid)
    }

    async fn estimate_fee(&self, target_blocks: u16) -> Result<Option<u64>, IndexerError> {
        let method = "blockchain.estimatefee";
        let rate: f64 = parse(method, self.request(method, json!([target_blocks])).await?)?;
        Ok(btc_per_kb_to_sat_per_vb(rate))
    }

    async fn block_time(&self, height: u32) -> Result<u64, IndexerError> {
        let method = "blockchain.block.header";
        let raw: String = parse(method, self.request(method, json!([height])).await?)?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| IndexerError::MalformedResponse(format!("{}: {}", method, e)))?;
        let header: bitcoin::block::Header = bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| IndexerError::MalformedResponse(format!("{}: {}", method, e)))?;
        Ok(u64::from(header.time))
    }
}
