/// Wallet service configuration from environment variables
///
/// Controls the storage root, default network, indexer endpoints, gap
/// limits and refresh retry policy. Defaults to Regtest for development.
use onchain_core::Network;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// Root directory holding one subdirectory per wallet
    pub data_dir: PathBuf,
    /// Network newly created wallets start on
    pub network: Network,
    /// Indexer endpoint per network (`http(s)://` Esplora, `tcp://` Electrum)
    pub indexer_urls: BTreeMap<Network, String>,
    /// Lookahead window on the receive chain
    pub gap_limit_receive: u32,
    /// Lookahead window on the change chain
    pub gap_limit_change: u32,
    /// Retries of a transient indexer failure before it is surfaced
    pub refresh_retries: u32,
    /// First retry delay, doubled on every attempt
    pub refresh_backoff: Duration,
    /// Tip polling interval of the header watcher
    pub header_poll_interval: Duration,
    /// Storage warning endpoint; telemetry is off when unset
    pub telemetry_url: Option<String>,
    pub platform: String,
    pub app_version: String,
    /// Listen address of the HTTP API
    pub bind_address: String,
}

/// Default indexer endpoint of a network
pub fn default_indexer_url(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "https://mempool.space/api",
        Network::Testnet => "https://mempool.space/testnet/api",
        Network::Regtest => "tcp://127.0.0.1:60001",
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("⚠️  Invalid value '{}' for {}, using default", value, key);
                default
            }
        },
        Err(_) => default,
    }
}

impl WalletConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `WALLET_DATA_DIR`: storage root (default `./wallets`)
    /// - `WALLET_NETWORK`: `bitcoin`/`mainnet`, `testnet` or `regtest` (default)
    /// - `INDEXER_BITCOIN_URL`, `INDEXER_TESTNET_URL`, `INDEXER_REGTEST_URL`
    /// - `GAP_LIMIT_RECEIVE`, `GAP_LIMIT_CHANGE` (default 20)
    /// - `REFRESH_RETRIES` (default 3), `REFRESH_BACKOFF_MS` (default 500)
    /// - `HEADER_POLL_SECS` (default 30)
    /// - `TELEMETRY_URL`, `APP_PLATFORM`, `APP_VERSION`
    /// - `BIND_ADDRESS` (default `127.0.0.1:3000`)
    ///
    /// # Examples
    ///
    /// ```bash
    /// # Regtest against a local electrs
    /// WALLET_NETWORK=regtest INDEXER_REGTEST_URL=tcp://127.0.0.1:60401 cargo run
    ///
    /// # Testnet through a private Esplora
    /// WALLET_NETWORK=testnet INDEXER_TESTNET_URL=http://localhost:3002 cargo run
    /// ```
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let network = match env::var("WALLET_NETWORK") {
            Ok(value) => match Network::from_str(&value) {
                Ok(network) => network,
                Err(_) => {
                    log::warn!("⚠️  Unknown network '{}', defaulting to Regtest", value);
                    Network::Regtest
                }
            },
            Err(_) => defaults.network,
        };
        match network {
            Network::Bitcoin => log::info!("🌐 Using MAINNET network"),
            Network::Testnet => log::info!("🌐 Using TESTNET network"),
            Network::Regtest => log::info!("🔧 Using REGTEST network"),
        }

        let mut indexer_urls = BTreeMap::new();
        for net in Network::ALL {
            let key = format!("INDEXER_{}_URL", net.as_str().to_uppercase());
            let url = env::var(&key).unwrap_or_else(|_| default_indexer_url(net).to_string());
            indexer_urls.insert(net, url);
        }
        if let Some(url) = indexer_urls.get(&network) {
            log::info!("📡 Indexer: {}", url);
        }

        let telemetry_url = env::var("TELEMETRY_URL").ok().filter(|url| !url.is_empty());
        if let Some(ref url) = telemetry_url {
            log::info!("🔗 Telemetry URL: {}", url);
        }

        Self {
            data_dir: env::var("WALLET_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            network,
            indexer_urls,
            gap_limit_receive: env_parse("GAP_LIMIT_RECEIVE", defaults.gap_limit_receive).max(1),
            gap_limit_change: env_parse("GAP_LIMIT_CHANGE", defaults.gap_limit_change).max(1),
            refresh_retries: env_parse("REFRESH_RETRIES", defaults.refresh_retries),
            refresh_backoff: Duration::from_millis(env_parse("REFRESH_BACKOFF_MS", 500u64)),
            header_poll_interval: Duration::from_secs(env_parse("HEADER_POLL_SECS", 30u64).max(1)),
            telemetry_url,
            platform: env::var("APP_PLATFORM").unwrap_or(defaults.platform),
            app_version: env::var("APP_VERSION").unwrap_or(defaults.app_version),
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
        }
    }

    /// Configured indexer endpoint of `network`
    pub fn indexer_url(&self, network: Network) -> &str {
        self.indexer_urls
            .get(&network)
            .map(String::as_str)
            .unwrap_or_else(|| default_indexer_url(network))
    }
}

impl Default for WalletConfig {
    /// Default configuration (Regtest)
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./wallets"),
            network: Network::Regtest,
            indexer_urls: Network::ALL
                .into_iter()
                .map(|net| (net, default_indexer_url(net).to_string()))
                .collect(),
            gap_limit_receive: 20,
            gap_limit_change: 20,
            refresh_retries: 3,
            refresh_backoff: Duration::from_millis(500),
            header_poll_interval: Duration::from_secs(30),
            telemetry_url: None,
            platform: env::consts::OS.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            bind_address: "127.0.0.1:3000".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_regtest() {
        let config = WalletConfig::default();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.gap_limit_receive, 20);
        assert_eq!(config.gap_limit_change, 20);
        assert!(config.telemetry_url.is_none());
    }

    #[test]
    fn test_indexer_urls() {
        let mut config = WalletConfig::default();
        assert_eq!(config.indexer_url(Network::Bitcoin), "https://mempool.space/api");
        assert_eq!(config.indexer_url(Network::Regtest), "tcp://127.0.0.1:60001");

        config.indexer_urls.clear();
        assert_eq!(
            config.indexer_url(Network::Testnet),
            "https://mempool.space/testnet/api"
        );
    }

    #[test]
    fn test_env_parse_falls_back() {
        assert_eq!(env_parse("ONCHAIN_WALLET_UNSET_TEST_KEY", 7u32), 7);
    }
}
