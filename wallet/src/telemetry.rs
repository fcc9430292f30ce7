/// Storage warning telemetry
///
/// Best-effort reporting of address derivation mismatches, so an operator
/// can tell whether real funds sat at the wrong addresses. Delivery
/// failures never fail the caller; unreported warnings are retried on the
/// next refresh.
use serde::Serialize;
use uuid::Uuid;

use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::storage::StorageWarning;

#[derive(Debug, Serialize)]
struct WarningReport<'a> {
    id: Uuid,
    /// Satoshis currently held at the impacted addresses
    balance: u64,
    platform: &'a str,
    version: &'a str,
    timestamp: i64,
    /// Number of impacted addresses
    impacted: usize,
}

#[derive(Clone)]
pub struct TelemetryClient {
    client: reqwest::Client,
    url: String,
    platform: String,
    version: String,
}

impl TelemetryClient {
    pub fn new(url: String, platform: String, version: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            platform,
            version,
        }
    }

    /// Client for the configured endpoint, `None` when telemetry is off
    pub fn from_config(config: &WalletConfig) -> Option<Self> {
        config.telemetry_url.as_ref().map(|url| {
            Self::new(url.clone(), config.platform.clone(), config.app_version.clone())
        })
    }

    pub async fn report(&self, warning: &StorageWarning, balance: u64) -> Result<(), WalletError> {
        let report = WarningReport {
            id: warning.id,
            balance,
            platform: &self.platform,
            version: &self.version,
            timestamp: warning.timestamp.timestamp(),
            impacted: warning.impacted(),
        };

        log::debug!("📡 Reporting storage warning {} to {}", warning.id, self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&report)
            .send()
            .await
            .map_err(|e| WalletError::Telemetry(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WalletError::Telemetry(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        log::info!("Storage warning {} reported", warning.id);
        Ok(())
    }
}
