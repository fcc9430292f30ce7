use onchain_core::Network;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::models::{NetworkState, StorageWarning, WalletMetadata};
use crate::error::StorageError;

const METADATA_FILE: &str = "metadata.json";
const WARNINGS_FILE: &str = "warnings.json";

/// JSON file storage, one directory per wallet
///
/// Every write lands in a temp file that is renamed over the target, so a
/// reader sees either the old or the new file, never a partial one.
#[derive(Clone)]
pub struct Storage {
    base_path: PathBuf,
}

impl Storage {
    /// Create a new storage instance with the default base directory ("./wallets")
    pub fn new() -> Self {
        Self {
            base_path: PathBuf::from("./wallets"),
        }
    }

    /// Create storage with custom base directory (for testing)
    pub fn new_with_base_dir(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Get the base directory path for wallet storage
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_path
    }

    /// Get the directory path for a specific wallet
    fn wallet_dir(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    fn network_file(&self, name: &str, network: Network) -> PathBuf {
        self.wallet_dir(name).join(format!("{}.json", network.as_str()))
    }

    /// Create a new wallet directory structure
    pub fn create_wallet(&self, name: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.base_path)?;
        let wallet_dir = self.wallet_dir(name);
        fs::create_dir_all(&wallet_dir)?;
        Ok(())
    }

    /// Check if a wallet with the given name exists
    pub fn wallet_exists(&self, name: &str) -> bool {
        self.wallet_dir(name).join(METADATA_FILE).exists()
    }

    /// Save wallet metadata to disk
    pub fn save_metadata(&self, name: &str, meta: &WalletMetadata) -> Result<(), StorageError> {
        self.write_json(&self.wallet_dir(name).join(METADATA_FILE), meta)
    }

    /// Load wallet metadata from disk
    pub fn load_metadata(&self, name: &str) -> Result<WalletMetadata, StorageError> {
        let path = self.wallet_dir(name).join(METADATA_FILE);
        self.read_json(&path)?
            .ok_or_else(|| StorageError::FileNotFound(path.display().to_string()))
    }

    /// Save the state of one network
    pub fn save_network_state(
        &self,
        name: &str,
        network: Network,
        state: &NetworkState,
    ) -> Result<(), StorageError> {
        self.write_json(&self.network_file(name, network), state)
    }

    /// Load the state of one network, or a fresh state if none was saved yet
    pub fn load_network_state(&self, name: &str, network: Network) -> Result<NetworkState, StorageError> {
        Ok(self
            .read_json(&self.network_file(name, network))?
            .unwrap_or_else(|| NetworkState::new(network)))
    }

    /// Whether a state file exists for `network`
    pub fn has_network_state(&self, name: &str, network: Network) -> bool {
        self.network_file(name, network).exists()
    }

    pub fn save_warnings(&self, name: &str, warnings: &[StorageWarning]) -> Result<(), StorageError> {
        self.write_json(&self.wallet_dir(name).join(WARNINGS_FILE), &warnings)
    }

    /// Load storage warnings, empty if none were recorded
    pub fn load_warnings(&self, name: &str) -> Result<Vec<StorageWarning>, StorageError> {
        Ok(self
            .read_json(&self.wallet_dir(name).join(WARNINGS_FILE))?
            .unwrap_or_default())
    }

    /// List all wallet names in the storage directory
    pub fn list_wallets(&self) -> Result<Vec<String>, StorageError> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let mut wallets = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join(METADATA_FILE).exists() {
                if let Some(name_str) = path.file_name().and_then(|n| n.to_str()) {
                    wallets.push(name_str.to_string());
                }
            }
        }
        wallets.sort();
        Ok(wallets)
    }

    /// Delete a wallet and all its associated data from disk
    pub fn delete_wallet(&self, name: &str) -> Result<(), StorageError> {
        let wallet_dir = self.wallet_dir(name);

        if !wallet_dir.exists() {
            return Err(StorageError::DirectoryNotFound(
                wallet_dir.display().to_string(),
            ));
        }

        log::warn!("Deleting wallet directory: {:?}", wallet_dir);
        fs::remove_dir_all(&wallet_dir)?;
        log::info!("Wallet '{}' deleted successfully", name);

        Ok(())
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), StorageError> {
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::DirectoryNotFound(path.display().to_string()))?;
        if !dir.exists() {
            return Err(StorageError::DirectoryNotFound(dir.display().to_string()));
        }

        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}
