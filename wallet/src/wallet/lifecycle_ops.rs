/// Wallet lifecycle operations
///
/// Creation, secret handling, listing and removal of wallets. Chain scans
/// are driven by the manager; these helpers only touch storage.
use bip39::Mnemonic;
use onchain_core::{parse_mnemonic, AddressType, Chain, MasterKey, Network};

use crate::api::types::{WalletInfo, WalletSummary};
use crate::error::WalletError;
use crate::storage::{
    mnemonic_key, passphrase_key, NetworkState, SecretStore, Storage, WalletMetadata,
};

/// Metadata of an existing wallet
pub fn ensure_wallet(storage: &Storage, name: &str) -> Result<WalletMetadata, WalletError> {
    if !storage.wallet_exists(name) {
        return Err(WalletError::WalletNotFound(name.to_string()));
    }
    Ok(storage.load_metadata(name)?)
}

/// Wallet names end up as directory and secret names
pub fn validate_name(name: &str) -> Result<(), WalletError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(WalletError::Core(onchain_core::CoreError::InvalidDraft(format!(
            "invalid wallet name '{}': use 1-64 letters, digits, '-' or '_'",
            name
        ))));
    }
    Ok(())
}

pub fn store_secrets(
    secrets: &dyn SecretStore,
    name: &str,
    mnemonic: &Mnemonic,
    passphrase: &str,
) -> Result<(), WalletError> {
    secrets.set_value(&mnemonic_key(name), &mnemonic.to_string())?;
    secrets.set_value(&passphrase_key(name), passphrase)?;
    Ok(())
}

pub fn delete_secrets(secrets: &dyn SecretStore, name: &str) -> Result<(), WalletError> {
    secrets.delete_value(&mnemonic_key(name))?;
    secrets.delete_value(&passphrase_key(name))?;
    Ok(())
}

pub fn load_mnemonic(secrets: &dyn SecretStore, name: &str) -> Result<Mnemonic, WalletError> {
    let key = mnemonic_key(name);
    let words = secrets
        .get_value(&key)?
        .ok_or_else(|| WalletError::SecretNotFound(key.clone()))?;
    Ok(parse_mnemonic(&words)?)
}

/// Master key of `name` on `network`
pub fn load_master_key(
    secrets: &dyn SecretStore,
    name: &str,
    network: Network,
) -> Result<MasterKey, WalletError> {
    let mnemonic = load_mnemonic(secrets, name)?;
    let passphrase = secrets.get_value(&passphrase_key(name))?.unwrap_or_default();
    Ok(MasterKey::from_mnemonic(&mnemonic, &passphrase, network)?)
}

/// Pre-generate `count` addresses per chain off the async executor
pub async fn pregenerate(
    key: &MasterKey,
    state: NetworkState,
    address_type: AddressType,
    count: u32,
) -> Result<NetworkState, WalletError> {
    if count == 0 {
        return Ok(state);
    }

    let key = key.clone();
    let mut state = state;
    tokio::task::spawn_blocking(move || {
        state.book.generate_addresses(&key, address_type, count, Some(0))?;
        Ok::<_, WalletError>(state)
    })
    .await
    .map_err(|e| WalletError::Internal(format!("address generation task failed: {}", e)))?
}

/// Persist a brand new wallet on `network`
///
/// Secrets and network state are written before the metadata file, so a
/// wallet only becomes visible once it is complete.
pub async fn create_wallet(
    storage: &Storage,
    secrets: &dyn SecretStore,
    name: &str,
    mnemonic: &Mnemonic,
    network: Network,
    address_count: u32,
) -> Result<WalletInfo, WalletError> {
    validate_name(name)?;
    if storage.wallet_exists(name) {
        return Err(WalletError::WalletExists(name.to_string()));
    }

    let metadata = WalletMetadata::new(name, network);
    let address_type = metadata.address_type(network);
    let key = MasterKey::from_mnemonic(mnemonic, "", network)?;

    storage.create_wallet(name)?;
    store_secrets(secrets, name, mnemonic, "")?;

    let mut state = pregenerate(&key, NetworkState::new(network), address_type, address_count).await?;
    let first = state
        .book
        .current_address(&key, address_type, Chain::Receive)?;
    storage.save_network_state(name, network, &state)?;
    storage.save_metadata(name, &metadata)?;

    log::info!("📁 Created wallet '{}' on {} ({})", name, network, address_type);

    Ok(WalletInfo {
        name: name.to_string(),
        mnemonic: Some(mnemonic.to_string()),
        network,
        address_type,
        first_address: first.address,
    })
}

/// Remove every trace of a partially written wallet
pub fn discard_wallet(storage: &Storage, secrets: &dyn SecretStore, name: &str) {
    if let Err(e) = delete_secrets(secrets, name) {
        log::warn!("⚠️  Could not delete secrets of '{}': {}", name, e);
    }
    if storage.base_dir().join(name).exists() {
        if let Err(e) = storage.delete_wallet(name) {
            log::warn!("⚠️  Could not delete wallet '{}': {}", name, e);
        }
    }
}

/// List all wallets
pub fn list_wallets(storage: &Storage) -> Result<Vec<WalletSummary>, WalletError> {
    let mut wallets = Vec::new();

    for name in storage.list_wallets()? {
        let metadata = match storage.load_metadata(&name) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!("⚠️  Skipping wallet '{}': {}", name, e);
                continue;
            }
        };
        let last_synced_height = storage
            .load_network_state(&name, metadata.network)
            .ok()
            .and_then(|state| state.last_synced_height);

        wallets.push(WalletSummary {
            name: metadata.name.clone(),
            created_at: metadata.created_at.to_rfc3339(),
            network: metadata.network,
            address_type: metadata.address_type(metadata.network),
            last_synced_height,
        });
    }

    Ok(wallets)
}
