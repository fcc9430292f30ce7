/// Wallet orchestrator
///
/// Owns storage, secrets, indexer connections and the per-(wallet, network)
/// locks, and sequences the operation modules. Every state mutation loads
/// the network state under its lock, works on the copy and saves it back
/// only when the whole operation succeeded.
use bip39::Mnemonic;
use bitcoin::{OutPoint, Txid};
use onchain_core::{
    derive_auxiliary_mnemonic, filter, generate_mnemonic, parse_mnemonic, AddressType,
    AuxiliaryPurpose, BoostOptions, Chain, FeeEstimates, MasterKey, Network, PaymentUri,
    PendingTransaction, Recipient, SelectionPreference, TxRecord, TxType,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use super::boost_ops;
use super::lifecycle_ops::{self, ensure_wallet, load_master_key};
use super::send_ops;
use super::storage_check::{run_storage_check, StorageCheckReport};
use super::sync_ops::{refresh_state, GapLimits, RefreshOptions, RefreshSummary};
use crate::api::types::{
    AddressInfo, AddressTypeRequest, BalanceInfo, BoostResponse, CreateWalletRequest,
    DeleteWalletResponse, IndexerUrlRequest, PaymentUriRequest, PaymentUriResponse, PsbtResponse,
    RestoreWalletRequest, SendRequest, SendResponse, StorageCheckRequest, TransactionQuery,
    UtxoInfo, WalletInfo, WalletSummary,
};
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::indexer::{self, Indexer};
use crate::storage::{
    FileSecretStore, NetworkState, SecretStore, Storage, StorageWarning, WalletMetadata,
};
use crate::telemetry::TelemetryClient;

/// Addresses pre-generated per chain when a create request names none
const DEFAULT_ADDRESS_COUNT: u32 = 20;

/// Confirmation targets of fast, normal, slow and minimum estimates
const FEE_TARGETS: [u16; 4] = [1, 3, 6, 144];

type StateLock = Arc<tokio::sync::Mutex<()>>;

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn guard<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

/// Claim on a wallet name while its create or restore runs
///
/// Released on drop, after the wallet was either completed or discarded.
struct NameReservation<'a> {
    reserved: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        guard(self.reserved).remove(&self.name);
    }
}

pub struct WalletManager {
    config: WalletConfig,
    pub storage: Storage,
    secrets: Arc<dyn SecretStore>,
    /// Indexers injected per network, used before any URL
    overrides: RwLock<HashMap<Network, Arc<dyn Indexer>>>,
    /// Open indexer clients by endpoint URL
    connections: RwLock<HashMap<String, Arc<dyn Indexer>>>,
    selected: RwLock<Option<String>>,
    /// Bumped by network switches and wipes to discard in-flight results
    epochs: Mutex<HashMap<String, u64>>,
    locks: Mutex<HashMap<(String, Network), StateLock>>,
    /// Names with a create or restore in flight
    reserved: Mutex<HashSet<String>>,
    telemetry: Option<TelemetryClient>,
}

impl WalletManager {
    pub fn new(config: WalletConfig) -> Self {
        let storage = Storage::new_with_base_dir(config.data_dir.clone());
        let secrets = Arc::new(FileSecretStore::new(config.data_dir.join(".secrets")));
        Self::with_components(config, storage, secrets)
    }

    pub fn with_components(
        config: WalletConfig,
        storage: Storage,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let telemetry = TelemetryClient::from_config(&config);
        Self {
            config,
            storage,
            secrets,
            overrides: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            selected: RwLock::new(None),
            epochs: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            telemetry,
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// Route all traffic of `network` to `indexer`
    pub fn set_indexer(&self, network: Network, indexer: Arc<dyn Indexer>) {
        write(&self.overrides).insert(network, indexer);
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn connection(&self, url: &str) -> Result<Arc<dyn Indexer>, WalletError> {
        if let Some(indexer) = read(&self.connections).get(url) {
            return Ok(indexer.clone());
        }
        let indexer = indexer::connect(url)?;
        write(&self.connections).insert(url.to_string(), indexer.clone());
        Ok(indexer)
    }

    /// Indexer of the configured endpoint of `network`
    pub fn default_indexer(&self, network: Network) -> Result<Arc<dyn Indexer>, WalletError> {
        if let Some(indexer) = read(&self.overrides).get(&network) {
            return Ok(indexer.clone());
        }
        self.connection(self.config.indexer_url(network))
    }

    fn indexer_for(
        &self,
        metadata: &WalletMetadata,
        network: Network,
    ) -> Result<Arc<dyn Indexer>, WalletError> {
        if let Some(indexer) = read(&self.overrides).get(&network) {
            return Ok(indexer.clone());
        }
        match metadata.indexer_urls.get(&network) {
            Some(url) => self.connection(url),
            None => self.connection(self.config.indexer_url(network)),
        }
    }

    fn gaps(&self) -> GapLimits {
        GapLimits {
            receive: self.config.gap_limit_receive,
            change: self.config.gap_limit_change,
        }
    }

    fn state_lock(&self, name: &str, network: Network) -> StateLock {
        guard(&self.locks)
            .entry((name.to_string(), network))
            .or_default()
            .clone()
    }

    fn epoch(&self, name: &str) -> u64 {
        guard(&self.epochs).get(name).copied().unwrap_or(0)
    }

    fn bump_epoch(&self, name: &str) {
        *guard(&self.epochs).entry(name.to_string()).or_insert(0) += 1;
    }

    /// Fail when a network switch or wipe happened since `epoch` was read
    fn ensure_current(&self, name: &str, network: Network, epoch: u64) -> Result<(), WalletError> {
        if self.epoch(name) != epoch || !self.storage.wallet_exists(name) {
            log::warn!("⚠️  Discarding {} results of '{}': superseded", network, name);
            return Err(WalletError::Superseded(format!("{} on {}", name, network)));
        }
        Ok(())
    }

    fn load_state(&self, name: &str, network: Network) -> Result<NetworkState, WalletError> {
        if self.storage.has_network_state(name, network) {
            Ok(self.storage.load_network_state(name, network)?)
        } else {
            Ok(NetworkState::new(network))
        }
    }

    /// Retry `op` with exponential backoff while it fails transiently
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, WalletError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WalletError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.config.refresh_retries => {
                    let delay = self
                        .config
                        .refresh_backoff
                        .saturating_mul(1 << attempt.min(16));
                    log::warn!(
                        "⚠️  {} failed ({}), retry {}/{} in {:?}",
                        what,
                        e,
                        attempt + 1,
                        self.config.refresh_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Lock, load and run `op` against the current network state of `name`,
    /// saving the state when `op` succeeds
    async fn with_state<T, F>(&self, name: &str, op: F) -> Result<T, WalletError>
    where
        F: FnOnce(&MasterKey, AddressType, &mut NetworkState) -> Result<T, WalletError>,
    {
        let metadata = ensure_wallet(&self.storage, name)?;
        let network = metadata.network;
        let lock = self.state_lock(name, network);
        let _guard = lock.lock().await;

        let key = load_master_key(self.secrets.as_ref(), name, network)?;
        let mut state = self.load_state(name, network)?;
        let result = op(&key, metadata.address_type(network), &mut state)?;
        self.storage.save_network_state(name, network, &state)?;
        Ok(result)
    }

    /// Read-only snapshot of the current network state
    fn snapshot(&self, name: &str) -> Result<(WalletMetadata, NetworkState), WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let state = self.load_state(name, metadata.network)?;
        Ok((metadata, state))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Take `name` for a new wallet, failing if it exists or is being written
    fn reserve_name(&self, name: &str) -> Result<NameReservation<'_>, WalletError> {
        let mut reserved = guard(&self.reserved);
        if self.storage.wallet_exists(name) || !reserved.insert(name.to_string()) {
            return Err(WalletError::WalletExists(name.to_string()));
        }
        Ok(NameReservation {
            reserved: &self.reserved,
            name: name.to_string(),
        })
    }

    pub async fn create_wallet(&self, request: CreateWalletRequest) -> Result<WalletInfo, WalletError> {
        lifecycle_ops::validate_name(&request.name)?;
        let _reservation = self.reserve_name(&request.name)?;

        let mnemonic = generate_mnemonic(request.word_count.unwrap_or(12))?;
        let network = request.network.unwrap_or(self.config.network);
        let address_count = request.address_count.unwrap_or(DEFAULT_ADDRESS_COUNT);

        let result = lifecycle_ops::create_wallet(
            &self.storage,
            self.secrets.as_ref(),
            &request.name,
            &mnemonic,
            network,
            address_count,
        )
        .await;

        match result {
            Ok(info) => {
                *write(&self.selected) = Some(info.name.clone());
                Ok(info)
            }
            Err(e) => {
                lifecycle_ops::discard_wallet(&self.storage, self.secrets.as_ref(), &request.name);
                Err(e)
            }
        }
    }

    /// Restore from a phrase, scanning every address type on each network
    ///
    /// The wallet only appears once every network scan finished; any failure
    /// removes what was written.
    pub async fn restore_wallet(&self, request: RestoreWalletRequest) -> Result<WalletInfo, WalletError> {
        lifecycle_ops::validate_name(&request.name)?;
        let _reservation = self.reserve_name(&request.name)?;

        let mnemonic = parse_mnemonic(&request.mnemonic)?;
        let passphrase = request.passphrase.unwrap_or_default();
        let mut networks: Vec<Network> = Vec::new();
        for network in request.networks {
            if !networks.contains(&network) {
                networks.push(network);
            }
        }
        if networks.is_empty() {
            networks.push(self.config.network);
        }

        let name = request.name;
        let metadata = WalletMetadata::new(&name, networks[0]);
        log::info!("🔄 Restoring wallet '{}' on {:?}", name, networks);

        let restored = self
            .restore_networks(&metadata, &mnemonic, &passphrase, &networks)
            .await
            .and_then(|first_address| {
                self.storage.save_metadata(&name, &metadata)?;
                Ok(first_address)
            });
        match restored {
            Ok(first_address) => {
                *write(&self.selected) = Some(name.clone());
                log::info!("✅ Restored wallet '{}'", name);
                Ok(WalletInfo {
                    name,
                    mnemonic: None,
                    network: metadata.network,
                    address_type: metadata.address_type(metadata.network),
                    first_address,
                })
            }
            Err(e) => {
                log::warn!("⚠️  Restore of '{}' failed: {}", name, e);
                lifecycle_ops::discard_wallet(&self.storage, self.secrets.as_ref(), &name);
                Err(e)
            }
        }
    }

    async fn restore_networks(
        &self,
        metadata: &WalletMetadata,
        mnemonic: &Mnemonic,
        passphrase: &str,
        networks: &[Network],
    ) -> Result<String, WalletError> {
        let name = &metadata.name;
        self.storage.create_wallet(name)?;
        lifecycle_ops::store_secrets(self.secrets.as_ref(), name, mnemonic, passphrase)?;

        let gaps = self.gaps();
        let mut first_address = String::new();

        for &network in networks {
            let key = MasterKey::from_mnemonic(mnemonic, passphrase, network)?;
            let indexer = self.indexer_for(metadata, network)?;
            let key_ref = &key;

            let mut state = self
                .with_retries("Restore scan", move || {
                    let indexer = indexer.clone();
                    async move {
                        let mut state = NetworkState::new(network);
                        refresh_state(indexer.as_ref(), key_ref, &mut state, &AddressType::ALL, gaps)
                            .await?;
                        Ok(state)
                    }
                })
                .await?;

            if network == metadata.network {
                let address_type = metadata.address_type(network);
                first_address = state
                    .book
                    .current_address(&key, address_type, Chain::Receive)?
                    .address;
            }
            self.storage.save_network_state(name, network, &state)?;
        }

        Ok(first_address)
    }

    pub fn list_wallets(&self) -> Result<Vec<WalletSummary>, WalletError> {
        lifecycle_ops::list_wallets(&self.storage)
    }

    pub fn wallet_summary(&self, name: &str) -> Result<WalletSummary, WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let last_synced_height = self
            .load_state(name, metadata.network)?
            .last_synced_height;
        Ok(WalletSummary {
            name: metadata.name.clone(),
            created_at: metadata.created_at.to_rfc3339(),
            network: metadata.network,
            address_type: metadata.address_type(metadata.network),
            last_synced_height,
        })
    }

    pub fn select_wallet(&self, name: &str) -> Result<WalletSummary, WalletError> {
        let summary = self.wallet_summary(name)?;
        *write(&self.selected) = Some(name.to_string());
        log::info!("Selected wallet '{}'", name);
        Ok(summary)
    }

    pub fn selected_wallet(&self) -> Result<String, WalletError> {
        read(&self.selected).clone().ok_or(WalletError::NoWalletSelected)
    }

    /// Select `network` for `name`; in-flight work on the old one is discarded
    pub fn switch_network(&self, name: &str, network: Network) -> Result<WalletSummary, WalletError> {
        let mut metadata = ensure_wallet(&self.storage, name)?;
        if metadata.network != network {
            self.bump_epoch(name);
            metadata.network = network;
            self.storage.save_metadata(name, &metadata)?;
            if !self.storage.has_network_state(name, network) {
                self.storage
                    .save_network_state(name, network, &NetworkState::new(network))?;
            }
            log::info!("🌐 Wallet '{}' switched to {}", name, network);
        }
        self.wallet_summary(name)
    }

    /// Change the address type used for receiving, change and default scans
    pub fn set_address_type(
        &self,
        name: &str,
        request: AddressTypeRequest,
    ) -> Result<WalletSummary, WalletError> {
        let mut metadata = ensure_wallet(&self.storage, name)?;
        let network = request.network.unwrap_or(metadata.network);
        metadata.address_types.insert(network, request.address_type);
        self.storage.save_metadata(name, &metadata)?;
        log::info!("Wallet '{}' uses {} on {}", name, request.address_type, network);
        self.wallet_summary(name)
    }

    /// Persist a custom indexer endpoint for one network of `name`
    pub fn set_indexer_url(&self, name: &str, request: IndexerUrlRequest) -> Result<(), WalletError> {
        let mut metadata = ensure_wallet(&self.storage, name)?;
        let network = request.network.unwrap_or(metadata.network);
        self.connection(&request.url)?;
        metadata.indexer_urls.insert(network, request.url.clone());
        self.storage.save_metadata(name, &metadata)?;
        log::info!("📡 Wallet '{}' uses indexer {} on {}", name, request.url, network);
        Ok(())
    }

    /// Irreversibly remove the wallet, its secrets and all network states
    pub fn wipe(&self, name: &str) -> Result<DeleteWalletResponse, WalletError> {
        ensure_wallet(&self.storage, name)?;
        self.bump_epoch(name);

        lifecycle_ops::delete_secrets(self.secrets.as_ref(), name)?;
        self.storage.delete_wallet(name)?;
        guard(&self.locks).retain(|(wallet, _), _| wallet != name);

        let mut selected = write(&self.selected);
        if selected.as_deref() == Some(name) {
            *selected = None;
        }

        log::info!("🧹 Wallet '{}' wiped", name);
        Ok(DeleteWalletResponse {
            wallet_name: name.to_string(),
            status: "deleted".to_string(),
        })
    }

    /// Independent phrase for an auxiliary subsystem of `name`
    pub fn auxiliary_mnemonic(
        &self,
        name: &str,
        purpose: AuxiliaryPurpose,
    ) -> Result<Mnemonic, WalletError> {
        ensure_wallet(&self.storage, name)?;
        let mnemonic = lifecycle_ops::load_mnemonic(self.secrets.as_ref(), name)?;
        Ok(derive_auxiliary_mnemonic(&mnemonic, purpose)?)
    }

    // ========================================================================
    // Refresh & storage check
    // ========================================================================

    /// Sync the selected network of `name`, retrying transient failures
    pub async fn refresh(&self, name: &str, options: RefreshOptions) -> Result<RefreshSummary, WalletError> {
        self.with_retries("Refresh", move || self.refresh_once(name, options))
            .await
    }

    async fn refresh_once(&self, name: &str, options: RefreshOptions) -> Result<RefreshSummary, WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let network = metadata.network;
        let epoch = self.epoch(name);

        let lock = self.state_lock(name, network);
        let _guard = lock.lock().await;

        let key = load_master_key(self.secrets.as_ref(), name, network)?;
        let indexer = self.indexer_for(&metadata, network)?;
        let mut state = self.load_state(name, network)?;
        let types = self.scan_scope(&metadata, options.scan_all_address_types);

        let mut summary = refresh_state(indexer.as_ref(), &key, &mut state, &types, self.gaps()).await?;

        let mut warning = None;
        if options.storage_check {
            let (report, found) = self
                .repair_storage(indexer.as_ref(), &key, &mut state, &types, false)
                .await?;
            summary.repaired_addresses = report.impacted_count();
            summary.utxo_count = state.utxos.len();
            summary.balance = state.utxos.balance();
            warning = found;
        }

        self.ensure_current(name, network, epoch)?;
        self.storage.save_network_state(name, network, &state)?;
        if let Some(warning) = warning {
            self.record_warning(name, warning)?;
        }
        self.report_warnings(name, &state).await;

        Ok(summary)
    }

    /// Check stored addresses against derivation and repair mismatches
    pub async fn storage_check(
        &self,
        name: &str,
        request: StorageCheckRequest,
    ) -> Result<StorageCheckReport, WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let network = metadata.network;
        let epoch = self.epoch(name);

        let lock = self.state_lock(name, network);
        let _guard = lock.lock().await;

        let key = load_master_key(self.secrets.as_ref(), name, network)?;
        let indexer = self.indexer_for(&metadata, network)?;
        let mut state = self.load_state(name, network)?;
        let types = self.scan_scope(&metadata, request.scan_all_address_types);

        let (report, warning) = self
            .repair_storage(indexer.as_ref(), &key, &mut state, &types, request.thorough)
            .await?;

        self.ensure_current(name, network, epoch)?;
        if let Some(warning) = warning {
            self.storage.save_network_state(name, network, &state)?;
            self.record_warning(name, warning)?;
            self.report_warnings(name, &state).await;
        }
        Ok(report)
    }

    fn scan_scope(&self, metadata: &WalletMetadata, all: bool) -> Vec<AddressType> {
        if all {
            AddressType::ALL.to_vec()
        } else {
            vec![metadata.address_type(metadata.network)]
        }
    }

    /// Run the check off the executor; on a mismatch adopt the repaired
    /// address table and rebuild the UTXO set of every type from scratch
    async fn repair_storage(
        &self,
        indexer: &dyn Indexer,
        key: &MasterKey,
        state: &mut NetworkState,
        types: &[AddressType],
        thorough: bool,
    ) -> Result<(StorageCheckReport, Option<StorageWarning>), WalletError> {
        let mut book = state.book.clone();
        let check_key = key.clone();
        let check_types = types.to_vec();

        let (book, report) = tokio::task::spawn_blocking(move || {
            let report = run_storage_check(&check_key, &mut book, &check_types, thorough)?;
            Ok::<_, WalletError>((book, report))
        })
        .await
        .map_err(|e| WalletError::Internal(format!("storage check task failed: {}", e)))??;

        if report.all_match() {
            log::debug!("Storage check of {:?}: all addresses match", types);
            return Ok((report, None));
        }

        log::warn!(
            "⚠️  Storage check repaired {} addresses, rescanning {}",
            report.impacted_count(),
            state.network()
        );
        state.book = book;
        state.utxos.clear();
        refresh_state(indexer, key, state, &AddressType::ALL, self.gaps()).await?;

        let warning = StorageWarning::address_mismatch(state.network(), report.impacted.clone());
        Ok((report, Some(warning)))
    }

    fn record_warning(&self, name: &str, warning: StorageWarning) -> Result<(), WalletError> {
        let mut warnings = self.storage.load_warnings(name)?;
        warnings.push(warning);
        self.storage.save_warnings(name, &warnings)?;
        Ok(())
    }

    /// Send unreported warnings of this network; failures wait for the next refresh
    async fn report_warnings(&self, name: &str, state: &NetworkState) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let mut warnings = match self.storage.load_warnings(name) {
            Ok(warnings) => warnings,
            Err(e) => {
                log::warn!("⚠️  Could not load warnings of '{}': {}", name, e);
                return;
            }
        };

        let mut reported = false;
        for warning in warnings
            .iter_mut()
            .filter(|w| !w.reported && w.network == state.network())
        {
            let balance = state.utxos.value_at(&warning.script_hashes());
            match telemetry.report(warning, balance).await {
                Ok(()) => {
                    warning.reported = true;
                    reported = true;
                }
                Err(e) => log::warn!("⚠️  Storage warning {} not reported: {}", warning.id, e),
            }
        }

        if reported {
            if let Err(e) = self.storage.save_warnings(name, &warnings) {
                log::warn!("⚠️  Could not save warnings of '{}': {}", name, e);
            }
        }
    }

    pub fn storage_warnings(&self, name: &str) -> Result<Vec<StorageWarning>, WalletError> {
        ensure_wallet(&self.storage, name)?;
        Ok(self.storage.load_warnings(name)?)
    }

    // ========================================================================
    // Addresses, balance, history
    // ========================================================================

    /// Receive address of the selected type; `new` advances the cursor
    pub async fn get_receive_address(&self, name: &str, new: bool) -> Result<AddressInfo, WalletError> {
        self.with_state(name, |key, address_type, state| {
            let entry = if new {
                state
                    .book
                    .get_or_create(key, address_type, Chain::Receive, None)?
            } else {
                state
                    .book
                    .current_address(key, address_type, Chain::Receive)?
            };
            Ok(AddressInfo::new(address_type, entry))
        })
        .await
    }

    pub fn get_balance(&self, name: &str) -> Result<BalanceInfo, WalletError> {
        let (metadata, state) = self.snapshot(name)?;
        let balance = state.utxos.balance();
        Ok(BalanceInfo {
            network: metadata.network,
            confirmed_sats: balance.confirmed,
            unconfirmed_sats: balance.unconfirmed,
            total_sats: balance.total(),
            utxo_count: state.utxos.spendable().count(),
            blacklisted_count: state.utxos.blacklisted().count(),
            last_synced_height: state.last_synced_height,
        })
    }

    pub fn get_utxos(&self, name: &str) -> Result<Vec<UtxoInfo>, WalletError> {
        let (_, state) = self.snapshot(name)?;
        Ok(state
            .utxos
            .all()
            .iter()
            .map(|utxo| UtxoInfo {
                blacklisted: state.utxos.is_blacklisted(&utxo.outpoint()),
                utxo: utxo.clone(),
            })
            .collect())
    }

    /// History, newest first, narrowed by search text and type
    pub fn get_transactions(&self, name: &str, query: &TransactionQuery) -> Result<Vec<TxRecord>, WalletError> {
        let types = query
            .types
            .split(',')
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.parse::<TxType>())
            .collect::<Result<Vec<_>, _>>()?;
        let (_, state) = self.snapshot(name)?;
        Ok(filter(&state.history, &query.search, &types))
    }

    pub async fn blacklist_utxo(&self, name: &str, outpoint: OutPoint) -> Result<BalanceInfo, WalletError> {
        self.with_state(name, |_, _, state| {
            if state.utxos.blacklist(outpoint) {
                log::info!("Blacklisted {}", outpoint);
            }
            Ok(())
        })
        .await?;
        self.get_balance(name)
    }

    pub async fn whitelist_utxo(&self, name: &str, outpoint: OutPoint) -> Result<BalanceInfo, WalletError> {
        self.with_state(name, |_, _, state| {
            if state.utxos.whitelist(&outpoint) {
                log::info!("Whitelisted {}", outpoint);
            }
            Ok(())
        })
        .await?;
        self.get_balance(name)
    }

    pub async fn payment_uri(&self, name: &str, request: PaymentUriRequest) -> Result<PaymentUriResponse, WalletError> {
        let address = self.get_receive_address(name, false).await?.address;

        let mut uri = PaymentUri::new(address.clone());
        if let Some(amount) = request.amount_sats {
            uri = uri.with_amount(amount);
        }
        if let Some(label) = request.label.filter(|l| !l.is_empty()) {
            uri = uri.with_label(label);
        }
        if let Some(message) = request.message.filter(|m| !m.is_empty()) {
            uri = uri.with_message(message);
        }
        if let Some(invoice) = request.lightning.filter(|i| !i.is_empty()) {
            uri = uri.with_lightning(invoice);
        }

        Ok(PaymentUriResponse {
            uri: uri.to_string(),
            address,
        })
    }

    // ========================================================================
    // Fees & drafts
    // ========================================================================

    /// Fee rates for the standard targets; unknown targets fall back to the minimum
    pub async fn estimate_fees(&self, name: &str) -> Result<FeeEstimates, WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let indexer = self.indexer_for(&metadata, metadata.network)?;

        let mut rates = [0u64; 4];
        for (rate, target) in rates.iter_mut().zip(FEE_TARGETS) {
            *rate = indexer.estimate_fee(target).await?.unwrap_or(0);
        }

        let estimates = FeeEstimates::normalized(rates[0], rates[1], rates[2], rates[3]);
        log::debug!("Fee estimates on {}: {:?}", metadata.network, estimates);
        Ok(estimates)
    }

    pub fn get_draft(&self, name: &str) -> Result<PendingTransaction, WalletError> {
        Ok(self.snapshot(name)?.1.draft)
    }

    async fn edit_draft<F>(&self, name: &str, edit: F) -> Result<PendingTransaction, WalletError>
    where
        F: FnOnce(&mut PendingTransaction) -> Result<(), WalletError>,
    {
        self.with_state(name, |_, _, state| {
            edit(&mut state.draft)?;
            Ok(state.draft.clone())
        })
        .await
    }

    pub async fn set_draft_outputs(&self, name: &str, outputs: Vec<Recipient>) -> Result<PendingTransaction, WalletError> {
        self.edit_draft(name, |draft| Ok(draft.set_outputs(outputs)?)).await
    }

    pub async fn set_fee_rate(&self, name: &str, fee_rate: u64) -> Result<PendingTransaction, WalletError> {
        self.edit_draft(name, |draft| Ok(draft.set_fee_rate(fee_rate)?)).await
    }

    pub async fn set_rbf(&self, name: &str, rbf: bool) -> Result<PendingTransaction, WalletError> {
        self.edit_draft(name, |draft| Ok(draft.set_rbf(rbf)?)).await
    }

    pub async fn set_send_max(&self, name: &str, max: bool) -> Result<PendingTransaction, WalletError> {
        self.edit_draft(name, |draft| Ok(draft.set_max(max)?)).await
    }

    pub async fn set_draft_message(&self, name: &str, message: String, label: String) -> Result<PendingTransaction, WalletError> {
        self.edit_draft(name, |draft| {
            draft.set_message(message, label);
            Ok(())
        })
        .await
    }

    pub async fn set_selection_preference(
        &self,
        name: &str,
        preference: SelectionPreference,
    ) -> Result<PendingTransaction, WalletError> {
        self.edit_draft(name, |draft| Ok(draft.set_preference(preference)?)).await
    }

    pub async fn select_draft_utxos(&self, name: &str, outpoints: Vec<OutPoint>) -> Result<PendingTransaction, WalletError> {
        self.edit_draft(name, |draft| Ok(draft.select_inputs(outpoints)?)).await
    }

    /// Load a whole send request into a fresh draft
    pub async fn configure_draft(&self, name: &str, request: &SendRequest) -> Result<PendingTransaction, WalletError> {
        self.edit_draft(name, |draft| send_ops::configure_draft(draft, request))
            .await
    }

    pub async fn reset_draft(&self, name: &str) -> Result<PendingTransaction, WalletError> {
        self.edit_draft(name, |draft| {
            draft.reset();
            Ok(())
        })
        .await
    }

    pub async fn compose(&self, name: &str) -> Result<PendingTransaction, WalletError> {
        self.with_state(name, |key, address_type, state| {
            send_ops::compose(key, state, address_type)?;
            Ok(state.draft.clone())
        })
        .await
    }

    pub async fn sign_draft(&self, name: &str) -> Result<PendingTransaction, WalletError> {
        self.with_state(name, |key, _, state| {
            send_ops::sign(key, state)?;
            Ok(state.draft.clone())
        })
        .await
    }

    /// Unsigned PSBT of the ready draft
    pub async fn create_psbt(&self, name: &str) -> Result<PsbtResponse, WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let network = metadata.network;
        let lock = self.state_lock(name, network);
        let _guard = lock.lock().await;

        let key = load_master_key(self.secrets.as_ref(), name, network)?;
        let indexer = self.indexer_for(&metadata, network)?;
        let mut state = self.load_state(name, network)?;

        let response = send_ops::create_psbt(
            indexer.as_ref(),
            &key,
            &mut state,
            metadata.address_type(network),
        )
        .await?;
        self.storage.save_network_state(name, network, &state)?;
        Ok(response)
    }

    /// Broadcast the signed draft after re-validating its inputs
    pub async fn broadcast(&self, name: &str) -> Result<SendResponse, WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let network = metadata.network;
        let epoch = self.epoch(name);
        let lock = self.state_lock(name, network);
        let _guard = lock.lock().await;

        let key = load_master_key(self.secrets.as_ref(), name, network)?;
        let indexer = self.indexer_for(&metadata, network)?;
        let mut state = self.load_state(name, network)?;

        let result = send_ops::broadcast(
            indexer.as_ref(),
            &key,
            &mut state,
            metadata.address_type(network),
            self.gaps(),
        )
        .await;
        self.finish_broadcast(name, network, epoch, &state, result)
    }

    /// Compose, sign and broadcast in one step
    pub async fn send(&self, name: &str, request: SendRequest) -> Result<SendResponse, WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let network = metadata.network;
        let address_type = metadata.address_type(network);
        let epoch = self.epoch(name);
        let lock = self.state_lock(name, network);
        let _guard = lock.lock().await;

        let key = load_master_key(self.secrets.as_ref(), name, network)?;
        let indexer = self.indexer_for(&metadata, network)?;
        let mut state = self.load_state(name, network)?;

        send_ops::configure_draft(&mut state.draft, &request)?;
        send_ops::compose(&key, &mut state, address_type)?;
        send_ops::sign(&key, &mut state)?;

        let result =
            send_ops::broadcast(indexer.as_ref(), &key, &mut state, address_type, self.gaps()).await;
        self.finish_broadcast(name, network, epoch, &state, result)
    }

    /// Persist after a broadcast attempt
    ///
    /// A stale input set is saved too, so the refreshed UTXOs are kept and
    /// the draft can be recomposed.
    fn finish_broadcast<T>(
        &self,
        name: &str,
        network: Network,
        epoch: u64,
        state: &NetworkState,
        result: Result<T, WalletError>,
    ) -> Result<T, WalletError> {
        match result {
            Ok(value) => {
                self.storage.save_network_state(name, network, state)?;
                Ok(value)
            }
            Err(WalletError::StaleUtxoSet(inputs)) => {
                if self.ensure_current(name, network, epoch).is_ok() {
                    self.storage.save_network_state(name, network, state)?;
                }
                Err(WalletError::StaleUtxoSet(inputs))
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Boosting
    // ========================================================================

    pub async fn can_boost(&self, name: &str, txid: &Txid) -> Result<BoostOptions, WalletError> {
        let (metadata, state) = self.snapshot(name)?;
        let indexer = self.indexer_for(&metadata, metadata.network)?;
        boost_ops::can_boost(indexer.as_ref(), &state, txid).await
    }

    pub async fn bump_fee(&self, name: &str, txid: &Txid, fee_rate: u64) -> Result<BoostResponse, WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let network = metadata.network;
        let lock = self.state_lock(name, network);
        let _guard = lock.lock().await;

        let key = load_master_key(self.secrets.as_ref(), name, network)?;
        let indexer = self.indexer_for(&metadata, network)?;
        let mut state = self.load_state(name, network)?;

        let response = boost_ops::bump_fee(
            indexer.as_ref(),
            &key,
            &mut state,
            metadata.address_type(network),
            txid,
            fee_rate,
        )
        .await?;
        self.storage.save_network_state(name, network, &state)?;
        Ok(response)
    }

    pub async fn boost_cpfp(&self, name: &str, txid: &Txid, fee_rate: u64) -> Result<BoostResponse, WalletError> {
        let metadata = ensure_wallet(&self.storage, name)?;
        let network = metadata.network;
        let lock = self.state_lock(name, network);
        let _guard = lock.lock().await;

        let key = load_master_key(self.secrets.as_ref(), name, network)?;
        let indexer = self.indexer_for(&metadata, network)?;
        let mut state = self.load_state(name, network)?;

        let response = boost_ops::boost_cpfp(
            indexer.as_ref(),
            &key,
            &mut state,
            metadata.address_type(network),
            txid,
            fee_rate,
        )
        .await?;
        self.storage.save_network_state(name, network, &state)?;
        Ok(response)
    }
}
