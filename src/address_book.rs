//! Address book
//!
//! One table per (wallet, network) holding every materialized address keyed
//! by `(address_type, chain, index)`, a reverse index from script hash to
//! that key, and the per-type index cursors. Uniqueness of the composite key
//! and consistency of the reverse index are enforced here, in one place.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use crate::derivation::MasterKey;
use crate::{AddressEntry, AddressType, Chain, CoreError, Network};

/// Composite key of one address book row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressKey {
    pub address_type: AddressType,
    pub chain: Chain,
    pub index: u32,
}

impl AddressKey {
    pub fn new(address_type: AddressType, chain: Chain, index: u32) -> Self {
        Self {
            address_type,
            chain,
            index,
        }
    }
}

/// Cursor pair for one derivation chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCursor {
    /// Next index to hand out
    pub current: u32,
    /// Highest index seen with on-chain activity, `None` if none yet
    pub last_used: Option<u32>,
}

impl ChainCursor {
    /// First index not yet known to be used
    pub fn first_unused(&self) -> u32 {
        self.last_used.map_or(0, |i| i.saturating_add(1))
    }
}

/// Receive and change cursors of one address type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCursors {
    pub receive: ChainCursor,
    pub change: ChainCursor,
}

impl IndexCursors {
    pub fn get(&self, chain: Chain) -> &ChainCursor {
        match chain {
            Chain::Receive => &self.receive,
            Chain::Change => &self.change,
        }
    }

    pub fn get_mut(&mut self, chain: Chain) -> &mut ChainCursor {
        match chain {
            Chain::Receive => &mut self.receive,
            Chain::Change => &mut self.change,
        }
    }
}

/// Freshly materialized addresses for both chains of one address type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedAddresses {
    pub receive: Vec<AddressEntry>,
    pub change: Vec<AddressEntry>,
}

impl GeneratedAddresses {
    pub fn chain(&self, chain: Chain) -> &[AddressEntry] {
        match chain {
            Chain::Receive => &self.receive,
            Chain::Change => &self.change,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAddress {
    address_type: AddressType,
    chain: Chain,
    #[serde(flatten)]
    entry: AddressEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddressBookRecord {
    network: Network,
    addresses: Vec<StoredAddress>,
    cursors: BTreeMap<AddressType, IndexCursors>,
}

/// Address table of one (wallet, network)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AddressBookRecord", into = "AddressBookRecord")]
pub struct AddressBook {
    network: Network,
    entries: BTreeMap<AddressKey, AddressEntry>,
    by_script_hash: HashMap<String, AddressKey>,
    cursors: BTreeMap<AddressType, IndexCursors>,
}

impl From<AddressBookRecord> for AddressBook {
    fn from(record: AddressBookRecord) -> Self {
        let mut book = AddressBook::new(record.network);
        book.cursors = record.cursors;
        for stored in record.addresses {
            book.insert(stored.address_type, stored.chain, stored.entry);
        }
        book
    }
}

impl From<AddressBook> for AddressBookRecord {
    fn from(book: AddressBook) -> Self {
        let addresses = book
            .entries
            .into_iter()
            .map(|(key, entry)| StoredAddress {
                address_type: key.address_type,
                chain: key.chain,
                entry,
            })
            .collect();

        AddressBookRecord {
            network: book.network,
            addresses,
            cursors: book.cursors,
        }
    }
}

impl AddressBook {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            entries: BTreeMap::new(),
            by_script_hash: HashMap::new(),
            cursors: BTreeMap::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursors(&self, address_type: AddressType) -> IndexCursors {
        self.cursors.get(&address_type).copied().unwrap_or_default()
    }

    pub fn set_cursors(&mut self, address_type: AddressType, cursors: IndexCursors) {
        self.cursors.insert(address_type, cursors);
    }

    /// Insert or overwrite one row, keeping the script hash index consistent
    pub fn insert(&mut self, address_type: AddressType, chain: Chain, entry: AddressEntry) {
        let key = AddressKey::new(address_type, chain, entry.index);

        if let Some(previous) = self.entries.get(&key) {
            if previous.script_hash != entry.script_hash {
                self.by_script_hash.remove(&previous.script_hash);
            }
        }

        self.by_script_hash.insert(entry.script_hash.clone(), key);
        self.entries.insert(key, entry);
    }

    pub fn get(&self, key: &AddressKey) -> Option<&AddressEntry> {
        self.entries.get(key)
    }

    /// Reverse lookup from an indexer script hash
    pub fn lookup(&self, script_hash: &str) -> Option<(AddressKey, &AddressEntry)> {
        let key = self.by_script_hash.get(script_hash)?;
        self.entries.get(key).map(|entry| (*key, entry))
    }

    pub fn lookup_address(&self, address: &str) -> Option<(AddressKey, &AddressEntry)> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.address == address)
            .map(|(key, entry)| (*key, entry))
    }

    pub fn contains_script_hash(&self, script_hash: &str) -> bool {
        self.by_script_hash.contains_key(script_hash)
    }

    /// Entries of one chain in index order
    pub fn entries(
        &self,
        address_type: AddressType,
        chain: Chain,
    ) -> impl Iterator<Item = &AddressEntry> + '_ {
        let start = AddressKey::new(address_type, chain, 0);
        let end = AddressKey::new(address_type, chain, u32::MAX);
        self.entries.range(start..=end).map(|(_, entry)| entry)
    }

    /// Every row of the table, in key order
    pub fn iter(&self) -> impl Iterator<Item = (&AddressKey, &AddressEntry)> + '_ {
        self.entries.iter()
    }

    /// Lowest- and highest-index stored entries of one chain
    pub fn min_max(
        &self,
        address_type: AddressType,
        chain: Chain,
    ) -> Option<(&AddressEntry, &AddressEntry)> {
        let mut entries = self.entries(address_type, chain);
        let first = entries.next()?;
        let last = entries.last().unwrap_or(first);
        Some((first, last))
    }

    fn next_unstored_index(&self, address_type: AddressType, chain: Chain) -> u32 {
        self.min_max(address_type, chain)
            .map_or(0, |(_, max)| max.index.saturating_add(1))
    }

    /// Return the address at `index`, deriving and storing it when missing
    ///
    /// Without an index the chain's current cursor is used and then advanced.
    pub fn get_or_create(
        &mut self,
        key: &MasterKey,
        address_type: AddressType,
        chain: Chain,
        index: Option<u32>,
    ) -> Result<AddressEntry, CoreError> {
        self.ensure_network(key)?;

        let index = match index {
            Some(index) => index,
            None => {
                let mut cursors = self.cursors(address_type);
                let cursor = cursors.get_mut(chain);
                let index = cursor.current;
                cursor.current = index.checked_add(1).ok_or_else(|| {
                    CoreError::Derivation(format!("{} {} cursor exhausted", address_type, chain))
                })?;
                self.cursors.insert(address_type, cursors);
                index
            }
        };

        let book_key = AddressKey::new(address_type, chain, index);
        if let Some(entry) = self.entries.get(&book_key) {
            return Ok(entry.clone());
        }

        let entry = key.derive_address(address_type, chain, index)?;
        log::debug!("Materialized {} {} address {}: {}", address_type, chain, index, entry.address);
        self.insert(address_type, chain, entry.clone());
        Ok(entry)
    }

    /// The address at the chain's current cursor, without advancing it
    pub fn current_address(
        &mut self,
        key: &MasterKey,
        address_type: AddressType,
        chain: Chain,
    ) -> Result<AddressEntry, CoreError> {
        let index = self.cursors(address_type).get(chain).current;
        self.get_or_create(key, address_type, chain, Some(index))
    }

    /// Pre-generate `count` addresses on both chains
    ///
    /// Starts after the highest stored index of each chain unless `start` is
    /// given. Only newly derived rows are returned.
    pub fn generate_addresses(
        &mut self,
        key: &MasterKey,
        address_type: AddressType,
        count: u32,
        start: Option<u32>,
    ) -> Result<GeneratedAddresses, CoreError> {
        self.ensure_network(key)?;

        let mut generated = GeneratedAddresses::default();
        for chain in Chain::ALL {
            let first = start.unwrap_or_else(|| self.next_unstored_index(address_type, chain));
            let fresh = self.materialize(key, address_type, chain, window(first, count))?;
            match chain {
                Chain::Receive => generated.receive = fresh,
                Chain::Change => generated.change = fresh,
            }
        }

        Ok(generated)
    }

    /// Derive and store every missing index in `range`, returning the new rows
    pub fn materialize(
        &mut self,
        key: &MasterKey,
        address_type: AddressType,
        chain: Chain,
        range: Range<u32>,
    ) -> Result<Vec<AddressEntry>, CoreError> {
        self.ensure_network(key)?;

        let mut fresh = Vec::new();
        for index in range {
            if self.entries.contains_key(&AddressKey::new(address_type, chain, index)) {
                continue;
            }
            let entry = key.derive_address(address_type, chain, index)?;
            self.insert(address_type, chain, entry.clone());
            fresh.push(entry);
        }

        if !fresh.is_empty() {
            log::debug!("Generated {} {} {} addresses", fresh.len(), address_type, chain);
        }
        Ok(fresh)
    }

    /// Record on-chain activity at `index`
    ///
    /// Monotonic: the last-used cursor never decreases, and the current
    /// cursor is pushed past it. Returns whether anything changed.
    pub fn mark_used(&mut self, address_type: AddressType, chain: Chain, index: u32) -> bool {
        let mut cursors = self.cursors(address_type);
        let cursor = cursors.get_mut(chain);
        let before = *cursor;

        if cursor.last_used.map_or(true, |used| index > used) {
            cursor.last_used = Some(index);
        }
        cursor.current = cursor.current.max(index.saturating_add(1));

        let changed = *cursor != before;
        if changed {
            self.cursors.insert(address_type, cursors);
        }
        changed
    }

    /// [`mark_used`](Self::mark_used) by script hash; unknown hashes are ignored
    pub fn mark_script_hash_used(&mut self, script_hash: &str) -> bool {
        match self.lookup(script_hash).map(|(key, _)| key) {
            Some(key) => self.mark_used(key.address_type, key.chain, key.index),
            None => false,
        }
    }

    /// Replace every row of one address type
    ///
    /// Used by the storage repair. Cursors are left exactly as stored, so
    /// they never move below what was already confirmed used.
    pub fn replace_type(&mut self, address_type: AddressType, fresh: GeneratedAddresses) {
        let stale: Vec<AddressKey> = self
            .entries
            .keys()
            .filter(|key| key.address_type == address_type)
            .copied()
            .collect();
        for key in stale {
            if let Some(entry) = self.entries.remove(&key) {
                self.by_script_hash.remove(&entry.script_hash);
            }
        }

        for entry in fresh.receive {
            self.insert(address_type, Chain::Receive, entry);
        }
        for entry in fresh.change {
            self.insert(address_type, Chain::Change, entry);
        }
    }

    /// Script hashes of every stored row of the given types
    pub fn script_hashes(&self, types: &[AddressType]) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(key, _)| types.contains(&key.address_type))
            .map(|(_, entry)| entry.script_hash.clone())
            .collect()
    }

    fn ensure_network(&self, key: &MasterKey) -> Result<(), CoreError> {
        if key.network() != self.network {
            return Err(CoreError::Derivation(format!(
                "key for {} used with {} address book",
                key.network(),
                self.network
            )));
        }
        Ok(())
    }
}

fn window(start: u32, count: u32) -> Range<u32> {
    start..start.saturating_add(count)
}

/// Gap-limit probe over one derivation chain
///
/// Probes `[last_used + 1, last_used + 1 + gap_limit)` first. Activity slides
/// the window so that `gap_limit` unprobed-or-unused indices always follow
/// the highest active one; the scan ends after a window with no activity.
/// Indices are never probed twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapLimitScan {
    gap_limit: u32,
    probed_end: u32,
    last_active: Option<u32>,
    pending: Option<Range<u32>>,
}

impl GapLimitScan {
    pub fn new(last_used: Option<u32>, gap_limit: u32) -> Self {
        let start = last_used.map_or(0, |i| i.saturating_add(1));
        let gap_limit = gap_limit.max(1);

        Self {
            gap_limit,
            probed_end: start,
            last_active: last_used,
            pending: Some(window(start, gap_limit)),
        }
    }

    /// Indices to probe next, `None` once the scan is complete
    pub fn next_window(&self) -> Option<Range<u32>> {
        self.pending.clone()
    }

    /// Feed back which indices of the pending window showed activity
    pub fn record(&mut self, active: impl IntoIterator<Item = u32>) {
        let Some(probed) = self.pending.take() else {
            return;
        };

        let found = active.into_iter().filter(|i| probed.contains(i)).max();
        self.probed_end = probed.end;

        let Some(found) = found else {
            return;
        };

        self.last_active = Some(self.last_active.map_or(found, |a| a.max(found)));
        let end = found.saturating_add(1).saturating_add(self.gap_limit);
        if end > self.probed_end {
            self.pending = Some(self.probed_end..end);
        }
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_none()
    }

    /// Highest active index seen, including the starting cursor
    pub fn last_active(&self) -> Option<u32> {
        self.last_active
    }

    /// One past the last probed index
    pub fn probed_end(&self) -> u32 {
        self.probed_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn regtest_key() -> MasterKey {
        MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Regtest).unwrap()
    }

    #[test]
    fn test_get_or_create_advances_cursor() {
        let key = regtest_key();
        let mut book = AddressBook::new(Network::Regtest);

        let first = book
            .get_or_create(&key, AddressType::P2wpkh, Chain::Receive, None)
            .unwrap();
        let second = book
            .get_or_create(&key, AddressType::P2wpkh, Chain::Receive, None)
            .unwrap();

        assert_eq!(first.index, 0);
        assert_eq!(first.address, "bcrt1q6rz28mcfaxtmd6v789l9rrlrusdprr9pz3cppk");
        assert_eq!(second.index, 1);
        assert_eq!(book.cursors(AddressType::P2wpkh).receive.current, 2);
        assert_eq!(book.cursors(AddressType::P2wpkh).change.current, 0);
    }

    #[test]
    fn test_explicit_index_does_not_move_cursor() {
        let key = regtest_key();
        let mut book = AddressBook::new(Network::Regtest);

        let entry = book
            .get_or_create(&key, AddressType::P2sh, Chain::Change, Some(4))
            .unwrap();
        assert_eq!(entry.address, "2N1QXjBftgk6qssJaKabFLJeetWbLun28Zt");
        assert_eq!(book.cursors(AddressType::P2sh), IndexCursors::default());
    }

    #[test]
    fn test_generate_and_reverse_lookup() {
        let key = regtest_key();
        let mut book = AddressBook::new(Network::Regtest);

        let generated = book
            .generate_addresses(&key, AddressType::P2pkh, 5, None)
            .unwrap();
        assert_eq!(generated.receive.len(), 5);
        assert_eq!(generated.change.len(), 5);
        assert_eq!(generated.receive[4].address, "n2BMo5arHDyAK2CM8c56eoEd18uEkKnRLC");
        assert_eq!(generated.change[0].address, "mi8nhzZgGZQthq6DQHbru9crMDerUdTKva");

        let (found, entry) = book.lookup(&generated.change[4].script_hash).unwrap();
        assert_eq!(found, AddressKey::new(AddressType::P2pkh, Chain::Change, 4));
        assert_eq!(entry.address, "msNHWXQNUtKkqwW1RudHr68GBtQ7sy5a4F");

        // Continues after the highest stored index
        let more = book
            .generate_addresses(&key, AddressType::P2pkh, 2, None)
            .unwrap();
        assert_eq!(more.receive[0].index, 5);
        assert_eq!(book.len(), 14);
    }

    #[test]
    fn test_mark_used_is_monotonic() {
        let mut book = AddressBook::new(Network::Regtest);

        assert!(book.mark_used(AddressType::P2wpkh, Chain::Receive, 7));
        assert!(!book.mark_used(AddressType::P2wpkh, Chain::Receive, 3));

        let cursor = book.cursors(AddressType::P2wpkh).receive;
        assert_eq!(cursor.last_used, Some(7));
        assert_eq!(cursor.current, 8);
    }

    #[test]
    fn test_wrong_network_key_rejected() {
        let key = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Bitcoin).unwrap();
        let mut book = AddressBook::new(Network::Regtest);
        let result = book.get_or_create(&key, AddressType::P2wpkh, Chain::Receive, Some(0));
        assert!(matches!(result, Err(CoreError::Derivation(_))));
    }

    #[test]
    fn test_serde_roundtrip_rebuilds_index() {
        let key = regtest_key();
        let mut book = AddressBook::new(Network::Regtest);
        book.generate_addresses(&key, AddressType::P2wpkh, 3, None)
            .unwrap();
        book.mark_used(AddressType::P2wpkh, Chain::Change, 1);

        let json = serde_json::to_string(&book).unwrap();
        let restored: AddressBook = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, book);
        let entry = book.entries(AddressType::P2wpkh, Chain::Receive).nth(2).unwrap();
        assert!(restored.contains_script_hash(&entry.script_hash));
    }

    #[test]
    fn test_replace_type_keeps_cursors() {
        let key = regtest_key();
        let mut book = AddressBook::new(Network::Regtest);
        book.generate_addresses(&key, AddressType::P2wpkh, 3, None)
            .unwrap();
        book.mark_used(AddressType::P2wpkh, Chain::Receive, 2);

        let mut other = AddressBook::new(Network::Regtest);
        let fresh = other
            .generate_addresses(&key, AddressType::P2wpkh, 2, None)
            .unwrap();
        book.replace_type(AddressType::P2wpkh, fresh);

        assert_eq!(book.entries(AddressType::P2wpkh, Chain::Receive).count(), 2);
        assert_eq!(book.cursors(AddressType::P2wpkh).receive.last_used, Some(2));
    }

    #[test]
    fn test_replace_type_without_cursors_adds_none() {
        let key = regtest_key();
        let mut book = AddressBook::new(Network::Regtest);
        book.materialize(&key, AddressType::P2wpkh, Chain::Receive, 0..3)
            .unwrap();
        let before = book.clone();

        let mut other = AddressBook::new(Network::Regtest);
        let fresh = other
            .generate_addresses(&key, AddressType::P2wpkh, 3, None)
            .unwrap();
        let receive_only = GeneratedAddresses {
            receive: fresh.receive,
            change: Vec::new(),
        };
        book.replace_type(AddressType::P2wpkh, receive_only);

        assert_eq!(book, before);
    }

    #[test]
    fn test_gap_scan_empty_wallet_probes_one_window() {
        let mut scan = GapLimitScan::new(None, 20);
        assert_eq!(scan.next_window(), Some(0..20));

        scan.record(std::iter::empty());
        assert!(scan.is_done());
        assert_eq!(scan.last_active(), None);
        assert_eq!(scan.probed_end(), 20);
    }

    #[test]
    fn test_gap_scan_slides_on_activity() {
        let mut scan = GapLimitScan::new(None, 5);
        assert_eq!(scan.next_window(), Some(0..5));

        scan.record([1, 4]);
        assert_eq!(scan.next_window(), Some(5..10));

        scan.record([6]);
        assert_eq!(scan.next_window(), Some(10..12));

        scan.record(std::iter::empty());
        assert!(scan.is_done());
        assert_eq!(scan.last_active(), Some(6));
    }

    #[test]
    fn test_gap_scan_resumes_after_last_used() {
        let scan = GapLimitScan::new(Some(9), 20);
        assert_eq!(scan.next_window(), Some(10..30));
        assert_eq!(scan.last_active(), Some(9));
    }
}
