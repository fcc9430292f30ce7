/// Storage consistency check
///
/// Detects stored addresses that no longer match what the seed derives at
/// their index, and repairs the address table from a fresh derivation.
/// The quick check compares the lowest and highest stored index of each
/// chain; a mismatch there (or a thorough run) diffs the whole stored range.
use onchain_core::{
    AddressBook, AddressEntry, AddressKey, AddressType, Chain, CoreError, GeneratedAddresses,
    MasterKey,
};
use serde::Serialize;

use crate::storage::{ImpactedAddress, ImpactedAddresses};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageCheckReport {
    /// Address types that were checked
    pub checked: Vec<AddressType>,
    /// Mismatches per repaired address type
    pub impacted: Vec<ImpactedAddresses>,
}

impl StorageCheckReport {
    pub fn all_match(&self) -> bool {
        self.impacted.iter().all(ImpactedAddresses::is_empty)
    }

    pub fn impacted_count(&self) -> usize {
        self.impacted.iter().map(ImpactedAddresses::len).sum()
    }

    /// Script hashes the repaired rows now point at
    pub fn expected_script_hashes(&self) -> Vec<String> {
        self.impacted
            .iter()
            .flat_map(ImpactedAddresses::script_hashes)
            .collect()
    }
}

fn matches_derivation(
    key: &MasterKey,
    address_type: AddressType,
    chain: Chain,
    stored: &AddressEntry,
) -> Result<bool, CoreError> {
    let expected = key.derive_address(address_type, chain, stored.index)?;
    Ok(expected.address == stored.address)
}

/// Compare the boundary rows of both chains
fn boundaries_match(
    key: &MasterKey,
    book: &AddressBook,
    address_type: AddressType,
) -> Result<bool, CoreError> {
    for chain in Chain::ALL {
        if let Some((min, max)) = book.min_max(address_type, chain) {
            if !matches_derivation(key, address_type, chain, min)?
                || !matches_derivation(key, address_type, chain, max)?
            {
                log::warn!(
                    "⚠️  Stored {} {} addresses at index {} or {} differ from derivation",
                    address_type,
                    chain,
                    min.index,
                    max.index
                );
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Derive the full stored range of one chain and diff it row by row
fn diff_chain(
    key: &MasterKey,
    book: &AddressBook,
    address_type: AddressType,
    chain: Chain,
) -> Result<(Vec<AddressEntry>, Vec<ImpactedAddress>), CoreError> {
    let Some((min, max)) = book.min_max(address_type, chain) else {
        return Ok((Vec::new(), Vec::new()));
    };

    let mut fresh = Vec::new();
    let mut impacted = Vec::new();
    for index in min.index..=max.index {
        let expected = key.derive_address(address_type, chain, index)?;
        if let Some(stored) = book.get(&AddressKey::new(address_type, chain, index)) {
            if stored.address != expected.address {
                impacted.push(ImpactedAddress {
                    index,
                    path: expected.path.clone(),
                    stored: stored.address.clone(),
                    expected: expected.address.clone(),
                    script_hash: expected.script_hash.clone(),
                });
            }
        }
        fresh.push(expected);
    }

    Ok((fresh, impacted))
}

/// Check, and where needed repair, the address rows of `types`
///
/// Repaired types get their rows replaced by the fresh derivation of the
/// same index range; cursors stay as they were. CPU-bound, run it off the
/// async executor.
pub fn run_storage_check(
    key: &MasterKey,
    book: &mut AddressBook,
    types: &[AddressType],
    thorough: bool,
) -> Result<StorageCheckReport, CoreError> {
    let mut report = StorageCheckReport {
        checked: types.to_vec(),
        impacted: Vec::new(),
    };

    for &address_type in types {
        if !thorough && boundaries_match(key, book, address_type)? {
            continue;
        }

        let (receive, receive_impacted) = diff_chain(key, book, address_type, Chain::Receive)?;
        let (change, change_impacted) = diff_chain(key, book, address_type, Chain::Change)?;
        if receive_impacted.is_empty() && change_impacted.is_empty() {
            continue;
        }

        log::warn!(
            "🧹 Repairing {} {} addresses ({} receive, {} change)",
            receive_impacted.len() + change_impacted.len(),
            address_type,
            receive_impacted.len(),
            change_impacted.len()
        );
        book.replace_type(address_type, GeneratedAddresses { receive, change });

        report.impacted.push(ImpactedAddresses {
            address_type,
            receive: receive_impacted,
            change: change_impacted,
        });
    }

    Ok(report)
}
