//! Property tests for key derivation and the address book
//!
//! Tests cover:
//! - Reference addresses for every address type at indices 0 and 4 (regtest)
//! - Referential stability of derivation across independently built keys
//! - No address collisions across indices and chains
//! - History merge idempotence over overlapping batches

use onchain_core::bitcoin::hashes::Hash;
use onchain_core::bitcoin::Txid;
use onchain_core::{
    merge_incoming, AddressBook, AddressType, Chain, MasterKey, Network, TxRecord, TxType,
};
use std::collections::HashSet;

const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

// ============================================================================
// Test 1: Reference Address Set
// ============================================================================

#[test]
fn test_regtest_reference_addresses() {
    let key = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Regtest).unwrap();

    let expected = [
        (AddressType::P2pkh, Chain::Receive, 0, "mkpZhYtJu2r87Js3pDiWJDmPte2NRZ8bJV"),
        (AddressType::P2pkh, Chain::Receive, 4, "n2BMo5arHDyAK2CM8c56eoEd18uEkKnRLC"),
        (AddressType::P2pkh, Chain::Change, 0, "mi8nhzZgGZQthq6DQHbru9crMDerUdTKva"),
        (AddressType::P2pkh, Chain::Change, 4, "msNHWXQNUtKkqwW1RudHr68GBtQ7sy5a4F"),
        (AddressType::P2sh, Chain::Receive, 0, "2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2"),
        (AddressType::P2sh, Chain::Receive, 4, "2MuKeQzUHhUQWUZgx5AuNWoQ7YWx6vsXxrv"),
        (AddressType::P2sh, Chain::Change, 0, "2MvdUi5o3f2tnEFh9yGvta6FzptTZtkPJC8"),
        (AddressType::P2sh, Chain::Change, 4, "2N1QXjBftgk6qssJaKabFLJeetWbLun28Zt"),
        (AddressType::P2wpkh, Chain::Receive, 0, "bcrt1q6rz28mcfaxtmd6v789l9rrlrusdprr9pz3cppk"),
        (AddressType::P2wpkh, Chain::Receive, 4, "bcrt1q677973lw0w796gttpy52f296jqaaksz0kadvlr"),
        (AddressType::P2wpkh, Chain::Change, 0, "bcrt1q9u62588spffmq4dzjxsr5l297znf3z6jkgnhsw"),
        (AddressType::P2wpkh, Chain::Change, 4, "bcrt1qw3xfnyuspj8qnr2envc448mxwam7f7p249rqs0"),
    ];

    for (address_type, chain, index, address) in expected {
        let entry = key.derive_address(address_type, chain, index).unwrap();
        assert_eq!(entry.address, address, "{} {} {}", address_type, chain, index);
    }
}

// ============================================================================
// Test 2: Determinism and Uniqueness
// ============================================================================

#[test]
fn test_derivation_is_referentially_stable() {
    for network in Network::ALL {
        let first = MasterKey::from_phrase(TEST_MNEMONIC, "pass", network).unwrap();
        let second = MasterKey::from_phrase(TEST_MNEMONIC, "pass", network).unwrap();

        for address_type in AddressType::ALL {
            for chain in Chain::ALL {
                for index in [0, 1, 19, 20, 1_000, 0x7fff_ffff] {
                    let a = first.derive_address(address_type, chain, index).unwrap();
                    let b = second.derive_address(address_type, chain, index).unwrap();
                    assert_eq!(a, b);
                }
            }
        }
    }
}

#[test]
fn test_no_collisions_across_indices_and_chains() {
    let key = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Regtest).unwrap();
    let mut book = AddressBook::new(Network::Regtest);
    book.generate_addresses(&key, AddressType::P2wpkh, 5_000, Some(0))
        .unwrap();

    let mut addresses = HashSet::new();
    let mut script_hashes = HashSet::new();
    for (_, entry) in book.iter() {
        assert!(addresses.insert(entry.address.clone()), "duplicate {}", entry.address);
        assert!(script_hashes.insert(entry.script_hash.clone()));
    }
    assert_eq!(addresses.len(), 10_000);
}

// ============================================================================
// Test 3: History Merge
// ============================================================================

fn record(seed: u8, height: u32, timestamp: u64, tx_type: TxType) -> TxRecord {
    TxRecord {
        txid: Txid::from_byte_array([seed; 32]),
        address: String::new(),
        height,
        script_hash: String::new(),
        total_input_value: 0,
        matched_input_value: 0,
        total_output_value: 0,
        matched_output_value: 0,
        fee: 0,
        tx_type,
        value: u64::from(seed) * 1_000,
        timestamp,
        message: None,
    }
}

#[test]
fn test_merge_idempotent_over_overlapping_batches() {
    let batches: Vec<Vec<TxRecord>> = (0u8..6)
        .map(|round| {
            (0u8..10)
                .filter(|i| (i + round) % 3 != 0)
                .map(|i| {
                    let confirmed = if round > 2 { 100 + u32::from(i) } else { 0 };
                    let kind = if i % 2 == 0 { TxType::Sent } else { TxType::Received };
                    record(i, confirmed, 1_000 + u64::from(i % 4), kind)
                })
                .collect()
        })
        .collect();

    let mut state: Vec<TxRecord> = Vec::new();
    for batch in &batches {
        let once = merge_incoming(&state, batch);
        let twice = merge_incoming(&once, batch);
        assert_eq!(once, twice);

        let ids: HashSet<Txid> = once.iter().map(|r| r.txid).collect();
        assert_eq!(ids.len(), once.len());
        assert!(once.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        state = once;
    }
}
