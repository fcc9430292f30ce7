//! Address book entries and address validation

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Address, Script};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{CoreError, Network};

/// One derived address as stored in a wallet's address book
///
/// Reproducible byte-for-byte from the seed at its derivation path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub index: u32,
    /// Full derivation path, e.g. `m/84'/1'/0'/0/7`
    pub path: String,
    pub address: String,
    /// Indexer lookup key, see [`script_hash`]
    pub script_hash: String,
    /// Compressed public key, hex encoded
    pub public_key: String,
}

/// Electrum-style script hash: SHA-256 of the output script, byte-reversed, hex
pub fn script_hash(script: &Script) -> String {
    let mut bytes = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    bytes.reverse();
    hex::encode(bytes)
}

/// Parse an address and require it to belong to `network`
///
/// Testnet and regtest share base58 prefixes but not the bech32 HRP, so a
/// `tb1` address is rejected on regtest and vice versa.
pub fn validate_address(text: &str, network: Network) -> Result<Address, CoreError> {
    let unchecked = Address::from_str(text.trim())
        .map_err(|e| CoreError::InvalidAddress(format!("{}: {}", text, e)))?;

    unchecked
        .require_network(network.to_bitcoin())
        .map_err(|e| CoreError::InvalidAddress(format!("{}: {}", text, e)))
}

/// Script hash of an address string, validated against `network`
pub fn address_script_hash(text: &str, network: Network) -> Result<String, CoreError> {
    let address = validate_address(text, network)?;
    Ok(script_hash(&address.script_pubkey()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_hash_reference() {
        // First BIP84 receive address of the standard test mnemonic
        let hash = address_script_hash("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", Network::Bitcoin)
            .unwrap();
        assert_eq!(
            hash,
            "6e4f16236139f15046b38f399a683fb2aa8edf5fd128b3e5db017fb0ac74078a"
        );
    }

    #[test]
    fn test_validate_rejects_bad_checksum() {
        let result = validate_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyv", Network::Bitcoin);
        assert!(matches!(result, Err(CoreError::InvalidAddress(_))));
    }

    #[test]
    fn test_validate_rejects_wrong_network() {
        let result = validate_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", Network::Testnet);
        assert!(matches!(result, Err(CoreError::InvalidAddress(_))));

        let result = validate_address("bcrt1q6rz28mcfaxtmd6v789l9rrlrusdprr9pz3cppk", Network::Testnet);
        assert!(matches!(result, Err(CoreError::InvalidAddress(_))));
    }

    #[test]
    fn test_validate_accepts_testnet_base58_on_regtest() {
        assert!(validate_address("2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2", Network::Regtest).is_ok());
    }
}
