//! Key derivation
//!
//! Turns a BIP39 phrase into a master key and derives per-address-type,
//! per-chain, per-index keys along `purpose'/coin_type'/account'/chain/index`.
//! Everything here is pure: the same seed and path always yield the same key
//! and address, which is what restoring on a new device and the storage
//! consistency check both rely on.

use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv};
use bitcoin::hashes::{hmac, sha256, Hash, HashEngine};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::rand;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, PrivateKey};
use std::fmt;
use std::str::FromStr;

use crate::address::{script_hash, AddressEntry};
use crate::{AddressType, Chain, CoreError, Network};

/// Account used for every derivation path
pub const DEFAULT_ACCOUNT: u32 = 0;

/// Parse and checksum-validate a BIP39 phrase
pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, CoreError> {
    Mnemonic::parse(words.trim()).map_err(|e| CoreError::InvalidMnemonic(e.to_string()))
}

/// Generate a new random mnemonic of 12 or 24 words
pub fn generate_mnemonic(word_count: usize) -> Result<Mnemonic, CoreError> {
    let entropy_len = match word_count {
        12 => 16,
        24 => 32,
        other => {
            return Err(CoreError::InvalidMnemonic(format!(
                "unsupported word count {}",
                other
            )))
        }
    };
    let entropy = rand::random::<[u8; 32]>();

    Mnemonic::from_entropy(&entropy[..entropy_len])
        .map_err(|e| CoreError::InvalidMnemonic(e.to_string()))
}

/// Subsystems that get their own phrase derived from the wallet's phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxiliaryPurpose {
    Lightning,
    Tokens,
    Auth,
}

impl AuxiliaryPurpose {
    fn label(self) -> &'static str {
        match self {
            AuxiliaryPurpose::Lightning => "lightning",
            AuxiliaryPurpose::Tokens => "tokens",
            AuxiliaryPurpose::Auth => "auth",
        }
    }
}

/// Derive a reproducible, independent 12-word phrase for an auxiliary subsystem
///
/// Entropy is the first 16 bytes of HMAC-SHA256 keyed with the purpose label
/// over the source phrase's BIP39 seed.
pub fn derive_auxiliary_mnemonic(
    source: &Mnemonic,
    purpose: AuxiliaryPurpose,
) -> Result<Mnemonic, CoreError> {
    let seed = source.to_seed("");
    let mut engine = hmac::HmacEngine::<sha256::Hash>::new(purpose.label().as_bytes());
    engine.input(&seed);
    let mac = hmac::Hmac::<sha256::Hash>::from_engine(engine).to_byte_array();

    Mnemonic::from_entropy(&mac[..16]).map_err(|e| CoreError::InvalidMnemonic(e.to_string()))
}

/// Derivation path for one address
pub fn derivation_path(
    address_type: AddressType,
    network: Network,
    chain: Chain,
    index: u32,
) -> Result<DerivationPath, CoreError> {
    let children = [
        ChildNumber::from_hardened_idx(address_type.purpose()).map_err(CoreError::derivation)?,
        ChildNumber::from_hardened_idx(network.coin_type()).map_err(CoreError::derivation)?,
        ChildNumber::from_hardened_idx(DEFAULT_ACCOUNT).map_err(CoreError::derivation)?,
        ChildNumber::from_normal_idx(chain.index()).map_err(CoreError::derivation)?,
        ChildNumber::from_normal_idx(index).map_err(CoreError::derivation)?,
    ];
    Ok(DerivationPath::from(children.to_vec()))
}

/// Human-readable form of [`derivation_path`], `m/84'/1'/0'/0/3`
pub fn path_string(address_type: AddressType, network: Network, chain: Chain, index: u32) -> String {
    format!(
        "m/{}'/{}'/{}'/{}/{}",
        address_type.purpose(),
        network.coin_type(),
        DEFAULT_ACCOUNT,
        chain.index(),
        index
    )
}

/// Encode a public key as an address of the given type
pub fn address_for_key(
    public_key: &CompressedPublicKey,
    address_type: AddressType,
    network: Network,
) -> Address {
    match address_type {
        AddressType::P2pkh => Address::p2pkh(public_key.pubkey_hash(), network.to_bitcoin()),
        AddressType::P2sh => Address::p2shwpkh(public_key, network.to_bitcoin()),
        AddressType::P2wpkh => Address::p2wpkh(public_key, network.to_bitcoin()),
    }
}

/// Master key material derived from a seed
///
/// Holds private key material; never serialized and never logged.
#[derive(Clone)]
pub struct MasterKey {
    xpriv: Xpriv,
    network: Network,
    secp: Secp256k1<All>,
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("fingerprint", &self.fingerprint())
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl MasterKey {
    /// Convert a mnemonic and optional passphrase into master key material
    pub fn from_mnemonic(
        mnemonic: &Mnemonic,
        passphrase: &str,
        network: Network,
    ) -> Result<Self, CoreError> {
        let seed = mnemonic.to_seed(passphrase);
        Self::from_seed(&seed, network)
    }

    /// Parse a phrase and derive master key material from it
    pub fn from_phrase(words: &str, passphrase: &str, network: Network) -> Result<Self, CoreError> {
        let mnemonic = parse_mnemonic(words)?;
        Self::from_mnemonic(&mnemonic, passphrase, network)
    }

    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self, CoreError> {
        let xpriv =
            Xpriv::new_master(network.to_bitcoin(), seed).map_err(CoreError::derivation)?;

        Ok(Self {
            xpriv,
            network,
            secp: Secp256k1::new(),
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Fingerprint of the master public key, used as the PSBT key origin
    pub fn fingerprint(&self) -> Fingerprint {
        self.xpriv.fingerprint(&self.secp)
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    fn derive_xpriv(&self, path: &DerivationPath) -> Result<Xpriv, CoreError> {
        self.xpriv
            .derive_priv(&self.secp, path)
            .map_err(CoreError::derivation)
    }

    pub fn derive_private_key(&self, path: &DerivationPath) -> Result<PrivateKey, CoreError> {
        let derived = self.derive_xpriv(path)?;
        Ok(PrivateKey::new(derived.private_key, self.network.to_bitcoin()))
    }

    /// Derive the private key at `path`, WIF encoded
    pub fn derive_wif(&self, path: &str) -> Result<String, CoreError> {
        let path = DerivationPath::from_str(path).map_err(CoreError::derivation)?;
        Ok(self.derive_private_key(&path)?.to_wif())
    }

    pub fn derive_public_key(&self, path: &DerivationPath) -> Result<CompressedPublicKey, CoreError> {
        let derived = self.derive_xpriv(path)?;
        Ok(CompressedPublicKey(derived.private_key.public_key(&self.secp)))
    }

    /// Derive the address book entry at one (type, chain, index) position
    pub fn derive_address(
        &self,
        address_type: AddressType,
        chain: Chain,
        index: u32,
    ) -> Result<AddressEntry, CoreError> {
        let path = derivation_path(address_type, self.network, chain, index)?;
        let public_key = self.derive_public_key(&path)?;
        let address = address_for_key(&public_key, address_type, self.network);

        Ok(AddressEntry {
            index,
            path: path_string(address_type, self.network, chain, index),
            address: address.to_string(),
            script_hash: script_hash(&address.script_pubkey()),
            public_key: hex::encode(public_key.to_bytes()),
        })
    }

    /// Derive `count` consecutive entries starting at `start`
    pub fn derive_addresses(
        &self,
        address_type: AddressType,
        chain: Chain,
        start: u32,
        count: u32,
    ) -> Result<Vec<AddressEntry>, CoreError> {
        let mut addresses = Vec::with_capacity(count as usize);

        for i in 0..count {
            let index = start.checked_add(i).ok_or_else(|| {
                CoreError::Derivation(format!("index overflow at {} + {}", start, i))
            })?;
            addresses.push(self.derive_address(address_type, chain, index)?);
        }

        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_reference_vectors() {
        let mainnet = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Bitcoin).unwrap();
        assert_eq!(mainnet.fingerprint().to_string(), "73c5da0a");

        let legacy = mainnet.derive_address(AddressType::P2pkh, Chain::Receive, 0).unwrap();
        assert_eq!(legacy.address, "1LqBGSKuX5yYUonjxT5qGfpUsXKYYWeabA");
        assert_eq!(legacy.path, "m/44'/0'/0'/0/0");

        let native = mainnet.derive_address(AddressType::P2wpkh, Chain::Receive, 0).unwrap();
        assert_eq!(native.address, "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
        assert_eq!(
            native.public_key,
            "0330d54fd0dd420a6e5f8d3624f5f3482cae350f79d5f0753bf5beef9c2d91af3c"
        );

        let change = mainnet.derive_address(AddressType::P2wpkh, Chain::Change, 0).unwrap();
        assert_eq!(change.address, "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el");

        let testnet = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Testnet).unwrap();
        let nested = testnet.derive_address(AddressType::P2sh, Chain::Receive, 0).unwrap();
        assert_eq!(nested.address, "2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2");
        assert_eq!(nested.path, "m/49'/1'/0'/0/0");
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Regtest).unwrap();
        let b = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Regtest).unwrap();

        for address_type in AddressType::ALL {
            for chain in Chain::ALL {
                let first = a.derive_addresses(address_type, chain, 0, 5).unwrap();
                let second = b.derive_addresses(address_type, chain, 0, 5).unwrap();
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn test_passphrase_changes_keys() {
        let plain = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Bitcoin).unwrap();
        let salted = MasterKey::from_phrase(TEST_MNEMONIC, "TREZOR", Network::Bitcoin).unwrap();
        let a = plain.derive_address(AddressType::P2wpkh, Chain::Receive, 0).unwrap();
        let b = salted.derive_address(AddressType::P2wpkh, Chain::Receive, 0).unwrap();
        assert_ne!(a.address, b.address);
    }

    #[test]
    fn test_invalid_mnemonic() {
        let result = MasterKey::from_phrase("abandon abandon abandon", "", Network::Bitcoin);
        assert!(matches!(result, Err(CoreError::InvalidMnemonic(_))));

        let bad_checksum = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon";
        assert!(matches!(
            parse_mnemonic(bad_checksum),
            Err(CoreError::InvalidMnemonic(_))
        ));
    }

    #[test]
    fn test_wif_export() {
        let key = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Bitcoin).unwrap();
        let wif = key.derive_wif("m/84'/0'/0'/0/0").unwrap();
        // BIP84 reference private key for the first receive address
        assert_eq!(wif, "KyZpNDKnfs94vbrwhJneDi77V6jF64PWPF8x5cdJb8ifgg2DUc9d");
    }

    #[test]
    fn test_auxiliary_mnemonics() {
        let source = parse_mnemonic(TEST_MNEMONIC).unwrap();
        let lightning = derive_auxiliary_mnemonic(&source, AuxiliaryPurpose::Lightning).unwrap();
        let again = derive_auxiliary_mnemonic(&source, AuxiliaryPurpose::Lightning).unwrap();
        let auth = derive_auxiliary_mnemonic(&source, AuxiliaryPurpose::Auth).unwrap();

        assert_eq!(lightning, again);
        assert_ne!(lightning, auth);
        assert_ne!(lightning, source);
        assert_eq!(lightning.word_count(), 12);
    }

    #[test]
    fn test_generate_mnemonic() {
        assert_eq!(generate_mnemonic(12).unwrap().word_count(), 12);
        assert_eq!(generate_mnemonic(24).unwrap().word_count(), 24);
        assert!(generate_mnemonic(15).is_err());
    }
}
