//! Address types and derivation chains

use bitcoin::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Script template a wallet derives addresses for
///
/// Each type has its own BIP purpose, its own derivation subtree and its own
/// receive/change index cursors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// Legacy pay-to-pubkey-hash (BIP44)
    P2pkh,
    /// P2WPKH wrapped in P2SH (BIP49)
    P2sh,
    /// Native segwit v0 bech32 (BIP84)
    #[default]
    P2wpkh,
}

impl AddressType {
    pub const ALL: [AddressType; 3] = [AddressType::P2pkh, AddressType::P2sh, AddressType::P2wpkh];

    /// BIP purpose constant used as the first hardened path element
    pub fn purpose(self) -> u32 {
        match self {
            AddressType::P2pkh => 44,
            AddressType::P2sh => 49,
            AddressType::P2wpkh => 84,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AddressType::P2pkh => "Legacy",
            AddressType::P2sh => "Nested SegWit",
            AddressType::P2wpkh => "Native SegWit",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AddressType::P2pkh => "p2pkh",
            AddressType::P2sh => "p2sh",
            AddressType::P2wpkh => "p2wpkh",
        }
    }

    pub fn is_segwit(self) -> bool {
        !matches!(self, AddressType::P2pkh)
    }

    /// Classify an address into one of the wallet's own address types
    ///
    /// Returns `None` for templates the wallet never derives (P2WSH, P2TR).
    pub fn of(address: &Address) -> Option<Self> {
        match address.address_type()? {
            bitcoin::AddressType::P2pkh => Some(AddressType::P2pkh),
            bitcoin::AddressType::P2sh => Some(AddressType::P2sh),
            bitcoin::AddressType::P2wpkh => Some(AddressType::P2wpkh),
            _ => None,
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "p2pkh" | "legacy" => Ok(AddressType::P2pkh),
            "p2sh" | "p2sh-p2wpkh" | "nested" => Ok(AddressType::P2sh),
            "p2wpkh" | "bech32" | "native" => Ok(AddressType::P2wpkh),
            other => Err(CoreError::UnsupportedAddressType(other.to_string())),
        }
    }
}

/// External (receive) or internal (change) derivation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Receive,
    Change,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Receive, Chain::Change];

    /// Non-hardened path element selecting this chain
    pub fn index(self) -> u32 {
        match self {
            Chain::Receive => 0,
            Chain::Change => 1,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Receive => f.write_str("receive"),
            Chain::Change => f.write_str("change"),
        }
    }
}
