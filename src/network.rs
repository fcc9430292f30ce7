//! Supported networks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// Network a wallet's address set belongs to
///
/// Each wallet owns a complete, independent address book, UTXO set and
/// history per network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Bitcoin,
    Testnet,
    Regtest,
}

impl Network {
    pub const ALL: [Network; 3] = [Network::Bitcoin, Network::Testnet, Network::Regtest];

    /// Get the BIP44 coin type for this network
    ///
    /// - Mainnet: 0
    /// - Testnet/Regtest: 1
    pub fn coin_type(self) -> u32 {
        match self {
            Network::Bitcoin => 0,
            Network::Testnet | Network::Regtest => 1,
        }
    }

    pub fn to_bitcoin(self) -> bitcoin::Network {
        match self {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Bitcoin => "bitcoin",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(CoreError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl TryFrom<bitcoin::Network> for Network {
    type Error = CoreError;

    fn try_from(network: bitcoin::Network) -> Result<Self, Self::Error> {
        match network {
            bitcoin::Network::Bitcoin => Ok(Network::Bitcoin),
            bitcoin::Network::Testnet => Ok(Network::Testnet),
            bitcoin::Network::Regtest => Ok(Network::Regtest),
            other => Err(CoreError::UnsupportedNetwork(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_type() {
        assert_eq!(Network::Bitcoin.coin_type(), 0);
        assert_eq!(Network::Testnet.coin_type(), 1);
        assert_eq!(Network::Regtest.coin_type(), 1);
    }

    #[test]
    fn test_parse() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Bitcoin);
        assert_eq!("Regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert!(matches!(
            "signet".parse::<Network>(),
            Err(CoreError::UnsupportedNetwork(_))
        ));
    }
}
