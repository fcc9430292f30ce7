//! Unspent outputs and balance

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::AddressType;

/// A spendable output owned by one of the wallet's addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub address: String,
    pub script_hash: String,
    /// Compressed public key, hex
    pub public_key: String,
    pub address_type: AddressType,
    /// Address index on its chain
    pub index: u32,
    pub path: String,
    pub txid: Txid,
    pub vout: u32,
    /// 0 while unconfirmed
    pub height: u32,
    pub value: u64,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }

    pub fn is_confirmed(&self) -> bool {
        self.height > 0
    }
}

impl fmt::Display for Utxo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({} sats)", self.txid, self.vout, self.value)
    }
}

/// Balance split by confirmation state, blacklisted outputs excluded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: u64,
    pub unconfirmed: u64,
}

impl Balance {
    pub fn total(&self) -> u64 {
        self.confirmed + self.unconfirmed
    }
}

/// Current unspent outputs of one (wallet, network) plus the blacklist
///
/// The blacklist lives alongside the set but is never touched by
/// [`replace`](Self::replace), so exclusions survive refreshes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoSet {
    utxos: Vec<Utxo>,
    #[serde(default)]
    blacklist: BTreeSet<OutPoint>,
}

impl UtxoSet {
    pub fn new(utxos: Vec<Utxo>) -> Self {
        let mut set = Self::default();
        set.replace(utxos);
        set
    }

    pub fn all(&self) -> &[Utxo] {
        &self.utxos
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.iter().find(|u| u.outpoint() == *outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.get(outpoint).is_some()
    }

    /// Swap in a freshly scanned set, deduplicated and in outpoint order
    pub fn replace(&mut self, mut utxos: Vec<Utxo>) {
        utxos.sort_by_key(|u| u.outpoint());
        utxos.dedup_by_key(|u| u.outpoint());
        self.utxos = utxos;
    }

    pub fn clear(&mut self) {
        self.utxos.clear();
    }

    /// Drop outputs consumed by a broadcast transaction
    pub fn remove_spent(&mut self, spent: &[OutPoint]) -> usize {
        let before = self.utxos.len();
        self.utxos.retain(|u| !spent.contains(&u.outpoint()));
        before - self.utxos.len()
    }

    /// Add outputs known before the indexer reports them (own change)
    pub fn insert(&mut self, utxo: Utxo) {
        if !self.contains(&utxo.outpoint()) {
            self.utxos.push(utxo);
            self.utxos.sort_by_key(|u| u.outpoint());
        }
    }

    pub fn blacklist(&mut self, outpoint: OutPoint) -> bool {
        self.blacklist.insert(outpoint)
    }

    pub fn whitelist(&mut self, outpoint: &OutPoint) -> bool {
        self.blacklist.remove(outpoint)
    }

    pub fn is_blacklisted(&self, outpoint: &OutPoint) -> bool {
        self.blacklist.contains(outpoint)
    }

    pub fn blacklisted(&self) -> impl Iterator<Item = &OutPoint> + '_ {
        self.blacklist.iter()
    }

    /// Outputs coin selection may use
    pub fn spendable(&self) -> impl Iterator<Item = &Utxo> + '_ {
        self.utxos
            .iter()
            .filter(|u| !self.blacklist.contains(&u.outpoint()))
    }

    pub fn balance(&self) -> Balance {
        self.spendable().fold(Balance::default(), |mut balance, utxo| {
            if utxo.is_confirmed() {
                balance.confirmed += utxo.value;
            } else {
                balance.unconfirmed += utxo.value;
            }
            balance
        })
    }

    /// Sum of spendable outputs held at the given script hashes
    pub fn value_at(&self, script_hashes: &[String]) -> u64 {
        self.spendable()
            .filter(|u| script_hashes.contains(&u.script_hash))
            .map(|u| u.value)
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    pub(crate) fn utxo(txid_byte: u8, vout: u32, value: u64, height: u32) -> Utxo {
        Utxo {
            address: format!("addr{}", txid_byte),
            script_hash: format!("sh{}", txid_byte),
            public_key: String::new(),
            address_type: AddressType::P2wpkh,
            index: 0,
            path: "m/84'/1'/0'/0/0".to_string(),
            txid: Txid::from_byte_array([txid_byte; 32]),
            vout,
            height,
            value,
        }
    }

    #[test]
    fn test_balance_excludes_blacklisted() {
        let mut set = UtxoSet::new(vec![utxo(1, 0, 1_000, 100), utxo(2, 0, 500, 0)]);
        assert_eq!(set.balance().confirmed, 1_000);
        assert_eq!(set.balance().unconfirmed, 500);

        set.blacklist(utxo(1, 0, 0, 0).outpoint());
        assert_eq!(set.balance().total(), 500);
        assert_eq!(set.spendable().count(), 1);
    }

    #[test]
    fn test_blacklist_survives_replace() {
        let mut set = UtxoSet::new(vec![utxo(1, 0, 1_000, 100)]);
        set.blacklist(utxo(1, 0, 0, 0).outpoint());

        set.replace(vec![utxo(1, 0, 1_000, 101), utxo(3, 1, 2_000, 101)]);
        assert!(set.is_blacklisted(&utxo(1, 0, 0, 0).outpoint()));
        assert_eq!(set.balance().total(), 2_000);
    }

    #[test]
    fn test_replace_deduplicates() {
        let set = UtxoSet::new(vec![utxo(1, 0, 1_000, 1), utxo(1, 0, 1_000, 1)]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_spent() {
        let mut set = UtxoSet::new(vec![utxo(1, 0, 1_000, 1), utxo(2, 0, 2_000, 1)]);
        let removed = set.remove_spent(&[utxo(2, 0, 0, 0).outpoint()]);
        assert_eq!(removed, 1);
        assert_eq!(set.balance().total(), 1_000);
    }
}
