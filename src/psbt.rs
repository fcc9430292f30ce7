//! Unsigned PSBT construction (BIP174)
//!
//! Every input carries the UTXO it spends and its BIP32 key origin so an
//! external signer can find the key; a change output carries its origin too
//! so the signer can recognise it as its own.

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::key::CompressedPublicKey;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Txid};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use crate::derivation::address_for_key;
use crate::{AddressEntry, AddressType, CoreError, Network, Utxo};

/// Wallet-owned output of the transaction being wrapped
#[derive(Debug, Clone, Copy)]
pub struct OwnedOutput<'a> {
    pub vout: usize,
    pub entry: &'a AddressEntry,
    pub address_type: AddressType,
}

fn parse_key(hex_key: &str) -> Result<CompressedPublicKey, CoreError> {
    PublicKey::from_str(hex_key)
        .map(CompressedPublicKey)
        .map_err(|e| CoreError::Psbt(format!("invalid public key {}: {}", hex_key, e)))
}

fn parse_path(path: &str) -> Result<DerivationPath, CoreError> {
    DerivationPath::from_str(path)
        .map_err(|e| CoreError::Psbt(format!("invalid derivation path {}: {}", path, e)))
}

fn redeem_script(public_key: &CompressedPublicKey, address_type: AddressType) -> Option<ScriptBuf> {
    match address_type {
        AddressType::P2sh => Some(ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash())),
        AddressType::P2pkh | AddressType::P2wpkh => None,
    }
}

/// Wrap an unsigned transaction spending `inputs` (in input order) into a PSBT
///
/// Legacy inputs need their full previous transaction in `previous_txs`.
pub fn create_psbt(
    unsigned_tx: Transaction,
    inputs: &[Utxo],
    owned_outputs: &[OwnedOutput<'_>],
    fingerprint: Fingerprint,
    network: Network,
    previous_txs: &HashMap<Txid, Transaction>,
) -> Result<Psbt, CoreError> {
    if unsigned_tx.input.len() != inputs.len() {
        return Err(CoreError::Psbt(format!(
            "transaction has {} inputs but {} UTXOs were given",
            unsigned_tx.input.len(),
            inputs.len()
        )));
    }

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx).map_err(|e| CoreError::Psbt(e.to_string()))?;

    for (index, utxo) in inputs.iter().enumerate() {
        if psbt.unsigned_tx.input[index].previous_output != utxo.outpoint() {
            return Err(CoreError::Psbt(format!(
                "input {} does not spend {}",
                index,
                utxo.outpoint()
            )));
        }

        let public_key = parse_key(&utxo.public_key)?;
        let script_pubkey = address_for_key(&public_key, utxo.address_type, network).script_pubkey();
        let input = &mut psbt.inputs[index];

        if utxo.address_type.is_segwit() {
            input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(utxo.value),
                script_pubkey,
            });
        } else {
            let previous = previous_txs.get(&utxo.txid).ok_or_else(|| {
                CoreError::Psbt(format!("previous transaction {} is required", utxo.txid))
            })?;
            let spent = previous.output.get(utxo.vout as usize).ok_or_else(|| {
                CoreError::Psbt(format!("previous transaction has no output {}", utxo.vout))
            })?;
            if spent.script_pubkey != script_pubkey || spent.value.to_sat() != utxo.value {
                return Err(CoreError::Psbt(format!(
                    "previous transaction does not match {}",
                    utxo.outpoint()
                )));
            }
            input.non_witness_utxo = Some(previous.clone());
        }

        input.redeem_script = redeem_script(&public_key, utxo.address_type);
        input.bip32_derivation = BTreeMap::from([(
            public_key.0,
            (fingerprint, parse_path(&utxo.path)?),
        )]);
    }

    for owned in owned_outputs {
        let public_key = parse_key(&owned.entry.public_key)?;
        let output = psbt.outputs.get_mut(owned.vout).ok_or_else(|| {
            CoreError::Psbt(format!("transaction has no output {}", owned.vout))
        })?;

        output.redeem_script = redeem_script(&public_key, owned.address_type);
        output.bip32_derivation = BTreeMap::from([(
            public_key.0,
            (fingerprint, parse_path(&owned.entry.path)?),
        )]);
    }

    Ok(psbt)
}
