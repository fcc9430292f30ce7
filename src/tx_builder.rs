//! Transaction building: compose, sign, PSBT, fee bump (RBF) and boost (CPFP)
//!
//! Layout of every transaction built here: version 2, locktime 0, inputs in
//! selection order, recipient outputs in the order given, change last.
//! Replaceable transactions signal with `0xFFFFFFFD` on every input.

use bitcoin::absolute::LockTime;
use bitcoin::bip32::DerivationPath;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::key::CompressedPublicKey;
use bitcoin::psbt::Psbt;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::address::validate_address;
use crate::coin_selection::{select_coins, select_max, Selection, SelectionPreference, SelectionRequest};
use crate::derivation::{address_for_key, MasterKey};
use crate::draft::{ComposeStage, PendingTransaction};
use crate::fees::{dust_threshold, estimate_vsize, fee_for, script_len, MIN_FEE_RATE};
use crate::psbt::{create_psbt, OwnedOutput};
use crate::{AddressEntry, AddressType, CoreError, Network, Utxo};

fn sequence(rbf: bool) -> Sequence {
    if rbf {
        Sequence::ENABLE_RBF_NO_LOCKTIME
    } else {
        Sequence::MAX
    }
}

fn assemble(inputs: &[Utxo], outputs: Vec<TxOut>, rbf: bool) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: sequence(rbf),
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

/// Fee rate a transaction pays, rounded up to whole sat/vB
pub fn fee_rate_of(fee: u64, vsize: u64) -> u64 {
    if vsize == 0 {
        return 0;
    }
    fee.div_ceil(vsize)
}

/// Which boost paths an unconfirmed transaction allows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoostOptions {
    pub rbf: bool,
    pub cpfp: bool,
}

impl BoostOptions {
    /// RBF needs a replaceable, wallet-funded transaction; CPFP needs an
    /// unspent wallet-owned output. Neither applies once confirmed.
    pub fn evaluate(tx: &Transaction, confirmed: bool, wallet_funded: bool, owned_unspent: bool) -> Self {
        if confirmed {
            return Self::default();
        }
        Self {
            rbf: wallet_funded && tx.is_explicitly_rbf(),
            cpfp: owned_unspent,
        }
    }
}

/// A fee bump of a previously broadcast transaction
#[derive(Debug, Clone)]
pub struct FeeBumpRequest<'a> {
    pub original: &'a Transaction,
    pub original_fee: u64,
    /// UTXOs spent by `original`, in its input order
    pub original_inputs: Vec<Utxo>,
    /// Index of the wallet's change output in `original`, if any
    pub change_vout: Option<usize>,
    /// Where change goes if the original had none
    pub change_entry: &'a AddressEntry,
    pub change_type: AddressType,
    /// Extra spendable outputs, used only when the original inputs fall short
    pub extra_candidates: Vec<Utxo>,
    pub fee_rate: u64,
}

/// Unsigned result of [`TransactionBuilder::bump_fee`] or
/// [`TransactionBuilder::boost_cpfp`]
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub tx: Transaction,
    pub inputs: Vec<Utxo>,
    pub fee: u64,
    pub vsize: u64,
    /// Change (RBF) or the single child output (CPFP), 0 if none
    pub change: u64,
}

pub struct TransactionBuilder {
    network: Network,
}

impl TransactionBuilder {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    fn script_for(&self, address: &str) -> Result<ScriptBuf, CoreError> {
        Ok(validate_address(address, self.network)?.script_pubkey())
    }

    /// Run coin selection for a configured draft and move it to `Ready`
    ///
    /// Recipients are validated for network and dust first. For send-max the
    /// single recipient value is set to inputs minus fee.
    pub fn compose(
        &self,
        draft: &mut PendingTransaction,
        spendable: &[Utxo],
        change_entry: &AddressEntry,
        change_type: AddressType,
    ) -> Result<(), CoreError> {
        draft.begin_selection()?;

        match self.run_selection(draft, spendable, change_entry, change_type) {
            Ok(selection) => {
                if draft.max {
                    let value = selection.input_total - selection.fee;
                    if let Some(output) = draft.outputs.first_mut() {
                        output.value = value;
                    }
                }
                log::debug!(
                    "Composed {} inputs, fee {} sats ({} vB), change {} sats",
                    selection.inputs.len(),
                    selection.fee,
                    selection.vsize,
                    selection.change
                );
                draft.apply_selection(selection, Some(change_entry.clone()))
            }
            Err(e) => {
                draft.abort_selection();
                Err(e)
            }
        }
    }

    fn run_selection(
        &self,
        draft: &PendingTransaction,
        spendable: &[Utxo],
        change_entry: &AddressEntry,
        change_type: AddressType,
    ) -> Result<Selection, CoreError> {
        let mut script_lens = Vec::with_capacity(draft.outputs.len());
        let mut max_dust = 0;

        for output in &draft.outputs {
            let script = self.script_for(&output.address)?;
            let threshold = dust_threshold(&script);
            if !draft.max && output.value < threshold {
                return Err(CoreError::DustOutput {
                    value: output.value,
                    threshold,
                });
            }
            max_dust = threshold;
            script_lens.push(script.len());
        }

        let change_script = self.script_for(&change_entry.address)?;
        let mut request = SelectionRequest::new(spendable.to_vec(), draft.target(), script_lens);
        request.change_script_len = script_len(change_type);
        request.change_dust = dust_threshold(&change_script);
        request.fee_rate = draft.fee_rate.max(MIN_FEE_RATE);
        request.preference = draft.preference;
        request.manual = draft.manual_inputs.clone();

        if draft.max {
            request.target = 0;
            select_max(&request, max_dust)
        } else {
            select_coins(&request)
        }
    }

    fn draft_outputs(&self, draft: &PendingTransaction) -> Result<Vec<TxOut>, CoreError> {
        let mut outputs = Vec::with_capacity(draft.outputs.len() + 1);
        for recipient in &draft.outputs {
            outputs.push(TxOut {
                value: Amount::from_sat(recipient.value),
                script_pubkey: self.script_for(&recipient.address)?,
            });
        }

        if draft.change > 0 {
            let change = draft.change_address.as_ref().ok_or_else(|| {
                CoreError::InvalidDraft("change amount set without a change address".to_string())
            })?;
            outputs.push(TxOut {
                value: Amount::from_sat(draft.change),
                script_pubkey: self.script_for(&change.address)?,
            });
        }

        Ok(outputs)
    }

    /// The unsigned transaction a `Ready` draft describes
    pub fn build_unsigned(&self, draft: &PendingTransaction) -> Result<Transaction, CoreError> {
        if !matches!(
            draft.stage,
            ComposeStage::Ready | ComposeStage::Signed | ComposeStage::PsbtBuilt
        ) {
            return Err(CoreError::InvalidDraft(format!(
                "cannot build a transaction from a {} draft",
                draft.stage
            )));
        }

        let outputs = self.draft_outputs(draft)?;
        let tx = assemble(&draft.utxos, outputs, draft.rbf);

        let spent: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>() + draft.fee;
        if spent != draft.input_total() {
            return Err(CoreError::InvalidDraft(format!(
                "outputs and fee total {} sats but inputs total {} sats",
                spent,
                draft.input_total()
            )));
        }

        Ok(tx)
    }

    /// Sign a `Ready` draft, storing the hex transaction in it
    pub fn sign_draft(
        &self,
        draft: &mut PendingTransaction,
        key: &MasterKey,
    ) -> Result<Transaction, CoreError> {
        draft.expect_stage(ComposeStage::Ready)?;
        let unsigned = self.build_unsigned(draft)?;
        let signed = self.sign_transaction(unsigned, &draft.utxos, key)?;

        let raw = bitcoin::consensus::encode::serialize_hex(&signed);
        draft.mark_signed(raw, signed.compute_txid())?;
        Ok(signed)
    }

    /// Build the unsigned PSBT of a `Ready` draft, storing it base64 encoded
    pub fn create_draft_psbt(
        &self,
        draft: &mut PendingTransaction,
        key: &MasterKey,
        previous_txs: &HashMap<Txid, Transaction>,
        change_type: AddressType,
    ) -> Result<Psbt, CoreError> {
        draft.expect_stage(ComposeStage::Ready)?;
        let unsigned = self.build_unsigned(draft)?;
        let txid = unsigned.compute_txid();

        let mut owned = Vec::new();
        if let (true, Some(change)) = (draft.change > 0, draft.change_address.as_ref()) {
            owned.push(OwnedOutput {
                vout: draft.outputs.len(),
                entry: change,
                address_type: change_type,
            });
        }

        let psbt = create_psbt(
            unsigned,
            &draft.utxos,
            &owned,
            key.fingerprint(),
            self.network,
            previous_txs,
        )?;
        draft.mark_psbt(psbt.to_string(), txid)?;
        Ok(psbt)
    }

    /// Sign every input of `tx`; `inputs` are the UTXOs it spends, in order
    ///
    /// Keys are re-derived from each UTXO's path and must reproduce the
    /// stored public key and address.
    pub fn sign_transaction(
        &self,
        mut tx: Transaction,
        inputs: &[Utxo],
        key: &MasterKey,
    ) -> Result<Transaction, CoreError> {
        if tx.input.len() != inputs.len() {
            return Err(CoreError::signing(format!(
                "{} inputs but {} UTXOs",
                tx.input.len(),
                inputs.len()
            )));
        }

        let secp = key.secp();
        let mut unlocks = Vec::with_capacity(inputs.len());
        {
            let mut cache = SighashCache::new(&tx);

            for (index, utxo) in inputs.iter().enumerate() {
                if tx.input[index].previous_output != utxo.outpoint() {
                    return Err(CoreError::signing(format!(
                        "input {} does not spend {}",
                        index,
                        utxo.outpoint()
                    )));
                }

                let path = DerivationPath::from_str(&utxo.path).map_err(CoreError::signing)?;
                let private_key = key.derive_private_key(&path)?;
                let public_key = CompressedPublicKey::from_private_key(secp, &private_key)
                    .map_err(CoreError::signing)?;
                let address = address_for_key(&public_key, utxo.address_type, self.network);
                if address.to_string() != utxo.address {
                    return Err(CoreError::signing(format!(
                        "key at {} does not control {}",
                        utxo.path, utxo.address
                    )));
                }

                let message = match utxo.address_type {
                    AddressType::P2pkh => {
                        let sighash = cache
                            .legacy_signature_hash(
                                index,
                                &address.script_pubkey(),
                                EcdsaSighashType::All.to_u32(),
                            )
                            .map_err(CoreError::signing)?;
                        Message::from_digest(sighash.to_byte_array())
                    }
                    AddressType::P2sh | AddressType::P2wpkh => {
                        let witness_program = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
                        let sighash = cache
                            .p2wpkh_signature_hash(
                                index,
                                &witness_program,
                                Amount::from_sat(utxo.value),
                                EcdsaSighashType::All,
                            )
                            .map_err(CoreError::signing)?;
                        Message::from_digest(sighash.to_byte_array())
                    }
                };

                let signature = ecdsa::Signature {
                    signature: secp.sign_ecdsa(&message, &private_key.inner),
                    sighash_type: EcdsaSighashType::All,
                };
                unlocks.push((utxo.address_type, signature, public_key));
            }
        }

        for (input, (address_type, signature, public_key)) in tx.input.iter_mut().zip(unlocks) {
            match address_type {
                AddressType::P2pkh => {
                    let sig = PushBytesBuf::try_from(signature.to_vec()).map_err(CoreError::signing)?;
                    input.script_sig = ScriptBuf::builder()
                        .push_slice(sig)
                        .push_key(&bitcoin::PublicKey::new(public_key.0))
                        .into_script();
                }
                AddressType::P2sh => {
                    let redeem = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
                    let push = PushBytesBuf::try_from(redeem.into_bytes()).map_err(CoreError::signing)?;
                    input.script_sig = ScriptBuf::builder().push_slice(push).into_script();
                    input.witness = Witness::p2wpkh(&signature, &public_key.0);
                }
                AddressType::P2wpkh => {
                    input.witness = Witness::p2wpkh(&signature, &public_key.0);
                }
            }
        }

        log::debug!("Signed {} inputs of {}", tx.input.len(), tx.compute_txid());
        Ok(tx)
    }

    /// Replace an unconfirmed transaction with one paying `fee_rate`
    ///
    /// Keeps every original input and every recipient output untouched; only
    /// the change output shrinks, and extra inputs are added when it cannot
    /// absorb the higher fee. The result must also pay the original fee plus
    /// the incremental relay fee for its own size.
    pub fn bump_fee(&self, request: FeeBumpRequest<'_>) -> Result<BuiltTransaction, CoreError> {
        let original = request.original;

        if !original.is_explicitly_rbf() {
            return Err(CoreError::NotReplaceable(format!(
                "{} does not signal replaceability",
                original.compute_txid()
            )));
        }
        if request.original_inputs.len() != original.input.len() {
            return Err(CoreError::NotReplaceable(
                "not every input of the original belongs to this wallet".to_string(),
            ));
        }

        let original_vsize = original.vsize() as u64;
        let current = fee_rate_of(request.original_fee, original_vsize);
        if request.fee_rate <= current {
            return Err(CoreError::FeeRateTooLow {
                current,
                requested: request.fee_rate,
            });
        }

        let recipients: Vec<(usize, &TxOut)> = original
            .output
            .iter()
            .enumerate()
            .filter(|(vout, _)| Some(*vout) != request.change_vout)
            .collect();

        let change_script = match request.change_vout {
            Some(vout) => original
                .output
                .get(vout)
                .map(|o| o.script_pubkey.clone())
                .ok_or_else(|| CoreError::InvalidDraft(format!("no output {} to use as change", vout)))?,
            None => self.script_for(&request.change_entry.address)?,
        };

        let mut selection_request = SelectionRequest::new(
            request.extra_candidates.clone(),
            recipients.iter().map(|(_, o)| o.value.to_sat()).sum(),
            recipients.iter().map(|(_, o)| o.script_pubkey.len()).collect(),
        );
        selection_request.required = request.original_inputs.clone();
        selection_request.change_script_len = change_script.len();
        selection_request.change_dust = dust_threshold(&change_script);
        selection_request.fee_rate = request.fee_rate;
        selection_request.replaced_fee = Some(request.original_fee);
        selection_request.preference = SelectionPreference::MinimizeFee;

        let selection = select_coins(&selection_request)?;

        let mut outputs: Vec<TxOut> = Vec::with_capacity(original.output.len() + 1);
        for (vout, output) in original.output.iter().enumerate() {
            if Some(vout) == request.change_vout {
                if selection.has_change() {
                    outputs.push(TxOut {
                        value: Amount::from_sat(selection.change),
                        script_pubkey: change_script.clone(),
                    });
                }
            } else {
                outputs.push(output.clone());
            }
        }
        if request.change_vout.is_none() && selection.has_change() {
            outputs.push(TxOut {
                value: Amount::from_sat(selection.change),
                script_pubkey: change_script,
            });
        }

        log::info!(
            "Fee bump of {}: {} -> {} sat/vB, fee {} sats",
            original.compute_txid(),
            current,
            request.fee_rate,
            selection.fee
        );

        Ok(BuiltTransaction {
            tx: assemble(&selection.inputs, outputs, true),
            inputs: selection.inputs,
            fee: selection.fee,
            vsize: selection.vsize,
            change: selection.change,
        })
    }

    /// Child-pays-for-parent: spend the parent's wallet-owned outputs so that
    /// parent and child together pay `fee_rate`
    ///
    /// `owned_outputs` are the parent's unspent outputs that belong to the
    /// wallet; all of them are swept into one output at `destination`.
    pub fn boost_cpfp(
        &self,
        parent: &Transaction,
        parent_fee: u64,
        owned_outputs: &[Utxo],
        destination: &Address,
        fee_rate: u64,
    ) -> Result<BuiltTransaction, CoreError> {
        let parent_txid = parent.compute_txid();
        let mut inputs: Vec<Utxo> = owned_outputs
            .iter()
            .filter(|u| u.txid == parent_txid)
            .cloned()
            .collect();
        if inputs.is_empty() {
            return Err(CoreError::NoEligibleInputsForBoost);
        }
        inputs.sort_by_key(|u| u.vout);

        let script = destination.script_pubkey();
        let types: Vec<AddressType> = inputs.iter().map(|u| u.address_type).collect();
        let child_vsize = estimate_vsize(&types, &[script.len()]);
        let parent_vsize = parent.vsize() as u64;

        let package_fee = fee_for(parent_vsize.saturating_add(child_vsize), fee_rate);
        let fee = package_fee
            .saturating_sub(parent_fee)
            .max(fee_for(child_vsize, MIN_FEE_RATE));

        let input_total: u64 = inputs.iter().map(|u| u.value).sum();
        if input_total <= fee {
            return Err(CoreError::InsufficientFundsForFee {
                available: input_total,
                fee,
            });
        }

        let value = input_total - fee;
        let threshold = dust_threshold(&script);
        if value < threshold {
            return Err(CoreError::DustOutput { value, threshold });
        }

        log::info!(
            "CPFP child for {}: {} inputs, fee {} sats at {} sat/vB package rate",
            parent_txid,
            inputs.len(),
            fee,
            fee_rate
        );

        let outputs = vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script,
        }];

        Ok(BuiltTransaction {
            tx: assemble(&inputs, outputs, true),
            inputs,
            fee,
            vsize: child_vsize,
            change: value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::Recipient;
    use crate::{AddressBook, Chain};

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn wallet() -> (MasterKey, AddressBook) {
        let key = MasterKey::from_phrase(TEST_MNEMONIC, "", Network::Regtest).unwrap();
        let book = AddressBook::new(Network::Regtest);
        (key, book)
    }

    fn funded(
        key: &MasterKey,
        book: &mut AddressBook,
        address_type: AddressType,
        index: u32,
        txid_byte: u8,
        value: u64,
    ) -> Utxo {
        let entry = book
            .get_or_create(key, address_type, Chain::Receive, Some(index))
            .unwrap();
        Utxo {
            address: entry.address,
            script_hash: entry.script_hash,
            public_key: entry.public_key,
            address_type,
            index,
            path: entry.path,
            txid: Txid::from_byte_array([txid_byte; 32]),
            vout: 0,
            height: 100,
            value,
        }
    }

    #[test]
    fn test_compose_and_sign_mixed_inputs() {
        let (key, mut book) = wallet();
        let utxos = vec![
            funded(&key, &mut book, AddressType::P2pkh, 0, 1, 20_000),
            funded(&key, &mut book, AddressType::P2sh, 0, 2, 20_000),
            funded(&key, &mut book, AddressType::P2wpkh, 0, 3, 20_000),
        ];
        let change = book
            .get_or_create(&key, AddressType::P2wpkh, Chain::Change, None)
            .unwrap();

        let mut draft = PendingTransaction::new();
        draft
            .set_outputs(vec![Recipient::new("bcrt1q9u62588spffmq4dzjxsr5l297znf3z6jkgnhsw", 50_000)])
            .unwrap();
        draft.set_fee_rate(2).unwrap();

        let builder = TransactionBuilder::new(Network::Regtest);
        builder
            .compose(&mut draft, &utxos, &change, AddressType::P2wpkh)
            .unwrap();
        assert_eq!(draft.stage, ComposeStage::Ready);
        assert_eq!(draft.utxos.len(), 3);

        let signed = builder.sign_draft(&mut draft, &key).unwrap();
        assert_eq!(draft.stage, ComposeStage::Signed);

        // Legacy input: scriptSig only
        assert!(!signed.input[0].script_sig.is_empty());
        assert!(signed.input[0].witness.is_empty());
        // Nested segwit: redeem script push plus witness
        assert_eq!(signed.input[1].script_sig.len(), 23);
        assert_eq!(signed.input[1].witness.len(), 2);
        // Native segwit: witness only
        assert!(signed.input[2].script_sig.is_empty());
        assert_eq!(signed.input[2].witness.len(), 2);

        // Estimate assumes 72-byte signatures, so it is never below the real size
        assert!(draft.vsize >= signed.vsize() as u64);
        assert!(draft.vsize - (signed.vsize() as u64) <= 3);

        let total_out: u64 = signed.output.iter().map(|o| o.value.to_sat()).sum();
        assert_eq!(total_out + draft.fee, 60_000);
        assert!(signed.input.iter().all(|i| i.sequence == Sequence::ENABLE_RBF_NO_LOCKTIME));
    }

    #[test]
    fn test_compose_rejects_dust_and_foreign_address() {
        let (key, mut book) = wallet();
        let utxos = vec![funded(&key, &mut book, AddressType::P2wpkh, 0, 1, 20_000)];
        let change = book
            .get_or_create(&key, AddressType::P2wpkh, Chain::Change, None)
            .unwrap();
        let builder = TransactionBuilder::new(Network::Regtest);

        let mut draft = PendingTransaction::new();
        draft
            .set_outputs(vec![Recipient::new("bcrt1q9u62588spffmq4dzjxsr5l297znf3z6jkgnhsw", 293)])
            .unwrap();
        let result = builder.compose(&mut draft, &utxos, &change, AddressType::P2wpkh);
        assert!(matches!(result, Err(CoreError::DustOutput { threshold: 294, .. })));
        assert_eq!(draft.stage, ComposeStage::Configuring);

        draft
            .set_outputs(vec![Recipient::new("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", 5_000)])
            .unwrap();
        let result = builder.compose(&mut draft, &utxos, &change, AddressType::P2wpkh);
        assert!(matches!(result, Err(CoreError::InvalidAddress(_))));
    }

    #[test]
    fn test_send_max_sets_output_value() {
        let (key, mut book) = wallet();
        let utxos = vec![
            funded(&key, &mut book, AddressType::P2wpkh, 0, 1, 10_000),
            funded(&key, &mut book, AddressType::P2wpkh, 1, 2, 123_456),
        ];
        let change = book
            .get_or_create(&key, AddressType::P2wpkh, Chain::Change, None)
            .unwrap();
        let builder = TransactionBuilder::new(Network::Regtest);

        let mut draft = PendingTransaction::new();
        draft
            .set_outputs(vec![Recipient::new("2MuKeQzUHhUQWUZgx5AuNWoQ7YWx6vsXxrv", 0)])
            .unwrap();
        draft.set_max(true).unwrap();
        builder
            .compose(&mut draft, &utxos, &change, AddressType::P2wpkh)
            .unwrap();

        assert_eq!(draft.change, 0);
        assert!(draft.change_address.is_none());
        assert_eq!(draft.outputs[0].value + draft.fee, 133_456);

        let tx = builder.build_unsigned(&draft).unwrap();
        assert_eq!(tx.output.len(), 1);
    }

    #[test]
    fn test_bump_fee_shrinks_change_only() {
        let (key, mut book) = wallet();
        let utxos = vec![funded(&key, &mut book, AddressType::P2wpkh, 0, 1, 100_000)];
        let change = book
            .get_or_create(&key, AddressType::P2wpkh, Chain::Change, None)
            .unwrap();
        let builder = TransactionBuilder::new(Network::Regtest);

        let mut draft = PendingTransaction::new();
        draft
            .set_outputs(vec![Recipient::new("2MuKeQzUHhUQWUZgx5AuNWoQ7YWx6vsXxrv", 30_000)])
            .unwrap();
        builder
            .compose(&mut draft, &utxos, &change, AddressType::P2wpkh)
            .unwrap();
        let original_fee = draft.fee;
        let original = builder.sign_draft(&mut draft, &key).unwrap();

        let bump = builder
            .bump_fee(FeeBumpRequest {
                original: &original,
                original_fee,
                original_inputs: draft.utxos.clone(),
                change_vout: Some(1),
                change_entry: &change,
                change_type: AddressType::P2wpkh,
                extra_candidates: vec![],
                fee_rate: 10,
            })
            .unwrap();

        assert_eq!(bump.tx.input[0].previous_output, original.input[0].previous_output);
        assert_eq!(bump.tx.output[0], original.output[0]);
        assert!(bump.tx.output[1].value < original.output[1].value);
        assert_eq!(bump.fee, bump.vsize * 10);
        assert!(bump.fee >= original_fee + bump.vsize);

        let too_low = builder.bump_fee(FeeBumpRequest {
            original: &original,
            original_fee,
            original_inputs: draft.utxos.clone(),
            change_vout: Some(1),
            change_entry: &change,
            change_type: AddressType::P2wpkh,
            extra_candidates: vec![],
            fee_rate: 1,
        });
        assert!(matches!(too_low, Err(CoreError::FeeRateTooLow { .. })));
    }

    #[test]
    fn test_bump_fee_requires_rbf_signal() {
        let (key, mut book) = wallet();
        let utxos = vec![funded(&key, &mut book, AddressType::P2wpkh, 0, 1, 100_000)];
        let change = book
            .get_or_create(&key, AddressType::P2wpkh, Chain::Change, None)
            .unwrap();
        let builder = TransactionBuilder::new(Network::Regtest);

        let mut draft = PendingTransaction::new();
        draft
            .set_outputs(vec![Recipient::new("2MuKeQzUHhUQWUZgx5AuNWoQ7YWx6vsXxrv", 30_000)])
            .unwrap();
        draft.set_rbf(false).unwrap();
        builder
            .compose(&mut draft, &utxos, &change, AddressType::P2wpkh)
            .unwrap();
        let original = builder.sign_draft(&mut draft, &key).unwrap();

        let result = builder.bump_fee(FeeBumpRequest {
            original: &original,
            original_fee: draft.fee,
            original_inputs: draft.utxos.clone(),
            change_vout: Some(1),
            change_entry: &change,
            change_type: AddressType::P2wpkh,
            extra_candidates: vec![],
            fee_rate: 20,
        });
        assert!(matches!(result, Err(CoreError::NotReplaceable(_))));
        assert!(!BoostOptions::evaluate(&original, false, true, true).rbf);
    }

    #[test]
    fn test_cpfp_pays_for_package() {
        let (key, mut book) = wallet();
        let parent_input = funded(&key, &mut book, AddressType::P2wpkh, 0, 1, 50_000);
        let change = book
            .get_or_create(&key, AddressType::P2wpkh, Chain::Change, None)
            .unwrap();
        let builder = TransactionBuilder::new(Network::Regtest);

        let mut draft = PendingTransaction::new();
        draft
            .set_outputs(vec![Recipient::new("2MuKeQzUHhUQWUZgx5AuNWoQ7YWx6vsXxrv", 20_000)])
            .unwrap();
        builder
            .compose(&mut draft, &[parent_input], &change, AddressType::P2wpkh)
            .unwrap();
        let parent_fee = draft.fee;
        let parent = builder.sign_draft(&mut draft, &key).unwrap();
        let parent_txid = parent.compute_txid();

        let owned_change = Utxo {
            address: change.address.clone(),
            script_hash: change.script_hash.clone(),
            public_key: change.public_key.clone(),
            address_type: AddressType::P2wpkh,
            index: change.index,
            path: change.path.clone(),
            txid: parent_txid,
            vout: 1,
            height: 0,
            value: draft.change,
        };

        let destination = validate_address(&change.address, Network::Regtest).unwrap();
        let child = builder
            .boost_cpfp(&parent, parent_fee, &[owned_change.clone()], &destination, 20)
            .unwrap();

        let package_vsize = parent.vsize() as u64 + child.vsize;
        assert_eq!(child.fee + parent_fee, 20 * package_vsize);
        assert_eq!(child.change + child.fee, owned_change.value);

        let signed = builder.sign_transaction(child.tx, &child.inputs, &key).unwrap();
        assert_eq!(signed.input[0].previous_output.txid, parent_txid);

        let none = builder.boost_cpfp(&parent, parent_fee, &[], &destination, 20);
        assert!(matches!(none, Err(CoreError::NoEligibleInputsForBoost)));

        let absurd = builder.boost_cpfp(&parent, parent_fee, &[owned_change], &destination, u64::MAX);
        assert!(matches!(absurd, Err(CoreError::InsufficientFundsForFee { .. })));
    }
}
