//! Draft (pending) transaction and its compose state machine
//!
//! ```text
//! Idle -> Configuring -> Selecting -> Ready -> Signed | PsbtBuilt -> Broadcast -> Idle
//! ```
//!
//! Any edit to outputs, inputs, fee rate or send-max sends the draft back to
//! `Configuring` and drops the previous selection and signatures.

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::coin_selection::{Selection, SelectionPreference};
use crate::fees::MIN_FEE_RATE;
use crate::{AddressEntry, CoreError, Utxo};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposeStage {
    #[default]
    Idle,
    Configuring,
    Selecting,
    Ready,
    Signed,
    PsbtBuilt,
    Broadcast,
}

impl fmt::Display for ComposeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComposeStage::Idle => "idle",
            ComposeStage::Configuring => "configuring",
            ComposeStage::Selecting => "selecting",
            ComposeStage::Ready => "ready",
            ComposeStage::Signed => "signed",
            ComposeStage::PsbtBuilt => "psbt_built",
            ComposeStage::Broadcast => "broadcast",
        };
        f.write_str(name)
    }
}

/// One payment output of a draft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    /// Ignored for send-max drafts, where it is computed
    pub value: u64,
}

impl Recipient {
    pub fn new(address: impl Into<String>, value: u64) -> Self {
        Self {
            address: address.into(),
            value,
        }
    }
}

/// In-progress send composition of one (wallet, network)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub stage: ComposeStage,
    pub outputs: Vec<Recipient>,
    /// Selected inputs, in transaction order
    pub utxos: Vec<Utxo>,
    /// User-chosen inputs for manual selection
    pub manual_inputs: Vec<OutPoint>,
    pub preference: SelectionPreference,
    pub change_address: Option<AddressEntry>,
    /// 0 when there is no change output
    pub change: u64,
    pub fee: u64,
    pub fee_rate: u64,
    pub vsize: u64,
    pub message: String,
    pub label: String,
    pub rbf: bool,
    pub max: bool,
    /// Signed transaction, hex
    pub raw_tx: Option<String>,
    /// Unsigned PSBT, base64
    pub psbt: Option<String>,
    pub txid: Option<Txid>,
}

impl Default for PendingTransaction {
    fn default() -> Self {
        Self {
            stage: ComposeStage::Idle,
            outputs: Vec::new(),
            utxos: Vec::new(),
            manual_inputs: Vec::new(),
            preference: SelectionPreference::default(),
            change_address: None,
            change: 0,
            fee: 0,
            fee_rate: MIN_FEE_RATE,
            vsize: 0,
            message: String::new(),
            label: String::new(),
            rbf: true,
            max: false,
            raw_tx: None,
            psbt: None,
            txid: None,
        }
    }
}

impl PendingTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    fn reconfigure(&mut self) {
        self.stage = ComposeStage::Configuring;
        self.utxos.clear();
        self.change = 0;
        self.fee = 0;
        self.vsize = 0;
        self.raw_tx = None;
        self.psbt = None;
        self.txid = None;
    }

    fn ensure_editable(&self) -> Result<(), CoreError> {
        if self.stage == ComposeStage::Broadcast {
            return Err(CoreError::InvalidDraft(
                "draft was already broadcast; reset it first".to_string(),
            ));
        }
        Ok(())
    }

    pub fn set_outputs(&mut self, outputs: Vec<Recipient>) -> Result<(), CoreError> {
        self.ensure_editable()?;
        self.outputs = outputs;
        self.reconfigure();
        Ok(())
    }

    pub fn set_fee_rate(&mut self, fee_rate: u64) -> Result<(), CoreError> {
        self.ensure_editable()?;
        self.fee_rate = fee_rate.max(MIN_FEE_RATE);
        self.reconfigure();
        Ok(())
    }

    pub fn set_rbf(&mut self, rbf: bool) -> Result<(), CoreError> {
        self.ensure_editable()?;
        self.rbf = rbf;
        self.reconfigure();
        Ok(())
    }

    pub fn set_max(&mut self, max: bool) -> Result<(), CoreError> {
        self.ensure_editable()?;
        self.max = max;
        self.reconfigure();
        Ok(())
    }

    pub fn set_preference(&mut self, preference: SelectionPreference) -> Result<(), CoreError> {
        self.ensure_editable()?;
        self.preference = preference;
        self.reconfigure();
        Ok(())
    }

    /// Choose inputs by hand; switches the draft to manual selection
    pub fn select_inputs(&mut self, outpoints: Vec<OutPoint>) -> Result<(), CoreError> {
        self.ensure_editable()?;
        self.manual_inputs = outpoints;
        self.preference = SelectionPreference::Manual;
        self.reconfigure();
        Ok(())
    }

    /// Message and label do not affect the transaction bytes
    pub fn set_message(&mut self, message: impl Into<String>, label: impl Into<String>) {
        self.message = message.into();
        self.label = label.into();
    }

    pub fn begin_selection(&mut self) -> Result<(), CoreError> {
        self.ensure_editable()?;
        if self.outputs.is_empty() {
            return Err(CoreError::InvalidDraft("no outputs set".to_string()));
        }
        self.reconfigure();
        self.stage = ComposeStage::Selecting;
        Ok(())
    }

    pub fn apply_selection(
        &mut self,
        selection: Selection,
        change_address: Option<AddressEntry>,
    ) -> Result<(), CoreError> {
        self.expect_stage(ComposeStage::Selecting)?;
        self.utxos = selection.inputs;
        self.fee = selection.fee;
        self.vsize = selection.vsize;
        self.change = selection.change;
        self.change_address = change_address.filter(|_| selection.change > 0);
        self.stage = ComposeStage::Ready;
        Ok(())
    }

    /// Drop back after a failed selection
    pub fn abort_selection(&mut self) {
        if self.stage == ComposeStage::Selecting {
            self.stage = ComposeStage::Configuring;
        }
    }

    pub fn mark_signed(&mut self, raw_tx: String, txid: Txid) -> Result<(), CoreError> {
        self.expect_stage(ComposeStage::Ready)?;
        self.raw_tx = Some(raw_tx);
        self.txid = Some(txid);
        self.stage = ComposeStage::Signed;
        Ok(())
    }

    pub fn mark_psbt(&mut self, psbt: String, txid: Txid) -> Result<(), CoreError> {
        self.expect_stage(ComposeStage::Ready)?;
        self.psbt = Some(psbt);
        self.txid = Some(txid);
        self.stage = ComposeStage::PsbtBuilt;
        Ok(())
    }

    pub fn mark_broadcast(&mut self) -> Result<(), CoreError> {
        self.expect_stage(ComposeStage::Signed)?;
        self.stage = ComposeStage::Broadcast;
        Ok(())
    }

    /// Back to `Idle`, keeping nothing
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn expect_stage(&self, stage: ComposeStage) -> Result<(), CoreError> {
        if self.stage != stage {
            return Err(CoreError::InvalidDraft(format!(
                "expected draft stage {}, found {}",
                stage, self.stage
            )));
        }
        Ok(())
    }

    /// Sum of requested output values
    /// Sum of recipient values, saturating like the fee math
    pub fn target(&self) -> u64 {
        self.outputs
            .iter()
            .fold(0u64, |total, o| total.saturating_add(o.value))
    }

    pub fn input_total(&self) -> u64 {
        self.utxos.iter().map(|u| u.value).sum()
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.utxos.iter().map(Utxo::outpoint).collect()
    }
}
