//! Coin selection
//!
//! Every mode produces a selection whose fee is recomputed from the exact
//! input and output count it ends up with, so the result never carries a
//! stale estimate. A change output is added only when the remainder after
//! paying for it is at least its dust threshold; otherwise the remainder is
//! left to the fee.
//!
//! Ordering is a documented total order, never map iteration order:
//! - largest first: value descending, then older first, then outpoint
//! - smallest first: value ascending, then older first, then outpoint
//!
//! "Older" means lower confirmation height; unconfirmed outputs (height 0)
//! count as the newest.

use bitcoin::OutPoint;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::fees::{estimate_vsize, fee_for, INCREMENTAL_RELAY_FEE_RATE, MIN_FEE_RATE};
use crate::{AddressType, CoreError, Utxo};

/// How inputs are picked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPreference {
    /// Caller supplies the inputs
    Manual,
    /// Spend many small outputs
    Consolidate,
    /// Prefer a single input that needs no change
    Privacy,
    /// Fewest, largest inputs
    #[default]
    MinimizeFee,
}

/// Inputs to one selection run
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    /// Eligible outputs, blacklist already applied
    pub candidates: Vec<Utxo>,
    /// Inputs that must be spent regardless of preference, in order
    pub required: Vec<Utxo>,
    /// Sum of the recipient outputs
    pub target: u64,
    /// Script lengths of the recipient outputs
    pub output_script_lens: Vec<usize>,
    pub change_script_len: usize,
    pub change_dust: u64,
    /// sat/vB
    pub fee_rate: u64,
    /// Fee of the transaction being replaced, if any; the result then pays
    /// at least that plus the incremental relay fee for its own size
    pub replaced_fee: Option<u64>,
    pub preference: SelectionPreference,
    /// Inputs chosen by the user for [`SelectionPreference::Manual`]
    pub manual: Vec<OutPoint>,
}

impl SelectionRequest {
    pub fn new(candidates: Vec<Utxo>, target: u64, output_script_lens: Vec<usize>) -> Self {
        Self {
            candidates,
            required: Vec::new(),
            target,
            output_script_lens,
            change_script_len: crate::fees::script_len(AddressType::P2wpkh),
            change_dust: 0,
            fee_rate: MIN_FEE_RATE,
            replaced_fee: None,
            preference: SelectionPreference::default(),
            manual: Vec::new(),
        }
    }
}

/// Outcome of coin selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    pub input_total: u64,
    pub fee: u64,
    pub vsize: u64,
    /// 0 when no change output is created
    pub change: u64,
}

impl Selection {
    pub fn has_change(&self) -> bool {
        self.change > 0
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(Utxo::outpoint).collect()
    }
}

fn age_rank(utxo: &Utxo) -> u32 {
    if utxo.height == 0 {
        u32::MAX
    } else {
        utxo.height
    }
}

fn older_first(a: &Utxo, b: &Utxo) -> Ordering {
    age_rank(a)
        .cmp(&age_rank(b))
        .then_with(|| a.outpoint().cmp(&b.outpoint()))
}

pub fn largest_first(a: &Utxo, b: &Utxo) -> Ordering {
    b.value.cmp(&a.value).then_with(|| older_first(a, b))
}

pub fn smallest_first(a: &Utxo, b: &Utxo) -> Ordering {
    a.value.cmp(&b.value).then_with(|| older_first(a, b))
}

struct Evaluator<'a> {
    request: &'a SelectionRequest,
}

impl Evaluator<'_> {
    fn fee(&self, input_types: &[AddressType], with_change: bool) -> (u64, u64) {
        let mut outputs = self.request.output_script_lens.clone();
        if with_change {
            outputs.push(self.request.change_script_len);
        }
        let vsize = estimate_vsize(input_types, &outputs);
        (required_fee(self.request, vsize), vsize)
    }

    /// Fee and change for exactly these inputs, `None` if they fall short
    fn finalize(&self, inputs: &[Utxo]) -> Option<Selection> {
        let input_total: u64 = inputs.iter().map(|u| u.value).sum();
        let types: Vec<AddressType> = inputs.iter().map(|u| u.address_type).collect();

        let (fee_without, vsize_without) = self.fee(&types, false);
        let needed = self.request.target.checked_add(fee_without)?;
        if inputs.is_empty() || input_total < needed {
            return None;
        }

        let (fee_with, vsize_with) = self.fee(&types, true);
        let change = input_total
            .checked_sub(self.request.target)
            .and_then(|rest| rest.checked_sub(fee_with));

        match change {
            Some(change) if change >= self.request.change_dust.max(1) => Some(Selection {
                inputs: inputs.to_vec(),
                input_total,
                fee: fee_with,
                vsize: vsize_with,
                change,
            }),
            _ => Some(Selection {
                inputs: inputs.to_vec(),
                input_total,
                fee: input_total - self.request.target,
                vsize: vsize_without,
                change: 0,
            }),
        }
    }

    /// Add candidates in order until the selection covers target and fee
    fn accumulate(&self, ordered: &[Utxo]) -> Option<Selection> {
        let mut inputs = self.request.required.clone();
        if let Some(selection) = self.finalize(&inputs) {
            return Some(selection);
        }

        for utxo in ordered {
            inputs.push(utxo.clone());
            if let Some(selection) = self.finalize(&inputs) {
                return Some(selection);
            }
        }
        None
    }

    fn shortfall(&self, pool: &[Utxo]) -> CoreError {
        let mut everything = self.request.required.clone();
        everything.extend(pool.iter().cloned());
        let types: Vec<AddressType> = everything.iter().map(|u| u.address_type).collect();
        let (fee, _) = self.fee(&types, false);

        CoreError::InsufficientFunds {
            needed: self.request.target.saturating_add(fee),
            available: everything.iter().map(|u| u.value).sum(),
        }
    }
}

fn required_fee(request: &SelectionRequest, vsize: u64) -> u64 {
    let fee = fee_for(vsize, request.fee_rate);
    match request.replaced_fee {
        Some(replaced) => {
            fee.max(replaced.saturating_add(fee_for(vsize, INCREMENTAL_RELAY_FEE_RATE)))
        }
        None => fee,
    }
}

fn unrequired(request: &SelectionRequest) -> Vec<Utxo> {
    request
        .candidates
        .iter()
        .filter(|u| !request.required.iter().any(|r| r.outpoint() == u.outpoint()))
        .cloned()
        .collect()
}

/// Pick inputs covering `target` plus the fee for the resulting transaction
pub fn select_coins(request: &SelectionRequest) -> Result<Selection, CoreError> {
    let evaluator = Evaluator { request };
    let mut pool = unrequired(request);

    let selection = match request.preference {
        SelectionPreference::Manual => {
            let chosen = manual_inputs(request)?;
            return evaluator
                .finalize(&[request.required.clone(), chosen.clone()].concat())
                .ok_or_else(|| evaluator.shortfall(&chosen));
        }
        SelectionPreference::MinimizeFee => {
            pool.sort_by(largest_first);
            evaluator.accumulate(&pool)
        }
        SelectionPreference::Consolidate => {
            pool.sort_by(smallest_first);
            evaluator.accumulate(&pool)
        }
        SelectionPreference::Privacy => {
            pool.sort_by(smallest_first);
            privacy_single(&evaluator, &pool).or_else(|| {
                pool.sort_by(largest_first);
                evaluator.accumulate(&pool)
            })
        }
    };

    selection.ok_or_else(|| evaluator.shortfall(&pool))
}

/// A single input with no change if one exists, else the smallest single
/// input that covers the payment. `pool` is sorted smallest first.
fn privacy_single(evaluator: &Evaluator<'_>, pool: &[Utxo]) -> Option<Selection> {
    if !evaluator.request.required.is_empty() {
        return None;
    }

    let singles: Vec<Selection> = pool
        .iter()
        .filter_map(|utxo| evaluator.finalize(std::slice::from_ref(utxo)))
        .collect();

    singles
        .iter()
        .find(|s| !s.has_change())
        .or_else(|| singles.first())
        .cloned()
}

fn manual_inputs(request: &SelectionRequest) -> Result<Vec<Utxo>, CoreError> {
    if request.manual.is_empty() && request.required.is_empty() {
        return Err(CoreError::InvalidDraft("no inputs selected".to_string()));
    }

    request
        .manual
        .iter()
        .filter(|outpoint| !request.required.iter().any(|r| r.outpoint() == **outpoint))
        .map(|outpoint| {
            request
                .candidates
                .iter()
                .find(|u| u.outpoint() == *outpoint)
                .cloned()
                .ok_or_else(|| {
                    CoreError::InvalidDraft(format!("{} is not a spendable output", outpoint))
                })
        })
        .collect()
}

/// Spend every candidate into a single output worth the inputs minus the fee
///
/// With [`SelectionPreference::Manual`] only the chosen inputs are swept.
pub fn select_max(request: &SelectionRequest, output_dust: u64) -> Result<Selection, CoreError> {
    if request.output_script_lens.len() != 1 {
        return Err(CoreError::InvalidDraft(
            "send-max requires exactly one output".to_string(),
        ));
    }

    let mut inputs = request.required.clone();
    if request.preference == SelectionPreference::Manual {
        inputs.extend(manual_inputs(request)?);
    } else {
        let mut pool = unrequired(request);
        pool.sort_by(older_first);
        inputs.extend(pool);
    }

    let input_total: u64 = inputs.iter().map(|u| u.value).sum();
    let types: Vec<AddressType> = inputs.iter().map(|u| u.address_type).collect();
    let vsize = estimate_vsize(&types, &request.output_script_lens);
    let fee = required_fee(request, vsize);

    if inputs.is_empty() || input_total <= fee {
        return Err(CoreError::InsufficientFundsForFee {
            available: input_total,
            fee,
        });
    }

    let value = input_total - fee;
    if value < output_dust {
        return Err(CoreError::DustOutput {
            value,
            threshold: output_dust,
        });
    }

    Ok(Selection {
        inputs,
        input_total,
        fee,
        vsize,
        change: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fees::estimate_fee;
    use crate::utxo::tests::utxo;

    fn request(candidates: Vec<Utxo>, target: u64) -> SelectionRequest {
        let mut request = SelectionRequest::new(candidates, target, vec![22]);
        request.change_dust = 294;
        request
    }

    #[test]
    fn test_minimize_fee_takes_largest() {
        let pool = vec![utxo(1, 0, 5_000, 10), utxo(2, 0, 50_000, 10), utxo(3, 0, 20_000, 10)];
        let selection = select_coins(&request(pool, 10_000)).unwrap();

        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value, 50_000);
        assert_eq!(selection.fee, 141);
        assert_eq!(selection.change, 50_000 - 10_000 - 141);
    }

    #[test]
    fn test_consolidate_takes_smallest() {
        let pool = vec![utxo(1, 0, 5_000, 10), utxo(2, 0, 50_000, 10), utxo(3, 0, 8_000, 10)];
        let mut req = request(pool, 10_000);
        req.preference = SelectionPreference::Consolidate;
        let selection = select_coins(&req).unwrap();

        let values: Vec<u64> = selection.inputs.iter().map(|u| u.value).collect();
        assert_eq!(values, vec![5_000, 8_000]);
    }

    #[test]
    fn test_privacy_prefers_changeless_single() {
        // 10_200 leaves 90 sats over target and fee: below dust, so no change
        let pool = vec![utxo(1, 0, 10_300, 10), utxo(2, 0, 60_000, 10), utxo(3, 0, 10_200, 10)];
        let mut req = request(pool, 10_000);
        req.preference = SelectionPreference::Privacy;
        let selection = select_coins(&req).unwrap();

        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value, 10_200);
        assert!(!selection.has_change());
        assert_eq!(selection.fee, 200);
    }

    #[test]
    fn test_ties_broken_by_age_then_outpoint() {
        let pool = vec![utxo(3, 0, 50_000, 0), utxo(2, 0, 50_000, 20), utxo(1, 1, 50_000, 20)];
        let selection = select_coins(&request(pool, 10_000)).unwrap();
        assert_eq!(selection.inputs[0].outpoint(), utxo(1, 1, 0, 0).outpoint());
    }

    #[test]
    fn test_dust_change_folded_into_fee() {
        let pool = vec![utxo(1, 0, 10_400, 1)];
        let selection = select_coins(&request(pool, 10_000)).unwrap();
        assert_eq!(selection.change, 0);
        assert_eq!(selection.fee, 400);
        assert_eq!(selection.vsize, 110);
    }

    #[test]
    fn test_insufficient_funds() {
        let pool = vec![utxo(1, 0, 1_000, 1), utxo(2, 0, 2_000, 1)];
        let result = select_coins(&request(pool, 5_000));
        assert!(matches!(
            result,
            Err(CoreError::InsufficientFunds { available: 3_000, .. })
        ));
    }

    #[test]
    fn test_manual_selection() {
        let pool = vec![utxo(1, 0, 30_000, 1), utxo(2, 0, 30_000, 1)];
        let mut req = request(pool, 10_000);
        req.preference = SelectionPreference::Manual;
        req.manual = vec![utxo(2, 0, 0, 0).outpoint()];
        let selection = select_coins(&req).unwrap();
        assert_eq!(selection.outpoints(), vec![utxo(2, 0, 0, 0).outpoint()]);

        req.manual = vec![utxo(9, 0, 0, 0).outpoint()];
        assert!(matches!(select_coins(&req), Err(CoreError::InvalidDraft(_))));
    }

    #[test]
    fn test_selection_always_covers_recomputed_fee() {
        let pool: Vec<Utxo> = (1..=30u8)
            .map(|i| utxo(i, u32::from(i % 3), 700 + u64::from(i) * 1_337, u32::from(i)))
            .collect();
        let total: u64 = pool.iter().map(|u| u.value).sum();

        for preference in [
            SelectionPreference::MinimizeFee,
            SelectionPreference::Consolidate,
            SelectionPreference::Privacy,
        ] {
            for fee_rate in [1, 5, 25] {
                for target in [1_000u64, 9_999, 60_000, 250_000, total] {
                    let mut req = request(pool.clone(), target);
                    req.preference = preference;
                    req.fee_rate = fee_rate;

                    let Ok(selection) = select_coins(&req) else {
                        let types = vec![AddressType::P2wpkh; pool.len()];
                        assert!(total < target + estimate_fee(&types, &[22], fee_rate));
                        continue;
                    };

                    let types: Vec<AddressType> =
                        selection.inputs.iter().map(|u| u.address_type).collect();
                    let outputs: &[usize] = if selection.has_change() { &[22, 22] } else { &[22] };
                    let fee = estimate_fee(&types, outputs, fee_rate);

                    assert!(selection.fee >= fee);
                    assert_eq!(selection.input_total, target + selection.fee + selection.change);
                }
            }
        }
    }

    #[test]
    fn test_send_max_is_exact() {
        let pool = vec![utxo(1, 0, 10_000, 1), utxo(2, 0, 123_456, 1)];
        let selection = select_max(&request(pool, 0), 294).unwrap();

        assert_eq!(selection.inputs.len(), 2);
        assert!(!selection.has_change());
        // 42 + 2 * 272 + 124 = 710 wu
        assert_eq!(selection.fee, 178);
        assert_eq!(selection.input_total - selection.fee, 133_278);
    }

    #[test]
    fn test_absurd_fee_rate_is_unaffordable() {
        let pool = vec![utxo(1, 0, 50_000, 1), utxo(2, 0, 20_000, 1)];
        let mut req = request(pool, 10_000);
        req.fee_rate = u64::MAX / 100;

        assert!(matches!(
            select_coins(&req),
            Err(CoreError::InsufficientFunds { needed: u64::MAX, available: 70_000 })
        ));

        req.target = 0;
        assert!(matches!(
            select_max(&req, 294),
            Err(CoreError::InsufficientFundsForFee { fee: u64::MAX, .. })
        ));

        req.target = u64::MAX;
        req.fee_rate = 1;
        assert!(matches!(select_coins(&req), Err(CoreError::InsufficientFunds { .. })));
    }

    #[test]
    fn test_replacement_fee_saturates() {
        let pool = vec![utxo(1, 0, 50_000, 1)];
        let mut req = request(pool, 10_000);
        req.replaced_fee = Some(u64::MAX - 10);
        assert!(matches!(select_coins(&req), Err(CoreError::InsufficientFunds { .. })));
    }

    #[test]
    fn test_send_max_fee_exceeds_funds() {
        let pool = vec![utxo(1, 0, 100, 1)];
        let result = select_max(&request(pool, 0), 294);
        assert!(matches!(result, Err(CoreError::InsufficientFundsForFee { .. })));
    }
}
