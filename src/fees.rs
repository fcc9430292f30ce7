//! Transaction size, fee and dust model
//!
//! Sizes are computed in weight units and rounded up to virtual bytes once,
//! so a fee derived from an input/output count is exact for the transaction
//! the builder actually produces (signatures assumed at their 72-byte
//! maximum).

use bitcoin::Script;
use serde::{Deserialize, Serialize};

use crate::AddressType;

/// Lowest fee rate the builder will use
pub const MIN_FEE_RATE: u64 = 1;

/// Minimum fee rate increase a replacement must pay for its own size (sat/vB)
pub const INCREMENTAL_RELAY_FEE_RATE: u64 = 1;

/// Relay fee rate dust thresholds are computed against (sat/vB)
const DUST_RELAY_FEE_RATE: u64 = 3;

const WITNESS_SCALE: u64 = 4;

/// version + locktime
const TX_FIXED_BYTES: u64 = 8;

/// outpoint (36) + sequence (4)
const INPUT_FIXED_BYTES: u64 = 40;

/// DER signature (max 72 incl. sighash byte) + compressed pubkey, with push opcodes
const SIG_AND_KEY_PUSH_BYTES: u64 = 1 + 72 + 1 + 33;

fn compact_size_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Weight of one input spending an output of the given type
pub fn input_weight(address_type: AddressType) -> u64 {
    match address_type {
        AddressType::P2pkh => {
            let script_sig = SIG_AND_KEY_PUSH_BYTES;
            (INPUT_FIXED_BYTES + compact_size_len(script_sig) + script_sig) * WITNESS_SCALE
        }
        AddressType::P2sh => {
            // scriptSig pushes the 22-byte P2WPKH redeem script
            let script_sig = 1 + 22;
            let witness = 1 + SIG_AND_KEY_PUSH_BYTES;
            (INPUT_FIXED_BYTES + compact_size_len(script_sig) + script_sig) * WITNESS_SCALE
                + witness
        }
        AddressType::P2wpkh => {
            let witness = 1 + SIG_AND_KEY_PUSH_BYTES;
            (INPUT_FIXED_BYTES + compact_size_len(0)) * WITNESS_SCALE + witness
        }
    }
}

/// Weight of an output paying to a script of `script_len` bytes
pub fn output_weight(script_len: usize) -> u64 {
    let script_len = script_len as u64;
    (8 + compact_size_len(script_len) + script_len) * WITNESS_SCALE
}

/// Length of the output script of the wallet's own address types
pub fn script_len(address_type: AddressType) -> usize {
    match address_type {
        AddressType::P2pkh => 25,
        AddressType::P2sh => 23,
        AddressType::P2wpkh => 22,
    }
}

/// Virtual size of a transaction with the given inputs and output scripts
pub fn estimate_vsize(inputs: &[AddressType], output_script_lens: &[usize]) -> u64 {
    let segwit = inputs.iter().any(|t| t.is_segwit());
    let mut weight = (TX_FIXED_BYTES
        + compact_size_len(inputs.len() as u64)
        + compact_size_len(output_script_lens.len() as u64))
        * WITNESS_SCALE;

    if segwit {
        // marker + flag
        weight += 2;
        // legacy inputs still carry an empty witness stack in a segwit tx
        weight += inputs.iter().filter(|t| !t.is_segwit()).count() as u64;
    }

    weight += inputs.iter().map(|t| input_weight(*t)).sum::<u64>();
    weight += output_script_lens.iter().map(|l| output_weight(*l)).sum::<u64>();

    weight.div_ceil(WITNESS_SCALE)
}

/// Fee for `vsize` virtual bytes at `fee_rate` sat/vB
///
/// Saturates at `u64::MAX`, which no input set can cover, so an absurd rate
/// surfaces as insufficient funds instead of wrapping to a tiny fee.
pub fn fee_for(vsize: u64, fee_rate: u64) -> u64 {
    vsize.saturating_mul(fee_rate.max(MIN_FEE_RATE))
}

/// Fee for a transaction of the given shape at `fee_rate` sat/vB
pub fn estimate_fee(inputs: &[AddressType], output_script_lens: &[usize], fee_rate: u64) -> u64 {
    fee_for(estimate_vsize(inputs, output_script_lens), fee_rate)
}

/// Smallest output value the network relays for this script
///
/// Matches Bitcoin Core's dust rule at the default 3 sat/vB dust relay fee:
/// the output plus the cost of later spending it. OP_RETURN outputs are never
/// dust.
pub fn dust_threshold(script: &Script) -> u64 {
    if script.is_op_return() {
        return 0;
    }

    let output_size = 8 + compact_size_len(script.len() as u64) + script.len() as u64;
    let spend_size = if script.is_witness_program() {
        // 32 + 4 + 1 + (107 / 4) + 4
        67
    } else {
        // 32 + 4 + 1 + 107 + 4
        148
    };

    (output_size + spend_size) * DUST_RELAY_FEE_RATE
}

/// Fee rates for the standard confirmation targets, sat/vB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimates {
    /// Next block
    pub fast: u64,
    /// ~3 blocks
    pub normal: u64,
    /// ~6 blocks
    pub slow: u64,
    /// ~1 day
    pub minimum: u64,
}

impl FeeEstimates {
    /// Normalize raw estimates: at least [`MIN_FEE_RATE`], non-increasing
    /// from fast to minimum
    pub fn normalized(fast: u64, normal: u64, slow: u64, minimum: u64) -> Self {
        let minimum = minimum.max(MIN_FEE_RATE);
        let slow = slow.max(minimum);
        let normal = normal.max(slow);
        let fast = fast.max(normal);

        Self {
            fast,
            normal,
            slow,
            minimum,
        }
    }
}

impl Default for FeeEstimates {
    fn default() -> Self {
        Self::normalized(MIN_FEE_RATE, MIN_FEE_RATE, MIN_FEE_RATE, MIN_FEE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Address;
    use std::str::FromStr;

    fn script_of(address: &str) -> bitcoin::ScriptBuf {
        Address::from_str(address)
            .unwrap()
            .assume_checked()
            .script_pubkey()
    }

    #[test]
    fn test_input_weights() {
        assert_eq!(input_weight(AddressType::P2pkh), 592);
        assert_eq!(input_weight(AddressType::P2sh), 364);
        assert_eq!(input_weight(AddressType::P2wpkh), 272);
    }

    #[test]
    fn test_vsize_one_in_two_out_segwit() {
        // 42 overhead + 272 input + 2 * 124 outputs = 562 wu
        let vsize = estimate_vsize(&[AddressType::P2wpkh], &[22, 22]);
        assert_eq!(vsize, 141);
    }

    #[test]
    fn test_vsize_legacy_has_no_witness_overhead() {
        // (10 + 148 + 34) bytes, no marker/flag
        let vsize = estimate_vsize(&[AddressType::P2pkh], &[25]);
        assert_eq!(vsize, 192);
    }

    #[test]
    fn test_dust_thresholds_match_core() {
        assert_eq!(dust_threshold(&script_of("1LqBGSKuX5yYUonjxT5qGfpUsXKYYWeabA")), 546);
        assert_eq!(dust_threshold(&script_of("2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2")), 540);
        assert_eq!(
            dust_threshold(&script_of("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu")),
            294
        );
    }

    #[test]
    fn test_fee_saturates_instead_of_wrapping() {
        assert_eq!(fee_for(141, 0), 141);
        assert_eq!(fee_for(141, 5), 705);
        assert_eq!(fee_for(141, u64::MAX / 100), u64::MAX);
        assert_eq!(
            estimate_fee(&[AddressType::P2wpkh], &[22, 22], u64::MAX),
            u64::MAX
        );
    }

    #[test]
    fn test_fee_estimates_are_monotonic() {
        let estimates = FeeEstimates::normalized(2, 5, 0, 3);
        assert_eq!(estimates.minimum, 3);
        assert_eq!(estimates.slow, 3);
        assert_eq!(estimates.normal, 5);
        assert_eq!(estimates.fast, 5);
    }
}
