//! Virtual size estimation of the final transaction, before it is signed.
//!
//! Signatures are counted at their maximum length (72 bytes with sighash
//! flag for ECDSA, 64 for schnorr with the default sighash), so estimates
//! may be a few vbytes high. Finalized inputs are measured exactly.

use bitcoin::{
    psbt::{Input, Psbt},
    Script, TxOut, Witness,
};

use super::InputState;
use crate::{
    encoding::{prefixed_len, VarInt},
    script::{classify, parse_multisig, single_key_leaf, MultisigScript, ScriptPattern},
};

const WITNESS_SCALE: u64 = 4;
/// nVersion + nLockTime
const TX_FIXED_BYTES: u64 = 8;
const SEGWIT_MARKER_WU: u64 = 2;
/// Outpoint and nSequence
const INPUT_FIXED_BYTES: u64 = 36 + 4;
const ECDSA_SIG_BYTES: u64 = 72;
const SCHNORR_SIG_BYTES: u64 = 64;
const COMPRESSED_KEY_BYTES: u64 = 33;
/// `<sig> <pubkey>`
const P2PKH_SCRIPT_SIG_BYTES: u64 = 1 + ECDSA_SIG_BYTES + 1 + COMPRESSED_KEY_BYTES;
/// Push of a 22 byte P2WPKH program.
const P2SH_P2WPKH_SCRIPT_SIG_BYTES: u64 = 23;
/// Push of a 34 byte P2WSH program.
const P2SH_P2WSH_SCRIPT_SIG_BYTES: u64 = 35;
/// Item count, signature and key.
const P2WPKH_WITNESS_WU: u64 = 1 + 1 + ECDSA_SIG_BYTES + 1 + COMPRESSED_KEY_BYTES;
const P2TR_KEY_SPEND_WITNESS_WU: u64 = 1 + 1 + SCHNORR_SIG_BYTES;
/// Assumed when a P2WSH input doesn't carry its witness script.
const FALLBACK_MULTISIG: (u64, u64) = (2, 3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InputWeight {
    /// Non-witness bytes, counted four times.
    base: u64,
    /// Witness bytes, counted once.
    witness: u64,
    segwit: bool,
}

impl InputWeight {
    fn legacy(script_sig_len: u64) -> Self {
        Self {
            base: INPUT_FIXED_BYTES + prefixed(script_sig_len),
            witness: 0,
            segwit: false,
        }
    }

    fn segwit(script_sig_len: u64, witness: u64) -> Self {
        Self {
            base: INPUT_FIXED_BYTES + prefixed(script_sig_len),
            witness,
            segwit: true,
        }
    }
}

fn prefixed(len: u64) -> u64 {
    prefixed_len(len as usize) as u64
}

/// Size of a data push inside a script, including the push opcode.
fn push_len(len: u64) -> u64 {
    match len {
        0..=75 => 1 + len,
        76..=255 => 2 + len,
        _ => 3 + len,
    }
}

fn multisig_shape(script: Option<&Script>) -> (u64, u64, u64) {
    match script.and_then(parse_multisig) {
        Some(MultisigScript { required, keys }) => (
            required as u64,
            keys.len() as u64,
            script.map(|s| s.len() as u64).unwrap_or_default(),
        ),
        None => {
            let (m, n) = FALLBACK_MULTISIG;
            (m, n, 34 * n + 3)
        }
    }
}

/// Item count, the empty dummy, `m` signatures and the witness script.
fn multisig_witness_wu(script: Option<&Script>) -> u64 {
    let (m, _, script_len) = multisig_shape(script);
    1 + 1 + (1 + ECDSA_SIG_BYTES) * m + prefixed(script_len)
}

fn witness_wu(witness: &Witness) -> u64 {
    VarInt(witness.len() as u64).size() as u64
        + witness.iter().map(|i| prefixed(i.len() as u64)).sum::<u64>()
}

fn taproot_witness_wu(input: &Input) -> u64 {
    if input.tap_key_sig.is_some() || input.tap_script_sigs.is_empty() {
        return P2TR_KEY_SPEND_WITNESS_WU;
    }
    input
        .tap_scripts
        .iter()
        .find(|(_, (script, _))| single_key_leaf(script).is_some())
        .map(|(control_block, (script, _))| {
            1 + prefixed(SCHNORR_SIG_BYTES)
                + prefixed(script.len() as u64)
                + prefixed(control_block.serialize().len() as u64)
        })
        .unwrap_or(P2TR_KEY_SPEND_WITNESS_WU)
}

fn estimate_input(input: &Input, utxo: Option<&TxOut>) -> InputWeight {
    if input.final_script_sig.is_some() || input.final_script_witness.is_some() {
        let script_sig_len = input.final_script_sig.as_ref().map_or(0, |s| s.len() as u64);
        return match &input.final_script_witness {
            Some(w) if !w.is_empty() => InputWeight::segwit(script_sig_len, witness_wu(w)),
            _ => InputWeight::legacy(script_sig_len),
        };
    }
    let unknown = InputWeight::segwit(0, P2WPKH_WITNESS_WU);
    let Some(utxo) = utxo else { return unknown };
    match classify(&utxo.script_pubkey) {
        ScriptPattern::P2pkh(_) => InputWeight::legacy(P2PKH_SCRIPT_SIG_BYTES),
        ScriptPattern::P2wpkh(_) => InputWeight::segwit(0, P2WPKH_WITNESS_WU),
        ScriptPattern::P2tr(_) => InputWeight::segwit(0, taproot_witness_wu(input)),
        ScriptPattern::P2wsh(_) => {
            InputWeight::segwit(0, multisig_witness_wu(input.witness_script.as_deref()))
        }
        ScriptPattern::P2sh(_) => match input.redeem_script.as_deref() {
            None => InputWeight::segwit(P2SH_P2WPKH_SCRIPT_SIG_BYTES, P2WPKH_WITNESS_WU),
            Some(rs) => match classify(rs) {
                ScriptPattern::P2wpkh(_) => {
                    InputWeight::segwit(P2SH_P2WPKH_SCRIPT_SIG_BYTES, P2WPKH_WITNESS_WU)
                }
                ScriptPattern::P2wsh(_) => InputWeight::segwit(
                    P2SH_P2WSH_SCRIPT_SIG_BYTES,
                    multisig_witness_wu(input.witness_script.as_deref()),
                ),
                _ => {
                    let (m, _, script_len) = multisig_shape(Some(rs));
                    InputWeight::legacy(1 + (1 + ECDSA_SIG_BYTES) * m + push_len(script_len))
                }
            },
        },
        ScriptPattern::Unknown => unknown,
    }
}

fn output_bytes(output: &TxOut) -> u64 {
    8 + prefixed(output.script_pubkey.len() as u64)
}

/// Weight of the transaction once every input is signed.
pub fn estimate_weight(psbt: &Psbt) -> u64 {
    let tx = &psbt.unsigned_tx;
    let inputs = (0..psbt.inputs.len())
        .map(|i| estimate_input(&psbt.inputs[i], InputState::of(psbt, i).utxo()))
        .collect::<Vec<_>>();
    let any_segwit = inputs.iter().any(|i| i.segwit);
    let base = TX_FIXED_BYTES
        + VarInt(tx.input.len() as u64).size() as u64
        + VarInt(tx.output.len() as u64).size() as u64
        + inputs.iter().map(|i| i.base).sum::<u64>()
        + tx.output.iter().map(output_bytes).sum::<u64>();
    let mut witness = inputs.iter().map(|i| i.witness).sum::<u64>();
    if any_segwit {
        // marker and flag, plus an empty witness for every non-segwit input
        witness += SEGWIT_MARKER_WU + inputs.iter().filter(|i| !i.segwit).count() as u64;
    }
    base * WITNESS_SCALE + witness
}

pub fn estimate_vsize(psbt: &Psbt) -> u64 {
    estimate_weight(psbt).div_ceil(WITNESS_SCALE)
}
