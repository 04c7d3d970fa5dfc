//! Script pattern recognition and the handful of scripts the signer builds.

use anyhow::Context;
use bitcoin::{
    blockdata::{
        opcodes::{
            all::{OP_CHECKMULTISIG, OP_CHECKSIG, OP_PUSHBYTES_0, OP_PUSHNUM_1, OP_PUSHNUM_16},
            Opcode,
        },
        script::{Builder, Instruction},
    },
    hashes::Hash,
    key::{CompressedPublicKey, XOnlyPublicKey},
    secp256k1::{All, Secp256k1},
    taproot::{TaprootBuilder, TaprootSpendInfo},
    PubkeyHash, PublicKey, Script, ScriptBuf, ScriptHash, WPubkeyHash, WScriptHash,
};

pub const MAX_MULTISIG_KEYS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptPattern {
    P2pkh(PubkeyHash),
    P2sh(ScriptHash),
    P2wpkh(WPubkeyHash),
    P2wsh(WScriptHash),
    P2tr(XOnlyPublicKey),
    Unknown,
}

impl ScriptPattern {
    pub fn is_segwit(&self) -> bool {
        matches!(self, Self::P2wpkh(_) | Self::P2wsh(_) | Self::P2tr(_))
    }
}

/// Classifies a scriptPubKey. Anything that isn't one of the standard
/// templates is `Unknown`.
pub fn classify(script: &Script) -> ScriptPattern {
    let b = script.as_bytes();
    let pattern = if script.is_p2pkh() {
        b[3..23].try_into().ok().map(|h| ScriptPattern::P2pkh(PubkeyHash::from_byte_array(h)))
    } else if script.is_p2sh() {
        b[2..22].try_into().ok().map(|h| ScriptPattern::P2sh(ScriptHash::from_byte_array(h)))
    } else if script.is_p2wpkh() {
        b[2..22].try_into().ok().map(|h| ScriptPattern::P2wpkh(WPubkeyHash::from_byte_array(h)))
    } else if script.is_p2wsh() {
        b[2..34].try_into().ok().map(|h| ScriptPattern::P2wsh(WScriptHash::from_byte_array(h)))
    } else if script.is_p2tr() {
        XOnlyPublicKey::from_slice(&b[2..34]).ok().map(ScriptPattern::P2tr)
    } else {
        None
    };
    pattern.unwrap_or(ScriptPattern::Unknown)
}

/// Small integer pushed by OP_0 and OP_1..OP_16.
pub fn op_to_int(op: Opcode) -> Option<u8> {
    let code = op.to_u8();
    if op == OP_PUSHBYTES_0 {
        Some(0)
    } else if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&code) {
        Some(code - OP_PUSHNUM_1.to_u8() + 1)
    } else {
        None
    }
}

fn instruction_to_int(i: &Instruction) -> Option<u8> {
    match i {
        Instruction::Op(op) => op_to_int(*op),
        Instruction::PushBytes(b) if b.is_empty() => Some(0),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigScript {
    pub required: usize,
    /// Keys in script order.
    pub keys: Vec<PublicKey>,
}

/// Decodes `OP_m <key>... OP_n OP_CHECKMULTISIG`.
pub fn parse_multisig(script: &Script) -> Option<MultisigScript> {
    let instructions = script.instructions().collect::<Result<Vec<_>, _>>().ok()?;
    if instructions.len() < 4 {
        return None;
    }
    let (last, rest) = instructions.split_last()?;
    if *last != Instruction::Op(OP_CHECKMULTISIG) {
        return None;
    }
    let (n, rest) = rest.split_last()?;
    let (m, keys) = rest.split_first()?;
    let required = usize::from(instruction_to_int(m)?);
    let total = usize::from(instruction_to_int(n)?);
    if required < 1 || required > total || total > MAX_MULTISIG_KEYS || keys.len() != total {
        return None;
    }
    let keys = keys
        .iter()
        .map(|k| match k {
            Instruction::PushBytes(b) if b.len() == 33 || b.len() == 65 => {
                PublicKey::from_slice(b.as_bytes()).ok()
            }
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(MultisigScript { required, keys })
}

/// `OP_m <keys> OP_n OP_CHECKMULTISIG`; with `sorted` the keys are ordered
/// lexicographically by their serialization (BIP-67).
pub fn multisig_script(
    required: usize,
    keys: &[PublicKey],
    sorted: bool,
) -> anyhow::Result<ScriptBuf> {
    anyhow::ensure!(
        required >= 1 && required <= keys.len() && keys.len() <= MAX_MULTISIG_KEYS,
        "Invalid multisig threshold {required}-of-{}",
        keys.len()
    );
    let mut keys = keys.to_vec();
    if sorted {
        keys.sort_by_key(|k| k.to_bytes());
    }
    let builder = keys
        .iter()
        .fold(Builder::new().push_int(required as i64), |b, k| b.push_key(k));
    Ok(builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// BIP-143 script code of a P2WPKH output: the P2PKH script of the same key.
pub fn p2pkh_script_code(pubkey: &CompressedPublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&pubkey.pubkey_hash())
}

/// `<xonly> OP_CHECKSIG`, the only leaf shape the signer finalizes on its own.
pub fn single_key_leaf(script: &Script) -> Option<XOnlyPublicKey> {
    let b = script.as_bytes();
    if b.len() == 34 && b[0] == 0x20 && b[33] == OP_CHECKSIG.to_u8() {
        XOnlyPublicKey::from_slice(&b[1..33]).ok()
    } else {
        None
    }
}

pub fn single_key_leaf_script(key: &XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(key)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Taproot tree with all leaves given equal weight, so depths differ by at most one.
pub fn balanced_tap_tree(
    secp: &Secp256k1<All>,
    internal_key: XOnlyPublicKey,
    leaves: Vec<ScriptBuf>,
) -> anyhow::Result<TaprootSpendInfo> {
    if leaves.is_empty() {
        return Ok(TaprootSpendInfo::new_key_spend(secp, internal_key, None));
    }
    TaprootBuilder::with_huffman_tree(leaves.into_iter().map(|s| (1, s)))
        .context("failure building taproot tree")?
        .finalize(secp, internal_key)
        .map_err(|_| anyhow::anyhow!("taproot tree is incomplete"))
}
