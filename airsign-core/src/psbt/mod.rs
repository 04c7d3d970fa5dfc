use std::{fs::OpenOptions, io::Read, path::Path};

use anyhow::Context;
use bitcoin::{
    base64::{engine::general_purpose::STANDARD, Engine},
    psbt::{Input, Psbt},
    TxOut,
};

use crate::error::MalformedInput;

pub mod alternative;
pub mod analyze;
pub mod finalize;
pub mod raw;
pub mod sign;
pub mod size;

pub use analyze::{can_finalize, input_signature_status, is_fully_signed, psbt_details, PsbtDetails};
pub use finalize::{finalize_psbt, finalize_to_hex};
pub use sign::{sign_psbt, SigningResult};
pub use size::estimate_vsize;

use raw::{RawPsbt, PSBT_MAGIC};

/// A deserialized PSBT plus what the lenient fallback had to drop to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPsbt {
    pub psbt: Psbt,
    pub stripped_global_xpubs: usize,
}

/// Strict BIP-174 parse. When that fails and the global map carries xpub
/// entries, they are dropped and the parse is retried once: some coordinators
/// emit broken global xpubs and the signer never needs them.
pub fn parse_psbt(bytes: &[u8]) -> Result<ParsedPsbt, MalformedInput> {
    if !bytes.starts_with(&PSBT_MAGIC) {
        return Err(MalformedInput::Psbt("missing magic bytes".into()));
    }
    let strict = match Psbt::deserialize(bytes) {
        Ok(psbt) => {
            return Ok(ParsedPsbt {
                psbt,
                stripped_global_xpubs: 0,
            })
        }
        Err(e) => e,
    };
    let mut raw = RawPsbt::parse(bytes).map_err(|_| MalformedInput::Psbt(strict.to_string()))?;
    let stripped = raw.strip_global_xpubs();
    if stripped == 0 {
        return Err(MalformedInput::Psbt(strict.to_string()));
    }
    let lenient = raw.serialize();
    let psbt = Psbt::deserialize(&lenient).map_err(|e| {
        MalformedInput::Psbt(format!(
            "{strict} (still invalid without global xpubs: {e})"
        ))
    })?;
    log::warn!("PSBT failed strict parsing ({strict}), dropped {stripped} global xpub entries");
    Ok(ParsedPsbt {
        psbt,
        stripped_global_xpubs: stripped,
    })
}

pub fn parse_psbt_base64(s: &str) -> Result<ParsedPsbt, MalformedInput> {
    let bytes = STANDARD
        .decode(s.trim())
        .map_err(|e| MalformedInput::Base64(e.to_string()))?;
    parse_psbt(&bytes)
}

pub fn parse_psbt_hex(s: &str) -> Result<ParsedPsbt, MalformedInput> {
    let bytes = hex::decode(s.trim()).map_err(|e| MalformedInput::Hex(e.to_string()))?;
    parse_psbt(&bytes)
}

pub fn serialize_psbt_base64(psbt: &Psbt) -> String {
    STANDARD.encode(psbt.serialize())
}

/// Accepts binary, base64 or hex PSBT content.
pub fn parse_psbt_any(content: &[u8]) -> Result<ParsedPsbt, MalformedInput> {
    if content.starts_with(&PSBT_MAGIC) {
        return parse_psbt(content);
    }
    let text = std::str::from_utf8(content)
        .map_err(|_| MalformedInput::Psbt("neither binary nor text".into()))?
        .trim();
    if text.len() % 2 == 0 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        parse_psbt_hex(text)
    } else {
        parse_psbt_base64(text)
    }
}

pub fn open_psbt_file(p: &Path) -> anyhow::Result<ParsedPsbt> {
    let raw = {
        let mut f = OpenOptions::new()
            .read(true)
            .open(p)
            .context("failure opening PSBT file")?;
        let mut buffer = Vec::new();
        f.read_to_end(&mut buffer)
            .context("failure reading PSBT file")?;
        buffer
    };
    parse_psbt_any(&raw).context("failure deserializing PSBT file")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Partial,
    Finalized,
}

/// Where the spent output comes from, and whether the input is already final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputState {
    NonWitness { utxo: TxOut, stage: Stage },
    Witness { utxo: TxOut, stage: Stage },
    MissingUtxo { stage: Stage },
}

impl InputState {
    pub fn of(psbt: &Psbt, index: usize) -> Self {
        let input = &psbt.inputs[index];
        let stage = if is_finalized(input) {
            Stage::Finalized
        } else {
            Stage::Partial
        };
        if let Some(utxo) = &input.witness_utxo {
            return Self::Witness {
                utxo: utxo.clone(),
                stage,
            };
        }
        let outpoint = psbt.unsigned_tx.input.get(index).map(|i| i.previous_output);
        match (&input.non_witness_utxo, outpoint) {
            (Some(prev), Some(outpoint)) => {
                if prev.compute_txid() != outpoint.txid {
                    log::warn!("Input {index} carries a previous transaction with the wrong txid");
                    return Self::MissingUtxo { stage };
                }
                match prev.output.get(outpoint.vout as usize) {
                    Some(utxo) => Self::NonWitness {
                        utxo: utxo.clone(),
                        stage,
                    },
                    None => Self::MissingUtxo { stage },
                }
            }
            _ => Self::MissingUtxo { stage },
        }
    }

    pub fn utxo(&self) -> Option<&TxOut> {
        match self {
            Self::NonWitness { utxo, .. } | Self::Witness { utxo, .. } => Some(utxo),
            Self::MissingUtxo { .. } => None,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::NonWitness { stage, .. }
            | Self::Witness { stage, .. }
            | Self::MissingUtxo { stage } => *stage,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.stage() == Stage::Finalized
    }
}

pub fn is_finalized(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

/// Spent outputs of every input, in order, when all of them are known.
pub fn all_spent_outputs(psbt: &Psbt) -> Option<Vec<TxOut>> {
    (0..psbt.inputs.len())
        .map(|i| InputState::of(psbt, i).utxo().cloned())
        .collect()
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::str::FromStr;

    use bitcoin::{
        absolute::LockTime, transaction::Version, Amount, OutPoint, ScriptBuf, Sequence,
        Transaction, TxIn, TxOut, Txid, Witness,
    };

    use super::*;

    pub fn funding_tx(script_pubkey: ScriptBuf, amount: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(
                    Txid::from_str("5cfc272c62a9fb056f274405cf8f541ae96776271511d5cf730a54f35291ca87")
                        .expect("valid txid"),
                    0,
                ),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(amount),
                script_pubkey,
            }],
        }
    }

    /// One input spending `funding:0`, paying to `outputs`.
    pub fn spending_psbt(funding: &Transaction, outputs: Vec<TxOut>) -> Psbt {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(funding.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: outputs,
        };
        Psbt::from_unsigned_tx(tx).expect("unsigned tx")
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{Amount, ScriptBuf};
    use pretty_assertions::assert_eq;

    use super::{test_utils::*, *};
    use crate::psbt::raw::{RawEntry, PSBT_GLOBAL_XPUB};

    fn sample_psbt() -> Psbt {
        let funding = funding_tx(ScriptBuf::from_bytes(vec![0x51]), 10_000);
        spending_psbt(
            &funding,
            vec![TxOut {
                value: Amount::from_sat(9_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x52]),
            }],
        )
    }

    #[test]
    fn test_parse_strict() -> anyhow::Result<()> {
        let psbt = sample_psbt();
        let parsed = parse_psbt(&psbt.serialize())?;
        assert_eq!(parsed.psbt, psbt);
        assert_eq!(parsed.stripped_global_xpubs, 0);
        let b64 = serialize_psbt_base64(&psbt);
        assert_eq!(parse_psbt_base64(&b64)?.psbt, psbt);
        assert_eq!(parse_psbt_any(b64.as_bytes())?.psbt, psbt);
        assert_eq!(parse_psbt_hex(&hex::encode(psbt.serialize()))?.psbt, psbt);
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_psbt(b"nope"), Err(MalformedInput::Psbt(_))));
        assert!(matches!(parse_psbt_base64("!!!"), Err(MalformedInput::Base64(_))));
        assert!(matches!(parse_psbt_hex("zz"), Err(MalformedInput::Hex(_))));
        assert!(matches!(
            parse_psbt(&[0x70, 0x73, 0x62, 0x74, 0xff, 0x00]),
            Err(MalformedInput::Psbt(_))
        ));
    }

    #[test]
    fn test_huge_lengths_are_malformed() {
        let mut huge_key = PSBT_MAGIC.to_vec();
        huge_key.extend([0xff; 9]);
        huge_key.push(0x00);
        assert!(matches!(parse_psbt(&huge_key), Err(MalformedInput::Psbt(_))));

        let mut huge_value = PSBT_MAGIC.to_vec();
        huge_value.extend([0x01, PSBT_GLOBAL_XPUB]);
        huge_value.extend([0xfe, 0xff, 0xff, 0xff, 0xff, 0x00]);
        assert!(matches!(parse_psbt(&huge_value), Err(MalformedInput::Psbt(_))));
        assert!(matches!(
            parse_psbt_any(&huge_value),
            Err(MalformedInput::Psbt(_))
        ));
    }

    #[test]
    fn test_broken_global_xpub_is_dropped() -> anyhow::Result<()> {
        let psbt = sample_psbt();
        let mut raw = RawPsbt::parse(&psbt.serialize())?;
        raw.global.push(RawEntry {
            key: vec![PSBT_GLOBAL_XPUB, 0xde, 0xad],
            value: vec![0x00; 7],
        });
        let corrupted = raw.serialize();
        assert!(Psbt::deserialize(&corrupted).is_err());
        let parsed = parse_psbt(&corrupted)?;
        assert_eq!(parsed.stripped_global_xpubs, 1);
        assert_eq!(parsed.psbt, psbt);
        Ok(())
    }

    #[test]
    fn test_input_state() -> anyhow::Result<()> {
        let funding = funding_tx(ScriptBuf::from_bytes(vec![0x51]), 10_000);
        let mut psbt = spending_psbt(&funding, vec![]);
        assert_eq!(InputState::of(&psbt, 0), InputState::MissingUtxo { stage: Stage::Partial });
        psbt.inputs[0].non_witness_utxo = Some(funding.clone());
        assert_eq!(
            InputState::of(&psbt, 0),
            InputState::NonWitness {
                utxo: funding.output[0].clone(),
                stage: Stage::Partial
            }
        );
        let witness_utxo = TxOut {
            value: Amount::from_sat(1),
            script_pubkey: ScriptBuf::new(),
        };
        psbt.inputs[0].witness_utxo = Some(witness_utxo.clone());
        psbt.inputs[0].final_script_sig = Some(ScriptBuf::new());
        let state = InputState::of(&psbt, 0);
        assert_eq!(
            state,
            InputState::Witness {
                utxo: witness_utxo,
                stage: Stage::Finalized
            }
        );
        assert!(state.is_finalized());

        let other = funding_tx(ScriptBuf::from_bytes(vec![0x59]), 1);
        psbt.inputs[0] = Input {
            non_witness_utxo: Some(other),
            ..Default::default()
        };
        assert_eq!(InputState::of(&psbt, 0).utxo(), None);
        Ok(())
    }
}
