use bitcoin::{
    key::CompressedPublicKey,
    psbt::{Input, Psbt},
    script::{Builder, PushBytes},
    taproot::TapLeafHash,
    ScriptBuf, TxOut, Witness,
};

use super::InputState;
use crate::{
    error::{EngineError, Incompleteness},
    script::{classify, parse_multisig, single_key_leaf, ScriptPattern},
    transaction::to_hex,
};

type Finalized = (Option<ScriptBuf>, Option<Witness>);

fn unfinalizable(index: usize, reason: impl Into<String>) -> Incompleteness {
    Incompleteness::Unfinalizable {
        index,
        reason: reason.into(),
    }
}

fn script_sig(index: usize, items: &[Vec<u8>]) -> Result<ScriptBuf, Incompleteness> {
    items
        .iter()
        .try_fold(Builder::new(), |b, item| {
            let push = <&PushBytes>::try_from(item.as_slice())
                .map_err(|_| unfinalizable(index, "script push too large"))?;
            Ok(b.push_slice(push))
        })
        .map(Builder::into_script)
}

/// `[sig, pubkey]` for the partial signature whose key satisfies `matches`.
fn single_sig_items(
    index: usize,
    input: &Input,
    matches: impl Fn(&bitcoin::PublicKey) -> bool,
) -> Result<Vec<Vec<u8>>, Incompleteness> {
    input
        .partial_sigs
        .iter()
        .find(|(k, _)| matches(k))
        .map(|(k, sig)| vec![sig.to_vec(), k.to_bytes()])
        .ok_or(Incompleteness::InsufficientSignatures {
            index,
            present: 0,
            required: 1,
        })
}

fn p2wpkh_items(
    index: usize,
    input: &Input,
    hash: bitcoin::WPubkeyHash,
) -> Result<Vec<Vec<u8>>, Incompleteness> {
    single_sig_items(index, input, |k| {
        CompressedPublicKey::try_from(*k).is_ok_and(|c| c.wpubkey_hash() == hash)
    })
}

/// Signatures in the order the keys appear in the script, `required` of them.
fn multisig_sigs(
    index: usize,
    input: &Input,
    script: &bitcoin::Script,
) -> Result<Vec<Vec<u8>>, Incompleteness> {
    let ms = parse_multisig(script).ok_or_else(|| unfinalizable(index, "not a multisig script"))?;
    let sigs = ms
        .keys
        .iter()
        .filter_map(|k| input.partial_sigs.get(k))
        .map(|s| s.to_vec())
        .collect::<Vec<_>>();
    if sigs.len() < ms.required {
        return Err(Incompleteness::InsufficientSignatures {
            index,
            present: sigs.len(),
            required: ms.required,
        });
    }
    Ok(sigs.into_iter().take(ms.required).collect())
}

fn p2wsh_witness(
    index: usize,
    input: &Input,
    hash: bitcoin::WScriptHash,
) -> Result<Witness, Incompleteness> {
    let ws = input
        .witness_script
        .as_ref()
        .ok_or_else(|| unfinalizable(index, "missing witness script"))?;
    if ws.wscript_hash() != hash {
        return Err(unfinalizable(index, "witness script doesn't match the output"));
    }
    let mut items = vec![vec![]];
    items.extend(multisig_sigs(index, input, ws)?);
    items.push(ws.to_bytes());
    Ok(Witness::from_slice(&items))
}

fn finalize_taproot(index: usize, input: &Input) -> Result<Witness, Incompleteness> {
    if let Some(sig) = &input.tap_key_sig {
        return Ok(Witness::from_slice(&[sig.to_vec()]));
    }
    input
        .tap_scripts
        .iter()
        .find_map(|(control_block, (script, version))| {
            let key = single_key_leaf(script)?;
            let leaf = TapLeafHash::from_script(script, *version);
            let sig = input.tap_script_sigs.get(&(key, leaf))?;
            Some(Witness::from_slice(&[
                sig.to_vec(),
                script.to_bytes(),
                control_block.serialize(),
            ]))
        })
        .ok_or(Incompleteness::InsufficientSignatures {
            index,
            present: 0,
            required: 1,
        })
}

fn finalize_input(index: usize, input: &Input, utxo: &TxOut) -> Result<Finalized, Incompleteness> {
    match classify(&utxo.script_pubkey) {
        ScriptPattern::P2tr(_) => Ok((None, Some(finalize_taproot(index, input)?))),
        ScriptPattern::P2wpkh(hash) => {
            let items = p2wpkh_items(index, input, hash)?;
            Ok((None, Some(Witness::from_slice(&items))))
        }
        ScriptPattern::P2wsh(hash) => Ok((None, Some(p2wsh_witness(index, input, hash)?))),
        ScriptPattern::P2pkh(hash) => {
            let items = single_sig_items(index, input, |k| k.pubkey_hash() == hash)?;
            Ok((Some(script_sig(index, &items)?), None))
        }
        ScriptPattern::P2sh(hash) => {
            let rs = input
                .redeem_script
                .as_ref()
                .ok_or_else(|| unfinalizable(index, "missing redeem script"))?;
            if rs.script_hash() != hash {
                return Err(unfinalizable(index, "redeem script doesn't match the output"));
            }
            let redeem_push = script_sig(index, &[rs.to_bytes()])?;
            match classify(rs) {
                ScriptPattern::P2wpkh(hash) => {
                    let items = p2wpkh_items(index, input, hash)?;
                    Ok((Some(redeem_push), Some(Witness::from_slice(&items))))
                }
                ScriptPattern::P2wsh(hash) => {
                    Ok((Some(redeem_push), Some(p2wsh_witness(index, input, hash)?)))
                }
                _ => {
                    let mut items = vec![vec![]];
                    items.extend(multisig_sigs(index, input, rs)?);
                    items.push(rs.to_bytes());
                    Ok((Some(script_sig(index, &items)?), None))
                }
            }
        }
        ScriptPattern::Unknown => Err(unfinalizable(index, "unsupported output script")),
    }
}

/// Builds the final scriptSig/witness of every input. Inputs that are already
/// final are kept as they are, so finalizing twice changes nothing.
pub fn finalize_psbt(psbt: &Psbt) -> Result<Psbt, EngineError> {
    let mut finalized = psbt.clone();
    for (index, input) in psbt.inputs.iter().enumerate() {
        let state = InputState::of(psbt, index);
        if state.is_finalized() {
            continue;
        }
        let utxo = state.utxo().ok_or(Incompleteness::MissingUtxo { index })?;
        let (final_script_sig, final_script_witness) = finalize_input(index, input, utxo)?;
        log::debug!("Finalized input {index}");
        finalized.inputs[index] = Input {
            non_witness_utxo: input.non_witness_utxo.clone(),
            witness_utxo: input.witness_utxo.clone(),
            final_script_sig,
            final_script_witness,
            proprietary: input.proprietary.clone(),
            unknown: input.unknown.clone(),
            ..Default::default()
        };
    }
    Ok(finalized)
}

/// Finalizes and returns the network serialization of the signed transaction.
pub fn finalize_to_hex(psbt: &Psbt) -> Result<String, EngineError> {
    let tx = finalize_psbt(psbt)?.extract_tx_unchecked_fee_rate();
    log::info!("Extracted transaction {}", tx.compute_txid());
    Ok(to_hex(&tx))
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        ecdsa,
        secp256k1::{Message, Secp256k1, SecretKey},
        sighash::EcdsaSighashType,
        Amount, PublicKey,
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        psbt::test_utils::{funding_tx, spending_psbt},
        script::multisig_script,
    };

    fn key(i: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[i; 32]).expect("valid key");
        (sk, PublicKey::new(sk.public_key(&secp)))
    }

    /// Any valid signature will do, the finalizer doesn't verify them.
    fn dummy_sig(sk: &SecretKey) -> ecdsa::Signature {
        let secp = Secp256k1::new();
        ecdsa::Signature {
            signature: secp.sign_ecdsa(&Message::from_digest([7u8; 32]), sk),
            sighash_type: EcdsaSighashType::All,
        }
    }

    fn psbt_spending(script_pubkey: ScriptBuf) -> Psbt {
        let funding = funding_tx(script_pubkey, 100_000);
        let mut psbt = spending_psbt(
            &funding,
            vec![TxOut {
                value: Amount::from_sat(90_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            }],
        );
        psbt.inputs[0].witness_utxo = Some(funding.output[0].clone());
        psbt
    }

    #[test]
    fn test_p2wsh_multisig_order() -> anyhow::Result<()> {
        let (a_sk, a) = key(1);
        let (b_sk, b) = key(2);
        let (_, c) = key(3);
        // unsorted: script order is C, A, B
        let ws = multisig_script(2, &[c, a, b], false)?;
        let mut psbt = psbt_spending(ScriptBuf::new_p2wsh(&ws.wscript_hash()));
        psbt.inputs[0].witness_script = Some(ws.clone());
        psbt.inputs[0].partial_sigs.insert(b, dummy_sig(&b_sk));
        assert!(matches!(
            finalize_psbt(&psbt),
            Err(EngineError::Incomplete(Incompleteness::InsufficientSignatures {
                index: 0,
                present: 1,
                required: 2
            }))
        ));
        psbt.inputs[0].partial_sigs.insert(a, dummy_sig(&a_sk));
        let finalized = finalize_psbt(&psbt)?;
        let input = &finalized.inputs[0];
        let witness = input.final_script_witness.as_ref().expect("witness");
        let items = witness.iter().map(<[u8]>::to_vec).collect::<Vec<_>>();
        assert_eq!(
            items,
            vec![
                vec![],
                dummy_sig(&a_sk).to_vec(),
                dummy_sig(&b_sk).to_vec(),
                ws.to_bytes()
            ]
        );
        assert!(input.partial_sigs.is_empty());
        assert_eq!(input.witness_script, None);
        assert!(input.witness_utxo.is_some());
        assert_eq!(finalize_psbt(&finalized)?, finalized);
        Ok(())
    }

    #[test]
    fn test_bare_p2sh_multisig() -> anyhow::Result<()> {
        let (a_sk, a) = key(1);
        let (_, b) = key(2);
        let rs = multisig_script(1, &[a, b], true)?;
        let mut psbt = psbt_spending(ScriptBuf::new_p2sh(&rs.script_hash()));
        psbt.inputs[0].redeem_script = Some(rs.clone());
        psbt.inputs[0].partial_sigs.insert(a, dummy_sig(&a_sk));
        let finalized = finalize_psbt(&psbt)?;
        let input = &finalized.inputs[0];
        assert_eq!(input.final_script_witness, None);
        let expected = script_sig(0, &[vec![], dummy_sig(&a_sk).to_vec(), rs.to_bytes()])?;
        assert_eq!(input.final_script_sig, Some(expected));
        Ok(())
    }

    #[test]
    fn test_p2wpkh_and_nested() -> anyhow::Result<()> {
        let (sk, pk) = key(4);
        let compressed = CompressedPublicKey::try_from(pk)?;
        let mut native = psbt_spending(ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()));
        native.inputs[0].partial_sigs.insert(pk, dummy_sig(&sk));
        let finalized = finalize_psbt(&native)?;
        let witness = finalized.inputs[0].final_script_witness.clone().expect("witness");
        assert_eq!(witness.len(), 2);
        assert_eq!(witness.nth(1), Some(pk.to_bytes().as_slice()));
        assert_eq!(finalized.inputs[0].final_script_sig, None);

        let rs = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
        let mut nested = psbt_spending(ScriptBuf::new_p2sh(&rs.script_hash()));
        nested.inputs[0].redeem_script = Some(rs.clone());
        nested.inputs[0].partial_sigs.insert(pk, dummy_sig(&sk));
        let finalized = finalize_psbt(&nested)?;
        assert_eq!(
            finalized.inputs[0].final_script_sig,
            Some(script_sig(0, &[rs.to_bytes()])?)
        );
        assert_eq!(finalized.inputs[0].final_script_witness, Some(witness));
        let hex = finalize_to_hex(&nested)?;
        assert!(hex.starts_with("02000000"));
        Ok(())
    }

    #[test]
    fn test_missing_utxo() {
        let mut psbt = psbt_spending(ScriptBuf::new());
        psbt.inputs[0].witness_utxo = None;
        assert!(matches!(
            finalize_psbt(&psbt),
            Err(EngineError::Incomplete(Incompleteness::MissingUtxo { index: 0 }))
        ));
        let psbt = psbt_spending(ScriptBuf::from_bytes(vec![0x51]));
        assert!(matches!(
            finalize_psbt(&psbt),
            Err(EngineError::Incomplete(Incompleteness::Unfinalizable { index: 0, .. }))
        ));
    }
}
