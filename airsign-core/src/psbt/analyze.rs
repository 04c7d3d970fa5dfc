use bitcoin::{bip32::Fingerprint, psbt::Psbt, Network};
use serde::Serialize;

use super::{estimate_vsize, finalize_psbt, InputState};
use crate::{
    address::address_from_script,
    script::{parse_multisig, MultisigScript},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MultisigStatus {
    pub required: usize,
    pub total: usize,
    /// Signatures present, the minimum across inputs for a whole PSBT.
    pub current: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSignatureStatus {
    pub index: usize,
    pub finalized: bool,
    pub has_utxo: bool,
    pub signatures: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multisig: Option<MultisigStatus>,
    pub sufficient: bool,
}

/// Multisig script of an input: witness script first, then redeem script.
fn input_multisig(psbt: &Psbt, index: usize) -> Option<MultisigScript> {
    let input = &psbt.inputs[index];
    input
        .witness_script
        .as_deref()
        .and_then(parse_multisig)
        .or_else(|| input.redeem_script.as_deref().and_then(parse_multisig))
}

pub fn input_signature_status(psbt: &Psbt, index: usize) -> InputSignatureStatus {
    let state = InputState::of(psbt, index);
    let input = &psbt.inputs[index];
    let finalized = state.is_finalized();
    let has_utxo = state.utxo().is_some();
    let signatures = input.partial_sigs.len()
        + usize::from(input.tap_key_sig.is_some())
        + input.tap_script_sigs.len();
    let multisig = input_multisig(psbt, index).map(|ms| {
        let present = ms
            .keys
            .iter()
            .filter(|k| input.partial_sigs.contains_key(*k))
            .count();
        MultisigStatus {
            required: ms.required,
            total: ms.keys.len(),
            current: if finalized { ms.required } else { present },
        }
    });
    let sufficient = if !has_utxo {
        false
    } else if finalized {
        true
    } else {
        match &multisig {
            Some(ms) => ms.current >= ms.required,
            None => signatures >= 1,
        }
    };
    InputSignatureStatus {
        index,
        finalized,
        has_utxo,
        signatures,
        multisig,
        sufficient,
    }
}

pub fn is_fully_signed(psbt: &Psbt) -> bool {
    (0..psbt.inputs.len()).all(|i| input_signature_status(psbt, i).sufficient)
}

/// True when every input can be turned into a final scriptSig/witness.
pub fn can_finalize(psbt: &Psbt) -> bool {
    finalize_psbt(psbt).is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputDetails {
    pub outpoint: String,
    pub address: Option<String>,
    pub amount_sat: Option<u64>,
    pub utxo: &'static str,
    #[serde(flatten)]
    pub status: InputSignatureStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputDetails {
    pub index: usize,
    pub address: Option<String>,
    pub amount_sat: u64,
    pub is_change: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PsbtDetails {
    pub txid: String,
    pub inputs: Vec<InputDetails>,
    pub outputs: Vec<OutputDetails>,
    pub total_input_sat: Option<u64>,
    pub total_output_sat: u64,
    pub fee_sat: Option<u64>,
    pub virtual_size: u64,
    pub fee_rate_sat_vb: Option<f64>,
    pub multisig: Option<MultisigStatus>,
    pub fully_signed: bool,
    pub can_finalize: bool,
}

/// Summary for review before signing. Outputs with derivation data for one of
/// `fingerprints` are reported as change.
pub fn psbt_details(psbt: &Psbt, fingerprints: &[Fingerprint], network: Network) -> PsbtDetails {
    let inputs = (0..psbt.inputs.len())
        .map(|index| {
            let state = InputState::of(psbt, index);
            let utxo = state.utxo();
            InputDetails {
                outpoint: psbt.unsigned_tx.input[index].previous_output.to_string(),
                address: utxo.and_then(|u| address_from_script(&u.script_pubkey, network)),
                amount_sat: utxo.map(|u| u.value.to_sat()),
                utxo: match state {
                    InputState::Witness { .. } => "witness",
                    InputState::NonWitness { .. } => "non-witness",
                    InputState::MissingUtxo { .. } => "missing",
                },
                status: input_signature_status(psbt, index),
            }
        })
        .collect::<Vec<_>>();
    let outputs = psbt
        .unsigned_tx
        .output
        .iter()
        .zip(&psbt.outputs)
        .enumerate()
        .map(|(index, (txout, output))| {
            let ours = |fp: &Fingerprint| fingerprints.contains(fp);
            OutputDetails {
                index,
                address: address_from_script(&txout.script_pubkey, network),
                amount_sat: txout.value.to_sat(),
                is_change: output.bip32_derivation.values().any(|(fp, _)| ours(fp))
                    || output.tap_key_origins.values().any(|(_, (fp, _))| ours(fp)),
            }
        })
        .collect::<Vec<_>>();
    let total_input_sat = inputs
        .iter()
        .map(|i| i.amount_sat)
        .try_fold(0u64, |acc, a| acc.checked_add(a?));
    let total_output_sat = outputs.iter().map(|o| o.amount_sat).sum::<u64>();
    let fee_sat = total_input_sat.and_then(|i| i.checked_sub(total_output_sat));
    if total_input_sat.is_some() && fee_sat.is_none() {
        log::warn!("Outputs spend more than the inputs provide");
    }
    let virtual_size = estimate_vsize(psbt);
    let multisig = inputs
        .iter()
        .filter_map(|i| i.status.multisig)
        .reduce(|a, b| MultisigStatus {
            current: a.current.min(b.current),
            ..a
        });
    PsbtDetails {
        txid: psbt.unsigned_tx.compute_txid().to_string(),
        fully_signed: inputs.iter().all(|i| i.status.sufficient),
        can_finalize: can_finalize(psbt),
        inputs,
        outputs,
        total_input_sat,
        total_output_sat,
        fee_sat,
        virtual_size,
        fee_rate_sat_vb: fee_sat.map(|f| f as f64 / virtual_size as f64),
        multisig,
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{
        ecdsa,
        secp256k1::{Message, Secp256k1, SecretKey},
        sighash::EcdsaSighashType,
        Amount, PublicKey, ScriptBuf, TxOut,
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        psbt::test_utils::{funding_tx, spending_psbt},
        script::multisig_script,
    };

    fn keys() -> Vec<(SecretKey, PublicKey)> {
        let secp = Secp256k1::new();
        (1..=3u8)
            .map(|i| {
                let sk = SecretKey::from_slice(&[i; 32]).expect("valid key");
                (sk, PublicKey::new(sk.public_key(&secp)))
            })
            .collect()
    }

    fn sig(sk: &SecretKey) -> ecdsa::Signature {
        ecdsa::Signature {
            signature: Secp256k1::new().sign_ecdsa(&Message::from_digest([1u8; 32]), sk),
            sighash_type: EcdsaSighashType::All,
        }
    }

    fn multisig_psbt() -> anyhow::Result<Psbt> {
        let pubkeys = keys().into_iter().map(|(_, pk)| pk).collect::<Vec<_>>();
        let ws = multisig_script(2, &pubkeys, true)?;
        let funding = funding_tx(ScriptBuf::new_p2wsh(&ws.wscript_hash()), 100_000);
        let change = ScriptBuf::new_p2wsh(&ws.wscript_hash());
        let mut psbt = spending_psbt(
            &funding,
            vec![
                TxOut {
                    value: Amount::from_sat(60_000),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
                },
                TxOut {
                    value: Amount::from_sat(39_000),
                    script_pubkey: change,
                },
            ],
        );
        psbt.inputs[0].witness_utxo = Some(funding.output[0].clone());
        psbt.inputs[0].witness_script = Some(ws);
        psbt.outputs[1].bip32_derivation.insert(
            pubkeys[0].inner,
            (Fingerprint::from([9, 9, 9, 9]), Default::default()),
        );
        Ok(psbt)
    }

    #[test]
    fn test_multisig_status() -> anyhow::Result<()> {
        let keys = keys();
        let mut psbt = multisig_psbt()?;
        let status = input_signature_status(&psbt, 0);
        assert_eq!(
            status.multisig,
            Some(MultisigStatus {
                required: 2,
                total: 3,
                current: 0
            })
        );
        assert!(!status.sufficient);
        psbt.inputs[0].partial_sigs.insert(keys[0].1, sig(&keys[0].0));
        assert!(!is_fully_signed(&psbt));
        assert!(!can_finalize(&psbt));
        psbt.inputs[0].partial_sigs.insert(keys[2].1, sig(&keys[2].0));
        assert!(is_fully_signed(&psbt));
        assert!(can_finalize(&psbt));
        let finalized = finalize_psbt(&psbt)?;
        let status = input_signature_status(&finalized, 0);
        assert!(status.finalized && status.sufficient);
        Ok(())
    }

    #[test]
    fn test_details() -> anyhow::Result<()> {
        let psbt = multisig_psbt()?;
        let details = psbt_details(&psbt, &[Fingerprint::from([9, 9, 9, 9])], Network::Bitcoin);
        assert_eq!(details.total_input_sat, Some(100_000));
        assert_eq!(details.total_output_sat, 99_000);
        assert_eq!(details.fee_sat, Some(1_000));
        assert_eq!(details.inputs[0].utxo, "witness");
        assert!(details.inputs[0].address.as_deref().is_some_and(|a| a.starts_with("bc1q")));
        assert!(!details.outputs[0].is_change);
        assert!(details.outputs[1].is_change);
        assert_eq!(details.outputs[0].address, None);
        assert_eq!(
            details.multisig,
            Some(MultisigStatus {
                required: 2,
                total: 3,
                current: 0
            })
        );
        assert!(!details.fully_signed);
        assert_eq!(details.virtual_size, estimate_vsize(&psbt));
        assert!(details.fee_rate_sat_vb.is_some_and(|r| r > 1.0));

        let mut missing = psbt.clone();
        missing.inputs[0].witness_utxo = None;
        let details = psbt_details(&missing, &[], Network::Bitcoin);
        assert_eq!(details.fee_sat, None);
        assert_eq!(details.inputs[0].utxo, "missing");
        assert!(!details.inputs[0].status.sufficient);
        Ok(())
    }
}
