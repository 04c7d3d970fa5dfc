use std::cmp::Ordering;

use bitcoin::{consensus::encode::serialize_hex, hashes::Hash, Psbt, Transaction, TxIn, TxOut};

// txid in the byte order it is displayed in
fn input_key(input: &TxIn) -> ([u8; 32], u32) {
    let mut txid = input.previous_output.txid.to_byte_array();
    txid.reverse();
    (txid, input.previous_output.vout)
}

fn compare_inputs(a: &TxIn, b: &TxIn) -> Ordering {
    input_key(a).cmp(&input_key(b))
}

fn compare_outputs(a: &TxOut, b: &TxOut) -> Ordering {
    a.value
        .cmp(&b.value)
        .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
}

/// BIP-69 ordering of inputs and outputs.
pub fn sort_bip69(tx: &Transaction) -> Transaction {
    let mut tx = tx.clone();
    tx.input.sort_by(compare_inputs);
    tx.output.sort_by(compare_outputs);
    tx
}

/// BIP-69 ordering applied to a PSBT, keeping each per-input and per-output
/// map next to the entry it describes.
pub fn sort_psbt_bip69(psbt: &Psbt) -> Psbt {
    let mut psbt = psbt.clone();
    let mut inputs = std::mem::take(&mut psbt.unsigned_tx.input)
        .into_iter()
        .zip(std::mem::take(&mut psbt.inputs))
        .collect::<Vec<_>>();
    inputs.sort_by(|(a, _), (b, _)| compare_inputs(a, b));
    let mut outputs = std::mem::take(&mut psbt.unsigned_tx.output)
        .into_iter()
        .zip(std::mem::take(&mut psbt.outputs))
        .collect::<Vec<_>>();
    outputs.sort_by(|(a, _), (b, _)| compare_outputs(a, b));
    let (tx_inputs, psbt_inputs): (Vec<_>, Vec<_>) = inputs.into_iter().unzip();
    let (tx_outputs, psbt_outputs): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
    psbt.unsigned_tx.input = tx_inputs;
    psbt.inputs = psbt_inputs;
    psbt.unsigned_tx.output = tx_outputs;
    psbt.outputs = psbt_outputs;
    psbt
}

/// Raw transaction hex.
pub fn to_hex(tx: &Transaction) -> String {
    serialize_hex(tx)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bitcoin::{
        absolute::LockTime, psbt, transaction::Version, Amount, OutPoint, ScriptBuf, Sequence,
        Txid, Witness,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    fn input(txid: &str, vout: u32) -> anyhow::Result<TxIn> {
        Ok(TxIn {
            previous_output: OutPoint::new(Txid::from_str(txid)?, vout),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        })
    }

    fn output(sats: u64, script: &[u8]) -> TxOut {
        TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: ScriptBuf::from_bytes(script.to_vec()),
        }
    }

    fn tx() -> anyhow::Result<Transaction> {
        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![
                input("ff00000000000000000000000000000000000000000000000000000000000001", 0)?,
                input("0100000000000000000000000000000000000000000000000000000000000000", 5)?,
                input("0100000000000000000000000000000000000000000000000000000000000000", 1)?,
            ],
            output: vec![
                output(2000, &[0x51, 0x02]),
                output(1000, &[0x51]),
                output(2000, &[0x51, 0x01]),
            ],
        })
    }

    #[test]
    fn test_sort_bip69() -> anyhow::Result<()> {
        let sorted = sort_bip69(&tx()?);
        let vouts = sorted
            .input
            .iter()
            .map(|i| i.previous_output.vout)
            .collect::<Vec<_>>();
        assert_eq!(vouts, vec![1, 5, 0]);
        let outputs = sorted
            .output
            .iter()
            .map(|o| (o.value.to_sat(), o.script_pubkey.to_bytes()))
            .collect::<Vec<_>>();
        assert_eq!(
            outputs,
            vec![
                (1000, vec![0x51]),
                (2000, vec![0x51, 0x01]),
                (2000, vec![0x51, 0x02])
            ]
        );
        Ok(())
    }

    #[test]
    fn test_sort_psbt_keeps_maps_aligned() -> anyhow::Result<()> {
        let mut p = Psbt::from_unsigned_tx(tx()?)?;
        for (i, input) in p.inputs.iter_mut().enumerate() {
            input.witness_utxo = Some(output(i as u64, &[]));
        }
        let sorted = sort_psbt_bip69(&p);
        assert_eq!(sorted.unsigned_tx, sort_bip69(&p.unsigned_tx));
        let tags = sorted
            .inputs
            .iter()
            .map(|i: &psbt::Input| i.witness_utxo.as_ref().map(|u| u.value.to_sat()))
            .collect::<Vec<_>>();
        assert_eq!(tags, vec![Some(2), Some(1), Some(0)]);
        Ok(())
    }

    #[test]
    fn test_to_hex() -> anyhow::Result<()> {
        let hex = to_hex(&tx()?);
        assert!(hex.starts_with("0200000003"));
        Ok(())
    }
}
