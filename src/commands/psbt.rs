use std::path::Path;

use airsign_core::{
    anyhow::{self, Context},
    bitcoin::{
        base64::{engine::general_purpose::STANDARD, Engine},
        secp256k1::{All, Secp256k1},
        Amount,
    },
    config::EngineConfig,
    engine::{analyze_psbt_base64, finalize_psbt_base64, sign_psbt_base64, SignOutcome},
    hex, log,
    psbt::{sign::AlternativePath, PsbtDetails},
    secrecy::ExposeSecret,
};
use serde::Serialize;

use super::{
    create_file, from_input_to_signed_psbt, read_psbt_base64, read_seed, seed_fingerprint,
    to_json,
};
use crate::{handle_input_path, FinalizeArgs, InspectArgs, SignArgs};

/// What gets printed after writing a signed PSBT.
#[derive(Debug, Serialize)]
pub(crate) struct SignReport {
    pub(crate) output: String,
    pub(crate) signed_inputs: Vec<usize>,
    pub(crate) total_inputs: usize,
    pub(crate) alternative_paths: Vec<AlternativePath>,
    pub(crate) used_gap_scan: bool,
    pub(crate) stripped_global_xpubs: usize,
}

pub(super) fn validated_input_psbt_sign(details: &PsbtDetails) -> anyhow::Result<()> {
    if details.outputs.is_empty() {
        anyhow::bail!("The PSBT has no outputs, better avoid signing that")
    }
    Ok(())
}

/// Lists the outputs on stderr so they can be checked against the
/// coordinator's screen.
pub(super) fn print_outputs(details: &PsbtDetails) {
    for output in &details.outputs {
        let label = if output.is_change { "Change" } else { "Output" };
        let destination = output.address.as_deref().unwrap_or("non-standard script");
        eprintln!(
            "- {}: {label} {destination}: {:.8} BTC",
            output.index,
            Amount::from_sat(output.amount_sat).to_btc()
        );
    }
    match details.fee_sat {
        Some(fee) => eprintln!(
            "Fee: {fee} sats (~{:.1} sat/vB for {} vB)",
            details.fee_rate_sat_vb.unwrap_or_default(),
            details.virtual_size
        ),
        None => eprintln!("Fee: unknown, some inputs have no UTXO information"),
    }
}

/// Decodes the signed PSBT and writes it in binary form.
pub(super) fn save_signed(
    psbt_file: &Path,
    output: Option<&Path>,
    outcome: SignOutcome,
) -> anyhow::Result<String> {
    let output_path = match output {
        Some(p) => p.to_path_buf(),
        None => from_input_to_signed_psbt(&handle_input_path(psbt_file)?)?,
    };
    let bytes = STANDARD
        .decode(&outcome.psbt_base64)
        .context("failure decoding signed PSBT")?;
    let output_path = create_file(&bytes, &output_path)?;
    log::info!("Saved signed PSBT to {output_path:?}");
    to_json(&SignReport {
        output: output_path.display().to_string(),
        signed_inputs: outcome.signed_inputs,
        total_inputs: outcome.total_inputs,
        alternative_paths: outcome.alternative_paths,
        used_gap_scan: outcome.used_gap_scan,
        stripped_global_xpubs: outcome.stripped_global_xpubs,
    })
}

pub(crate) fn inspect(
    secp: &Secp256k1<All>,
    config: &EngineConfig,
    args: &InspectArgs,
) -> anyhow::Result<String> {
    let psbt = read_psbt_base64(&args.psbt_file)?;
    let fingerprints = args
        .seed_files
        .iter()
        .map(|f| seed_fingerprint(secp, &read_seed(f, None)?, config))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let details = analyze_psbt_base64(&psbt, &fingerprints, config.network)?;
    to_json(&details)
}

pub(crate) fn sign(
    secp: &Secp256k1<All>,
    config: &EngineConfig,
    args: &SignArgs,
) -> anyhow::Result<String> {
    let psbt = read_psbt_base64(&args.psbt_file)?;
    let seed = read_seed(&args.seed.seed_file, args.seed.passphrase_file.as_deref())?;
    let fingerprint = seed_fingerprint(secp, &seed, config)?;
    let details = analyze_psbt_base64(&psbt, &[fingerprint], config.network)?;
    validated_input_psbt_sign(&details)?;
    print_outputs(&details);
    let outcome = sign_psbt_base64(
        secp,
        &psbt,
        &hex::encode(seed.expose_secret()),
        args.seed.script_type,
        args.account,
        config,
    )?;
    for alternative in &outcome.alternative_paths {
        log::warn!(
            "Input {} was signed with {} instead of the stated {}",
            alternative.input,
            alternative.used,
            alternative.stated
        );
    }
    save_signed(&args.psbt_file, args.output.as_deref(), outcome)
}

/// Prints the transaction hex, or writes it to `--output`.
pub(crate) fn finalize(args: &FinalizeArgs) -> anyhow::Result<String> {
    let psbt = read_psbt_base64(&args.psbt_file)?;
    let tx_hex = finalize_psbt_base64(&psbt)?;
    match &args.output {
        Some(output) => {
            let path = create_file(tx_hex.as_bytes(), output)?;
            log::info!("Saved transaction to {path:?}");
            Ok(path.display().to_string())
        }
        None => Ok(tx_hex),
    }
}
