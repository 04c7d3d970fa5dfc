use airsign_core::{
    anyhow::{self, Context},
    bitcoin::{
        bip32::Fingerprint,
        secp256k1::{All, Secp256k1},
    },
    config::EngineConfig,
    engine::{analyze_psbt_base64, import_multisig, sign_multisig_psbt_base64, MemoryStorage},
    hex, log,
    multisig::MultisigConfig,
    secrecy::{ExposeSecret, SecretString},
};
use serde::Serialize;

use super::{
    psbt::{print_outputs, save_signed, validated_input_psbt_sign},
    read_psbt_base64, read_seed, read_text, seed_fingerprint, to_json,
};
use crate::{ImportMultisigArgs, SignMultisigArgs};

#[derive(Debug, Serialize)]
struct ImportReport<'a> {
    #[serde(flatten)]
    config: &'a MultisigConfig,
    receiving_addresses: Vec<String>,
}

/// Loads every seed file into a storage keyed by file name, returning the
/// fingerprints found.
fn load_storage(
    secp: &Secp256k1<All>,
    config: &EngineConfig,
    seed_files: &[std::path::PathBuf],
) -> anyhow::Result<(MemoryStorage, Vec<Fingerprint>)> {
    let mut storage = MemoryStorage::default();
    let mut fingerprints = Vec::with_capacity(seed_files.len());
    for file in seed_files {
        let seed = read_seed(file, None)?;
        let fingerprint = seed_fingerprint(secp, &seed, config)?;
        log::debug!("Loaded seed {fingerprint} from {file:?}");
        storage.add_seed(
            file.display().to_string(),
            SecretString::from(hex::encode(seed.expose_secret())),
        );
        fingerprints.push(fingerprint);
    }
    Ok((storage, fingerprints))
}

pub(crate) fn import(
    secp: &Secp256k1<All>,
    config: &EngineConfig,
    args: &ImportMultisigArgs,
) -> anyhow::Result<String> {
    let text = read_text(&args.descriptor_file)?;
    let (_, fingerprints) = load_storage(secp, config, &args.seed_files)?;
    let multisig = import_multisig(secp, &text, &fingerprints, config.network)?;
    let receiving_addresses = (0..args.addresses)
        .map(|i| {
            multisig
                .address(secp, false, i, config.network)
                .map(|a| a.to_string())
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    log::info!(
        "Imported {} {} wallet with {} local cosigners",
        multisig.multisig_type,
        multisig.script_type,
        multisig.local_cosigners().count()
    );
    to_json(&ImportReport {
        config: &multisig,
        receiving_addresses,
    })
}

pub(crate) fn sign(
    secp: &Secp256k1<All>,
    config: &EngineConfig,
    args: &SignMultisigArgs,
) -> anyhow::Result<String> {
    let psbt = read_psbt_base64(&args.psbt_file)?;
    let text = read_text(&args.descriptor_file)?;
    let (storage, fingerprints) = load_storage(secp, config, &args.seed_files)?;
    let multisig = import_multisig(secp, &text, &fingerprints, config.network)
        .context("failure importing the multisig descriptor")?;
    let details = analyze_psbt_base64(&psbt, &fingerprints, config.network)?;
    validated_input_psbt_sign(&details)?;
    print_outputs(&details);
    let outcome = sign_multisig_psbt_base64(secp, &psbt, &multisig, &storage, config)?;
    save_signed(&args.psbt_file, args.output.as_deref(), outcome)
}
