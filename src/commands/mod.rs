use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use airsign_core::{
    anyhow::{self, Context},
    bitcoin::{
        base64::{engine::general_purpose::STANDARD, Engine},
        bip32::Fingerprint,
        secp256k1::{All, Secp256k1},
    },
    config::EngineConfig,
    hex,
    keys::{master_fingerprint, master_from_seed, Secret},
    mnemonic::seed_from_text,
    psbt::raw::PSBT_MAGIC,
    secrecy::{ExposeSecret, SecretString},
    serde_json,
};
use serde::Serialize;

use crate::{handle_input_path, handle_output_path, Command};

pub(crate) mod keys;
pub(crate) mod multisig;
pub(crate) mod psbt;

const SIGNED_PSBT_FILE_SUFFIX: &str = "_signed.psbt";

/// Runs one command and returns what should be printed on stdout.
pub(crate) fn run(
    secp: &Secp256k1<All>,
    config: &EngineConfig,
    command: &Command,
) -> anyhow::Result<String> {
    match command {
        Command::Keys(args) => keys::keys(secp, config, args),
        Command::Address(args) => keys::address(secp, config, args),
        Command::Descriptor(args) => keys::descriptor(secp, config, args),
        Command::ImportMultisig(args) => multisig::import(secp, config, args),
        Command::Inspect(args) => psbt::inspect(secp, config, args),
        Command::Sign(args) => psbt::sign(secp, config, args),
        Command::SignMultisig(args) => multisig::sign(secp, config, args),
        Command::Finalize(args) => psbt::finalize(args),
    }
}

pub(crate) fn to_json(value: &impl Serialize) -> anyhow::Result<String> {
    serde_json::to_string_pretty(value).context("failure serializing output")
}

fn read_passphrase(path: &Path) -> anyhow::Result<SecretString> {
    let path = handle_input_path(path)?;
    let text = fs::read_to_string(&path).with_context(|| format!("failure reading {path:?}"))?;
    Ok(SecretString::from(text.trim_end_matches(['\r', '\n']).to_owned()))
}

/// Seed bytes from a file holding a mnemonic or a hex seed.
pub(crate) fn read_seed(
    seed_file: &Path,
    passphrase_file: Option<&Path>,
) -> anyhow::Result<Secret<Vec<u8>>> {
    let path = handle_input_path(seed_file)?;
    let text = SecretString::from(
        fs::read_to_string(&path).with_context(|| format!("failure reading seed {path:?}"))?,
    );
    let passphrase = passphrase_file.map(read_passphrase).transpose()?;
    seed_from_text(text.expose_secret(), passphrase.as_ref())
        .with_context(|| format!("invalid seed in {path:?}"))
}

pub(crate) fn read_seed_hex(
    seed_file: &Path,
    passphrase_file: Option<&Path>,
) -> anyhow::Result<SecretString> {
    let seed = read_seed(seed_file, passphrase_file)?;
    Ok(SecretString::from(hex::encode(seed.expose_secret())))
}

pub(crate) fn seed_fingerprint(
    secp: &Secp256k1<All>,
    seed: &Secret<Vec<u8>>,
    config: &EngineConfig,
) -> anyhow::Result<Fingerprint> {
    let master = master_from_seed(seed.expose_secret(), config.network)?;
    Ok(master_fingerprint(secp, &master))
}

/// Reads a PSBT file in binary, hex or base64 form and returns it as base64.
/// The bytes are passed through untouched so the engine sees the original.
pub(crate) fn read_psbt_base64(path: &Path) -> anyhow::Result<String> {
    let path = handle_input_path(path)?;
    let bytes = fs::read(&path).with_context(|| format!("failure reading PSBT {path:?}"))?;
    if bytes.starts_with(&PSBT_MAGIC) {
        return Ok(STANDARD.encode(&bytes));
    }
    let text = std::str::from_utf8(&bytes)
        .with_context(|| format!("{path:?} is neither a binary nor a text PSBT"))?
        .trim();
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(STANDARD.encode(hex::decode(text)?));
    }
    Ok(text.to_owned())
}

pub(crate) fn read_text(path: &Path) -> anyhow::Result<String> {
    let path = handle_input_path(path)?;
    fs::read_to_string(&path).with_context(|| format!("failure reading {path:?}"))
}

/// Writes a new file, never overwriting an existing one.
pub(crate) fn create_file(data: &[u8], output_file_path: &Path) -> anyhow::Result<PathBuf> {
    let path = handle_output_path(output_file_path)?;
    let mut f = BufWriter::new(
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .context("failure opening output file for write")?,
    );
    f.write_all(data).context("failure writing final data")?;
    f.flush().context("failure flushing final data")?;
    Ok(path.to_path_buf())
}

pub(crate) fn from_input_to_signed_psbt(file: &Path) -> anyhow::Result<PathBuf> {
    extend_base_name_with_suffix(file, SIGNED_PSBT_FILE_SUFFIX)
}

fn extend_base_name_with_suffix(base_name: &Path, suffix: &str) -> anyhow::Result<PathBuf> {
    let mut output_name = base_name
        .file_stem()
        .ok_or_else(|| anyhow::anyhow!("Output path {base_name:?} isn't a file"))?
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Output path {base_name:?} has a invalid name"))?
        .to_string();
    output_name.push_str(suffix);
    Ok(base_name.with_file_name(output_name.as_str()))
}
