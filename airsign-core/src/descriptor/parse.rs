use std::str::FromStr;

use anyhow::Context;
use bitcoin::{
    bip32::{Fingerprint, Xpub},
    secp256k1::{All, Secp256k1},
    Network, NetworkKind,
};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::{
    add_checksum,
    bsms::{extract_bsms, BsmsContent},
    miniscript_address, multisig_descriptor, strip_and_verify_checksum,
};
use crate::{
    address::SingleSigScriptType,
    error::MalformedInput,
    keypath::KeyPath,
    multisig::{
        ChildTemplate, CosignerInfo, MultisigConfig, MultisigScriptType, MultisigType,
        MAX_TOTAL_SIGS_MULTISIG,
    },
    slip132::FromSlip132,
};

// [fingerprint/origin/path]XPUB/child/path
static KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?:\[([0-9a-fA-F]{8})((?:/[0-9]+['hH]?)*)\])?",
        r"([xyzYZtuvUV]pub[1-9A-HJ-NP-Za-km-z]{100,112})",
        r"((?:/(?:[0-9]+|<[0-9]+;[0-9]+>|\*))*)",
    ))
    .unwrap()
});
static THRESHOLD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(sorted)?multi\(\s*([0-9]+)\s*,").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyEntry {
    fingerprint: Fingerprint,
    derivation_path: KeyPath,
    xpub: Xpub,
    xpub_text: String,
    child_path: ChildTemplate,
}

fn parse_key_entry(c: &Captures) -> anyhow::Result<KeyEntry> {
    let xpub_text = c.get(3).context("missing xpub")?.as_str();
    let xpub = Xpub::from_slip132_str(xpub_text)
        .with_context(|| format!("invalid extended key {xpub_text}"))?;
    let fingerprint = match c.get(1) {
        Some(f) => Fingerprint::from_str(f.as_str())?,
        None => {
            log::debug!("Key {xpub_text} has no origin, using its own fingerprint");
            xpub.fingerprint()
        }
    };
    let derivation_path = match c.get(2).map(|m| m.as_str()).unwrap_or_default() {
        "" => KeyPath::master(),
        p => KeyPath::from_str(p.trim_start_matches('/'))?,
    };
    let child_path = ChildTemplate::from_str(c.get(4).map(|m| m.as_str()).unwrap_or_default())?;
    Ok(KeyEntry {
        fingerprint,
        derivation_path,
        xpub,
        xpub_text: xpub_text.to_owned(),
        child_path,
    })
}

fn check_network(xpub: &Xpub, network: Network) -> anyhow::Result<()> {
    anyhow::ensure!(
        xpub.network == NetworkKind::from(network),
        "Extended key {xpub} doesn't belong to {network}"
    );
    Ok(())
}

fn descriptor_error(e: anyhow::Error) -> MalformedInput {
    MalformedInput::Descriptor(format!("{e:#}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleSigDescriptor {
    pub script_type: SingleSigScriptType,
    pub fingerprint: Fingerprint,
    pub derivation_path: KeyPath,
    pub xpub: Xpub,
    pub child_path: ChildTemplate,
}

/// Inverse of [`super::unified_descriptor`].
pub fn parse_singlesig_descriptor(text: &str) -> Result<SingleSigDescriptor, MalformedInput> {
    parse_singlesig(text).map_err(descriptor_error)
}

fn parse_singlesig(text: &str) -> anyhow::Result<SingleSigDescriptor> {
    let bsms = extract_bsms(text);
    let desc = strip_and_verify_checksum(&bsms.descriptor)?;
    for script_type in SingleSigScriptType::ALL {
        let (open, close) = script_type.descriptor_wrapper();
        let Some(inner) = desc.strip_prefix(open).and_then(|d| d.strip_suffix(close)) else {
            continue;
        };
        let captures = KEY_RE
            .captures(inner)
            .filter(|c| c.get(0).map(|m| m.as_str()) == Some(inner))
            .with_context(|| format!("Invalid key expression {inner}"))?;
        let key = parse_key_entry(&captures)?;
        return Ok(SingleSigDescriptor {
            script_type,
            fingerprint: key.fingerprint,
            derivation_path: key.derivation_path,
            xpub: key.xpub,
            child_path: key.child_path,
        });
    }
    anyhow::bail!("Unsupported single-sig descriptor {desc}")
}

fn multisig_script_type(desc: &str) -> anyhow::Result<MultisigScriptType> {
    if desc.starts_with("sh(wsh(") {
        Ok(MultisigScriptType::P2shP2wsh)
    } else if desc.starts_with("wsh(") {
        Ok(MultisigScriptType::P2wsh)
    } else if desc.starts_with("sh(") {
        Ok(MultisigScriptType::P2sh)
    } else {
        anyhow::bail!("Unsupported multisig descriptor, expected wsh(, sh(wsh( or sh(")
    }
}

/// Parses a multisig descriptor, optionally wrapped in a BSMS record.
///
/// Cosigners whose fingerprint is in `local_fingerprints` are marked local.
/// When the record carries a first address it must match the address derived
/// from the parsed keys.
pub fn parse_multisig_descriptor(
    secp: &Secp256k1<All>,
    text: &str,
    local_fingerprints: &[Fingerprint],
    network: Network,
) -> Result<MultisigConfig, MalformedInput> {
    let bsms = extract_bsms(text);
    let descriptor = strip_and_verify_checksum(&bsms.descriptor)
        .map_err(descriptor_error)?
        .to_owned();
    let desc = descriptor.as_str();
    let script_type = multisig_script_type(desc).map_err(descriptor_error)?;
    let threshold = THRESHOLD_RE
        .captures(desc)
        .context("No multi( or sortedmulti( found")
        .map_err(descriptor_error)?;
    let sorted = threshold.get(1).is_some();
    let required: u32 = threshold
        .get(2)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse()
        .map_err(|e| MalformedInput::Descriptor(format!("Invalid threshold: {e}")))?;
    let keys = KEY_RE
        .captures_iter(desc)
        .map(|c| parse_key_entry(&c))
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(descriptor_error)?;
    let total = u32::try_from(keys.len()).unwrap_or(u32::MAX);
    if required < 1 || required > total || total > MAX_TOTAL_SIGS_MULTISIG {
        return Err(MalformedInput::Threshold { required, total });
    }
    let multisig_type = MultisigType::new(required, total).map_err(descriptor_error)?;
    build_config(
        secp,
        desc,
        bsms,
        keys,
        multisig_type,
        script_type,
        sorted,
        local_fingerprints,
        network,
    )
    .map_err(descriptor_error)
}

#[allow(clippy::too_many_arguments)]
fn build_config(
    secp: &Secp256k1<All>,
    desc: &str,
    bsms: BsmsContent,
    keys: Vec<KeyEntry>,
    multisig_type: MultisigType,
    script_type: MultisigScriptType,
    sorted: bool,
    local_fingerprints: &[Fingerprint],
    network: Network,
) -> anyhow::Result<MultisigConfig> {
    if let Some(duplicated) = keys.iter().map(|k| k.xpub).duplicates().next() {
        anyhow::bail!("Cosigner key {duplicated} appears more than once")
    }
    for k in &keys {
        check_network(&k.xpub, network)?;
    }
    let cosigners = keys
        .into_iter()
        .map(|k| CosignerInfo {
            is_local: local_fingerprints.contains(&k.fingerprint),
            xpub: k.xpub,
            xpub_text: k.xpub_text,
            fingerprint: k.fingerprint,
            derivation_path: k.derivation_path,
            child_path: k.child_path,
        })
        .collect::<Vec<_>>();
    let config = MultisigConfig {
        multisig_type,
        cosigners,
        script_type,
        sorted,
        descriptor: add_checksum(desc)?,
        bsms: bsms.is_bsms().then_some(bsms),
    };
    config.validate()?;

    let first = config.address(secp, false, 0, network)?;
    match miniscript_address(&multisig_descriptor(&config)?, false, 0, network) {
        Ok(other) => anyhow::ensure!(
            other == first,
            "Derived address {first} disagrees with miniscript ({other})"
        ),
        Err(e) => log::warn!("Skipping miniscript cross-check: {e:#}"),
    }
    if let Some(expected) = config.bsms.as_ref().and_then(|b| b.first_address.as_deref()) {
        anyhow::ensure!(
            first.to_string() == expected,
            "First address mismatch: record says {expected} but keys derive {first}"
        );
    }
    let local = config.local_cosigners().count();
    log::info!(
        "Imported {} {} multisig with {local} local cosigner(s)",
        config.multisig_type,
        config.script_type
    );
    if local == 0 {
        log::debug!("None of {} fingerprints matched", local_fingerprints.len());
    }
    Ok(config)
}
