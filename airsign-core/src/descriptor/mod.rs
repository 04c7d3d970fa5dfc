//! Output descriptors: checksum, generation and parsing of the subset the
//! signer deals with (`pkh`, `sh`, `wpkh`, `wsh`, `tr`, `multi`, `sortedmulti`).

use std::str::FromStr;

use anyhow::Context;
use bitcoin::{
    bip32::{Fingerprint, Xpub},
    Address, Network,
};
use miniscript::{Descriptor, DescriptorPublicKey};

use crate::{address::SingleSigScriptType, keypath::KeyPath, multisig::MultisigConfig};

pub mod bsms;
pub mod parse;

pub use parse::{parse_multisig_descriptor, parse_singlesig_descriptor, SingleSigDescriptor};

const INPUT_CHARSET: &str = "0123456789()[],'/*abcdefgh@:$%{}IJKLMNOPQRSTUVWXYZ&+-.;<=>?!^_|~ijklmnopqrstuvwxyzABCDEFGH`#\"\\ ";
const CHECKSUM_CHARSET: &[u8] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
pub const CHECKSUM_LENGTH: usize = 8;

fn poly_mod(mut c: u64, val: u64) -> u64 {
    let c0 = c >> 35;
    c = ((c & 0x7ffffffff) << 5) ^ val;
    if c0 & 1 != 0 {
        c ^= 0xf5dee51989;
    }
    if c0 & 2 != 0 {
        c ^= 0xa9fdca3312;
    }
    if c0 & 4 != 0 {
        c ^= 0x1bab10e32d;
    }
    if c0 & 8 != 0 {
        c ^= 0x3706b1677a;
    }
    if c0 & 16 != 0 {
        c ^= 0x644d626ffd;
    }
    c
}

/// BIP-380 descriptor checksum of `desc` (which must not contain `#`).
pub fn checksum(desc: &str) -> anyhow::Result<String> {
    let mut c = 1u64;
    let mut cls = 0u64;
    let mut cls_count = 0;
    for ch in desc.chars() {
        let pos = INPUT_CHARSET
            .find(ch)
            .with_context(|| format!("Invalid character {ch:?} in descriptor"))? as u64;
        c = poly_mod(c, pos & 31);
        cls = cls * 3 + (pos >> 5);
        cls_count += 1;
        if cls_count == 3 {
            c = poly_mod(c, cls);
            cls = 0;
            cls_count = 0;
        }
    }
    if cls_count > 0 {
        c = poly_mod(c, cls);
    }
    for _ in 0..CHECKSUM_LENGTH {
        c = poly_mod(c, 0);
    }
    c ^= 1;
    Ok((0..CHECKSUM_LENGTH)
        .map(|j| char::from(CHECKSUM_CHARSET[((c >> (5 * (7 - j))) & 31) as usize]))
        .collect())
}

pub fn add_checksum(desc: &str) -> anyhow::Result<String> {
    Ok(format!("{desc}#{}", checksum(desc)?))
}

/// Returns the descriptor without its checksum. A missing checksum is
/// accepted, a wrong one is not.
pub fn strip_and_verify_checksum(text: &str) -> anyhow::Result<&str> {
    let text = text.trim();
    match text.split_once('#') {
        None => Ok(text),
        Some((desc, given)) => {
            let expected = checksum(desc)?;
            anyhow::ensure!(
                given == expected,
                "Invalid descriptor checksum {given}, expected {expected}"
            );
            Ok(desc)
        }
    }
}

fn key_expression(fingerprint: Fingerprint, path: &KeyPath, xpub: &Xpub, suffix: &str) -> String {
    let origin = if path.is_empty() {
        format!("[{fingerprint}]")
    } else {
        format!("[{fingerprint}/{}]", path.to_descriptor_string())
    };
    if suffix.is_empty() {
        format!("{origin}{xpub}")
    } else {
        format!("{origin}{xpub}/{suffix}")
    }
}

/// `scriptFn([fingerprint/path]xpub/<0;1>/*)#checksum`, covering both the
/// receive and change branches.
pub fn unified_descriptor(
    fingerprint: Fingerprint,
    path: &KeyPath,
    xpub: &Xpub,
    script_type: SingleSigScriptType,
) -> anyhow::Result<String> {
    let (open, close) = script_type.descriptor_wrapper();
    let key = key_expression(fingerprint, path, xpub, "<0;1>/*");
    add_checksum(&format!("{open}{key}{close}"))
}

/// `wsh(sortedmulti(m,...))` and friends for a multisig configuration.
pub fn multisig_descriptor(config: &MultisigConfig) -> anyhow::Result<String> {
    let (open, close) = config.script_type.descriptor_wrapper();
    let function = if config.sorted { "sortedmulti" } else { "multi" };
    let keys = config
        .cosigners
        .iter()
        .map(|c| {
            key_expression(
                c.fingerprint,
                &c.derivation_path,
                &c.xpub,
                &c.child_path.to_string(),
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    add_checksum(&format!(
        "{open}{function}({},{keys}){close}",
        config.multisig_type.required
    ))
}

/// Derives the address at `index` on the receive or change branch with
/// miniscript, as an independent check of our own script building.
pub fn miniscript_address(
    descriptor: &str,
    is_change: bool,
    index: u32,
    network: Network,
) -> anyhow::Result<Address> {
    let descriptor = Descriptor::<DescriptorPublicKey>::from_str(descriptor)
        .context("miniscript rejected the descriptor")?;
    let singles = descriptor.into_single_descriptors()?;
    let branch = match (singles.len(), is_change) {
        (1, _) => &singles[0],
        (_, false) => &singles[0],
        (_, true) => &singles[1],
    };
    Ok(branch.at_derivation_index(index)?.address(network)?)
}
