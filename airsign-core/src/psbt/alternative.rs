//! Fallback search for keys whose stated derivation path is wrong.
//!
//! Coordinators sometimes record a multisig-looking path for a single-sig key
//! (or the reverse), or the wrong account. When the key derived at the stated
//! path doesn't match, the same trailing `change/index` is tried under the
//! usual purposes and the first few accounts.

use std::ops::RangeInclusive;

use bitcoin::{
    bip32::{ChildNumber, Xpriv},
    secp256k1::{All, PublicKey, Secp256k1, SecretKey},
    Network,
};
use itertools::Itertools;

use crate::{address::coin_type, keypath::KeyPath};

pub const ALTERNATIVE_ACCOUNTS: RangeInclusive<u32> = 0..=9;
const SINGLESIG_PURPOSES: [u32; 4] = [84, 44, 49, 86];
const BIP48_PURPOSE: u32 = 48;
const BIP48_SCRIPT_TYPES: [u32; 2] = [2, 1];

fn hardened(i: u32) -> Option<ChildNumber> {
    ChildNumber::from_hardened_idx(i).ok()
}

/// Candidate paths in the order they are tried, without the stated path.
pub fn candidate_paths(stated: &KeyPath, network: Network) -> Vec<KeyPath> {
    let coin = stated.hardened_at(1).unwrap_or_else(|| coin_type(network));
    let suffix = stated.normal_suffix();
    let accounts = stated
        .hardened_at(2)
        .into_iter()
        .chain(ALTERNATIVE_ACCOUNTS)
        .unique()
        .collect::<Vec<_>>();
    let singlesig = SINGLESIG_PURPOSES.iter().flat_map(|&purpose| {
        accounts
            .iter()
            .map(move |&account| vec![purpose, coin, account])
    });
    let multisig = BIP48_SCRIPT_TYPES.iter().flat_map(|&script_type| {
        accounts
            .iter()
            .map(move |&account| vec![BIP48_PURPOSE, coin, account, script_type])
    });
    singlesig
        .chain(multisig)
        .filter_map(|prefix| {
            prefix
                .into_iter()
                .map(hardened)
                .collect::<Option<Vec<_>>>()
        })
        .map(|prefix| KeyPath::new(prefix).extend(suffix))
        .filter(|p| p != stated)
        .unique()
        .collect()
}

/// First candidate path whose public key satisfies `matches`.
pub fn find_alternative_path(
    secp: &Secp256k1<All>,
    master: &Xpriv,
    stated: &KeyPath,
    network: Network,
    matches: impl Fn(&PublicKey) -> bool,
) -> Option<(KeyPath, SecretKey)> {
    candidate_paths(stated, network).into_iter().find_map(|path| {
        let key = master
            .derive_priv(secp, &path.to_derivation_path())
            .ok()?
            .private_key;
        matches(&key.public_key(secp)).then(|| {
            log::debug!("Key for {stated} found at alternative path {path}");
            (path, key)
        })
    })
}
