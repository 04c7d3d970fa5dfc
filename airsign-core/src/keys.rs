use std::fmt::Display;

use anyhow::Context;
use bitcoin::{
    bip32::{ChainCode, ChildNumber, Fingerprint, Xpriv, Xpub},
    secp256k1::{All, Secp256k1, SecretKey},
    Network,
};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox};
use serde::{Serialize, Serializer};
use zeroize::Zeroize;

use crate::{
    address::{generate_address, SingleSigScriptType},
    keypath::KeyPath,
    slip132::ToSlip132,
};

pub type Secret<T> = SecretBox<T>;

/// Extended private key that wipes its secret and chain code when dropped
/// from a `Secret`.
#[derive(Clone)]
pub struct WXpriv(pub Xpriv);

impl Zeroize for WXpriv {
    fn zeroize(&mut self) {
        self.0.private_key.non_secure_erase();
        self.0.chain_code = ChainCode::from([0u8; 32]);
    }
}

impl CloneableSecret for WXpriv {}

pub fn secret_xpriv(xpriv: Xpriv) -> Secret<WXpriv> {
    Secret::from(Box::new(WXpriv(xpriv)))
}

/// BIP32 master key (HMAC-SHA512 keyed with "Bitcoin seed").
pub fn master_from_seed(seed: &[u8], network: Network) -> anyhow::Result<Secret<WXpriv>> {
    anyhow::ensure!(
        (16..=64).contains(&seed.len()),
        "Seed must be between 16 and 64 bytes, got {}",
        seed.len()
    );
    let master = Xpriv::new_master(network, seed).context("failure deriving master key")?;
    Ok(secret_xpriv(master))
}

pub fn derive_xpriv(
    secp: &Secp256k1<All>,
    parent: &Xpriv,
    path: &KeyPath,
) -> anyhow::Result<Secret<WXpriv>> {
    let child = parent
        .derive_priv(secp, &path.to_derivation_path())
        .with_context(|| format!("failure deriving private key at {path}"))?;
    Ok(secret_xpriv(child))
}

/// Public derivation. Hardened components are an error since they need the
/// private key.
pub fn derive_xpub(secp: &Secp256k1<All>, parent: &Xpub, path: &KeyPath) -> anyhow::Result<Xpub> {
    if let Some(c) = path.children().iter().find(|c| c.is_hardened()) {
        anyhow::bail!("Cannot derive hardened child {c} from a public key")
    }
    parent
        .derive_pub(secp, &path.to_derivation_path())
        .with_context(|| format!("failure deriving public key at {path}"))
}

/// The first four bytes of HASH160(pubkey) read as a little-endian integer,
/// the form some wallet files store fingerprints in.
pub fn fingerprint_le_u32(fingerprint: Fingerprint) -> u32 {
    u32::from_le_bytes(fingerprint.to_bytes())
}

pub fn master_fingerprint(secp: &Secp256k1<All>, master: &Secret<WXpriv>) -> Fingerprint {
    master.expose_secret().0.fingerprint(secp)
}

pub(crate) fn serialize_display<T: Display, S: Serializer>(v: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(v)
}

/// Public key material handed back to the storage layer after importing a seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalletKeys {
    #[serde(serialize_with = "serialize_display")]
    pub master_fingerprint: Fingerprint,
    pub master_fingerprint_le: u32,
    #[serde(serialize_with = "serialize_display")]
    pub account_path: KeyPath,
    #[serde(serialize_with = "serialize_display")]
    pub account_xpub: Xpub,
    pub account_xpub_slip132: String,
    pub script_type: SingleSigScriptType,
    pub first_receive_address: String,
}

impl WalletKeys {
    pub fn derive(
        secp: &Secp256k1<All>,
        seed: &[u8],
        account_path: &KeyPath,
        network: Network,
        script_type: SingleSigScriptType,
    ) -> anyhow::Result<Self> {
        let master = master_from_seed(seed, network)?;
        Self::from_master(secp, &master, account_path, network, script_type)
    }

    pub fn from_master(
        secp: &Secp256k1<All>,
        master: &Secret<WXpriv>,
        account_path: &KeyPath,
        network: Network,
        script_type: SingleSigScriptType,
    ) -> anyhow::Result<Self> {
        let master_fingerprint = master_fingerprint(secp, master);
        let account_xpriv = derive_xpriv(secp, &master.expose_secret().0, account_path)?;
        let account_xpub = Xpub::from_priv(secp, &account_xpriv.expose_secret().0);
        let first_receive_address =
            generate_address(secp, &account_xpub, 0, false, script_type, network)?;
        log::debug!("Derived account {account_path} for {master_fingerprint}");
        Ok(Self {
            master_fingerprint,
            master_fingerprint_le: fingerprint_le_u32(master_fingerprint),
            account_path: account_path.clone(),
            account_xpub,
            account_xpub_slip132: account_xpub
                .to_slip132_string(script_type.key_application(), account_xpub.network),
            script_type,
            first_receive_address: first_receive_address.to_string(),
        })
    }
}

/// Private key material of one single-sig account, used for signing.
#[derive(Clone)]
pub struct SigningKeys {
    master: Secret<WXpriv>,
    pub master_fingerprint: Fingerprint,
    pub account_path: KeyPath,
    pub account_xpub: Xpub,
    pub script_type: SingleSigScriptType,
    pub network: Network,
}

impl SigningKeys {
    pub fn new(
        secp: &Secp256k1<All>,
        master: Secret<WXpriv>,
        account_path: KeyPath,
        script_type: SingleSigScriptType,
        network: Network,
    ) -> anyhow::Result<Self> {
        let master_fingerprint = master_fingerprint(secp, &master);
        let account_xpriv = derive_xpriv(secp, &master.expose_secret().0, &account_path)?;
        let account_xpub = Xpub::from_priv(secp, &account_xpriv.expose_secret().0);
        Ok(Self {
            master,
            master_fingerprint,
            account_path,
            account_xpub,
            script_type,
            network,
        })
    }

    pub fn from_seed(
        secp: &Secp256k1<All>,
        seed: &[u8],
        account_path: KeyPath,
        script_type: SingleSigScriptType,
        network: Network,
    ) -> anyhow::Result<Self> {
        Self::new(
            secp,
            master_from_seed(seed, network)?,
            account_path,
            script_type,
            network,
        )
    }

    pub fn master(&self) -> &Secret<WXpriv> {
        &self.master
    }

    /// Private key at `path`, counted from the master key.
    pub fn secret_key_at(
        &self,
        secp: &Secp256k1<All>,
        path: &KeyPath,
    ) -> anyhow::Result<SecretKey> {
        Ok(derive_xpriv(secp, &self.master.expose_secret().0, path)?
            .expose_secret()
            .0
            .private_key)
    }

    /// Private key at `branch/index` below the account key.
    pub fn account_child_key(
        &self,
        secp: &Secp256k1<All>,
        is_change: bool,
        index: u32,
    ) -> anyhow::Result<(KeyPath, SecretKey)> {
        let path = self.account_path.extend(&[
            ChildNumber::from_normal_idx(u32::from(is_change))?,
            ChildNumber::from_normal_idx(index)?,
        ]);
        let key = self.secret_key_at(secp, &path)?;
        Ok((path, key))
    }
}
