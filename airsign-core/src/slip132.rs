//! SLIP-132 version prefixes for extended keys.
//!
//! `bitcoin::bip32` only knows xprv/xpub and tprv/tpub. Keys in the other
//! encodings are converted by swapping the 4 version bytes before handing the
//! 78-byte payload to the standard decoder.

use anyhow::{bail, Context};
use bitcoin::{
    base58,
    bip32::{Xpriv, Xpub},
    NetworkKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyApplication {
    /// P2PKH / generic (xpub, tpub)
    Hashed,
    /// P2WPKH nested in P2SH (ypub, upub)
    Nested,
    /// native P2WPKH (zpub, vpub)
    SegWit,
    /// P2WSH multisig nested in P2SH (Ypub, Upub)
    NestedMultisig,
    /// native P2WSH multisig (Zpub, Vpub)
    SegWitMultisig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyVersion {
    pub bytes: [u8; 4],
    pub prefix: &'static str,
    pub application: KeyApplication,
    pub network: NetworkKind,
    pub is_private: bool,
}

const fn v(
    bytes: [u8; 4],
    prefix: &'static str,
    application: KeyApplication,
    network: NetworkKind,
    is_private: bool,
) -> KeyVersion {
    KeyVersion {
        bytes,
        prefix,
        application,
        network,
        is_private,
    }
}

use KeyApplication::*;
use NetworkKind::{Main, Test};

pub const KEY_VERSIONS: [KeyVersion; 20] = [
    v([0x04, 0x88, 0xAD, 0xE4], "xprv", Hashed, Main, true),
    v([0x04, 0x88, 0xB2, 0x1E], "xpub", Hashed, Main, false),
    v([0x04, 0x9D, 0x78, 0x78], "yprv", Nested, Main, true),
    v([0x04, 0x9D, 0x7C, 0xB2], "ypub", Nested, Main, false),
    v([0x04, 0xB2, 0x43, 0x0C], "zprv", SegWit, Main, true),
    v([0x04, 0xB2, 0x47, 0x46], "zpub", SegWit, Main, false),
    v([0x02, 0x95, 0xB0, 0x05], "Yprv", NestedMultisig, Main, true),
    v([0x02, 0x95, 0xB4, 0x3F], "Ypub", NestedMultisig, Main, false),
    v([0x02, 0xAA, 0x7A, 0x99], "Zprv", SegWitMultisig, Main, true),
    v([0x02, 0xAA, 0x7E, 0xD3], "Zpub", SegWitMultisig, Main, false),
    v([0x04, 0x35, 0x83, 0x94], "tprv", Hashed, Test, true),
    v([0x04, 0x35, 0x87, 0xCF], "tpub", Hashed, Test, false),
    v([0x04, 0x4A, 0x4E, 0x28], "uprv", Nested, Test, true),
    v([0x04, 0x4A, 0x52, 0x62], "upub", Nested, Test, false),
    v([0x04, 0x5F, 0x18, 0xBC], "vprv", SegWit, Test, true),
    v([0x04, 0x5F, 0x1C, 0xF6], "vpub", SegWit, Test, false),
    v([0x02, 0x42, 0x85, 0xB5], "Uprv", NestedMultisig, Test, true),
    v([0x02, 0x42, 0x89, 0xEF], "Upub", NestedMultisig, Test, false),
    v([0x02, 0x57, 0x50, 0x48], "Vprv", SegWitMultisig, Test, true),
    v([0x02, 0x57, 0x54, 0x83], "Vpub", SegWitMultisig, Test, false),
];

impl KeyVersion {
    pub fn lookup(bytes: [u8; 4]) -> Option<KeyVersion> {
        KEY_VERSIONS.iter().find(|k| k.bytes == bytes).copied()
    }

    pub fn find(application: KeyApplication, network: NetworkKind, is_private: bool) -> KeyVersion {
        *KEY_VERSIONS
            .iter()
            .find(|k| {
                k.application == application && k.network == network && k.is_private == is_private
            })
            .expect("every combination to be in the table")
    }

    /// The plain BIP32 version (xprv/xpub/tprv/tpub) for the same network and privacy.
    fn standard(&self) -> KeyVersion {
        Self::find(Hashed, self.network, self.is_private)
    }
}

/// Decodes the Base58Check payload and returns its version entry.
pub fn detect_version(s: &str) -> anyhow::Result<(KeyVersion, Vec<u8>)> {
    let data = base58::decode_check(s.trim()).context("invalid base58 extended key")?;
    anyhow::ensure!(
        data.len() == 78,
        "extended key has wrong length {}",
        data.len()
    );
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&data[0..4]);
    let version = KeyVersion::lookup(prefix)
        .with_context(|| format!("unknown extended key version {}", hex::encode(prefix)))?;
    Ok((version, data))
}

fn with_version(mut data: Vec<u8>, version: &KeyVersion) -> Vec<u8> {
    data[0..4].copy_from_slice(&version.bytes);
    data
}

pub trait ToSlip132 {
    fn to_slip132_string(&self, application: KeyApplication, network: NetworkKind) -> String;
}

pub trait FromSlip132 {
    fn from_slip132_str(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl ToSlip132 for Xpub {
    fn to_slip132_string(&self, application: KeyApplication, network: NetworkKind) -> String {
        let version = KeyVersion::find(application, network, false);
        base58::encode_check(&with_version(self.encode().to_vec(), &version))
    }
}

impl ToSlip132 for Xpriv {
    fn to_slip132_string(&self, application: KeyApplication, network: NetworkKind) -> String {
        let version = KeyVersion::find(application, network, true);
        base58::encode_check(&with_version(self.encode().to_vec(), &version))
    }
}

impl FromSlip132 for Xpub {
    fn from_slip132_str(s: &str) -> anyhow::Result<Self> {
        let (version, data) = detect_version(s)?;
        if version.is_private {
            bail!("expected an extended public key but got {}", version.prefix)
        }
        Ok(Xpub::decode(&with_version(data, &version.standard()))?)
    }
}

impl FromSlip132 for Xpriv {
    fn from_slip132_str(s: &str) -> anyhow::Result<Self> {
        let (version, data) = detect_version(s)?;
        if !version.is_private {
            bail!("expected an extended private key but got {}", version.prefix)
        }
        Ok(Xpriv::decode(&with_version(data, &version.standard()))?)
    }
}

pub fn version_for(
    network: impl Into<NetworkKind>,
    application: KeyApplication,
    is_private: bool,
) -> KeyVersion {
    KeyVersion::find(application, network.into(), is_private)
}

pub fn encode_xpub(xpub: &Xpub, application: KeyApplication) -> String {
    xpub.to_slip132_string(application, xpub.network)
}

pub fn encode_xpriv(xpriv: &Xpriv, application: KeyApplication) -> String {
    xpriv.to_slip132_string(application, xpriv.network)
}

pub fn decode_xpub(s: &str) -> anyhow::Result<Xpub> {
    Xpub::from_slip132_str(s)
}

pub fn decode_xpriv(s: &str) -> anyhow::Result<Xpriv> {
    Xpriv::from_slip132_str(s)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    // BIP84 account 0 of the "abandon ... about" mnemonic
    const ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";
    const ZPRV: &str = "zprvAdG4iTXWBoARxkkzNpNh8r6Qag3irQB8PzEMkAFeTRXxHpbF9z4QgEvBRmfvqWvGp42t42nvgGpNgYSJA9iefm1yYNZKEm7z6qUWCroSQnE";

    #[test]
    fn test_decode_encode_zpub() -> anyhow::Result<()> {
        use pretty_assertions::assert_eq;
        let xpub = Xpub::from_slip132_str(ZPUB)?;
        assert_eq!(xpub.depth, 3);
        assert_eq!(xpub.to_slip132_string(SegWit, Main), ZPUB);
        let plain = xpub.to_string();
        assert!(plain.starts_with("xpub"));
        assert_eq!(Xpub::from_slip132_str(&plain)?, xpub);
        let xpriv = Xpriv::from_slip132_str(ZPRV)?;
        assert_eq!(xpriv.to_slip132_string(SegWit, Main), ZPRV);
        assert!(Xpub::from_slip132_str(ZPRV).is_err());
        assert!(Xpriv::from_slip132_str(ZPUB).is_err());
        Ok(())
    }

    #[test]
    fn test_all_versions_round_trip() -> anyhow::Result<()> {
        let xpriv = Xpriv::from_slip132_str(ZPRV)?;
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let xpub = Xpub::from_priv(&secp, &xpriv);
        for version in KEY_VERSIONS {
            if version.is_private {
                let mut k = xpriv;
                k.network = version.network;
                let s = k.to_slip132_string(version.application, version.network);
                assert!(s.starts_with(version.prefix), "{s} vs {}", version.prefix);
                assert_eq!(Xpriv::from_slip132_str(&s)?, k);
            } else {
                let mut k = xpub;
                k.network = version.network;
                let s = k.to_slip132_string(version.application, version.network);
                assert!(s.starts_with(version.prefix), "{s} vs {}", version.prefix);
                assert_eq!(Xpub::from_slip132_str(&s)?, k);
            }
        }
        Ok(())
    }

    #[test]
    fn test_version_for() {
        assert_eq!(
            version_for(bitcoin::Network::Testnet, SegWitMultisig, false).prefix,
            "Vpub"
        );
        assert_eq!(version_for(bitcoin::Network::Bitcoin, Nested, true).prefix, "yprv");
        assert_eq!(
            KeyVersion::lookup([0x04, 0xB2, 0x47, 0x46]).map(|v| v.prefix),
            Some("zpub")
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Xpub::from_slip132_str("xpub123").is_err());
        assert!(Xpub::from_str("zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs").is_err());
    }
}
