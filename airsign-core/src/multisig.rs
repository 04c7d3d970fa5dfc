use std::{fmt, str::FromStr};

use anyhow::{bail, Context};
use bitcoin::{
    bip32::{ChildNumber, Fingerprint, Xpub},
    secp256k1::{All, Secp256k1},
    Address, Network, PublicKey, ScriptBuf,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::{
    descriptor::bsms::BsmsContent,
    keypath::KeyPath,
    keys::serialize_display,
    script::multisig_script,
};

pub const MAX_TOTAL_SIGS_MULTISIG: u32 = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MultisigType {
    // M-of-N
    pub required: u32, // M
    pub total: u32,    // N
}

impl MultisigType {
    pub fn new(required: u32, total: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(
            required > 0,
            "Required signatures must be greater than zero"
        );
        anyhow::ensure!(
            required <= total,
            "Required ({required}) must be less than or equal to total ({total})"
        );
        anyhow::ensure!(
            total <= MAX_TOTAL_SIGS_MULTISIG,
            "Total {total} is greater than {MAX_TOTAL_SIGS_MULTISIG}"
        );
        Ok(Self { required, total })
    }
}

impl FromStr for MultisigType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static MULTISIGTYPE_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new("([0-9]+)[ -]?of[ -]?([0-9]+)").unwrap());
        let s = s.to_lowercase();
        let mut captures = MULTISIGTYPE_RE.captures_iter(s.as_str());
        let capture = captures.next().with_context(|| {
            format!("Invalid format ({s}), use a something like \"2-of-3\" or \"3-of-5\" (M-of-N)")
        })?;
        let required = capture
            .get(1)
            .context("Missing required value (M)")?
            .as_str()
            .parse()
            .map_err(|e| anyhow::anyhow!("Error parsing required (M) value: {e}"))?;
        let total = capture
            .get(2)
            .context("Missing total value (N)")?
            .as_str()
            .parse()
            .map_err(|e| anyhow::anyhow!("Error parsing total (N) value: {e}"))?;
        Self::new(required, total)
    }
}

impl fmt::Display for MultisigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.required;
        let n = self.total;
        f.write_fmt(format_args!("{m}-of-{n}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MultisigScriptType {
    /// bare P2SH
    #[serde(rename = "p2sh")]
    P2sh,
    /// P2WSH nested in P2SH, BIP-48 script type 1'
    #[serde(rename = "p2sh-p2wsh")]
    P2shP2wsh,
    /// native P2WSH, BIP-48 script type 2'
    #[serde(rename = "p2wsh")]
    P2wsh,
}

impl MultisigScriptType {
    /// Script type component of a BIP-48 path (`m/48'/coin'/account'/script'`).
    pub fn bip48_script_type(&self) -> Option<u32> {
        match self {
            Self::P2sh => None,
            Self::P2shP2wsh => Some(1),
            Self::P2wsh => Some(2),
        }
    }

    pub fn descriptor_wrapper(&self) -> (&'static str, &'static str) {
        match self {
            Self::P2sh => ("sh(", ")"),
            Self::P2shP2wsh => ("sh(wsh(", "))"),
            Self::P2wsh => ("wsh(", ")"),
        }
    }

    pub fn is_segwit(&self) -> bool {
        !matches!(self, Self::P2sh)
    }

    /// `m/48'/coin'/account'/script'`, or `m/45'` for bare P2SH.
    pub fn account_path(&self, network: Network, account: u32) -> anyhow::Result<KeyPath> {
        match self.bip48_script_type() {
            Some(script) => Ok(KeyPath::new(vec![
                ChildNumber::from_hardened_idx(48)?,
                ChildNumber::from_hardened_idx(crate::address::coin_type(network))?,
                ChildNumber::from_hardened_idx(account)?,
                ChildNumber::from_hardened_idx(script)?,
            ])),
            None => Ok(KeyPath::new(vec![ChildNumber::from_hardened_idx(45)?])),
        }
    }
}

impl FromStr for MultisigScriptType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "p2sh" | "sh" => Ok(Self::P2sh),
            "p2sh-p2wsh" | "sh-wsh" | "segwit-nested" => Ok(Self::P2shP2wsh),
            "p2wsh" | "wsh" | "segwit-native" => Ok(Self::P2wsh),
            _ => bail!("Got unknown multisig script type: {s}"),
        }
    }
}

impl fmt::Display for MultisigScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::P2sh => f.write_str("p2sh"),
            Self::P2shP2wsh => f.write_str("p2sh-p2wsh"),
            Self::P2wsh => f.write_str("p2wsh"),
        }
    }
}

/// One step of the path written after a key in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStep {
    Fixed(u32),
    /// `<receive;change>`
    Multipath(u32, u32),
    /// `*`
    Wildcard,
}

/// Path template following an xpub, such as `<0;1>/*` or `0/*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildTemplate(Vec<ChildStep>);

impl Default for ChildTemplate {
    fn default() -> Self {
        Self(vec![ChildStep::Multipath(0, 1), ChildStep::Wildcard])
    }
}

impl ChildTemplate {
    pub fn steps(&self) -> &[ChildStep] {
        &self.0
    }

    pub fn derive(&self, is_change: bool, index: u32) -> anyhow::Result<Vec<ChildNumber>> {
        self.0
            .iter()
            .map(|step| {
                let i = match *step {
                    ChildStep::Fixed(i) => i,
                    ChildStep::Multipath(receive, change) => {
                        if is_change {
                            change
                        } else {
                            receive
                        }
                    }
                    ChildStep::Wildcard => index,
                };
                Ok(ChildNumber::from_normal_idx(i)?)
            })
            .collect()
    }
}

impl FromStr for ChildTemplate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('/');
        if s.is_empty() {
            return Ok(Self(vec![]));
        }
        let parse_index = |v: &str| -> anyhow::Result<u32> {
            let i: u32 = v
                .parse()
                .with_context(|| format!("Invalid path step {v:?}"))?;
            anyhow::ensure!(i < 0x8000_0000, "Hardened step {v:?} after an xpub");
            Ok(i)
        };
        s.split('/')
            .map(|step| {
                if step == "*" {
                    Ok(ChildStep::Wildcard)
                } else if let Some(inner) =
                    step.strip_prefix('<').and_then(|s| s.strip_suffix('>'))
                {
                    let (a, b) = inner.split_once(';').with_context(|| {
                        format!("Only two-branch multipath is supported, got {step}")
                    })?;
                    anyhow::ensure!(
                        !b.contains(';'),
                        "Only two-branch multipath is supported, got {step}"
                    );
                    Ok(ChildStep::Multipath(parse_index(a)?, parse_index(b)?))
                } else {
                    Ok(ChildStep::Fixed(parse_index(step)?))
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map(Self)
    }
}

impl fmt::Display for ChildTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match step {
                ChildStep::Fixed(v) => write!(f, "{v}")?,
                ChildStep::Multipath(a, b) => write!(f, "<{a};{b}>")?,
                ChildStep::Wildcard => f.write_str("*")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CosignerInfo {
    #[serde(serialize_with = "serialize_display")]
    pub xpub: Xpub,
    /// The key as written in the source, possibly with a SLIP-132 prefix.
    pub xpub_text: String,
    #[serde(serialize_with = "serialize_display")]
    pub fingerprint: Fingerprint,
    /// Origin path from the cosigner's master key to `xpub`.
    #[serde(serialize_with = "serialize_display")]
    pub derivation_path: KeyPath,
    #[serde(serialize_with = "serialize_display")]
    pub child_path: ChildTemplate,
    pub is_local: bool,
}

impl CosignerInfo {
    pub fn derive_public_key(
        &self,
        secp: &Secp256k1<All>,
        is_change: bool,
        index: u32,
    ) -> anyhow::Result<PublicKey> {
        let children = self.child_path.derive(is_change, index)?;
        Ok(PublicKey::new(self.xpub.derive_pub(secp, &children)?.public_key))
    }

    /// Full path from the cosigner's master key for `is_change/index`.
    pub fn full_path(&self, is_change: bool, index: u32) -> anyhow::Result<KeyPath> {
        Ok(self
            .derivation_path
            .extend(&self.child_path.derive(is_change, index)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultisigConfig {
    #[serde(serialize_with = "serialize_display")]
    pub multisig_type: MultisigType,
    pub cosigners: Vec<CosignerInfo>,
    pub script_type: MultisigScriptType,
    /// `sortedmulti` rather than `multi`
    pub sorted: bool,
    pub descriptor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bsms: Option<BsmsContent>,
}

impl MultisigConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        MultisigType::new(self.multisig_type.required, self.multisig_type.total)?;
        anyhow::ensure!(
            self.cosigners.len() == usize::try_from(self.multisig_type.total)?,
            "Expected {} cosigners but got {}",
            self.multisig_type.total,
            self.cosigners.len()
        );
        Ok(())
    }

    pub fn local_cosigners(&self) -> impl Iterator<Item = &CosignerInfo> {
        self.cosigners.iter().filter(|c| c.is_local)
    }

    pub fn has_local_cosigner(&self) -> bool {
        self.local_cosigners().next().is_some()
    }

    /// The multisig script (witness script for segwit, redeem script for bare P2SH).
    pub fn multisig_script(
        &self,
        secp: &Secp256k1<All>,
        is_change: bool,
        index: u32,
    ) -> anyhow::Result<ScriptBuf> {
        let keys = self
            .cosigners
            .iter()
            .map(|c| c.derive_public_key(secp, is_change, index))
            .collect::<anyhow::Result<Vec<_>>>()?;
        multisig_script(
            usize::try_from(self.multisig_type.required)?,
            &keys,
            self.sorted,
        )
    }

    pub fn script_pubkey(
        &self,
        secp: &Secp256k1<All>,
        is_change: bool,
        index: u32,
    ) -> anyhow::Result<ScriptBuf> {
        let script = self.multisig_script(secp, is_change, index)?;
        Ok(match self.script_type {
            MultisigScriptType::P2sh => ScriptBuf::new_p2sh(&script.script_hash()),
            MultisigScriptType::P2shP2wsh => {
                ScriptBuf::new_p2sh(&ScriptBuf::new_p2wsh(&script.wscript_hash()).script_hash())
            }
            MultisigScriptType::P2wsh => ScriptBuf::new_p2wsh(&script.wscript_hash()),
        })
    }

    pub fn address(
        &self,
        secp: &Secp256k1<All>,
        is_change: bool,
        index: u32,
        network: Network,
    ) -> anyhow::Result<Address> {
        let script = self.script_pubkey(secp, is_change, index)?;
        Address::from_script(&script, network).context("failure building multisig address")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_multisig_type() -> anyhow::Result<()> {
        assert_eq!(MultisigType::from_str("2-of-3")?, MultisigType::new(2, 3)?);
        assert_eq!(MultisigType::from_str("3 of 5")?.to_string(), "3-of-5");
        assert_eq!(MultisigType::from_str("16of16")?.total, 16);
        assert!(MultisigType::from_str("4-of-3").is_err());
        assert!(MultisigType::from_str("0-of-3").is_err());
        assert!(MultisigType::from_str("1-of-17").is_err());
        assert!(MultisigType::from_str("two of three").is_err());
        Ok(())
    }

    #[test]
    fn test_script_type() -> anyhow::Result<()> {
        for t in [
            MultisigScriptType::P2sh,
            MultisigScriptType::P2shP2wsh,
            MultisigScriptType::P2wsh,
        ] {
            assert_eq!(MultisigScriptType::from_str(&t.to_string())?, t);
        }
        assert_eq!(
            MultisigScriptType::P2wsh
                .account_path(Network::Bitcoin, 0)?
                .to_string(),
            "m/48'/0'/0'/2'"
        );
        assert_eq!(
            MultisigScriptType::P2shP2wsh
                .account_path(Network::Testnet, 3)?
                .to_string(),
            "m/48'/1'/3'/1'"
        );
        Ok(())
    }

    #[test]
    fn test_child_template() -> anyhow::Result<()> {
        let t = ChildTemplate::from_str("/<0;1>/*")?;
        assert_eq!(t, ChildTemplate::default());
        assert_eq!(t.to_string(), "<0;1>/*");
        assert_eq!(
            t.derive(true, 7)?,
            vec![ChildNumber::from_normal_idx(1)?, ChildNumber::from_normal_idx(7)?]
        );
        let fixed = ChildTemplate::from_str("0/*")?;
        assert_eq!(fixed.derive(true, 2)?[0], ChildNumber::from_normal_idx(0)?);
        assert!(ChildTemplate::from_str("<0;1;2>/*").is_err());
        assert!(ChildTemplate::from_str("0h/*").is_err());
        assert!(ChildTemplate::from_str("2147483648/*").is_err());
        Ok(())
    }
}
