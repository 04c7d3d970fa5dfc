use std::str::FromStr;

use anyhow::{bail, Context};
use bitcoin::{
    bip32::{ChildNumber, Xpub},
    key::CompressedPublicKey,
    secp256k1::{All, PublicKey, Secp256k1},
    Address, Network, Script, ScriptBuf,
};
use serde::{Deserialize, Serialize};

use crate::{keypath::KeyPath, slip132::KeyApplication};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SingleSigScriptType {
    /// P2PKH
    #[serde(rename = "legacy")]
    Legacy,
    /// P2SH-P2WPKH
    #[serde(rename = "segwit-nested")]
    NestedSegwit,
    /// P2WPKH
    #[serde(rename = "segwit-native")]
    NativeSegwit,
    /// P2TR key path
    #[serde(rename = "taproot")]
    Taproot,
}

impl SingleSigScriptType {
    pub const ALL: [SingleSigScriptType; 4] = [
        Self::NativeSegwit,
        Self::Legacy,
        Self::NestedSegwit,
        Self::Taproot,
    ];

    /// BIP-44/49/84/86 purpose.
    pub fn purpose(&self) -> u32 {
        match self {
            Self::Legacy => 44,
            Self::NestedSegwit => 49,
            Self::NativeSegwit => 84,
            Self::Taproot => 86,
        }
    }

    pub fn from_purpose(purpose: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.purpose() == purpose)
    }

    pub fn key_application(&self) -> KeyApplication {
        match self {
            Self::Legacy | Self::Taproot => KeyApplication::Hashed,
            Self::NestedSegwit => KeyApplication::Nested,
            Self::NativeSegwit => KeyApplication::SegWit,
        }
    }

    /// Descriptor function wrapping the key, e.g. `wpkh(` ... `)`.
    pub fn descriptor_wrapper(&self) -> (&'static str, &'static str) {
        match self {
            Self::Legacy => ("pkh(", ")"),
            Self::NestedSegwit => ("sh(wpkh(", "))"),
            Self::NativeSegwit => ("wpkh(", ")"),
            Self::Taproot => ("tr(", ")"),
        }
    }

    /// `m/purpose'/coin'/account'`
    pub fn account_path(&self, network: Network, account: u32) -> anyhow::Result<KeyPath> {
        Ok(KeyPath::new(vec![
            ChildNumber::from_hardened_idx(self.purpose())?,
            ChildNumber::from_hardened_idx(coin_type(network))?,
            ChildNumber::from_hardened_idx(account)?,
        ]))
    }

    pub fn default_account_path(&self, network: Network) -> anyhow::Result<KeyPath> {
        self.account_path(network, 0)
    }
}

impl FromStr for SingleSigScriptType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "legacy" | "p2pkh" | "pkh" => Ok(Self::Legacy),
            "segwit-nested" | "p2sh-p2wpkh" | "sh-wpkh" => Ok(Self::NestedSegwit),
            "segwit-native" | "p2wpkh" | "wpkh" => Ok(Self::NativeSegwit),
            "taproot" | "p2tr" | "tr" => Ok(Self::Taproot),
            _ => bail!("Got unknown script type: {s}"),
        }
    }
}

impl std::fmt::Display for SingleSigScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::NestedSegwit => f.write_str("segwit-nested"),
            Self::NativeSegwit => f.write_str("segwit-native"),
            Self::Taproot => f.write_str("taproot"),
        }
    }
}

/// SLIP-44 coin type: 0 on mainnet, 1 on every test network.
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

pub fn script_pubkey_for(
    secp: &Secp256k1<All>,
    pubkey: &PublicKey,
    script_type: SingleSigScriptType,
) -> ScriptBuf {
    let compressed = CompressedPublicKey(*pubkey);
    match script_type {
        SingleSigScriptType::Legacy => ScriptBuf::new_p2pkh(&compressed.pubkey_hash()),
        SingleSigScriptType::NestedSegwit => {
            ScriptBuf::new_p2sh(&nested_redeem_script(pubkey).script_hash())
        }
        SingleSigScriptType::NativeSegwit => ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()),
        SingleSigScriptType::Taproot => {
            ScriptBuf::new_p2tr(secp, pubkey.x_only_public_key().0, None)
        }
    }
}

/// Redeem script of a P2SH-P2WPKH output (the P2WPKH program).
pub fn nested_redeem_script(pubkey: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&CompressedPublicKey(*pubkey).wpubkey_hash())
}

fn branch(is_change: bool) -> ChildNumber {
    ChildNumber::Normal {
        index: u32::from(is_change),
    }
}

pub fn generate_address(
    secp: &Secp256k1<All>,
    account_xpub: &Xpub,
    index: u32,
    is_change: bool,
    script_type: SingleSigScriptType,
    network: Network,
) -> anyhow::Result<Address> {
    let index = ChildNumber::from_normal_idx(index)?;
    let pubkey = account_xpub
        .derive_pub(secp, &[branch(is_change), index])?
        .public_key;
    let script = script_pubkey_for(secp, &pubkey, script_type);
    Address::from_script(&script, network).context("failure building address")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub address: Address,
    pub index: u32,
    pub is_change: bool,
}

pub fn derive_addresses(
    secp: &Secp256k1<All>,
    account_xpub: &Xpub,
    start: u32,
    quantity: u32,
    is_change: bool,
    script_type: SingleSigScriptType,
    network: Network,
) -> anyhow::Result<Vec<DerivedAddress>> {
    use rayon::prelude::*;
    let end = start
        .checked_add(quantity)
        .context("address range overflows")?;
    (start..end)
        .into_par_iter()
        .map(|index| -> anyhow::Result<DerivedAddress> {
            let address =
                generate_address(secp, account_xpub, index, is_change, script_type, network)?;
            Ok(DerivedAddress {
                address,
                index,
                is_change,
            })
        })
        .collect()
}

/// Looks for `target` among the first `gap_limit` receive and then change
/// scripts of the account. Returns `(is_change, index)`.
pub fn scan_for_script(
    secp: &Secp256k1<All>,
    account_xpub: &Xpub,
    script_type: SingleSigScriptType,
    target: &Script,
    gap_limit: u32,
) -> anyhow::Result<Option<(bool, u32)>> {
    use rayon::prelude::*;
    for is_change in [false, true] {
        let branch_xpub = account_xpub.derive_pub(secp, &[branch(is_change)])?;
        let found = (0..gap_limit).into_par_iter().find_map_first(|i| {
            let child = ChildNumber::from_normal_idx(i).ok()?;
            let pubkey = branch_xpub.derive_pub(secp, &[child]).ok()?.public_key;
            (script_pubkey_for(secp, &pubkey, script_type).as_script() == target).then_some(i)
        });
        if let Some(index) = found {
            log::debug!("Found script at {}/{index} after scanning", u32::from(is_change));
            return Ok(Some((is_change, index)));
        }
    }
    Ok(None)
}

/// Parses an address and checks it belongs to `network`.
pub fn parse_address(s: &str, network: Network) -> anyhow::Result<Address> {
    Address::from_str(s.trim())
        .with_context(|| format!("invalid address {s}"))?
        .require_network(network)
        .with_context(|| format!("address {s} is not valid on {network}"))
}

/// Address form of a scriptPubKey, when it has one.
pub fn address_from_script(script: &Script, network: Network) -> Option<String> {
    Address::from_script(script, network)
        .ok()
        .map(|a| a.to_string())
}

#[cfg(test)]
mod tests {
    use bitcoin::bip32::Xpriv;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::slip132::FromSlip132;

    const ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";
    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn account_xpub(
        secp: &Secp256k1<All>,
        script_type: SingleSigScriptType,
    ) -> anyhow::Result<Xpub> {
        let seed = crate::mnemonic::seed_from_text(ABANDON, None)?;
        let root =
            Xpriv::new_master(Network::Bitcoin, secrecy::ExposeSecret::expose_secret(&seed))?;
        let path = script_type.default_account_path(Network::Bitcoin)?;
        Ok(Xpub::from_priv(secp, &root.derive_priv(secp, &path.to_derivation_path())?))
    }

    #[test]
    fn test_first_addresses() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        let xpub = Xpub::from_slip132_str(ZPUB)?;
        let first = |t: SingleSigScriptType| -> anyhow::Result<String> {
            Ok(generate_address(&secp, &account_xpub(&secp, t)?, 0, false, t, Network::Bitcoin)?
                .to_string())
        };
        assert_eq!(
            generate_address(
                &secp,
                &xpub,
                0,
                false,
                SingleSigScriptType::NativeSegwit,
                Network::Bitcoin
            )?
            .to_string(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(first(SingleSigScriptType::NativeSegwit)?, "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
        assert_eq!(first(SingleSigScriptType::NestedSegwit)?, "37VucYSaXLCAsxYyAPfbSi9eh4iEcbShgf");
        assert_eq!(first(SingleSigScriptType::Legacy)?, "1LqBGSKuX5yYUonjxT5qGfpUsXKYYWeabA");
        assert_eq!(
            first(SingleSigScriptType::Taproot)?,
            "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr"
        );
        Ok(())
    }

    #[test]
    fn test_derive_and_scan() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        let xpub = Xpub::from_slip132_str(ZPUB)?;
        let t = SingleSigScriptType::NativeSegwit;
        let addresses = derive_addresses(&secp, &xpub, 0, 5, false, t, Network::Bitcoin)?;
        assert_eq!(addresses.len(), 5);
        assert_eq!(addresses[1].address.to_string(), "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g");
        let change = generate_address(&secp, &xpub, 17, true, t, Network::Bitcoin)?;
        assert_eq!(
            scan_for_script(&secp, &xpub, t, &change.script_pubkey(), 20)?,
            Some((true, 17))
        );
        assert_eq!(
            scan_for_script(&secp, &xpub, t, &addresses[4].address.script_pubkey(), 20)?,
            Some((false, 4))
        );
        assert_eq!(scan_for_script(&secp, &xpub, t, &change.script_pubkey(), 10)?, None);
        Ok(())
    }

    #[test]
    fn test_script_type_strings() -> anyhow::Result<()> {
        for t in SingleSigScriptType::ALL {
            assert_eq!(SingleSigScriptType::from_str(&t.to_string())?, t);
            assert_eq!(SingleSigScriptType::from_purpose(t.purpose()), Some(t));
        }
        assert_eq!(SingleSigScriptType::from_str("P2WPKH")?, SingleSigScriptType::NativeSegwit);
        assert!(SingleSigScriptType::from_str("p2wsh").is_err());
        assert_eq!(
            SingleSigScriptType::Taproot.default_account_path(Network::Testnet)?.to_string(),
            "m/86'/1'/0'"
        );
        Ok(())
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", Network::Bitcoin).is_ok());
        assert!(parse_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", Network::Testnet).is_err());
        assert!(parse_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyx", Network::Bitcoin).is_err());
    }
}
