use std::collections::BTreeSet;

use anyhow::Context;
use bitcoin::{
    bip32::{Fingerprint, Xpriv},
    ecdsa,
    hashes::Hash,
    key::{CompressedPublicKey, Keypair, TapTweak, XOnlyPublicKey},
    psbt::{Input, Psbt},
    script::Instruction,
    secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey},
    sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType},
    taproot::{self, TapLeafHash},
    Network, Script, ScriptBuf, Transaction, TxOut, WPubkeyHash, WScriptHash,
};
use secrecy::ExposeSecret;
use serde::Serialize;

use super::{alternative::find_alternative_path, all_spent_outputs, InputState};
use crate::{
    address::{nested_redeem_script, scan_for_script, SingleSigScriptType},
    config::EngineConfig,
    error::{EngineError, Incompleteness},
    keypath::KeyPath,
    keys::{derive_xpub, serialize_display, SigningKeys},
    multisig::{CosignerInfo, MultisigConfig, MultisigScriptType},
    script::{classify, p2pkh_script_code, ScriptPattern},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlternativePath {
    pub input: usize,
    #[serde(serialize_with = "serialize_display")]
    pub stated: KeyPath,
    #[serde(serialize_with = "serialize_display")]
    pub used: KeyPath,
}

#[derive(Debug, Clone)]
pub struct SigningResult {
    pub psbt: Psbt,
    /// Inputs that received at least one new signature, ascending.
    pub signed_inputs: Vec<usize>,
    pub total_inputs: usize,
    pub alternative_paths: Vec<AlternativePath>,
    pub used_gap_scan: bool,
}

impl SigningResult {
    fn unsigned(psbt: Psbt) -> Self {
        let total_inputs = psbt.inputs.len();
        Self {
            psbt,
            signed_inputs: vec![],
            total_inputs,
            alternative_paths: vec![],
            used_gap_scan: false,
        }
    }

    /// Folds a later pass over `self.psbt` into this result.
    pub fn merge(mut self, next: SigningResult) -> Self {
        let signed = self
            .signed_inputs
            .into_iter()
            .chain(next.signed_inputs)
            .collect::<BTreeSet<_>>();
        self.signed_inputs = signed.into_iter().collect();
        self.psbt = next.psbt;
        self.alternative_paths.extend(next.alternative_paths);
        self.used_gap_scan |= next.used_gap_scan;
        self
    }
}

/// A key found by scanning scripts, with the scripts needed to spend it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedKey {
    pub path: KeyPath,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
}

/// Finds our key for an input that has no derivation data for our fingerprint.
pub trait ScriptLocator {
    fn locate(
        &self,
        secp: &Secp256k1<All>,
        script_pubkey: &Script,
        gap_limit: u32,
    ) -> anyhow::Result<Option<LocatedKey>>;
}

impl ScriptLocator for SigningKeys {
    fn locate(
        &self,
        secp: &Secp256k1<All>,
        script_pubkey: &Script,
        gap_limit: u32,
    ) -> anyhow::Result<Option<LocatedKey>> {
        let Some((is_change, index)) =
            scan_for_script(secp, &self.account_xpub, self.script_type, script_pubkey, gap_limit)?
        else {
            return Ok(None);
        };
        let suffix = KeyPath::from_u32_slice(&[u32::from(is_change), index]);
        let redeem_script = match self.script_type {
            SingleSigScriptType::NestedSegwit => {
                let pubkey = derive_xpub(secp, &self.account_xpub, &suffix)?.public_key;
                Some(nested_redeem_script(&pubkey))
            }
            _ => None,
        };
        Ok(Some(LocatedKey {
            path: self.account_path.extend(suffix.children()),
            redeem_script,
            witness_script: None,
        }))
    }
}

/// Scans the addresses of a multisig configuration on behalf of one cosigner.
pub struct MultisigLocator<'a> {
    pub config: &'a MultisigConfig,
    pub cosigner: &'a CosignerInfo,
}

impl ScriptLocator for MultisigLocator<'_> {
    fn locate(
        &self,
        secp: &Secp256k1<All>,
        script_pubkey: &Script,
        gap_limit: u32,
    ) -> anyhow::Result<Option<LocatedKey>> {
        use rayon::prelude::*;
        for is_change in [false, true] {
            let found = (0..gap_limit).into_par_iter().find_map_first(|i| {
                let candidate = self.config.script_pubkey(secp, is_change, i).ok()?;
                (candidate.as_script() == script_pubkey).then_some(i)
            });
            let Some(index) = found else { continue };
            log::debug!("Found multisig script at {}/{index} after scanning", u32::from(is_change));
            let script = self.config.multisig_script(secp, is_change, index)?;
            let (redeem_script, witness_script) = match self.config.script_type {
                MultisigScriptType::P2sh => (Some(script), None),
                MultisigScriptType::P2shP2wsh => {
                    (Some(ScriptBuf::new_p2wsh(&script.wscript_hash())), Some(script))
                }
                MultisigScriptType::P2wsh => (None, Some(script)),
            };
            return Ok(Some(LocatedKey {
                path: self.cosigner.full_path(is_change, index)?,
                redeem_script,
                witness_script,
            }));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyRole {
    Ecdsa,
    Schnorr {
        key_spend: bool,
        leaves: Vec<TapLeafHash>,
    },
}

struct SignTarget {
    secret: SecretKey,
    role: KeyRole,
    /// Set when the key was found away from the stated path.
    alternative: Option<AlternativePath>,
}

/// Signs every input it can find a key for with one master key.
pub struct Signer<'a> {
    secp: &'a Secp256k1<All>,
    master: &'a Xpriv,
    fingerprint: Fingerprint,
    network: Network,
    gap_limit: u32,
}

impl<'a> Signer<'a> {
    pub fn new(
        secp: &'a Secp256k1<All>,
        master: &'a Xpriv,
        network: Network,
        gap_limit: u32,
    ) -> Self {
        Self {
            secp,
            master,
            fingerprint: master.fingerprint(secp),
            network,
            gap_limit,
        }
    }

    pub fn sign(&self, psbt: &Psbt, locator: &dyn ScriptLocator) -> SigningResult {
        let mut result = SigningResult::unsigned(psbt.clone());
        let tx = psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&tx);
        let prevouts = all_spent_outputs(psbt);
        for index in 0..psbt.inputs.len() {
            match self.sign_input(&mut result, index, &mut cache, prevouts.as_deref(), locator) {
                Ok(true) => result.signed_inputs.push(index),
                Ok(false) => {}
                Err(e) => log::warn!("Skipping input {index}: {e:#}"),
            }
        }
        log::info!(
            "Signed {} of {} inputs with key {}",
            result.signed_inputs.len(),
            result.total_inputs,
            self.fingerprint
        );
        result
    }

    fn derive(&self, path: &KeyPath) -> anyhow::Result<SecretKey> {
        Ok(self
            .master
            .derive_priv(self.secp, &path.to_derivation_path())
            .with_context(|| format!("failure deriving key at {path}"))?
            .private_key)
    }

    /// Key at the stated path, or at an alternative path when it doesn't match.
    fn key_for(
        &self,
        index: usize,
        stated: KeyPath,
        matches: impl Fn(&PublicKey) -> bool,
    ) -> Option<(SecretKey, Option<AlternativePath>)> {
        match self.derive(&stated) {
            Ok(secret) if matches(&secret.public_key(self.secp)) => return Some((secret, None)),
            Ok(_) => log::debug!(
                "Input {index}: key at {stated} doesn't match, trying alternatives"
            ),
            Err(e) => log::debug!("Input {index}: {e:#}"),
        }
        let (used, secret) =
            find_alternative_path(self.secp, self.master, &stated, self.network, matches)?;
        let alternative = AlternativePath {
            input: index,
            stated,
            used,
        };
        Some((secret, Some(alternative)))
    }

    fn targets(&self, index: usize, input: &Input) -> (bool, Vec<SignTarget>) {
        let mut has_metadata = false;
        let mut targets = Vec::new();
        for (pubkey, (fingerprint, path)) in &input.bip32_derivation {
            if *fingerprint != self.fingerprint {
                continue;
            }
            has_metadata = true;
            if let Some((secret, alternative)) = self.key_for(index, path.into(), |k| k == pubkey) {
                targets.push(SignTarget {
                    secret,
                    role: KeyRole::Ecdsa,
                    alternative,
                });
            }
        }
        for (xonly, (leaves, (fingerprint, path))) in &input.tap_key_origins {
            if *fingerprint != self.fingerprint {
                continue;
            }
            has_metadata = true;
            let matches = |k: &PublicKey| k.x_only_public_key().0 == *xonly;
            if let Some((secret, alternative)) = self.key_for(index, path.into(), matches) {
                targets.push(SignTarget {
                    secret,
                    role: KeyRole::Schnorr {
                        key_spend: leaves.is_empty() || input.tap_internal_key == Some(*xonly),
                        leaves: leaves.clone(),
                    },
                    alternative,
                });
            }
        }
        (has_metadata, targets)
    }

    /// Gap scan for an input with no metadata. Records what was found in the
    /// input so later steps (and other tools) see a regular PSBT.
    fn scan(
        &self,
        input: &mut Input,
        utxo: &TxOut,
        locator: &dyn ScriptLocator,
    ) -> anyhow::Result<Option<SignTarget>> {
        let Some(located) = locator.locate(self.secp, &utxo.script_pubkey, self.gap_limit)? else {
            return Ok(None);
        };
        let secret = self.derive(&located.path)?;
        let pubkey = secret.public_key(self.secp);
        let source = (self.fingerprint, located.path.to_derivation_path());
        if input.redeem_script.is_none() {
            input.redeem_script = located.redeem_script;
        }
        if input.witness_script.is_none() {
            input.witness_script = located.witness_script;
        }
        let role = if let ScriptPattern::P2tr(_) = classify(&utxo.script_pubkey) {
            let xonly = pubkey.x_only_public_key().0;
            input.tap_internal_key.get_or_insert(xonly);
            input.tap_key_origins.insert(xonly, (vec![], source));
            KeyRole::Schnorr {
                key_spend: true,
                leaves: vec![],
            }
        } else {
            input.bip32_derivation.insert(pubkey, source);
            KeyRole::Ecdsa
        };
        Ok(Some(SignTarget {
            secret,
            role,
            alternative: None,
        }))
    }

    fn sign_input(
        &self,
        result: &mut SigningResult,
        index: usize,
        cache: &mut SighashCache<&Transaction>,
        prevouts: Option<&[TxOut]>,
        locator: &dyn ScriptLocator,
    ) -> anyhow::Result<bool> {
        let state = InputState::of(&result.psbt, index);
        if state.is_finalized() {
            log::debug!("Input {index} is already finalized");
            return Ok(false);
        }
        let Some(utxo) = state.utxo().cloned() else {
            log::debug!("Input {index} has no UTXO information, cannot sign");
            return Ok(false);
        };
        let (has_metadata, mut targets) = self.targets(index, &result.psbt.inputs[index]);
        // changes only land in the PSBT once every target went through
        let mut input = result.psbt.inputs[index].clone();
        if !has_metadata {
            if let Some(target) = self.scan(&mut input, &utxo, locator)? {
                result.used_gap_scan = true;
                targets.push(target);
            } else {
                log::debug!("Input {index} doesn't belong to key {}", self.fingerprint);
            }
        }
        let mut signed = false;
        let mut alternatives = Vec::new();
        for target in targets {
            let signed_target = match &target.role {
                KeyRole::Ecdsa => {
                    self.sign_ecdsa(cache, &mut input, index, &utxo, &target.secret)?
                }
                KeyRole::Schnorr { key_spend, leaves } => {
                    let prevouts =
                        prevouts.context("taproot signing needs every spent output")?;
                    let mut any = false;
                    if *key_spend {
                        any |= self.sign_key_spend(
                            cache,
                            &mut input,
                            index,
                            &utxo,
                            prevouts,
                            &target.secret,
                        )?;
                    }
                    for leaf in leaves {
                        any |= self.sign_script_spend(
                            cache,
                            &mut input,
                            index,
                            prevouts,
                            *leaf,
                            &target.secret,
                        )?;
                    }
                    any
                }
            };
            if signed_target {
                alternatives.extend(target.alternative);
            }
            signed |= signed_target;
        }
        if is_p2wpkh_spend(&input, &utxo) && input.witness_script.take().is_some() {
            log::debug!("Input {index}: dropped witness script from a P2WPKH input");
        }
        result.psbt.inputs[index] = input;
        result.alternative_paths.extend(alternatives);
        Ok(signed)
    }

    fn sign_ecdsa(
        &self,
        cache: &mut SighashCache<&Transaction>,
        input: &mut Input,
        index: usize,
        utxo: &TxOut,
        secret: &SecretKey,
    ) -> anyhow::Result<bool> {
        let pubkey = bitcoin::PublicKey::new(secret.public_key(self.secp));
        let compressed = CompressedPublicKey(pubkey.inner);
        let sighash_type = input
            .sighash_type
            .map(|t| t.ecdsa_hash_ty())
            .transpose()?
            .unwrap_or(EcdsaSighashType::All);
        let p2wpkh = |cache: &mut SighashCache<&Transaction>,
                      hash: WPubkeyHash|
         -> anyhow::Result<Option<[u8; 32]>> {
            if compressed.wpubkey_hash() != hash {
                return Ok(None);
            }
            let script_code = p2pkh_script_code(&compressed);
            Ok(Some(
                cache
                    .p2wsh_signature_hash(index, &script_code, utxo.value, sighash_type)?
                    .to_byte_array(),
            ))
        };
        let p2wsh = |cache: &mut SighashCache<&Transaction>,
                     witness_script: Option<&ScriptBuf>,
                     hash: WScriptHash|
         -> anyhow::Result<Option<[u8; 32]>> {
            let ws = witness_script.context("missing witness script")?;
            anyhow::ensure!(ws.wscript_hash() == hash, "witness script doesn't match the output");
            if !script_has_key(ws, &pubkey) {
                return Ok(None);
            }
            Ok(Some(
                cache
                    .p2wsh_signature_hash(index, ws, utxo.value, sighash_type)?
                    .to_byte_array(),
            ))
        };
        let digest = match classify(&utxo.script_pubkey) {
            ScriptPattern::P2pkh(hash) => (compressed.pubkey_hash() == hash)
                .then(|| {
                    cache.legacy_signature_hash(index, &utxo.script_pubkey, sighash_type.to_u32())
                })
                .transpose()?
                .map(|h| h.to_byte_array()),
            ScriptPattern::P2wpkh(hash) => p2wpkh(cache, hash)?,
            ScriptPattern::P2wsh(hash) => p2wsh(cache, input.witness_script.as_ref(), hash)?,
            ScriptPattern::P2sh(hash) => {
                let rs = input.redeem_script.as_ref().context("missing redeem script")?;
                anyhow::ensure!(rs.script_hash() == hash, "redeem script doesn't match the output");
                match classify(rs) {
                    ScriptPattern::P2wpkh(hash) => p2wpkh(cache, hash)?,
                    ScriptPattern::P2wsh(hash) => {
                        p2wsh(cache, input.witness_script.as_ref(), hash)?
                    }
                    _ if script_has_key(rs, &pubkey) => Some(
                        cache
                            .legacy_signature_hash(index, rs, sighash_type.to_u32())?
                            .to_byte_array(),
                    ),
                    _ => None,
                }
            }
            ScriptPattern::P2tr(_) | ScriptPattern::Unknown => None,
        };
        let Some(digest) = digest else {
            log::debug!("Input {index}: key {pubkey} is not part of the spent script");
            return Ok(false);
        };
        let signature = self.secp.sign_ecdsa(&Message::from_digest(digest), secret);
        input.partial_sigs.insert(
            pubkey,
            ecdsa::Signature {
                signature,
                sighash_type,
            },
        );
        Ok(true)
    }

    fn taproot_sighash_type(input: &Input) -> anyhow::Result<TapSighashType> {
        Ok(input
            .sighash_type
            .map(|t| t.taproot_hash_ty())
            .transpose()?
            .unwrap_or(TapSighashType::Default))
    }

    fn sign_key_spend(
        &self,
        cache: &mut SighashCache<&Transaction>,
        input: &mut Input,
        index: usize,
        utxo: &TxOut,
        prevouts: &[TxOut],
        secret: &SecretKey,
    ) -> anyhow::Result<bool> {
        let ScriptPattern::P2tr(output_key) = classify(&utxo.script_pubkey) else {
            return Ok(false);
        };
        let keypair = Keypair::from_secret_key(self.secp, secret)
            .tap_tweak(self.secp, input.tap_merkle_root)
            .to_inner();
        if keypair.x_only_public_key().0 != output_key {
            log::debug!("Input {index}: tweaked key doesn't match the output key");
            return Ok(false);
        }
        let sighash_type = Self::taproot_sighash_type(input)?;
        let sighash =
            cache.taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts), sighash_type)?;
        let signature = self
            .secp
            .sign_schnorr_no_aux_rand(&Message::from_digest(sighash.to_byte_array()), &keypair);
        input.tap_key_sig = Some(taproot::Signature {
            signature,
            sighash_type,
        });
        Ok(true)
    }

    fn sign_script_spend(
        &self,
        cache: &mut SighashCache<&Transaction>,
        input: &mut Input,
        index: usize,
        prevouts: &[TxOut],
        leaf: TapLeafHash,
        secret: &SecretKey,
    ) -> anyhow::Result<bool> {
        let keypair = Keypair::from_secret_key(self.secp, secret);
        let xonly: XOnlyPublicKey = keypair.x_only_public_key().0;
        let sighash_type = Self::taproot_sighash_type(input)?;
        let sighash = cache.taproot_script_spend_signature_hash(
            index,
            &Prevouts::All(prevouts),
            leaf,
            sighash_type,
        )?;
        let signature = self
            .secp
            .sign_schnorr_no_aux_rand(&Message::from_digest(sighash.to_byte_array()), &keypair);
        input.tap_script_sigs.insert(
            (xonly, leaf),
            taproot::Signature {
                signature,
                sighash_type,
            },
        );
        Ok(true)
    }
}

fn script_has_key(script: &Script, pubkey: &bitcoin::PublicKey) -> bool {
    let needle = pubkey.to_bytes();
    script.instructions().any(|i| match i {
        Ok(Instruction::PushBytes(b)) => b.as_bytes() == needle.as_slice(),
        _ => false,
    })
}

/// Native or nested P2WPKH, judging by the spent script and redeem script.
pub(crate) fn is_p2wpkh_spend(input: &Input, utxo: &TxOut) -> bool {
    match classify(&utxo.script_pubkey) {
        ScriptPattern::P2wpkh(_) => true,
        ScriptPattern::P2sh(_) => input
            .redeem_script
            .as_ref()
            .is_some_and(|rs| matches!(classify(rs), ScriptPattern::P2wpkh(_))),
        _ => false,
    }
}

/// Signs with a single-sig account. Fails with `NothingSigned` when no input
/// could be signed.
pub fn sign_psbt(
    secp: &Secp256k1<All>,
    psbt: &Psbt,
    keys: &SigningKeys,
    config: &EngineConfig,
) -> Result<SigningResult, EngineError> {
    let master = &keys.master().expose_secret().0;
    let result = Signer::new(secp, master, keys.network, config.gap_limit).sign(psbt, keys);
    if result.signed_inputs.is_empty() {
        return Err(Incompleteness::NothingSigned {
            total: result.total_inputs,
        }
        .into());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bitcoin::{psbt::PsbtSighashType, Amount};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        address::script_pubkey_for,
        mnemonic::seed_from_text,
        psbt::test_utils::{funding_tx, spending_psbt},
    };

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn keys(
        secp: &Secp256k1<All>,
        script_type: SingleSigScriptType,
    ) -> anyhow::Result<SigningKeys> {
        let seed = seed_from_text(ABANDON, None)?;
        SigningKeys::from_seed(
            secp,
            seed.expose_secret(),
            script_type.default_account_path(Network::Bitcoin)?,
            script_type,
            Network::Bitcoin,
        )
    }

    fn config() -> EngineConfig {
        EngineConfig::new(Network::Bitcoin, Some(50)).expect("valid config")
    }

    /// PSBT spending the key at `branch/index` of `keys`, with or without
    /// derivation metadata.
    fn psbt_for(
        secp: &Secp256k1<All>,
        keys: &SigningKeys,
        is_change: bool,
        index: u32,
        with_metadata: bool,
    ) -> anyhow::Result<(Psbt, PublicKey)> {
        let (path, secret) = keys.account_child_key(secp, is_change, index)?;
        let pubkey = secret.public_key(secp);
        let spk = script_pubkey_for(secp, &pubkey, keys.script_type);
        let funding = funding_tx(spk.clone(), 50_000);
        let mut psbt = spending_psbt(
            &funding,
            vec![TxOut {
                value: Amount::from_sat(49_000),
                script_pubkey: spk,
            }],
        );
        let input = &mut psbt.inputs[0];
        match keys.script_type {
            SingleSigScriptType::Legacy => input.non_witness_utxo = Some(funding.clone()),
            _ => input.witness_utxo = Some(funding.output[0].clone()),
        }
        if keys.script_type == SingleSigScriptType::NestedSegwit {
            input.redeem_script = Some(nested_redeem_script(&pubkey));
        }
        if with_metadata {
            let source = (keys.master_fingerprint, path.to_derivation_path());
            if keys.script_type == SingleSigScriptType::Taproot {
                let xonly = pubkey.x_only_public_key().0;
                input.tap_internal_key = Some(xonly);
                input.tap_key_origins.insert(xonly, (vec![], source));
            } else {
                input.bip32_derivation.insert(pubkey, source);
            }
        }
        Ok((psbt, pubkey))
    }

    #[test]
    fn test_sign_p2wpkh() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        let keys = keys(&secp, SingleSigScriptType::NativeSegwit)?;
        let (mut psbt, pubkey) = psbt_for(&secp, &keys, false, 3, true)?;
        psbt.inputs[0].witness_script = Some(ScriptBuf::new());
        let result = sign_psbt(&secp, &psbt, &keys, &config())?;
        assert_eq!(result.signed_inputs, vec![0]);
        assert_eq!(result.total_inputs, 1);
        assert!(!result.used_gap_scan);
        assert!(result.alternative_paths.is_empty());
        let input = &result.psbt.inputs[0];
        assert_eq!(input.witness_script, None);
        let sig = input.partial_sigs[&bitcoin::PublicKey::new(pubkey)];
        let utxo = input.witness_utxo.as_ref().expect("utxo");
        let sighash = SighashCache::new(&result.psbt.unsigned_tx).p2wpkh_signature_hash(
            0,
            &utxo.script_pubkey,
            utxo.value,
            EcdsaSighashType::All,
        )?;
        secp.verify_ecdsa(
            &Message::from_digest(sighash.to_byte_array()),
            &sig.signature,
            &pubkey,
        )?;
        // the input psbt is left untouched
        assert!(psbt.inputs[0].partial_sigs.is_empty());
        Ok(())
    }

    #[test]
    fn test_failed_input_is_left_untouched() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        let keys = keys(&secp, SingleSigScriptType::NativeSegwit)?;
        let (mut psbt, pubkey) = psbt_for(&secp, &keys, false, 3, false)?;
        let input = &mut psbt.inputs[0];
        // the key is found through an alternative path, but the output is a
        // P2WSH without its witness script so no signature can be made
        let stated = KeyPath::from_str("m/48'/0'/0'/2'/0/3")?;
        input
            .bip32_derivation
            .insert(pubkey, (keys.master_fingerprint, stated.to_derivation_path()));
        input.witness_utxo = Some(TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: ScriptBuf::new_p2wsh(&ScriptBuf::from_bytes(vec![0x51]).wscript_hash()),
        });
        let master = &keys.master().expose_secret().0;
        let result = Signer::new(&secp, master, Network::Bitcoin, 50).sign(&psbt, &keys);
        assert!(result.signed_inputs.is_empty());
        assert!(result.alternative_paths.is_empty());
        assert_eq!(result.psbt, psbt);
        Ok(())
    }

    #[test]
    fn test_sign_legacy_and_nested() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        for script_type in [SingleSigScriptType::Legacy, SingleSigScriptType::NestedSegwit] {
            let keys = keys(&secp, script_type)?;
            let (psbt, pubkey) = psbt_for(&secp, &keys, true, 1, true)?;
            let result = sign_psbt(&secp, &psbt, &keys, &config())?;
            let sig = result.psbt.inputs[0].partial_sigs[&bitcoin::PublicKey::new(pubkey)];
            if script_type == SingleSigScriptType::Legacy {
                let cache = SighashCache::new(&result.psbt.unsigned_tx);
                let funding = result.psbt.inputs[0].non_witness_utxo.as_ref().expect("utxo");
                let sighash = cache.legacy_signature_hash(0, &funding.output[0].script_pubkey, 1)?;
                secp.verify_ecdsa(
                    &Message::from_digest(sighash.to_byte_array()),
                    &sig.signature,
                    &pubkey,
                )?;
            }
        }
        Ok(())
    }

    #[test]
    fn test_sign_taproot_key_spend() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        let keys = keys(&secp, SingleSigScriptType::Taproot)?;
        let (psbt, _) = psbt_for(&secp, &keys, false, 0, true)?;
        let result = sign_psbt(&secp, &psbt, &keys, &config())?;
        let input = &result.psbt.inputs[0];
        let sig = input.tap_key_sig.expect("key spend signature");
        let utxo = input.witness_utxo.clone().expect("utxo");
        let ScriptPattern::P2tr(output_key) = classify(&utxo.script_pubkey) else {
            panic!("not taproot")
        };
        let sighash = SighashCache::new(&result.psbt.unsigned_tx).taproot_key_spend_signature_hash(
            0,
            &Prevouts::All(&[utxo]),
            TapSighashType::Default,
        )?;
        secp.verify_schnorr(
            &sig.signature,
            &Message::from_digest(sighash.to_byte_array()),
            &output_key,
        )?;
        Ok(())
    }

    #[test]
    fn test_gap_scan() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        for script_type in SingleSigScriptType::ALL {
            let keys = keys(&secp, script_type)?;
            let (mut psbt, pubkey) = psbt_for(&secp, &keys, true, 7, false)?;
            if script_type == SingleSigScriptType::NestedSegwit {
                psbt.inputs[0].redeem_script = None;
            }
            let result = sign_psbt(&secp, &psbt, &keys, &config())?;
            assert!(result.used_gap_scan, "{script_type}");
            assert_eq!(result.signed_inputs, vec![0]);
            let input = &result.psbt.inputs[0];
            let expected_path = keys.account_path.extend(KeyPath::from_str("m/1/7")?.children());
            if script_type == SingleSigScriptType::Taproot {
                assert!(input.tap_key_sig.is_some());
                assert_eq!(
                    KeyPath::from(&input.tap_key_origins[&pubkey.x_only_public_key().0].1 .1),
                    expected_path
                );
            } else {
                assert_eq!(input.partial_sigs.len(), 1);
                assert_eq!(KeyPath::from(&input.bip32_derivation[&pubkey].1), expected_path);
            }
        }
        Ok(())
    }

    #[test]
    fn test_nothing_signed_and_finalized_skipped() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        let keys = keys(&secp, SingleSigScriptType::NativeSegwit)?;
        let (mut psbt, pubkey) = psbt_for(&secp, &keys, false, 0, true)?;
        psbt.inputs[0].final_script_witness = Some(bitcoin::Witness::new());
        assert!(matches!(
            sign_psbt(&secp, &psbt, &keys, &config()),
            Err(EngineError::Incomplete(Incompleteness::NothingSigned { total: 1 }))
        ));

        // metadata for another wallet, and the script is out of the scan range
        let (mut psbt, _) = psbt_for(&secp, &keys, false, 60, false)?;
        psbt.inputs[0]
            .bip32_derivation
            .insert(pubkey, (Fingerprint::from([1, 2, 3, 4]), KeyPath::from_str("m/0")?.into()));
        assert!(matches!(
            sign_psbt(&secp, &psbt, &keys, &config()),
            Err(EngineError::Incomplete(Incompleteness::NothingSigned { total: 1 }))
        ));
        Ok(())
    }

    #[test]
    fn test_sighash_type_respected() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        let keys = keys(&secp, SingleSigScriptType::NativeSegwit)?;
        let (mut psbt, pubkey) = psbt_for(&secp, &keys, false, 0, true)?;
        psbt.inputs[0].sighash_type =
            Some(PsbtSighashType::from(EcdsaSighashType::SinglePlusAnyoneCanPay));
        let result = sign_psbt(&secp, &psbt, &keys, &config())?;
        assert_eq!(
            result.psbt.inputs[0].partial_sigs[&bitcoin::PublicKey::new(pubkey)].sighash_type,
            EcdsaSighashType::SinglePlusAnyoneCanPay
        );
        Ok(())
    }
}
