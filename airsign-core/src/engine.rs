//! String level entry points for the storage/UI collaborator.
//!
//! Everything here takes text (hex seeds, base64 PSBTs, descriptor text) and
//! returns typed results with an [`EngineError`], so callers never see
//! `anyhow` chains.

use std::collections::BTreeMap;

use bitcoin::{
    bip32::{Fingerprint, Xpub},
    psbt::Psbt,
    secp256k1::{All, Secp256k1},
    Network,
};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::{
    address::{generate_address, parse_address, scan_for_script, SingleSigScriptType},
    config::EngineConfig,
    descriptor::{parse_multisig_descriptor, unified_descriptor},
    error::{EngineError, EngineResult, Incompleteness, MalformedInput},
    keypath::KeyPath,
    keys::{master_fingerprint, master_from_seed, Secret, SigningKeys, WXpriv, WalletKeys},
    mnemonic::seed_from_hex,
    multisig::MultisigConfig,
    psbt::{
        analyze::psbt_details,
        finalize_to_hex, parse_psbt_base64, serialize_psbt_base64,
        sign::{sign_psbt, AlternativePath, MultisigLocator, Signer, SigningResult},
        PsbtDetails,
    },
    slip132::decode_xpub,
};

/// Seeds held by the device, addressed by an opaque key id.
pub trait SecureStorage {
    fn key_ids(&self) -> Vec<String>;

    /// A master key unlocked earlier in the session, if any. Skips the seed
    /// round trip.
    fn loaded_master(&self, _key_id: &str) -> Option<Secret<WXpriv>> {
        None
    }

    fn seed_hex(&self, key_id: &str) -> anyhow::Result<SecretString>;
}

/// In-memory storage, for the CLI and tests.
#[derive(Default)]
pub struct MemoryStorage {
    seeds: BTreeMap<String, SecretString>,
    loaded: BTreeMap<String, Secret<WXpriv>>,
}

impl MemoryStorage {
    pub fn add_seed(&mut self, key_id: impl Into<String>, seed_hex: SecretString) {
        self.seeds.insert(key_id.into(), seed_hex);
    }

    pub fn add_loaded(&mut self, key_id: impl Into<String>, master: Secret<WXpriv>) {
        self.loaded.insert(key_id.into(), master);
    }
}

impl SecureStorage for MemoryStorage {
    fn key_ids(&self) -> Vec<String> {
        let mut ids = self.loaded.keys().cloned().collect::<Vec<_>>();
        ids.extend(self.seeds.keys().filter(|k| !self.loaded.contains_key(*k)).cloned());
        ids
    }

    fn loaded_master(&self, key_id: &str) -> Option<Secret<WXpriv>> {
        self.loaded.get(key_id).cloned()
    }

    fn seed_hex(&self, key_id: &str) -> anyhow::Result<SecretString> {
        self.seeds
            .get(key_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown key id {key_id}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignOutcome {
    pub psbt_base64: String,
    pub signed_inputs: Vec<usize>,
    pub total_inputs: usize,
    pub alternative_paths: Vec<AlternativePath>,
    pub used_gap_scan: bool,
    pub stripped_global_xpubs: usize,
}

impl SignOutcome {
    fn new(result: SigningResult, stripped_global_xpubs: usize) -> Self {
        Self {
            psbt_base64: serialize_psbt_base64(&result.psbt),
            signed_inputs: result.signed_inputs,
            total_inputs: result.total_inputs,
            alternative_paths: result.alternative_paths,
            used_gap_scan: result.used_gap_scan,
            stripped_global_xpubs,
        }
    }
}

fn derivation(e: anyhow::Error) -> EngineError {
    EngineError::Derivation(format!("{e:#}"))
}

fn seed_error(e: anyhow::Error) -> EngineError {
    MalformedInput::Other(format!("invalid seed: {e:#}")).into()
}

fn master_from_seed_hex(seed_hex: &str, network: Network) -> EngineResult<Secret<WXpriv>> {
    let seed = seed_from_hex(seed_hex).map_err(seed_error)?;
    master_from_seed(seed.expose_secret(), network).map_err(seed_error)
}

fn account_path(
    path: Option<&str>,
    script_type: SingleSigScriptType,
    network: Network,
) -> EngineResult<KeyPath> {
    match path {
        Some(p) => p
            .parse()
            .map_err(|e: anyhow::Error| MalformedInput::KeyPath(format!("{e:#}")).into()),
        None => script_type.default_account_path(network).map_err(derivation),
    }
}

/// Fingerprint, account xpub and first address of a seed. `path` defaults to
/// the script type's standard account 0.
pub fn derive_wallet_keys(
    secp: &Secp256k1<All>,
    seed_hex: &str,
    path: Option<&str>,
    script_type: SingleSigScriptType,
    network: Network,
) -> EngineResult<WalletKeys> {
    let master = master_from_seed_hex(seed_hex, network)?;
    let path = account_path(path, script_type, network)?;
    WalletKeys::from_master(secp, &master, &path, network, script_type).map_err(derivation)
}

pub fn sign_psbt_base64(
    secp: &Secp256k1<All>,
    psbt_base64: &str,
    seed_hex: &str,
    script_type: SingleSigScriptType,
    account: u32,
    config: &EngineConfig,
) -> EngineResult<SignOutcome> {
    let parsed = parse_psbt_base64(psbt_base64)?;
    let master = master_from_seed_hex(seed_hex, config.network)?;
    let path = script_type
        .account_path(config.network, account)
        .map_err(derivation)?;
    let keys = SigningKeys::new(secp, master, path, script_type, config.network)
        .map_err(derivation)?;
    let result = sign_psbt(secp, &parsed.psbt, &keys, config)?;
    Ok(SignOutcome::new(result, parsed.stripped_global_xpubs))
}

/// Signs with every key in `storage` that is a cosigner of `multisig`,
/// accumulating their signatures in one PSBT. Keys that can't be read are
/// logged and skipped.
pub fn sign_multisig_psbt(
    secp: &Secp256k1<All>,
    psbt: &Psbt,
    multisig: &MultisigConfig,
    storage: &dyn SecureStorage,
    config: &EngineConfig,
) -> EngineResult<SigningResult> {
    let mut result: Option<SigningResult> = None;
    for key_id in storage.key_ids() {
        let master = match storage.loaded_master(&key_id) {
            Some(master) => master,
            None => match storage
                .seed_hex(&key_id)
                .map_err(seed_error)
                .and_then(|s| master_from_seed_hex(s.expose_secret(), config.network))
            {
                Ok(master) => master,
                Err(e) => {
                    log::warn!("Skipping key {key_id}: {e}");
                    continue;
                }
            },
        };
        let fingerprint = master_fingerprint(secp, &master);
        let cosigners = multisig
            .cosigners
            .iter()
            .filter(|c| c.fingerprint == fingerprint)
            .collect::<Vec<_>>();
        if cosigners.is_empty() {
            log::debug!("Key {key_id} ({fingerprint}) is not a cosigner");
            continue;
        }
        let signer = Signer::new(
            secp,
            &master.expose_secret().0,
            config.network,
            config.gap_limit,
        );
        for cosigner in cosigners {
            let locator = MultisigLocator {
                config: multisig,
                cosigner,
            };
            let current = result.as_ref().map_or(psbt, |r| &r.psbt);
            let pass = signer.sign(current, &locator);
            result = Some(match result.take() {
                Some(previous) => previous.merge(pass),
                None => pass,
            });
        }
    }
    let result = result.ok_or(Incompleteness::NoLocalCosigner)?;
    if result.signed_inputs.is_empty() {
        return Err(Incompleteness::NothingSigned {
            total: result.total_inputs,
        }
        .into());
    }
    Ok(result)
}

pub fn sign_multisig_psbt_base64(
    secp: &Secp256k1<All>,
    psbt_base64: &str,
    multisig: &MultisigConfig,
    storage: &dyn SecureStorage,
    config: &EngineConfig,
) -> EngineResult<SignOutcome> {
    let parsed = parse_psbt_base64(psbt_base64)?;
    let result = sign_multisig_psbt(secp, &parsed.psbt, multisig, storage, config)?;
    Ok(SignOutcome::new(result, parsed.stripped_global_xpubs))
}

/// Raw transaction hex, ready to broadcast.
pub fn finalize_psbt_base64(psbt_base64: &str) -> EngineResult<String> {
    finalize_to_hex(&parse_psbt_base64(psbt_base64)?.psbt)
}

pub fn analyze_psbt_base64(
    psbt_base64: &str,
    fingerprints: &[Fingerprint],
    network: Network,
) -> EngineResult<PsbtDetails> {
    Ok(psbt_details(
        &parse_psbt_base64(psbt_base64)?.psbt,
        fingerprints,
        network,
    ))
}

/// Parses a descriptor or BSMS record. A configuration none of
/// `local_fingerprints` takes part in cannot be signed here and is rejected.
pub fn import_multisig(
    secp: &Secp256k1<All>,
    text: &str,
    local_fingerprints: &[Fingerprint],
    network: Network,
) -> EngineResult<MultisigConfig> {
    let config = parse_multisig_descriptor(secp, text, local_fingerprints, network)?;
    if !config.has_local_cosigner() {
        return Err(Incompleteness::NoLocalCosigner.into());
    }
    Ok(config)
}

pub fn unified_descriptor_for_seed(
    secp: &Secp256k1<All>,
    seed_hex: &str,
    script_type: SingleSigScriptType,
    network: Network,
) -> EngineResult<String> {
    let keys = derive_wallet_keys(secp, seed_hex, None, script_type, network)?;
    unified_descriptor(
        keys.master_fingerprint,
        &keys.account_path,
        &keys.account_xpub,
        script_type,
    )
    .map_err(|e| MalformedInput::Descriptor(format!("{e:#}")).into())
}

fn parse_xpub(text: &str) -> EngineResult<Xpub> {
    decode_xpub(text.trim()).map_err(|e| MalformedInput::ExtendedKey(format!("{e:#}")).into())
}

pub fn generate_address_from_xpub(
    secp: &Secp256k1<All>,
    xpub_text: &str,
    index: u32,
    is_change: bool,
    script_type: SingleSigScriptType,
    network: Network,
) -> EngineResult<String> {
    let xpub = parse_xpub(xpub_text)?;
    Ok(generate_address(secp, &xpub, index, is_change, script_type, network)
        .map_err(derivation)?
        .to_string())
}

/// `(is_change, index)` of `address` within the gap limit, if it belongs to
/// the account.
pub fn find_address_index(
    secp: &Secp256k1<All>,
    xpub_text: &str,
    address: &str,
    script_type: SingleSigScriptType,
    config: &EngineConfig,
) -> EngineResult<Option<(bool, u32)>> {
    let xpub = parse_xpub(xpub_text)?;
    let address = parse_address(address, config.network)
        .map_err(|e| MalformedInput::Address(format!("{e:#}")))?;
    scan_for_script(
        secp,
        &xpub,
        script_type,
        &address.script_pubkey(),
        config.gap_limit,
    )
    .map_err(derivation)
}
