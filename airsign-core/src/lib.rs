use bitcoin::secp256k1::{All, Secp256k1};
use rand_core::{CryptoRng, RngCore};

pub mod address;
pub mod config;
pub mod custom_logger;
pub mod descriptor;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod keypath;
pub mod keys;
pub mod mnemonic;
pub mod multisig;
pub mod psbt;
pub mod script;
pub mod slip132;
pub mod transaction;

pub use {
    anyhow, bip39, bitcoin, env_logger, hex, itertools, log, miniscript, rand, rand_core, rayon,
    secrecy, serde, serde_json,
};

/// Builds a secp256k1 context randomized with bytes from `rng`.
pub fn get_secp<Rng: CryptoRng + RngCore>(rng: &mut Rng) -> Secp256k1<All> {
    let mut seed = [0u8; 32];
    rng.fill_bytes(&mut seed);
    let mut s = Secp256k1::new();
    s.seeded_randomize(&seed);
    s
}
