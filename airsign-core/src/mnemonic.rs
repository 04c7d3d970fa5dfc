use std::str::FromStr;

use anyhow::Context;
use bip39::{Language, Mnemonic};
use rand_core::{CryptoRng, RngCore};
use secrecy::{ExposeSecret, ExposeSecretMut, SecretString};

use crate::keys::Secret;

const MAX_ENTROPY_BYTES: usize = 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WordCount {
    W12,
    W24,
}

impl WordCount {
    pub fn to_integer(&self) -> u8 {
        match self {
            WordCount::W12 => 12,
            WordCount::W24 => 24,
        }
    }

    pub fn entropy_bytes(&self) -> usize {
        (usize::from(self.to_integer()) / 3) * 4
    }
}

impl FromStr for WordCount {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "12" => Ok(Self::W12),
            "24" => Ok(Self::W24),
            other => anyhow::bail!("Invalid word count {other}, expected 12 or 24"),
        }
    }
}

pub fn mnemonic_from_entropy(entropy: &[u8]) -> anyhow::Result<Secret<Mnemonic>> {
    let mnemonic = Mnemonic::from_entropy_in(Language::English, entropy)
        .context("invalid entropy length for a mnemonic")?;
    Ok(Secret::from(Box::new(mnemonic)))
}

pub fn generate_mnemonic<Rng: CryptoRng + RngCore>(
    rng: &mut Rng,
    word_count: WordCount,
) -> anyhow::Result<Secret<Mnemonic>> {
    let entropy_bytes = word_count.entropy_bytes();
    let mut entropy = Secret::from(Box::new([0u8; MAX_ENTROPY_BYTES]));
    rng.fill_bytes(&mut entropy.expose_secret_mut()[0..entropy_bytes]);
    mnemonic_from_entropy(&entropy.expose_secret()[0..entropy_bytes])
}

/// Parses an English mnemonic. Extra whitespace and upper case letters are
/// tolerated, the checksum is not.
pub fn validate_mnemonic(words: &str) -> anyhow::Result<Secret<Mnemonic>> {
    let normalized = words
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, &normalized)
        .context("invalid mnemonic")?;
    Ok(Secret::from(Box::new(mnemonic)))
}

/// BIP39 seed (PBKDF2-HMAC-SHA512, 2048 rounds, salt "mnemonic" + passphrase).
pub fn seed_from_mnemonic(
    mnemonic: &Secret<Mnemonic>,
    passphrase: Option<&SecretString>,
) -> Secret<[u8; 64]> {
    let passphrase = passphrase.map(|p| p.expose_secret()).unwrap_or("");
    Secret::from(Box::new(mnemonic.expose_secret().to_seed(passphrase)))
}

/// Decodes a hex encoded seed as handed over by the storage layer.
pub fn seed_from_hex(seed_hex: &str) -> anyhow::Result<Secret<Vec<u8>>> {
    let seed = hex::decode(seed_hex.trim()).context("seed is not valid hex")?;
    anyhow::ensure!(
        (16..=64).contains(&seed.len()),
        "Seed must be between 16 and 64 bytes, got {}",
        seed.len()
    );
    Ok(Secret::from(Box::new(seed)))
}

/// Accepts either a hex seed or a mnemonic (with an optional passphrase).
pub fn seed_from_text(
    text: &str,
    passphrase: Option<&SecretString>,
) -> anyhow::Result<Secret<Vec<u8>>> {
    let text = text.trim();
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return seed_from_hex(text);
    }
    let mnemonic = validate_mnemonic(text)?;
    let seed = seed_from_mnemonic(&mnemonic, passphrase);
    Ok(Secret::from(Box::new(seed.expose_secret().to_vec())))
}

#[cfg(test)]
mod tests {
    use bitcoin::{bip32::Xpriv, secp256k1::Secp256k1, Network};
    use pretty_assertions::assert_eq;

    use super::*;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_abandon_fingerprint() -> anyhow::Result<()> {
        let secp = Secp256k1::new();
        let mnemonic = validate_mnemonic(ABANDON)?;
        let seed = seed_from_mnemonic(&mnemonic, None);
        let master = Xpriv::new_master(Network::Bitcoin, seed.expose_secret())?;
        assert_eq!(master.fingerprint(&secp).to_string(), "73c5da0a");
        Ok(())
    }

    #[test]
    fn test_entropy_round_trip() -> anyhow::Result<()> {
        let mnemonic = mnemonic_from_entropy(&[0u8; 16])?;
        assert_eq!(mnemonic.expose_secret().to_string(), ABANDON);
        assert_eq!(mnemonic.expose_secret().to_entropy(), vec![0u8; 16]);
        assert!(mnemonic_from_entropy(&[0u8; 15]).is_err());
        Ok(())
    }

    #[test]
    fn test_generate() -> anyhow::Result<()> {
        let mut rng = rand::thread_rng();
        for (count, words) in [(WordCount::W12, 12), (WordCount::W24, 24)] {
            let m = generate_mnemonic(&mut rng, count)?;
            assert_eq!(m.expose_secret().word_count(), words);
            validate_mnemonic(&m.expose_secret().to_string())?;
        }
        Ok(())
    }

    #[test]
    fn test_validate() {
        assert!(validate_mnemonic("  Abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon ABOUT ").is_ok());
        assert!(validate_mnemonic("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon").is_err());
        assert!(validate_mnemonic("abandon foo").is_err());
    }

    #[test]
    fn test_seed_inputs() -> anyhow::Result<()> {
        let from_words = seed_from_text(ABANDON, None)?;
        let from_hex = seed_from_text(&hex::encode(from_words.expose_secret()), None)?;
        assert_eq!(from_words.expose_secret(), from_hex.expose_secret());
        let with_passphrase = seed_from_text(ABANDON, Some(&SecretString::new("TREZOR".into())))?;
        assert!(from_words.expose_secret() != with_passphrase.expose_secret());
        assert!(seed_from_hex("abcd").is_err());
        assert!(seed_from_hex("zz").is_err());
        Ok(())
    }
}
