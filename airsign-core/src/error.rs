//! Error taxonomy exposed at the engine boundary.
//!
//! Internals use `anyhow` and get classified here before reaching a caller, so
//! the UI can tell "this file is not a PSBT" apart from "import the matching
//! cosigner key".

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed input: {0}")]
    Malformed(#[from] MalformedInput),
    #[error("key derivation failed: {0}")]
    Derivation(String),
    #[error("incomplete: {0}")]
    Incomplete(#[from] Incompleteness),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedInput {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("invalid PSBT: {0}")]
    Psbt(String),
    #[error("invalid descriptor: {0}")]
    Descriptor(String),
    #[error("invalid multisig threshold {required}-of-{total}")]
    Threshold { required: u32, total: u32 },
    #[error("invalid key path: {0}")]
    KeyPath(String),
    #[error("invalid extended key: {0}")]
    ExtendedKey(String),
    #[error("invalid mnemonic: {0}")]
    Mnemonic(String),
    #[error("invalid address: {0}")]
    Address(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Incompleteness {
    #[error("input {index} has {present} of {required} required signatures")]
    InsufficientSignatures {
        index: usize,
        present: usize,
        required: usize,
    },
    #[error("input {index} has no UTXO information")]
    MissingUtxo { index: usize },
    #[error("input {index} cannot be finalized: {reason}")]
    Unfinalizable { index: usize, reason: String },
    #[error("no local key matches any cosigner")]
    NoLocalCosigner,
    #[error("none of the {total} inputs could be signed with this wallet")]
    NothingSigned { total: usize },
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete(_))
    }
}

impl From<bitcoin::bip32::Error> for EngineError {
    fn from(e: bitcoin::bip32::Error) -> Self {
        Self::Derivation(e.to_string())
    }
}
