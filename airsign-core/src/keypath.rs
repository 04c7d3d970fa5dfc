use std::{fmt, str::FromStr};

use anyhow::{bail, Context};
use bitcoin::bip32::{ChildNumber, DerivationPath};

/// A BIP32 key path such as `m/84'/0'/0'`.
///
/// Parsing accepts an optional `m/` prefix and `'`, `h` or `H` as the
/// hardened marker. `Display` always uses the `m/` prefix and `'`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct KeyPath(Vec<ChildNumber>);

impl KeyPath {
    pub fn new(children: Vec<ChildNumber>) -> Self {
        Self(children)
    }

    pub fn master() -> Self {
        Self(Vec::new())
    }

    pub fn children(&self) -> &[ChildNumber] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, c: ChildNumber) -> Self {
        let mut v = self.0.clone();
        v.push(c);
        Self(v)
    }

    pub fn extend(&self, other: &[ChildNumber]) -> Self {
        let mut v = self.0.clone();
        v.extend_from_slice(other);
        Self(v)
    }

    /// Raw 32-bit components with the hardened bit set where applicable.
    pub fn to_u32_vec(&self) -> Vec<u32> {
        self.0.iter().map(|c| u32::from(*c)).collect()
    }

    pub fn from_u32_slice(v: &[u32]) -> Self {
        Self(v.iter().map(|i| ChildNumber::from(*i)).collect())
    }

    /// Same path without the `m/` prefix and with `h` as the hardened marker,
    /// as written inside descriptor key origins.
    pub fn to_descriptor_string(&self) -> String {
        self.0.iter().map(fmt_child_h).collect::<Vec<_>>().join("/")
    }

    /// Hardened index of the component at `position`, if present and hardened.
    pub fn hardened_at(&self, position: usize) -> Option<u32> {
        match self.0.get(position) {
            Some(ChildNumber::Hardened { index }) => Some(*index),
            _ => None,
        }
    }

    /// Non-hardened components following the last hardened one.
    pub fn normal_suffix(&self) -> &[ChildNumber] {
        let start = self
            .0
            .iter()
            .rposition(|c| c.is_hardened())
            .map(|p| p + 1)
            .unwrap_or(0);
        &self.0[start..]
    }

    pub fn to_derivation_path(&self) -> DerivationPath {
        DerivationPath::from(self.0.clone())
    }
}

fn fmt_child_h(c: &ChildNumber) -> String {
    match c {
        ChildNumber::Hardened { index } => format!("{index}h"),
        ChildNumber::Normal { index } => index.to_string(),
    }
}

fn parse_child(s: &str) -> anyhow::Result<ChildNumber> {
    let (digits, hardened) = match s.strip_suffix(['\'', 'h', 'H']) {
        Some(d) => (d, true),
        None => (s, false),
    };
    anyhow::ensure!(
        !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        "Invalid path component {s:?}"
    );
    let index: u32 = digits
        .parse()
        .with_context(|| format!("Path component {s:?} out of range"))?;
    let child = if hardened {
        ChildNumber::from_hardened_idx(index)
    } else {
        ChildNumber::from_normal_idx(index)
    };
    child.with_context(|| format!("Path component {s:?} out of range"))
}

impl FromStr for KeyPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = match s {
            "" | "m" | "M" => return Ok(Self::master()),
            _ => s
                .strip_prefix("m/")
                .or_else(|| s.strip_prefix("M/"))
                .unwrap_or(s),
        };
        if rest.is_empty() || rest.ends_with('/') {
            bail!("Invalid key path {s:?}")
        }
        rest.split('/')
            .map(parse_child)
            .collect::<anyhow::Result<Vec<_>>>()
            .map(Self)
            .with_context(|| format!("Invalid key path {s:?}"))
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for c in &self.0 {
            match c {
                ChildNumber::Hardened { index } => write!(f, "/{index}'")?,
                ChildNumber::Normal { index } => write!(f, "/{index}")?,
            }
        }
        Ok(())
    }
}

impl From<DerivationPath> for KeyPath {
    fn from(p: DerivationPath) -> Self {
        Self(p.as_ref().to_vec())
    }
}

impl From<&DerivationPath> for KeyPath {
    fn from(p: &DerivationPath) -> Self {
        Self(p.as_ref().to_vec())
    }
}

impl From<KeyPath> for DerivationPath {
    fn from(p: KeyPath) -> Self {
        DerivationPath::from(p.0)
    }
}

impl AsRef<[ChildNumber]> for KeyPath {
    fn as_ref(&self) -> &[ChildNumber] {
        &self.0
    }
}
