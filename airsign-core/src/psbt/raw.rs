//! Minimal key-value walker over the global section of a serialized PSBT.
//!
//! Only used for the global-xpub leniency: the global map is split into
//! entries, rewritten, and the rest of the stream is carried over untouched.

use anyhow::Context;

use crate::encoding::{deserialize_byte_vector, serialize_byte_vector};

pub const PSBT_MAGIC: [u8; 5] = [0x70, 0x73, 0x62, 0x74, 0xff];
pub const PSBT_GLOBAL_UNSIGNED_TX: u8 = 0x00;
pub const PSBT_GLOBAL_XPUB: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RawEntry {
    /// First byte of the key. Key types above 0xfc would be compact-size
    /// encoded, none of the global ones we care about are.
    pub fn key_type(&self) -> Option<u8> {
        self.key.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPsbt {
    pub global: Vec<RawEntry>,
    /// Input and output maps, byte for byte.
    pub remainder: Vec<u8>,
}

impl RawPsbt {
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut r = bytes
            .strip_prefix(&PSBT_MAGIC)
            .context("missing PSBT magic bytes")?;
        let mut global = Vec::new();
        loop {
            let key = deserialize_byte_vector(&mut r).context("truncated global map")?;
            if key.is_empty() {
                break;
            }
            let value = deserialize_byte_vector(&mut r).context("truncated global value")?;
            global.push(RawEntry { key, value });
        }
        Ok(Self {
            global,
            remainder: r.to_vec(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = Vec::with_capacity(self.remainder.len() + 256);
        w.extend(PSBT_MAGIC);
        for entry in &self.global {
            serialize_byte_vector(&entry.key, &mut w);
            serialize_byte_vector(&entry.value, &mut w);
        }
        // separator
        w.push(0x00);
        w.extend(&self.remainder);
        w
    }

    /// Removes every global xpub entry and returns how many were dropped.
    pub fn strip_global_xpubs(&mut self) -> usize {
        let before = self.global.len();
        self.global
            .retain(|e| e.key_type() != Some(PSBT_GLOBAL_XPUB));
        before - self.global.len()
    }
}
