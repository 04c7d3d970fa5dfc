//! Compact-size helpers on top of the `bitcoin` consensus codec.

use anyhow::Context;
pub use bitcoin::consensus::encode::VarInt;
use bitcoin::{
    consensus::{encode, Decodable},
    io::Read,
};

/// Size in bytes of `len` prefixed by its compact-size length.
pub fn prefixed_len(len: usize) -> usize {
    VarInt(len as u64).size() + len
}

/// Appends `vector` with its compact-size length prefix.
pub fn serialize_byte_vector(vector: &[u8], w: &mut Vec<u8>) {
    w.extend(encode::serialize(&vector.to_vec()));
}

/// Reads a length-prefixed byte vector. Lengths beyond what the consensus
/// codec accepts, or beyond the end of the input, are errors.
pub fn deserialize_byte_vector<R: Read + ?Sized>(r: &mut R) -> anyhow::Result<Vec<u8>> {
    Vec::<u8>::consensus_decode(r).context("invalid length-prefixed bytes")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_prefixed_len_boundaries() {
        for (len, expected) in [(0usize, 1usize), (0xFC, 0xFD), (0xFD, 0x100), (0x10000, 0x10005)] {
            assert_eq!(prefixed_len(len), expected);
        }
    }

    #[test]
    fn test_byte_vector() -> anyhow::Result<()> {
        let mut w = Vec::new();
        serialize_byte_vector(&[1, 2, 3], &mut w);
        assert_eq!(w, vec![3, 1, 2, 3]);
        let mut r = w.as_slice();
        assert_eq!(deserialize_byte_vector(&mut r)?, vec![1, 2, 3]);
        assert!(r.is_empty());
        Ok(())
    }

    #[test]
    fn test_byte_vector_truncated() {
        assert!(deserialize_byte_vector(&mut [0x05u8, 1, 2].as_slice()).is_err());
        // non-minimal length
        assert!(deserialize_byte_vector(&mut [0xFDu8, 0x01, 0x00, 0xaa].as_slice()).is_err());
    }

    #[test]
    fn test_huge_length_is_an_error() {
        let mut bytes = vec![0xFFu8; 9];
        bytes.push(0x00);
        assert!(deserialize_byte_vector(&mut bytes.as_slice()).is_err());
    }
}
