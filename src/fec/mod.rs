//! Forward error correction
//!
//! A systematic Reed-Solomon code over GF(2⁸): each group carries k data
//! shards and n−k parity shards, and any k of the n reconstruct the data.
//! Parity row r encodes `Σ_i α^(r·i)·data_i`, so the first parity row is
//! the plain XOR of the data shards and single losses take a cheap XOR
//! path instead of the matrix solve.

pub mod gf;
pub mod group;
pub mod manager;

pub use group::{FecGroup, FecGroupConfig, FecShard};
pub use manager::{FecRepairManager, FecStats, RecoveredShard};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FecError {
    #[error("{kind} shard index {index} out of range (limit {limit})")]
    IndexOutOfRange {
        index: u32,
        kind: &'static str,
        limit: u32,
    },

    #[error("shard length {got} does not match group length {expected}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("group holds {received} shards but needs {needed} to repair")]
    InsufficientShards { received: usize, needed: usize },

    #[error("linear system is singular, group cannot be repaired")]
    NonRepairable,

    #[error("group table full ({groups} groups) with none expired")]
    Backpressure { groups: usize },

    #[error("invalid code parameters k={k} n={n}")]
    InvalidParams { k: u32, n: u32 },

    #[error("group already consumed by a successful repair")]
    Consumed,
}

/// Compute the n−k parity shards for k equal-length data shards.
///
/// This is the encoder counterpart of [`FecGroup::repair`]; senders and
/// tests use it to produce groups the repair path reconstructs
/// byte-exactly.
pub fn encode_parity(k: usize, n: usize, data: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, FecError> {
    if k == 0 || n < k || n > 255 {
        return Err(FecError::InvalidParams {
            k: k as u32,
            n: n as u32,
        });
    }
    if data.len() != k {
        return Err(FecError::InsufficientShards {
            received: data.len(),
            needed: k,
        });
    }
    let len = data[0].len();
    if data.iter().any(|d| d.len() != len) {
        let got = data.iter().map(|d| d.len()).find(|&l| l != len).unwrap_or(0);
        return Err(FecError::LengthMismatch { expected: len, got });
    }

    let mut parity = vec![vec![0u8; len]; n - k];
    for (r, out) in parity.iter_mut().enumerate() {
        for (i, shard) in data.iter().enumerate() {
            let coeff = gf::gf_pow((r * i) as u32);
            for (dst, src) in out.iter_mut().zip(shard) {
                *dst ^= gf::gf_mul(coeff, *src);
            }
        }
    }
    Ok(parity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_parity_row_is_xor() {
        let data = vec![vec![0xAA, 0x01], vec![0x55, 0x02], vec![0x0F, 0x04]];
        let parity = encode_parity(3, 4, &data).unwrap();
        assert_eq!(parity[0], vec![0xAA ^ 0x55 ^ 0x0F, 0x01 ^ 0x02 ^ 0x04]);
    }

    #[test]
    fn test_encode_rejects_bad_params() {
        assert!(encode_parity(0, 4, &[]).is_err());
        assert!(encode_parity(4, 3, &vec![vec![0u8; 4]; 4]).is_err());
        assert!(encode_parity(200, 256, &vec![vec![0u8; 4]; 200]).is_err());
    }

    #[test]
    fn test_encode_rejects_uneven_lengths() {
        let data = vec![vec![0u8; 8], vec![0u8; 9]];
        assert!(matches!(
            encode_parity(2, 3, &data),
            Err(FecError::LengthMismatch { .. })
        ));
    }
}
