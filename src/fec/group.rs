//! FEC group buffer
//!
//! Accumulates the shards of one forward-error-correction group and
//! reconstructs missing data shards, using a plain XOR for the dominant
//! single-loss case and Reed-Solomon over GF(2⁸) for multi-loss.

use std::collections::BTreeMap;

use super::gf::{gf_inv, gf_mul, gf_pow};
use super::FecError;

/// Code parameters snapshotted by each group at creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FecGroupConfig {
    /// Data shards per group.
    pub k: u32,
    /// Total shards per group (data + parity).
    pub n: u32,
    /// How long a group may wait for shards before eviction.
    pub repair_deadline_ms: i64,
    /// Extend the deadline for groups carrying a keyframe.
    pub keyframe_relax: bool,
    /// Extra wait granted by `keyframe_relax`.
    pub keyframe_grace_ms: i64,
}

impl Default for FecGroupConfig {
    fn default() -> Self {
        Self {
            k: 8,
            n: 12,
            repair_deadline_ms: 100,
            keyframe_relax: true,
            keyframe_grace_ms: 100,
        }
    }
}

impl FecGroupConfig {
    pub fn validate(&self) -> Result<(), FecError> {
        if self.k == 0 || self.n < self.k || self.n > 255 {
            return Err(FecError::InvalidParams {
                k: self.k,
                n: self.n,
            });
        }
        Ok(())
    }

    pub fn parity_count(&self) -> u32 {
        self.n - self.k
    }
}

/// One shard of a FEC group.
///
/// Data shards occupy indices `[0, k)`, parity shards `[k, n)` after the
/// wire index has been normalized by [`FecGroup::insert`].
#[derive(Debug, Clone)]
pub struct FecShard {
    pub group_id: u32,
    pub index: u32,
    pub payload: Vec<u8>,
    pub is_parity: bool,
    pub arrival_ms: i64,
    pub seq_num: u64,
    pub is_keyframe: bool,
}

/// Sparse shard set for a single group id.
#[derive(Debug)]
pub struct FecGroup {
    group_id: u32,
    config: FecGroupConfig,
    shards: BTreeMap<u32, FecShard>,
    created_ms: i64,
    shard_len: usize,
    consumed: bool,
}

impl FecGroup {
    pub fn new(group_id: u32, config: FecGroupConfig, now_ms: i64) -> Self {
        Self {
            group_id,
            config,
            shards: BTreeMap::new(),
            created_ms: now_ms,
            shard_len: 0,
            consumed: false,
        }
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn received_count(&self) -> usize {
        self.shards.len()
    }

    /// Record one shard. A duplicate `(group, index)` is a no-op; all
    /// shards of a group must share one byte length.
    pub fn insert(
        &mut self,
        index: u32,
        payload: Vec<u8>,
        is_parity: bool,
        arrival_ms: i64,
        seq_num: u64,
        is_keyframe: bool,
    ) -> Result<(), FecError> {
        if self.consumed {
            return Err(FecError::Consumed);
        }

        let index = if is_parity {
            if index >= self.config.parity_count() {
                return Err(FecError::IndexOutOfRange {
                    index,
                    kind: "parity",
                    limit: self.config.parity_count(),
                });
            }
            self.config.k + index
        } else {
            if index >= self.config.k {
                return Err(FecError::IndexOutOfRange {
                    index,
                    kind: "data",
                    limit: self.config.k,
                });
            }
            index
        };

        if self.shards.contains_key(&index) {
            return Ok(());
        }

        if self.shard_len == 0 {
            self.shard_len = payload.len();
        } else if payload.len() != self.shard_len {
            return Err(FecError::LengthMismatch {
                expected: self.shard_len,
                got: payload.len(),
            });
        }

        self.shards.insert(
            index,
            FecShard {
                group_id: self.group_id,
                index,
                payload,
                is_parity,
                arrival_ms,
                seq_num,
                is_keyframe,
            },
        );
        Ok(())
    }

    /// True once at least k shards of any kind are present.
    pub fn can_repair(&self) -> bool {
        self.shards.len() >= self.config.k as usize
    }

    /// True when all k data shards arrived and no decoding is needed.
    pub fn is_complete(&self) -> bool {
        self.data_count() >= self.config.k as usize
    }

    fn data_count(&self) -> usize {
        self.shards.values().filter(|s| !s.is_parity).count()
    }

    fn missing_data_indices(&self) -> Vec<u32> {
        (0..self.config.k)
            .filter(|i| !self.shards.contains_key(i))
            .collect()
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        let mut deadline = self.config.repair_deadline_ms;
        if self.config.keyframe_relax && self.shards.values().any(|s| s.is_keyframe) {
            deadline += self.config.keyframe_grace_ms;
        }
        now_ms - self.created_ms > deadline
    }

    /// Reconstruct and return the k data shards in index order, consuming
    /// the group.
    pub fn repair(&mut self) -> Result<Vec<FecShard>, FecError> {
        if self.consumed {
            return Err(FecError::Consumed);
        }
        if self.shards.len() < self.config.k as usize {
            return Err(FecError::InsufficientShards {
                received: self.shards.len(),
                needed: self.config.k as usize,
            });
        }

        let missing = self.missing_data_indices();
        if !missing.is_empty() {
            let parity_present = self.shards.values().filter(|s| s.is_parity).count();
            if missing.len() > parity_present {
                return Err(FecError::NonRepairable);
            }

            let recovered = if self.xor_applicable(&missing) {
                vec![self.repair_xor(missing[0])]
            } else {
                self.repair_rs(&missing)?
            };
            for shard in recovered {
                self.shards.insert(shard.index, shard);
            }
        }

        self.consumed = true;
        let mut shards = std::mem::take(&mut self.shards);
        let out: Vec<FecShard> = (0..self.config.k)
            .filter_map(|i| shards.remove(&i))
            .collect();
        debug_assert_eq!(out.len(), self.config.k as usize);
        Ok(out)
    }

    /// The XOR shortcut applies when a single data shard is missing, the
    /// rest are present, and the one parity on hand is the first parity
    /// row, whose codeword is the plain XOR of the data shards.
    fn xor_applicable(&self, missing: &[u32]) -> bool {
        if missing.len() != 1 {
            return false;
        }
        let parities: Vec<u32> = self
            .shards
            .values()
            .filter(|s| s.is_parity)
            .map(|s| s.index)
            .collect();
        parities == [self.config.k]
            && self.data_count() == self.config.k as usize - 1
    }

    fn repair_xor(&self, missing_index: u32) -> FecShard {
        let parity = &self.shards[&self.config.k];
        let mut payload = parity.payload.clone();
        for shard in self.shards.values().filter(|s| !s.is_parity) {
            for (dst, src) in payload.iter_mut().zip(&shard.payload) {
                *dst ^= src;
            }
        }
        self.recovered_shard(missing_index, payload, parity.arrival_ms)
    }

    /// General Reed-Solomon path. Each parity row r holds
    /// `Σ_i α^(r·i)·data_i`; subtracting the present data contributions
    /// leaves a Vandermonde system in the missing shards, solved by
    /// Gauss-Jordan elimination once for the whole block length.
    fn repair_rs(&self, missing: &[u32]) -> Result<Vec<FecShard>, FecError> {
        let m = missing.len();
        let parities: Vec<&FecShard> = self.shards.values().filter(|s| s.is_parity).collect();
        let data: Vec<&FecShard> = self.shards.values().filter(|s| !s.is_parity).collect();
        let rows = &parities[..m];

        // Syndromes: parity bytes minus what the received data explains.
        let mut rhs: Vec<Vec<u8>> = rows
            .iter()
            .map(|p| {
                let row = p.index - self.config.k;
                let mut acc = p.payload.clone();
                for shard in &data {
                    let coeff = gf_pow(row * shard.index);
                    for (dst, src) in acc.iter_mut().zip(&shard.payload) {
                        *dst ^= gf_mul(coeff, *src);
                    }
                }
                acc
            })
            .collect();

        let mut matrix: Vec<Vec<u8>> = rows
            .iter()
            .map(|p| {
                let row = p.index - self.config.k;
                missing.iter().map(|&mi| gf_pow(row * mi)).collect()
            })
            .collect();

        // Gauss-Jordan over GF(2⁸); row operations apply to the full
        // byte vectors on the right-hand side.
        for col in 0..m {
            let pivot = (col..m).find(|&r| matrix[r][col] != 0);
            let Some(pivot) = pivot else {
                return Err(FecError::NonRepairable);
            };
            if pivot != col {
                matrix.swap(pivot, col);
                rhs.swap(pivot, col);
            }

            let inv = gf_inv(matrix[col][col]);
            if inv != 1 {
                for v in matrix[col].iter_mut() {
                    *v = gf_mul(*v, inv);
                }
                for b in rhs[col].iter_mut() {
                    *b = gf_mul(*b, inv);
                }
            }

            for row in 0..m {
                if row == col {
                    continue;
                }
                let factor = matrix[row][col];
                if factor == 0 {
                    continue;
                }
                let (pivot_m, pivot_r) = (matrix[col].clone(), rhs[col].clone());
                for (dst, src) in matrix[row].iter_mut().zip(&pivot_m) {
                    *dst ^= gf_mul(factor, *src);
                }
                for (dst, src) in rhs[row].iter_mut().zip(&pivot_r) {
                    *dst ^= gf_mul(factor, *src);
                }
            }
        }

        let base_arrival = rows[0].arrival_ms;
        Ok(missing
            .iter()
            .zip(rhs)
            .map(|(&index, payload)| self.recovered_shard(index, payload, base_arrival))
            .collect())
    }

    /// Metadata for a reconstructed shard: the keyframe flag is the
    /// sticky-or of the present data shards, the sequence number is
    /// extrapolated from the nearest present data shard. Both are
    /// heuristics carried for downstream tie-breaking only.
    fn recovered_shard(&self, index: u32, payload: Vec<u8>, arrival_ms: i64) -> FecShard {
        let is_keyframe = self
            .shards
            .values()
            .any(|s| !s.is_parity && s.is_keyframe);
        let seq_num = self
            .shards
            .values()
            .filter(|s| !s.is_parity)
            .min_by_key(|s| s.index.abs_diff(index))
            .map(|near| {
                let delta = index as i64 - near.index as i64;
                near.seq_num.saturating_add_signed(delta)
            })
            .unwrap_or(0);

        FecShard {
            group_id: self.group_id,
            index,
            payload,
            is_parity: false,
            arrival_ms,
            seq_num,
            is_keyframe,
        }
    }
}
