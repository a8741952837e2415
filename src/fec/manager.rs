//! FEC repair manager
//!
//! Owns the live FEC groups of one session, keyed by group id. Enforces
//! the group cap with expired-group eviction and drives the periodic
//! repair sweep that feeds recovered shards to the reorder stage.

use std::collections::HashMap;

use super::group::{FecGroup, FecGroupConfig};
use super::FecError;

/// Counters published into the stats snapshot.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct FecStats {
    pub total_groups: u64,
    pub repaired_groups: u64,
    pub complete_groups: u64,
    pub expired_groups: u64,
    pub failed_repairs: u64,
}

/// A data shard coming out of a repair sweep, with the metadata the
/// reorder stage consumes.
#[derive(Debug)]
pub struct RecoveredShard {
    pub payload: Vec<u8>,
    pub seq_num: u64,
    pub is_keyframe: bool,
}

pub struct FecRepairManager {
    config: FecGroupConfig,
    groups: HashMap<u32, FecGroup>,
    max_groups: usize,
    stats: FecStats,
}

impl FecRepairManager {
    pub fn new(config: FecGroupConfig) -> Self {
        let max_groups = (config.k as usize) * 10;
        Self {
            config,
            groups: HashMap::new(),
            max_groups,
            stats: FecStats::default(),
        }
    }

    pub fn set_max_groups(&mut self, max_groups: usize) {
        self.max_groups = max_groups;
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn stats(&self) -> FecStats {
        self.stats
    }

    /// Insert one shard, creating its group on first contact. When the
    /// group table is full an expired group is evicted to make room;
    /// with nothing expired the insertion is refused.
    pub fn insert(
        &mut self,
        group_id: u32,
        index: u32,
        payload: Vec<u8>,
        is_parity: bool,
        arrival_ms: i64,
        seq_num: u64,
        is_keyframe: bool,
    ) -> Result<(), FecError> {
        if !self.groups.contains_key(&group_id) {
            if self.groups.len() >= self.max_groups {
                let expired = self
                    .groups
                    .iter()
                    .find(|(_, g)| g.is_expired(arrival_ms))
                    .map(|(id, _)| *id);
                match expired {
                    Some(id) => {
                        self.groups.remove(&id);
                        self.stats.expired_groups += 1;
                        tracing::debug!(group_id = id, "evicted expired FEC group to admit new one");
                    }
                    None => {
                        return Err(FecError::Backpressure {
                            groups: self.groups.len(),
                        });
                    }
                }
            }
            self.groups
                .insert(group_id, FecGroup::new(group_id, self.config, arrival_ms));
            self.stats.total_groups += 1;
        }

        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or(FecError::Backpressure { groups: 0 })?;
        group.insert(index, payload, is_parity, arrival_ms, seq_num, is_keyframe)
    }

    /// Sweep all groups: drop the expired, repair the repairable, and
    /// return the recovered data shards with their metadata. Successfully
    /// repaired groups are consumed and removed.
    pub fn check_and_repair(&mut self, now_ms: i64) -> Vec<RecoveredShard> {
        let mut output = Vec::new();
        let mut remove = Vec::new();

        for (&id, group) in self.groups.iter_mut() {
            if group.is_expired(now_ms) {
                remove.push(id);
                self.stats.expired_groups += 1;
                continue;
            }
            if !group.can_repair() {
                continue;
            }

            let complete = group.is_complete();
            match group.repair() {
                Ok(shards) => {
                    for shard in shards {
                        output.push(RecoveredShard {
                            payload: shard.payload,
                            seq_num: shard.seq_num,
                            is_keyframe: shard.is_keyframe,
                        });
                    }
                    if complete {
                        self.stats.complete_groups += 1;
                    } else {
                        self.stats.repaired_groups += 1;
                    }
                    remove.push(id);
                }
                Err(e) => {
                    self.stats.failed_repairs += 1;
                    tracing::warn!(group_id = id, error = %e, "FEC repair failed");
                }
            }
        }

        for id in remove {
            self.groups.remove(&id);
        }
        output
    }

    /// Drop every group past its deadline without attempting repair.
    pub fn cleanup_expired(&mut self, now_ms: i64) {
        let before = self.groups.len();
        self.groups.retain(|_, g| !g.is_expired(now_ms));
        self.stats.expired_groups += (before - self.groups.len()) as u64;
    }
}
