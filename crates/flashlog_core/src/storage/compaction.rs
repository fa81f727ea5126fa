//! Quota-driven compaction.
//!
//! Compaction rewrites a session's file so that it holds only unread bytes
//! plus the minimum free band. Delivered chunks are not copied.
//!
//! ## Invariants
//!
//! - Compaction **MUST NOT** change the unread bytes of any session
//! - Candidates with the most reclaimable space go first; ties go to the
//!   oldest session
//! - A compaction that fails on flash discards only that session's log

use crate::error::CoreResult;
use crate::storage::engine::StorageEngine;
use crate::storage::log::SessionLog;
use crate::types::SessionId;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Result of a compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionResult {
    /// Files rewritten.
    pub files_rewritten: usize,
    /// Bytes returned to the quota.
    pub bytes_reclaimed: u64,
}

impl StorageEngine {
    /// Compacts every session file to its unread bytes plus the minimum
    /// free band.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated afterwards.
    pub fn compact_all(&self) -> CoreResult<CompactionResult> {
        let mut logs = self.logs.lock();
        let mut result = CompactionResult::default();
        let order = self.compaction_order(&logs, None);
        for id in order {
            if let Some(log) = logs.get_mut(&id) {
                result.bytes_reclaimed += self.compact_one(log);
                result.files_rewritten += 1;
            }
        }
        let quota_used = self.quota_used()?;
        info!(
            files = result.files_rewritten,
            reclaimed = result.bytes_reclaimed,
            quota_used,
            "compaction complete"
        );
        Ok(result)
    }

    /// Compacts sessions other than `id` until a file of `required` bytes
    /// for `id` fits in the quota.
    pub(crate) fn compact_others(
        &self,
        logs: &mut BTreeMap<SessionId, SessionLog>,
        id: SessionId,
        required: u64,
    ) -> CoreResult<()> {
        for other in self.compaction_order(logs, Some(id)) {
            if let Some(log) = logs.get_mut(&other) {
                self.compact_one(log);
            }
            if let Some(log) = logs.get(&id) {
                let others = self.quota_used()?.saturating_sub(log.file_size());
                if others + required <= self.config.quota_bytes {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Sessions with reclaimable space, largest slack first, then oldest.
    fn compaction_order(
        &self,
        logs: &BTreeMap<SessionId, SessionLog>,
        exclude: Option<SessionId>,
    ) -> Vec<SessionId> {
        let mut candidates: Vec<(u64, u32, SessionId)> = logs
            .iter()
            .filter(|(id, log)| Some(**id) != exclude && log.file.is_some())
            .filter_map(|(id, log)| {
                let slack = log.file_size().checked_sub(self.compacted_size(log))?;
                (slack > 0).then_some((slack, log.header.timestamp, *id))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, _, id)| id).collect()
    }

    fn compacted_size(&self, log: &SessionLog) -> u64 {
        log.live_footprint() + self.config.min_free_bytes
    }

    /// Rewrites one log at its compacted size. Returns the bytes reclaimed.
    fn compact_one(&self, log: &mut SessionLog) -> u64 {
        let before = log.file_size();
        let target = self.compacted_size(log);
        if target >= before {
            return 0;
        }
        match self.rewrite(log, target) {
            Ok(()) => {
                self.stats.record_compaction();
                debug!(
                    session = %log.header.session_id,
                    from = before,
                    to = target,
                    "compacted session file"
                );
                before - target
            }
            Err(err) => {
                self.contain_fault(log, &err);
                before
            }
        }
    }
}
