//! Background merge worker.
//!
//! Wakes every `merge_interval` and checks whether level 0 has reached
//! `num_level_zero_tables`. If so, it reports the L0 key range and the
//! overlapping L1 tables as a compaction candidate. Tables are not
//! rewritten here; the candidate is the hook a merge policy plugs into.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::closer::Closer;
use crate::levels::LevelManager;
use crate::Engine;

pub(crate) fn spawn_merge_worker(
    levels: Arc<LevelManager>,
    closer: Arc<Closer>,
    interval: Duration,
) -> Result<JoinHandle<()>> {
    closer.add_running(1);
    let worker_closer = Arc::clone(&closer);
    let spawned = thread::Builder::new()
        .name("lsm-merge".into())
        .spawn(move || {
            tracing::debug!(interval_ms = interval.as_millis() as u64, "merge worker started");
            let mut last_reported: Option<Vec<u64>> = None;
            while !worker_closer.wait_timeout(interval) {
                let Some(candidate) = levels.compaction_candidate() else {
                    last_reported = None;
                    continue;
                };
                if last_reported.as_ref() == Some(&candidate.top) {
                    continue;
                }
                tracing::info!(
                    l0_tables = candidate.top.len(),
                    l1_overlapping = candidate.bottom.len(),
                    "compaction candidate: {:?} + {:?}",
                    candidate.top,
                    candidate.bottom
                );
                last_reported = Some(candidate.top);
            }
            tracing::debug!("merge worker stopped");
            worker_closer.done();
        });

    match spawned {
        Ok(handle) => Ok(handle),
        Err(e) => {
            closer.done();
            Err(e).context("failed to spawn merge worker")
        }
    }
}

impl Engine {
    /// The compaction the merge worker would report right now, if any.
    #[must_use]
    pub fn compaction_candidate(&self) -> Option<crate::CompactionCandidate> {
        self.levels.compaction_candidate()
    }
}
