//! Local edit pipeline: debounced diff extraction against the last
//! synchronized snapshot.
//!
//! Time is injected as [`Instant`] so the pipeline can be driven from a
//! tokio interval in production and from fixed instants in tests.

use log::debug;
use std::time::{Duration, Instant};

use crate::diff::extract;
use crate::operation::Edit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Quiet period that ends a burst.
    pub debounce: Duration,
    /// Upper bound on how long a continuous burst may be held back.
    pub max_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            max_wait: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Burst {
    started: Instant,
    last: Instant,
}

/// Edits extracted from one burst, ready to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    /// Revision the edits were computed against.
    pub base_revision: u64,
    pub edits: Vec<Edit>,
}

#[derive(Debug)]
pub struct LocalEditPipeline {
    config: PipelineConfig,
    snapshot: String,
    revision: u64,
    burst: Option<Burst>,
}

impl LocalEditPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            snapshot: String::new(),
            revision: 0,
            burst: None,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Last synchronized snapshot.
    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn has_pending(&self) -> bool {
        self.burst.is_some()
    }

    /// Note a content-changing input event at `now`.
    pub fn record(&mut self, now: Instant) {
        match &mut self.burst {
            Some(burst) => burst.last = now,
            None => {
                self.burst = Some(Burst {
                    started: now,
                    last: now,
                })
            }
        }
    }

    /// Whether the pending burst should be flushed at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.burst.is_some_and(|burst| {
            now.saturating_duration_since(burst.last) >= self.config.debounce
                || now.saturating_duration_since(burst.started) >= self.config.max_wait
        })
    }

    /// Diff `current` against the snapshot if the burst is due (or `force`).
    ///
    /// On a non-empty diff the snapshot becomes `current` and the revision
    /// advances optimistically by the number of edits.
    pub fn flush(&mut self, current: &str, now: Instant, force: bool) -> Option<PendingBatch> {
        if self.burst.is_none() || !(force || self.is_due(now)) {
            return None;
        }
        self.burst = None;

        let edits = extract(&self.snapshot, current);
        if edits.is_empty() {
            return None;
        }
        let base_revision = self.revision;
        self.snapshot = current.to_string();
        self.revision += edits.len() as u64;
        debug!(
            "flushed {} local edit(s), revision {} -> {}",
            edits.len(),
            base_revision,
            self.revision
        );
        Some(PendingBatch {
            base_revision,
            edits,
        })
    }

    /// Accept content that arrived from the authority.
    pub fn sync(&mut self, snapshot: impl Into<String>, revision: u64) {
        self.snapshot = snapshot.into();
        self.revision = revision;
    }

    /// Forget any pending burst and adopt a fresh state (after `init`).
    pub fn reset(&mut self, snapshot: impl Into<String>, revision: u64) {
        self.burst = None;
        self.sync(snapshot, revision);
    }
}
