//! Client-side queue of submitted edit batches awaiting acknowledgement.
//!
//! A batch stays queued from the moment it is sent until the authority
//! acknowledges its `batch_id`. After a reconnect every outstanding batch
//! is re-sent with its original base revision; the authority's dedup
//! window makes that safe.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::operation::Edit;

/// Edits submitted to the authority as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditBatch {
    pub session_id: String,
    pub batch_id: Uuid,
    pub base_revision: u64,
    pub operations: Vec<Edit>,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub batch: EditBatch,
    /// Revision the authority should report if nothing else interleaved.
    pub expected_revision: u64,
    /// False once a resync replaced the mirror the batch was applied to.
    pub applied_locally: bool,
}

#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<InFlight>,
    max_size: usize,
}

impl Outbox {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a sent batch. Returns `false` if the outbox is full.
    pub fn push(&mut self, batch: EditBatch) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        let expected_revision = batch.base_revision + batch.operations.len() as u64;
        self.queue.push_back(InFlight {
            batch,
            expected_revision,
            applied_locally: true,
        });
        true
    }

    /// Remove the acknowledged batch, wherever it sits in the queue.
    pub fn ack(&mut self, batch_id: Uuid) -> Option<InFlight> {
        let index = self
            .queue
            .iter()
            .position(|entry| entry.batch.batch_id == batch_id)?;
        self.queue.remove(index)
    }

    /// Every outstanding batch, oldest first, marked as no longer reflected
    /// in the local mirror.
    pub fn resubmit(&mut self) -> Vec<EditBatch> {
        self.queue
            .iter_mut()
            .map(|entry| {
                entry.applied_locally = false;
                entry.batch.clone()
            })
            .collect()
    }

    /// Whether some unacknowledged batch is still reflected in the mirror.
    pub fn has_local_unacked(&self) -> bool {
        self.queue.iter().any(|entry| entry.applied_locally)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total operations queued.
    pub fn total_operations(&self) -> usize {
        self.queue.iter().map(|entry| entry.batch.operations.len()).sum()
    }
}
