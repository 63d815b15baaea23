//! Admitted requests waiting for a global execution slot.

use std::collections::VecDeque;

use super::request::{RequestId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEntry {
    /// Submission order, assigned once at admission and kept across retries.
    pub seq: u64,
    pub request_id: RequestId,
    pub user_id: UserId,
}

/// Queue ordered by submission sequence.
///
/// Dispatch takes the oldest entry whose user is eligible, so order is FIFO within
/// one user and no user's backlog can hold back another user that still has room.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: VecDeque<QueuedEntry>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts at the position given by `entry.seq`. New submissions always carry
    /// the highest sequence and land at the back; re-queued retries slot back in
    /// front of anything submitted after them.
    pub fn push(&mut self, entry: QueuedEntry) {
        let at = self.entries.partition_point(|queued| queued.seq < entry.seq);
        self.entries.insert(at, entry);
    }

    /// Removes and returns the oldest entry accepted by `eligible`.
    pub fn pop_eligible<F>(&mut self, mut eligible: F) -> Option<QueuedEntry>
    where
        F: FnMut(&UserId) -> bool,
    {
        let at = self.entries.iter().position(|entry| eligible(&entry.user_id))?;
        self.entries.remove(at)
    }

    pub fn remove(&mut self, request_id: &RequestId) -> Option<QueuedEntry> {
        let at = self
            .entries
            .iter()
            .position(|entry| &entry.request_id == request_id)?;
        self.entries.remove(at)
    }

    #[cfg(test)]
    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.entries.iter().any(|entry| &entry.request_id == request_id)
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &QueuedEntry> {
        self.entries.iter()
    }
}
