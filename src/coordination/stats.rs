use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use serde::Serialize;

use super::{
    internal_event::{
        ChatProcessingTime, ChatProcessingTimeHandle, ChatSlotsInUse, ChatSlotsInUseHandle,
        InternalEventHandle, RegisterInternalEvent, SlotUsage,
    },
    request::RequestStatus,
};

/// Aggregate view returned by `ChatCoordinator::status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub processing_count: usize,
    pub queue_length: usize,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
    pub timed_out_requests: u64,
    pub rejected_requests: u64,
    pub retried_requests: u64,
    /// Mean time from first dispatch to the terminal state, in milliseconds, over
    /// requests that ran.
    pub average_processing_time: f64,
    pub concurrent_peak: usize,
    pub fallback_activations: u64,
    pub fallback_active: bool,
}

/// Lock-free counters, updated by the coordinator and never read back by it.
pub struct StatsCollector {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
    processed: AtomicU64,
    processing_micros: AtomicU64,
    peak: AtomicUsize,
    slots: ChatSlotsInUseHandle,
    processing_time: ChatProcessingTimeHandle,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            processing_micros: AtomicU64::new(0),
            peak: AtomicUsize::new(0),
            slots: ChatSlotsInUse.register(),
            processing_time: ChatProcessingTime.register(),
        }
    }

    pub fn record_accepted(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Called after every change of the running or queued counts.
    pub fn record_slots(&self, running: usize, queued: usize) {
        self.peak.fetch_max(running, Ordering::Relaxed);
        self.slots.emit(SlotUsage { running, queued });
    }

    pub fn record_finished(&self, status: RequestStatus, processing_time: Option<Duration>) {
        let counter = match status {
            RequestStatus::Completed => &self.completed,
            RequestStatus::Failed => &self.failed,
            RequestStatus::Cancelled => &self.cancelled,
            RequestStatus::TimedOut => &self.timed_out,
            RequestStatus::Queued | RequestStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if let Some(elapsed) = processing_time {
            self.processed.fetch_add(1, Ordering::Relaxed);
            self.processing_micros
                .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
            self.processing_time.emit(elapsed);
        }
    }

    /// Counter values combined with the live figures owned by other components.
    pub fn snapshot(
        &self,
        processing_count: usize,
        queue_length: usize,
        fallback_activations: u64,
        fallback_active: bool,
    ) -> Stats {
        let processed = self.processed.load(Ordering::Relaxed);
        let average_processing_time = if processed == 0 {
            0.0
        } else {
            self.processing_micros.load(Ordering::Relaxed) as f64 / processed as f64 / 1000.0
        };
        Stats {
            processing_count,
            queue_length,
            total_requests: self.total.load(Ordering::Relaxed),
            completed_requests: self.completed.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled.load(Ordering::Relaxed),
            timed_out_requests: self.timed_out.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            retried_requests: self.retried.load(Ordering::Relaxed),
            average_processing_time,
            concurrent_peak: self.peak.load(Ordering::Relaxed),
            fallback_activations,
            fallback_active,
        }
    }
}
