use std::time::Duration;

use metrics::{Gauge, Histogram, counter, gauge, histogram};

use super::InternalEvent;
use crate::coordination::request::{RequestId, RequestStatus, SessionId, UserId};

#[derive(Debug)]
pub struct ChatRequestAccepted<'a> {
    pub request_id: &'a RequestId,
    pub user_id: &'a UserId,
    /// `running`, `queued` or `sequential`.
    pub placement: &'static str,
}

impl InternalEvent for ChatRequestAccepted<'_> {
    fn emit(self) {
        debug!(
            target: "chat_coordinator::admission",
            request_id = %self.request_id,
            user = %self.user_id,
            placement = self.placement,
            "Chat request accepted"
        );
        counter!("chat_requests_accepted_total", "placement" => self.placement).increment(1);
    }
}

#[derive(Debug)]
pub struct ChatRequestRejected<'a> {
    pub user_id: &'a UserId,
    pub reason: &'static str,
}

impl InternalEvent for ChatRequestRejected<'_> {
    fn emit(self) {
        info!(
            target: "chat_coordinator::admission",
            user = %self.user_id,
            reason = self.reason,
            "Chat request rejected"
        );
        counter!("chat_requests_rejected_total", "reason" => self.reason).increment(1);
    }
}

#[derive(Debug)]
pub struct ChatRequestFinished<'a> {
    pub request_id: &'a RequestId,
    pub status: RequestStatus,
    pub retries: usize,
    pub detail: Option<&'a str>,
}

impl InternalEvent for ChatRequestFinished<'_> {
    fn emit(self) {
        match self.status {
            RequestStatus::Failed => warn!(
                target: "chat_coordinator::worker",
                request_id = %self.request_id,
                retries = self.retries,
                error = self.detail.unwrap_or_default(),
                "Chat request failed"
            ),
            RequestStatus::TimedOut => warn!(
                target: "chat_coordinator::worker",
                request_id = %self.request_id,
                "Chat request timed out"
            ),
            _ => debug!(
                target: "chat_coordinator::worker",
                request_id = %self.request_id,
                status = %self.status,
                "Chat request finished"
            ),
        }
        counter!("chat_requests_finished_total", "status" => self.status.to_string()).increment(1);
    }
}

#[derive(Debug)]
pub struct ChatRequestRetried<'a> {
    pub request_id: &'a RequestId,
    pub retry: usize,
    pub delay: Duration,
}

impl InternalEvent for ChatRequestRetried<'_> {
    fn emit(self) {
        info!(
            target: "chat_coordinator::worker",
            request_id = %self.request_id,
            retry = self.retry,
            delay_ms = self.delay.as_millis() as u64,
            "Backing off before retry"
        );
        counter!("chat_request_retries_total").increment(1);
    }
}

#[derive(Debug)]
pub struct FallbackActivated {
    pub consecutive_failures: u32,
    pub cooldown: Duration,
}

impl InternalEvent for FallbackActivated {
    fn emit(self) {
        warn!(
            target: "chat_coordinator::fallback",
            consecutive_failures = self.consecutive_failures,
            cooldown_secs = self.cooldown.as_secs(),
            "Circuit opened, routing new requests through the sequential lane"
        );
        counter!("chat_fallback_activations_total").increment(1);
    }
}

#[derive(Debug)]
pub struct StaleSessionWrite<'a> {
    pub session_id: &'a SessionId,
    pub request_id: &'a RequestId,
    pub generation: u64,
    pub current: u64,
}

impl InternalEvent for StaleSessionWrite<'_> {
    fn emit(self) {
        trace!(
            target: "chat_coordinator::session",
            session_id = %self.session_id,
            request_id = %self.request_id,
            generation = self.generation,
            current = self.current,
            "Discarded stale session write"
        );
        counter!("chat_session_stale_writes_total").increment(1);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SlotUsage {
    pub running: usize,
    pub queued: usize,
}

registered_event! {
    ChatSlotsInUse => {
        running: Gauge = gauge!("chat_requests_running"),
        queued: Gauge = gauge!("chat_requests_queued"),
    }

    fn emit(&self, usage: SlotUsage) {
        self.running.set(usage.running as f64);
        self.queued.set(usage.queued as f64);
        trace!(
            target: "chat_coordinator::stats",
            running = usage.running,
            queued = usage.queued,
            "Slot usage updated"
        );
    }
}

registered_event! {
    ChatProcessingTime => {
        processing: Histogram = histogram!("chat_request_processing_seconds"),
    }

    fn emit(&self, elapsed: Duration) {
        self.processing.record(elapsed);
    }
}
