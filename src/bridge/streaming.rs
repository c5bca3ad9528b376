//! Partial tool-input streaming: dedupe, throttle and reveal gating.
//!
//! Shared by both wire encodings. Nothing here performs I/O; the widget
//! runtime feeds in values and timestamps and acts on the decisions.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::{signature::Stable, LifecycleState};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ThrottleDecision {
    /// Send this value now; it has been recorded as sent.
    SendNow(Value),
    /// Held until the trailing deadline.
    Deferred(Instant),
    /// Structurally identical to the last value sent.
    Unchanged,
}

/// Minimum-interval throttle with a trailing send.
#[derive(Debug)]
pub(crate) struct PartialInputThrottle {
    min_interval: Duration,
    pending: Option<Stable>,
    last_sent_signature: Option<String>,
    last_sent_at: Option<Instant>,
}

impl PartialInputThrottle {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            pending: None,
            last_sent_signature: None,
            last_sent_at: None,
        }
    }

    pub(crate) fn offer(&mut self, value: Value, now: Instant) -> ThrottleDecision {
        let candidate = Stable::new(value);
        if self.last_sent_signature.as_deref() == Some(candidate.signature()) {
            self.pending = None;
            return ThrottleDecision::Unchanged;
        }

        if let Some(due) = self.next_allowed_at() {
            if now < due {
                self.pending = Some(candidate);
                return ThrottleDecision::Deferred(due);
            }
        }

        self.pending = None;
        self.record_sent(&candidate, now);
        ThrottleDecision::SendNow(candidate.value().clone())
    }

    /// The trailing deadline, when a value is waiting.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(self.next_allowed_at().unwrap_or_else(Instant::now))
    }

    /// Releases the pending value once its deadline has passed.
    pub(crate) fn take_due(&mut self, now: Instant) -> Option<Value> {
        let due = self.deadline()?;
        if now < due {
            return None;
        }
        let pending = self.pending.take()?;
        self.record_sent(&pending, now);
        Some(pending.value().clone())
    }

    pub(crate) fn discard_pending(&mut self) {
        self.pending = None;
    }

    pub(crate) fn reset(&mut self) {
        self.pending = None;
        self.last_sent_signature = None;
        self.last_sent_at = None;
    }

    fn next_allowed_at(&self) -> Option<Instant> {
        self.last_sent_at.map(|at| at + self.min_interval)
    }

    fn record_sent(&mut self, value: &Stable, now: Instant) {
        self.last_sent_signature = Some(value.signature().to_string());
        self.last_sent_at = Some(now);
    }
}

/// Tracks lifecycle transitions so partial sends only happen while
/// streaming, and resume cleanly when streaming restarts for the same call.
#[derive(Debug)]
pub(crate) struct InputStreamController {
    throttle: PartialInputThrottle,
    state: Option<LifecycleState>,
}

impl InputStreamController {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            throttle: PartialInputThrottle::new(min_interval),
            state: None,
        }
    }

    /// Returns `true` when streaming restarted after a later state.
    pub(crate) fn observe(&mut self, state: LifecycleState) -> bool {
        let restarted = state == LifecycleState::InputStreaming
            && self
                .state
                .is_some_and(|previous| previous != LifecycleState::InputStreaming);
        if restarted {
            self.throttle.reset();
        }
        if state != LifecycleState::InputStreaming {
            self.throttle.discard_pending();
        }
        self.state = Some(state);
        restarted
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.state == Some(LifecycleState::InputStreaming)
    }

    pub(crate) fn offer(&mut self, partial: Value, now: Instant) -> ThrottleDecision {
        if !self.is_streaming() {
            return ThrottleDecision::Unchanged;
        }
        self.throttle.offer(partial, now)
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        if !self.is_streaming() {
            return None;
        }
        self.throttle.deadline()
    }

    pub(crate) fn take_due(&mut self, now: Instant) -> Option<Value> {
        if !self.is_streaming() {
            return None;
        }
        self.throttle.take_due(now)
    }

    pub(crate) fn reset(&mut self) {
        self.throttle.reset();
    }
}

/// Keeps a widget hidden until the guest reports a size or a fallback elapses.
#[derive(Debug)]
pub(crate) struct RevealGate {
    fallback: Duration,
    deadline: Option<Instant>,
    revealed: bool,
}

impl RevealGate {
    pub(crate) fn new(fallback: Duration) -> Self {
        Self {
            fallback,
            deadline: None,
            revealed: false,
        }
    }

    pub(crate) fn arm(&mut self, now: Instant) {
        if !self.revealed && self.deadline.is_none() {
            self.deadline = Some(now + self.fallback);
        }
    }

    pub(crate) fn is_revealed(&self) -> bool {
        self.revealed
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        if self.revealed {
            None
        } else {
            self.deadline
        }
    }

    /// Returns `true` when this call revealed the widget.
    pub(crate) fn on_size_changed(&mut self) -> bool {
        self.reveal()
    }

    /// Returns `true` when the fallback fired and revealed the widget.
    pub(crate) fn on_tick(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => self.reveal(),
            _ => false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.deadline = None;
        self.revealed = false;
    }

    fn reveal(&mut self) -> bool {
        if self.revealed {
            return false;
        }
        self.revealed = true;
        self.deadline = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const INTERVAL: Duration = Duration::from_millis(50);

    #[test]
    fn first_partial_is_sent_immediately() {
        let mut throttle = PartialInputThrottle::new(INTERVAL);
        let now = Instant::now();
        assert_eq!(
            throttle.offer(json!({ "a": 1 }), now),
            ThrottleDecision::SendNow(json!({ "a": 1 }))
        );
        assert_eq!(throttle.deadline(), None);
    }

    #[test]
    fn early_update_is_deferred_and_sent_once() {
        let mut throttle = PartialInputThrottle::new(INTERVAL);
        let start = Instant::now();
        throttle.offer(json!({ "a": 1 }), start);

        let early = start + Duration::from_millis(10);
        assert_eq!(
            throttle.offer(json!({ "a": 1, "b": 2 }), early),
            ThrottleDecision::Deferred(start + INTERVAL)
        );
        assert_eq!(throttle.take_due(early), None);
        assert_eq!(
            throttle.take_due(start + INTERVAL),
            Some(json!({ "a": 1, "b": 2 }))
        );
        assert_eq!(throttle.take_due(start + INTERVAL * 3), None);
    }

    #[test]
    fn latest_pending_value_wins() {
        let mut throttle = PartialInputThrottle::new(INTERVAL);
        let start = Instant::now();
        throttle.offer(json!({ "a": 1 }), start);
        throttle.offer(json!({ "a": 1, "b": 2 }), start + Duration::from_millis(5));
        throttle.offer(json!({ "a": 1, "b": 2, "c": 3 }), start + Duration::from_millis(20));
        assert_eq!(
            throttle.take_due(start + INTERVAL),
            Some(json!({ "a": 1, "b": 2, "c": 3 }))
        );
    }

    #[test]
    fn unchanged_values_are_never_resent() {
        let mut throttle = PartialInputThrottle::new(INTERVAL);
        let start = Instant::now();
        throttle.offer(json!({ "a": 1, "b": 2 }), start);
        let reordered = serde_json::from_str::<Value>(r#"{"b":2,"a":1}"#).expect("parse");
        assert_eq!(
            throttle.offer(reordered, start + INTERVAL * 2),
            ThrottleDecision::Unchanged
        );
    }

    #[test]
    fn reverting_to_last_sent_value_drops_pending() {
        let mut throttle = PartialInputThrottle::new(INTERVAL);
        let start = Instant::now();
        throttle.offer(json!({ "a": 1 }), start);
        throttle.offer(json!({ "a": 2 }), start + Duration::from_millis(5));
        throttle.offer(json!({ "a": 1 }), start + Duration::from_millis(6));
        assert_eq!(throttle.deadline(), None);
        assert_eq!(throttle.take_due(start + INTERVAL), None);
    }

    #[test]
    fn sends_are_spaced_by_the_minimum_interval() {
        let mut throttle = PartialInputThrottle::new(INTERVAL);
        let start = Instant::now();
        let mut sent_at = Vec::new();
        for step in 0..40u64 {
            let now = start + Duration::from_millis(step * 7);
            if let Some(value) = throttle.take_due(now) {
                assert!(value.is_object());
                sent_at.push(now);
            }
            if let ThrottleDecision::SendNow(_) = throttle.offer(json!({ "step": step }), now) {
                sent_at.push(now);
            }
        }
        assert!(sent_at.len() > 1);
        for pair in sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= INTERVAL);
        }
    }

    #[test]
    fn restarting_stream_resets_bookkeeping() {
        let mut stream = InputStreamController::new(INTERVAL);
        let start = Instant::now();
        assert!(!stream.observe(LifecycleState::InputStreaming));
        assert!(matches!(
            stream.offer(json!({ "a": 1 }), start),
            ThrottleDecision::SendNow(_)
        ));

        assert!(!stream.observe(LifecycleState::OutputAvailable));
        assert_eq!(
            stream.offer(json!({ "a": 2 }), start + INTERVAL),
            ThrottleDecision::Unchanged
        );

        assert!(stream.observe(LifecycleState::InputStreaming));
        assert_eq!(
            stream.offer(json!({ "a": 1 }), start + Duration::from_millis(1)),
            ThrottleDecision::SendNow(json!({ "a": 1 }))
        );
    }

    #[test]
    fn leaving_streaming_discards_pending_partial() {
        let mut stream = InputStreamController::new(INTERVAL);
        let start = Instant::now();
        stream.observe(LifecycleState::InputStreaming);
        stream.offer(json!({ "a": 1 }), start);
        stream.offer(json!({ "a": 2 }), start + Duration::from_millis(1));
        assert!(stream.deadline().is_some());

        stream.observe(LifecycleState::InputAvailable);
        assert_eq!(stream.deadline(), None);
        assert_eq!(stream.take_due(start + INTERVAL), None);
    }

    #[test]
    fn reveal_on_size_change_or_timeout_whichever_first() {
        let start = Instant::now();
        let mut gate = RevealGate::new(Duration::from_millis(500));
        gate.arm(start);
        assert!(!gate.on_tick(start + Duration::from_millis(100)));
        assert!(gate.on_size_changed());
        assert!(gate.is_revealed());
        assert!(!gate.on_tick(start + Duration::from_secs(1)));
        assert_eq!(gate.deadline(), None);

        let mut slow = RevealGate::new(Duration::from_millis(500));
        slow.arm(start);
        assert_eq!(slow.deadline(), Some(start + Duration::from_millis(500)));
        assert!(slow.on_tick(start + Duration::from_millis(500)));
        assert!(!slow.on_size_changed());
    }
}
