//! Backpressure and flow control for session delivery
//!
//! Every session owns a bounded outbound queue. When a slow client lets it
//! fill, the overflow policy decides which message is lost, and the first
//! overflow (lag onset) triggers a backpressure notice asking the client to
//! poll at a slower cadence.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::candles::Timeframe;

/// Which message is lost when a session's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Drop the incoming message.
    DropNewest,
}

/// Why a backpressure notice was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureReason {
    /// This client alone is not keeping up.
    ClientLag,
    /// Many clients are lagging at once.
    ServerLoad,
}

impl BackpressureReason {
    /// `server_load` once `lagging_sessions` reaches `threshold`.
    pub fn classify(lagging_sessions: usize, threshold: usize) -> Self {
        if lagging_sessions >= threshold {
            BackpressureReason::ServerLoad
        } else {
            BackpressureReason::ClientLag
        }
    }

    /// Suggested seconds between updates for a series of `timeframe`.
    pub fn suggested_cadence(&self, timeframe: Timeframe) -> u64 {
        let secs = timeframe.duration_secs().unsigned_abs();
        match self {
            BackpressureReason::ClientLag => secs * 2,
            BackpressureReason::ServerLoad => secs * 4,
        }
    }
}

/// Result of an enqueue on a bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// A message (old or new, per policy) was lost.
    pub dropped: bool,
    /// This enqueue moved the queue into the lagging state.
    pub lag_onset: bool,
}

/// Per-session outbound queue with bounded capacity.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    messages: VecDeque<T>,
    /// Control message sent before any queued message; outside capacity.
    priority: Option<T>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Total messages dropped for this session.
    messages_dropped: u64,
    /// Set on overflow, cleared once drained below half capacity.
    lagging: bool,
}

impl<T> OutboundQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            priority: None,
            capacity,
            policy,
            messages_dropped: 0,
            lagging: false,
        }
    }

    pub fn push(&mut self, message: T) -> Enqueued {
        if self.messages.len() < self.capacity {
            self.messages.push_back(message);
            return Enqueued {
                dropped: false,
                lag_onset: false,
            };
        }

        match self.policy {
            OverflowPolicy::DropOldest => {
                self.messages.pop_front();
                self.messages.push_back(message);
            }
            OverflowPolicy::DropNewest => drop(message),
        }
        self.messages_dropped += 1;

        let lag_onset = !self.lagging;
        self.lagging = true;
        Enqueued {
            dropped: true,
            lag_onset,
        }
    }

    /// Set the control message sent ahead of everything else. Overflow never
    /// evicts it; a newer control message replaces it.
    pub fn push_priority(&mut self, message: T) {
        self.priority = Some(message);
    }

    /// Next message to send. Returns whether the lagging state cleared.
    pub fn pop(&mut self) -> (Option<T>, bool) {
        if let Some(message) = self.priority.take() {
            return (Some(message), false);
        }
        let message = self.messages.pop_front();
        let recovered = self.lagging && self.messages.len() < self.capacity.div_ceil(2);
        if recovered {
            self.lagging = false;
        }
        (message, recovered)
    }

    /// Discard everything queued. Returns whether the queue was lagging.
    pub fn clear(&mut self) -> bool {
        self.messages.clear();
        self.priority = None;
        std::mem::take(&mut self.lagging)
    }

    pub fn len(&self) -> usize {
        self.messages.len() + usize::from(self.priority.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.priority.is_none()
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_basic() {
        let mut queue = OutboundQueue::new(10, OverflowPolicy::DropOldest);
        assert!(!queue.push(1).dropped);
        assert!(!queue.push(2).dropped);

        assert_eq!(queue.len(), 2);
        assert!(!queue.is_lagging());
        assert_eq!(queue.pop().0, Some(1));
    }

    #[test]
    fn test_overflow_drop_oldest() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(1);
        queue.push(2);

        let outcome = queue.push(3);
        assert_eq!(
            outcome,
            Enqueued {
                dropped: true,
                lag_onset: true
            }
        );
        assert_eq!(queue.messages_dropped(), 1);
        assert_eq!(queue.pop().0, Some(2));
        assert_eq!(queue.pop().0, Some(3));
    }

    #[test]
    fn test_overflow_drop_newest() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropNewest);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop().0, Some(1));
        assert_eq!(queue.pop().0, Some(2));
        assert_eq!(queue.pop().0, None);
    }

    #[test]
    fn test_lag_onset_reported_once() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(1);
        queue.push(2);
        assert!(queue.push(3).lag_onset);
        assert!(!queue.push(4).lag_onset);
        assert!(queue.is_lagging());

        // Draining below half capacity clears the state
        assert!(!queue.pop().1);
        assert!(queue.pop().1);
        assert!(!queue.is_lagging());

        queue.push(5);
        queue.push(6);
        assert!(queue.push(7).lag_onset);
    }

    #[test]
    fn test_priority_survives_overflow() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        queue.push_priority(0);
        queue.push(4);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().0, Some(0));
        assert_eq!(queue.pop().0, Some(3));
        assert_eq!(queue.pop().0, Some(4));
    }

    #[test]
    fn test_clear_reports_lag() {
        let mut queue = OutboundQueue::new(1, OverflowPolicy::DropNewest);
        queue.push(1);
        queue.push(2);
        assert!(queue.clear());
        assert!(queue.is_empty());
        assert!(!queue.clear());
    }

    #[test]
    fn test_reason_and_cadence() {
        assert_eq!(BackpressureReason::classify(1, 5), BackpressureReason::ClientLag);
        assert_eq!(BackpressureReason::classify(5, 5), BackpressureReason::ServerLoad);

        assert_eq!(BackpressureReason::ClientLag.suggested_cadence(Timeframe::M5), 600);
        assert_eq!(BackpressureReason::ServerLoad.suggested_cadence(Timeframe::M1), 240);
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&BackpressureReason::ServerLoad).unwrap();
        assert_eq!(json, "\"server_load\"");
    }
}
