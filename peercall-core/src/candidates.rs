//! FIFO buffer for candidates that arrive before the remote description

use crate::types::IceCandidate;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// A candidate waiting for the remote description to be applied.
#[derive(Debug, Clone)]
pub struct PendingCandidate {
    /// The queued candidate.
    pub candidate: IceCandidate,
    /// When it arrived.
    pub received_at: DateTime<Utc>,
}

/// Holds candidates received before the remote session description exists.
///
/// Owned by the active session and only touched under its lock; the session
/// drains it exactly once the remote description is applied and clears it on
/// terminal cleanup.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<PendingCandidate>,
}

impl CandidateBuffer {
    /// Empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate, stamping its arrival time.
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(PendingCandidate {
            candidate,
            received_at: Utc::now(),
        });
    }

    /// Take every queued candidate in receipt order, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<PendingCandidate> {
        self.queue.drain(..).collect()
    }

    /// Drop everything without applying.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Number of queued candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 UDP 2122252543 192.0.2.{n} 54400 typ host"))
    }

    #[test]
    fn drains_in_receipt_order() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.push(candidate(2));
        buffer.push(candidate(3));
        assert_eq!(buffer.len(), 3);

        let drained = buffer.drain();
        let lines: Vec<_> = drained.iter().map(|p| p.candidate.candidate.clone()).collect();
        assert!(lines[0].starts_with("candidate:1"));
        assert!(lines[1].starts_with("candidate:2"));
        assert!(lines[2].starts_with("candidate:3"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_of_empty_buffer_yields_nothing() {
        let mut buffer = CandidateBuffer::new();
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn pushes_after_a_drain_queue_again() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.drain();
        buffer.push(candidate(2));

        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].candidate.candidate.starts_with("candidate:2"));
    }

    #[test]
    fn clear_discards_without_yielding() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.push(candidate(2));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn arrival_times_are_monotone_in_queue_order() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.push(candidate(2));
        let drained = buffer.drain();
        assert!(drained[0].received_at <= drained[1].received_at);
    }
}
