//! Reorders entity frames by simulation time before they are applied.
//!
//! Frames arrive on an unreliable channel in any order. The buffer holds
//! them until the local simulation clock plus a fixed delay has passed their
//! timestamp, then releases them oldest first.

use flux_actions::PeerId;

use crate::error::FrameError;
use crate::serialization::frame_time;

struct Pending<T> {
    simulation_time: f64,
    item: T,
}

/// Time-ordered holding area for items stamped with a simulation time.
pub struct JitterBuffer<T> {
    pending: Vec<Pending<T>>,
}

impl<T> Default for JitterBuffer<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
        }
    }
}

impl<T> JitterBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, simulation_time: f64, item: T) {
        self.pending.push(Pending {
            simulation_time,
            item,
        });
    }

    /// Releases every item stamped at or before `local_time + delay`, in
    /// ascending time order. Items with equal times keep arrival order.
    pub fn drain(&mut self, local_time: f64, delay: f64) -> Vec<T> {
        let target = local_time + delay;
        self.pending
            .sort_by(|a, b| a.simulation_time.total_cmp(&b.simulation_time));
        let ready = self
            .pending
            .partition_point(|pending| pending.simulation_time <= target);
        let released: Vec<T> = self
            .pending
            .drain(..ready)
            .map(|pending| pending.item)
            .collect();
        if !self.pending.is_empty() {
            tracing::debug!(
                released = released.len(),
                backlog = self.pending.len(),
                target,
                "jitter buffer holding frames"
            );
        }
        released
    }

    /// Earliest pending simulation time.
    pub fn next_time(&self) -> Option<f64> {
        self.pending
            .iter()
            .map(|pending| pending.simulation_time)
            .min_by(f64::total_cmp)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ---------------------------------------------------------------------------
// IncomingFrames
// ---------------------------------------------------------------------------

/// A buffered entity frame and its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub from: PeerId,
    pub bytes: Vec<u8>,
}

/// Entity frames received from the transport, awaiting their turn.
pub struct IncomingFrames {
    local_peer: PeerId,
    buffer: JitterBuffer<ReceivedFrame>,
}

impl IncomingFrames {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            buffer: JitterBuffer::new(),
        }
    }

    /// Buffers a frame by its header time. Frames sent by the local peer and
    /// empty frames are dropped. Returns whether the frame was buffered.
    pub fn push_frame(&mut self, from: PeerId, bytes: Vec<u8>) -> Result<bool, FrameError> {
        if from == self.local_peer || bytes.is_empty() {
            return Ok(false);
        }
        let simulation_time = match frame_time(&bytes) {
            Ok(time) => time,
            Err(err) => {
                tracing::warn!(%from, len = bytes.len(), "dropping entity frame: {err}");
                return Err(err);
            }
        };
        self.buffer
            .push(simulation_time, ReceivedFrame { from, bytes });
        Ok(true)
    }

    pub fn drain(&mut self, local_time: f64, delay: f64) -> Vec<ReceivedFrame> {
        self.buffer.drain(local_time, delay)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_releases_due_items_in_time_order() {
        let mut buffer = JitterBuffer::new();
        buffer.push(30.0, "c");
        buffer.push(10.0, "a");
        buffer.push(20.0, "b");

        assert_eq!(buffer.drain(25.0, 0.0), vec!["a", "b"]);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.next_time(), Some(30.0));
        assert_eq!(buffer.drain(25.0, 5.0), vec!["c"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_delay_holds_recent_items() {
        let mut buffer = JitterBuffer::new();
        buffer.push(10.0, 1);
        buffer.push(12.0, 2);
        assert_eq!(buffer.drain(10.0, 1.0), vec![1]);
        assert!(buffer.drain(10.5, 1.0).is_empty());
        assert_eq!(buffer.drain(11.0, 1.0), vec![2]);
    }

    #[test]
    fn test_equal_times_keep_arrival_order() {
        let mut buffer = JitterBuffer::new();
        buffer.push(5.0, "first");
        buffer.push(1.0, "early");
        buffer.push(5.0, "second");
        assert_eq!(buffer.drain(5.0, 0.0), vec!["early", "first", "second"]);
    }

    #[test]
    fn test_late_arrival_released_next_drain() {
        let mut buffer = JitterBuffer::new();
        buffer.push(2.0, 2);
        assert_eq!(buffer.drain(3.0, 0.0), vec![2]);
        // Older than what was already released; still delivered, never dropped.
        buffer.push(1.0, 1);
        assert_eq!(buffer.drain(3.0, 0.0), vec![1]);
    }

    fn frame(time: f64) -> Vec<u8> {
        let mut bytes = time.to_be_bytes().to_vec();
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes
    }

    #[test]
    fn test_incoming_frames_drop_loopback() {
        let mut incoming = IncomingFrames::new(PeerId::new("p1"));
        assert!(!incoming.push_frame(PeerId::new("p1"), frame(1.0)).unwrap());
        assert!(!incoming.push_frame(PeerId::new("host"), Vec::new()).unwrap());
        assert!(incoming.push_frame(PeerId::new("host"), frame(1.0)).unwrap());
        assert_eq!(incoming.len(), 1);
    }

    #[test]
    fn test_incoming_frames_released_by_header_time() {
        let mut incoming = IncomingFrames::new(PeerId::new("p1"));
        incoming.push_frame(PeerId::new("host"), frame(3.0)).unwrap();
        incoming.push_frame(PeerId::new("p2"), frame(1.0)).unwrap();

        let released = incoming.drain(3.0, 0.0);
        let senders: Vec<_> = released.iter().map(|f| f.from.as_str()).collect();
        assert_eq!(senders, ["p2", "host"]);
        assert_eq!(released[1].bytes, frame(3.0));
    }

    #[test]
    fn test_incoming_frame_without_header_rejected() {
        let mut incoming = IncomingFrames::new(PeerId::new("p1"));
        assert!(matches!(
            incoming.push_frame(PeerId::new("host"), vec![0, 1, 2]),
            Err(FrameError::Truncated(_))
        ));
        assert!(incoming.is_empty());
    }
}
