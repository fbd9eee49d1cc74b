use std::collections::VecDeque;

use crate::channel::proto::Frame;

/// Result of one flush cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlushOutcome {
    /// Frames handed to the transport during this cycle.
    pub sent: usize,
    /// Frames still waiting, including the one that failed.
    pub remaining: usize,
}

impl FlushOutcome {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// FIFO of frames waiting for a live connection.
///
/// Frames leave strictly in submission order. A failed hand-off puts the frame
/// back at the head so a later flush retries it before anything newer.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<Frame>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Appends a frame submitted while the channel is not live.
    pub fn push_back(&mut self, frame: Frame) {
        self.pending.push_back(frame);
    }

    /// Re-queues a frame whose send failed, ahead of everything else.
    pub fn push_front(&mut self, frame: Frame) {
        self.pending.push_front(frame);
    }

    /// Drains the queue through `send` until it is empty or a send fails.
    pub fn flush<E, F>(&mut self, mut send: F) -> FlushOutcome
    where
        F: FnMut(&Frame) -> Result<(), E>,
    {
        let mut sent = 0;
        while let Some(next) = self.pending.pop_front() {
            if send(&next).is_err() {
                self.pending.push_front(next);
                break;
            }
            sent += 1;
        }
        FlushOutcome {
            sent,
            remaining: self.pending.len(),
        }
    }

    /// Iterates pending frames in send order.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.pending.iter()
    }
}
