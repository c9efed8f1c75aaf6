use crate::message::{OutboundMessage, BAND_COUNT};
use crate::shared::{ErrorType, LinkError, LinkResult};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::frame::InboundFrame;
use zcore::logging::{error, Trace};

struct Bands {
    bands: [VecDeque<OutboundMessage>; BAND_COUNT],
    len: usize,
}

/// The outbound queue: FIFO within a band, strictly higher bands drain
/// first. Thread safe with a bounded-wait dequeue for the I/O thread.
pub struct OutboundQueue {
    inner: Mutex<Bands>,
    avail: Condvar,
    bound: usize,
    trace: Trace,
}

impl OutboundQueue {
    pub fn new(bound: usize, trace: Trace) -> OutboundQueue {
        OutboundQueue {
            inner: Mutex::new(Bands {
                bands: Default::default(),
                len: 0,
            }),
            avail: Condvar::new(),
            bound,
            trace,
        }
    }

    /// Queues a message at its priority band. A full queue means the system
    /// is in an unrecoverable backlog, so the whole queue is dropped with a
    /// diagnostic rather than blocking the caller.
    pub fn enqueue(&self, msg: OutboundMessage) {
        let mut inner = self.inner.lock().expect("Outbound queue poisoned");

        if inner.len >= self.bound {
            error!(self.trace.log(),
                   "the output msg queue has become full, flushing it, msgs have been lost";
                   "dropped" => inner.len);
            for band in inner.bands.iter_mut() {
                band.clear();
            }
            inner.len = 0;
        }

        let band = msg.priority().band();
        inner.bands[band].push_back(msg);
        inner.len += 1;
        self.avail.notify_one();
    }

    /// Removes the highest band FIFO head, waiting up to `timeout` for one
    /// to arrive.
    pub fn dequeue(&self, timeout: Duration) -> Option<OutboundMessage> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("Outbound queue poisoned");

        loop {
            if inner.len > 0 {
                let band = (0..BAND_COUNT)
                    .rev()
                    .find(|&band| !inner.bands[band].is_empty())
                    .expect("Queue length out of sync with its bands");
                inner.len -= 1;
                return inner.bands[band].pop_front();
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .avail
                .wait_timeout(inner, deadline - now)
                .expect("Outbound queue poisoned");
            inner = guard;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Outbound queue poisoned").len
    }

    /// Percentage of the bound in use, for driver side monitoring.
    pub fn used_pct(&self) -> usize {
        (self.len() * 100 / self.bound).min(100)
    }

    pub fn clear(&self) -> Vec<OutboundMessage> {
        let mut inner = self.inner.lock().expect("Outbound queue poisoned");
        let mut drained = Vec::with_capacity(inner.len);
        for band in inner.bands.iter_mut().rev() {
            drained.extend(band.drain(..));
        }
        inner.len = 0;
        drained
    }
}

/// The inbound queue toward the upper layer. Bounded; overflow is an
/// internal invariant violation the I/O loop deals with, not something to
/// block the wire on.
pub struct InboundQueue {
    inner: Mutex<VecDeque<InboundFrame>>,
    avail: Condvar,
    bound: usize,
}

impl InboundQueue {
    pub fn new(bound: usize) -> InboundQueue {
        InboundQueue {
            inner: Mutex::new(VecDeque::new()),
            avail: Condvar::new(),
            bound,
        }
    }

    pub fn push(&self, frame: InboundFrame) -> LinkResult<()> {
        let mut inner = self.inner.lock().expect("Inbound queue poisoned");

        if inner.len() >= self.bound {
            return Err(LinkError::Fatal(ErrorType::QueueOverflow));
        }

        inner.push_back(frame);
        self.avail.notify_one();
        Ok(())
    }

    /// Bounded-wait dequeue for the consuming thread.
    pub fn pop(&self, timeout: Duration) -> Option<InboundFrame> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("Inbound queue poisoned");

        loop {
            if let Some(frame) = inner.pop_front() {
                return Some(frame);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .avail
                .wait_timeout(inner, deadline - now)
                .expect("Inbound queue poisoned");
            inner = guard;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Inbound queue poisoned").len()
    }

    pub fn clear(&self) -> Vec<InboundFrame> {
        self.inner
            .lock()
            .expect("Inbound queue poisoned")
            .drain(..)
            .collect()
    }
}
