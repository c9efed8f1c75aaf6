use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

// Slice the wait so a shutdown request is noticed promptly
const WAIT_SLICE: Duration = Duration::from_millis(150);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WaitOutcome {
    Success,
    Failure,
    TimedOut,
}

struct BridgeState {
    // Ack id the driver thread is blocked on; zero when nobody waits
    wait_id: u32,
    result: Option<bool>,
}

/// Lets the driver thread block until the state machine reaches a terminal
/// state for a specific outbound message. One event, one waited id, one
/// result slot; only a single waiter is supported by contract (the driver
/// serialises its synchronous calls).
pub struct AckBridge {
    state: Mutex<BridgeState>,
    done: Condvar,
}

impl AckBridge {
    pub fn new() -> AckBridge {
        AckBridge {
            state: Mutex::new(BridgeState {
                wait_id: 0,
                result: None,
            }),
            done: Condvar::new(),
        }
    }

    /// Blocks until the engine reports a terminal state for `ack_id`, the
    /// timeout elapses, or shutdown is requested.
    pub fn wait(&self, ack_id: u32, timeout: Duration, shutdown: &AtomicBool) -> WaitOutcome {
        let deadline = Instant::now() + timeout;

        {
            let mut state = self.state.lock().expect("Ack bridge poisoned");
            state.wait_id = ack_id;
            state.result = None;
        }

        let outcome = loop {
            let state = self.state.lock().expect("Ack bridge poisoned");
            if let Some(success) = state.result {
                break if success {
                    WaitOutcome::Success
                } else {
                    WaitOutcome::Failure
                };
            }

            let now = Instant::now();
            if now >= deadline || shutdown.load(Ordering::Relaxed) {
                break WaitOutcome::TimedOut;
            }

            let slice = WAIT_SLICE.min(deadline - now);
            drop(
                self.done
                    .wait_timeout(state, slice)
                    .expect("Ack bridge poisoned"),
            );
        };

        // Make sure the engine knows nobody is waiting any more
        let mut state = self.state.lock().expect("Ack bridge poisoned");
        state.wait_id = 0;
        state.result = None;

        outcome
    }

    /// Called by the I/O thread at each terminal transition. A result for
    /// an id nobody waits on is dropped.
    pub fn complete(&self, ack_id: u32, success: bool) {
        let mut state = self.state.lock().expect("Ack bridge poisoned");
        if state.wait_id == ack_id && state.wait_id != 0 {
            state.result = Some(success);
            self.done.notify_one();
        }
    }

    /// Wakes any waiter with a failure. Used when the I/O loop resets after
    /// an internal error so the driver thread cannot deadlock.
    pub fn release_failure(&self) {
        let mut state = self.state.lock().expect("Ack bridge poisoned");
        if state.wait_id != 0 {
            state.result = Some(false);
            self.done.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_success_wakes_waiter() {
        let bridge = Arc::new(AckBridge::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let engine = bridge.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            engine.complete(7, true);
        });

        let outcome = bridge.wait(7, Duration::from_secs(2), &shutdown);
        assert_eq!(outcome, WaitOutcome::Success);
        handle.join().unwrap();
    }

    #[test]
    fn test_failure_wakes_waiter() {
        let bridge = Arc::new(AckBridge::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let engine = bridge.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            engine.complete(9, false);
        });

        assert_eq!(
            bridge.wait(9, Duration::from_secs(2), &shutdown),
            WaitOutcome::Failure
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_timeout() {
        let bridge = AckBridge::new();
        let shutdown = AtomicBool::new(false);

        let start = Instant::now();
        let outcome = bridge.wait(3, Duration::from_millis(50), &shutdown);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_result_for_other_id_is_dropped() {
        let bridge = Arc::new(AckBridge::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let engine = bridge.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            engine.complete(99, true);
        });

        assert_eq!(
            bridge.wait(3, Duration::from_millis(100), &shutdown),
            WaitOutcome::TimedOut
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_shutdown_unblocks() {
        let bridge = Arc::new(AckBridge::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            flag.store(true, Ordering::Relaxed);
        });

        let start = Instant::now();
        let outcome = bridge.wait(5, Duration::from_secs(30), &shutdown);
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_release_failure() {
        let bridge = Arc::new(AckBridge::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let engine = bridge.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            engine.release_failure();
        });

        assert_eq!(
            bridge.wait(11, Duration::from_secs(2), &shutdown),
            WaitOutcome::Failure
        );
        handle.join().unwrap();
    }
}
