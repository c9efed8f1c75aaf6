//! Structured build-and-send helpers for the command classes the engine
//! must speak itself. Builders are stateless; delivery policy (bands,
//! synchronous waits) is layered on top of the engine handle.

use crate::bridge::WaitOutcome;
use crate::message::{OutboundMessage, Priority};
use crate::stick::Stick;
use std::time::Duration;

pub mod association;
pub mod configuration;
pub mod manufacturer;
pub mod multi_channel;
pub mod naming;
pub mod security;
pub mod thermostat;
pub mod version;
pub mod wakeup;

/// What the engine needs to know about a target node. The engine has no
/// access to the unit database, so callers put this on every message.
#[derive(Debug, Copy, Clone, Default)]
pub struct TargetProfile {
    pub secure: bool,
    pub freq_listener: bool,
    /// The caller asserts the (non-listening) target is currently awake,
    /// e.g. it just sent a wakeup notification.
    pub awake: bool,
}

impl TargetProfile {
    #[inline]
    pub fn query_priority(&self) -> Priority {
        if self.awake {
            Priority::Wakeup
        } else {
            Priority::Query
        }
    }

    #[inline]
    pub fn command_priority(&self) -> Priority {
        if self.awake {
            Priority::Wakeup
        } else {
            Priority::Command
        }
    }
}

/// How a helper message went out.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Delivery {
    /// The synchronous wait ran to a terminal state.
    Completed(WaitOutcome),
    /// Queued for later; the ack id can be waited on when needed.
    Queued(u32),
}

/// Sends a built message with the awake-hint policy: an awake target is
/// waited on synchronously, otherwise the message is queued and the ack id
/// returned for a later bounded wait.
pub fn deliver(
    stick: &Stick,
    msg: OutboundMessage,
    profile: TargetProfile,
    timeout: Duration,
) -> Delivery {
    if profile.awake {
        Delivery::Completed(stick.send_sync(msg, timeout))
    } else {
        Delivery::Queued(stick.enqueue(msg))
    }
}
