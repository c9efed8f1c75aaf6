//! The transport engine for a serial attached Z-Wave controller. Owns the
//! wire, drives every outbound message through its ping/nonce/encrypt/
//! send/ack phases, and classifies inbound frames before the driver layer
//! sees them.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod bridge;
pub mod cc;
pub mod config;
pub mod controller;
pub mod frame;
pub mod message;
pub mod nonce;
pub mod port;
pub mod queue;
pub mod shared;
pub mod stick;

pub use crate::bridge::WaitOutcome;
pub use crate::config::{ConfigStore, EngineConfig, MemoryStore, NetworkKey, PortConfig, TomlStore};
pub use crate::frame::{FrameType, InboundFrame};
pub use crate::message::{OutboundMessage, Priority};
pub use crate::stick::Stick;
