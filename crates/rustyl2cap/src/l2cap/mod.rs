//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the BR/EDR connection-oriented channel layer, which is
//! responsible for:
//! - Multiplexing protocol channels over a single ACL link
//! - Channel setup, configuration and teardown
//! - Segmentation and reassembly of SDUs
//! - Flow and error control in Enhanced Retransmission and Streaming modes

pub mod constants;
pub mod types;
pub mod psm;
pub mod fcs;
pub mod timer;
pub mod security;
pub mod packet;
pub mod signaling;
pub mod channel;
pub mod link;
pub mod fcr;
pub mod config;
pub mod csm;
pub mod core;
#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::types::*;
pub use self::core::{DataWriteStatus, L2capManager};
pub use self::channel::{ChannelConfig, L2capChannel};
pub use self::csm::L2capEvent;
pub use self::link::{AclScheduler, Link, LinkState};
pub use self::packet::FlushPolicy;
pub use self::psm::{L2capCallbacks, Registration, PSM};
pub use self::security::{NoSecurity, SecurityManager, SecurityStatus};
pub use self::timer::{TimerId, TimerQueue, TimerService};
