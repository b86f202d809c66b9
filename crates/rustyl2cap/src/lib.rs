//! RustyL2cap - Bluetooth Classic L2CAP channel layer
//!
//! This library implements the connection-oriented channel state machine of
//! BR/EDR L2CAP together with the Flow Control and Retransmission engine for
//! Basic, Enhanced Retransmission and Streaming modes. It sits above an HCI
//! transport and below protocol clients such as RFCOMM or AVDTP; both sides
//! plug in through traits so the core stays free of I/O.

pub mod error;
pub mod hci;
pub mod l2cap;

// Re-export common types for convenience
pub use error::HciError;
pub use hci::{AclPacket, CommandSender, HciCommand, PacketBoundary};
pub use l2cap::{
    BdAddr, ChannelState, ConfigInfo, DataWriteStatus, ErtmInfo, L2capCallbacks, L2capChannel,
    L2capConfig, L2capError, L2capManager, RetransmissionMode,
};
