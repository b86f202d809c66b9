//! Bluetooth HCI (Host Controller Interface) plumbing used by L2CAP
//!
//! L2CAP never talks to a transport directly. Commands are formatted here and
//! handed to a [`CommandSender`], ACL data is framed as [`AclPacket`].

pub mod constants;
pub mod packet;


pub use packet::{AclPacket, HciCommand, PacketBoundary};

use crate::error::HciError;

/// Asynchronous HCI command dispatch.
///
/// Implementations format the command for their transport and queue it for
/// the controller. Completion events are not reported back to L2CAP.
pub trait CommandSender {
    fn send_command(&mut self, command: HciCommand) -> Result<(), HciError>;
}
