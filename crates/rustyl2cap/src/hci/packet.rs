//! HCI packet structures
//!
//! Command packets for the few controller operations L2CAP needs, and the ACL
//! data packet that carries L2CAP PDUs.

use crate::error::HciError;
use crate::hci::constants::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// HCI commands issued by the L2CAP layer
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    CreateConnection {
        bd_addr: [u8; 6],
        packet_type: u16,
        allow_role_switch: bool,
    },
    Disconnect { handle: u16, reason: u8 },

    // Link Policy Commands (OGF: 0x02)
    ExitSniffMode { handle: u16 },

    // Host Controller Commands (OGF: 0x03)
    WriteAutomaticFlushTimeout { handle: u16, timeout: u16 },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::CreateConnection { .. } => (OGF_LINK_CTL, OCF_CREATE_CONN),
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::ExitSniffMode { .. } => (OGF_LINK_POLICY, OCF_EXIT_SNIFF_MODE),
            Self::WriteAutomaticFlushTimeout { .. } => {
                (OGF_HOST_CTL, OCF_WRITE_AUTOMATIC_FLUSH_TIMEOUT)
            }
        }
    }

    /// Packed 16-bit opcode
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        ((ogf as u16) << 10) | (ocf & 0x3ff)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match *self {
            Self::CreateConnection {
                bd_addr,
                packet_type,
                allow_role_switch,
            } => {
                let mut params = Vec::with_capacity(13);
                params.extend_from_slice(&bd_addr);
                params.extend_from_slice(&packet_type.to_le_bytes());
                params.push(HCI_PAGE_SCAN_REP_MODE_R1);
                params.push(0x00); // Reserved
                params.extend_from_slice(&0u16.to_le_bytes()); // Clock offset unknown
                params.push(allow_role_switch as u8);
                params
            }

            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(reason);
                params
            }

            Self::ExitSniffMode { handle } => handle.to_le_bytes().to_vec(),

            Self::WriteAutomaticFlushTimeout { handle, timeout } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
                params
            }
        }
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// Packet boundary flag carried in the ACL header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBoundary {
    /// First fragment of a PDU the controller must not flush
    StartNonFlushable,
    /// Continuation fragment
    Continuation,
    /// First fragment of an automatically flushable PDU
    StartFlushable,
}

impl PacketBoundary {
    pub fn bits(self) -> u8 {
        match self {
            Self::StartNonFlushable => ACL_PB_START_NON_FLUSHABLE,
            Self::Continuation => ACL_PB_CONTINUATION,
            Self::StartFlushable => ACL_PB_START_FLUSHABLE,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            ACL_PB_START_NON_FLUSHABLE => Some(Self::StartNonFlushable),
            ACL_PB_CONTINUATION => Some(Self::Continuation),
            ACL_PB_START_FLUSHABLE => Some(Self::StartFlushable),
            _ => None,
        }
    }
}

/// One ACL data packet holding a complete L2CAP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    /// Connection handle (12 bits)
    pub handle: u16,
    /// Packet boundary flag
    pub boundary: PacketBoundary,
    /// L2CAP PDU, basic header included
    pub data: Vec<u8>,
}

impl AclPacket {
    pub fn new(handle: u16, boundary: PacketBoundary, data: Vec<u8>) -> Self {
        Self {
            handle: handle & HCI_ACL_HANDLE_MASK,
            boundary,
            data,
        }
    }

    /// Serialize to an HCI ACL packet, packet indicator included.
    ///
    /// The length field is capped at `max_data_len`; the transport segments
    /// anything longer.
    pub fn to_packet(&self, max_data_len: u16) -> Vec<u8> {
        let mut packet = Vec::with_capacity(1 + HCI_ACL_HEADER_SIZE + self.data.len());
        packet.push(HCI_ACL_PKT);

        let word = (self.handle & HCI_ACL_HANDLE_MASK)
            | ((self.boundary.bits() as u16) << HCI_ACL_PB_SHIFT);
        let len = std::cmp::min(self.data.len(), max_data_len as usize) as u16;

        packet.extend_from_slice(&word.to_le_bytes());
        packet.extend_from_slice(&len.to_le_bytes());
        packet.extend_from_slice(&self.data);
        packet
    }

    /// Parse an ACL packet without the packet indicator byte
    pub fn parse(data: &[u8]) -> Result<Self, HciError> {
        if data.len() < HCI_ACL_HEADER_SIZE {
            return Err(HciError::InvalidPacketFormat);
        }

        let mut cursor = Cursor::new(data);
        let word = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| HciError::InvalidPacketFormat)?;
        let len = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| HciError::InvalidPacketFormat)? as usize;

        let payload = &data[HCI_ACL_HEADER_SIZE..];
        if payload.len() < len {
            return Err(HciError::InvalidParamLength(payload.len()));
        }

        let boundary = PacketBoundary::from_bits(((word >> HCI_ACL_PB_SHIFT) & 0x03) as u8)
            .ok_or(HciError::InvalidPacketFormat)?;

        Ok(Self {
            handle: word & HCI_ACL_HANDLE_MASK,
            boundary,
            data: payload[..len].to_vec(),
        })
    }
}
