//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! This module manages PSM values and the callback set a client registers
//! for one PSM.

use super::types::{ChannelId, ConfigInfo, ErtmInfo};
use super::types::BdAddr;
use std::fmt;
use std::sync::Arc;

/// Protocol/Service Multiplexer (PSM) values used in L2CAP.
///
/// See Bluetooth Core Specification Vol 3, Part A, Section 4.2.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PSM {
    /// Service Discovery Protocol
    SDP,
    /// RFCOMM protocol
    RFCOMM,
    /// Telephony Control Protocol
    TCS_BIN,
    /// BNEP protocol
    BNEP,
    /// HID Control
    HID_CONTROL,
    /// HID Interrupt
    HID_INTERRUPT,
    /// AVCTP protocol
    AVCTP,
    /// AVDTP protocol
    AVDTP,
    /// AVCTP Browsing
    AVCTP_BROWSING,
    /// Any other value
    Dynamic(u16),
}

impl PSM {
    /// A PSM is odd and the least significant bit of its upper octet is 0
    pub fn is_valid(&self) -> bool {
        let value = self.value();
        (value & 0x0001) == 0x0001 && (value & 0x0100) == 0
    }

    /// Get the PSM value as u16
    pub fn value(&self) -> u16 {
        match self {
            PSM::SDP => 0x0001,
            PSM::RFCOMM => 0x0003,
            PSM::TCS_BIN => 0x0005,
            PSM::BNEP => 0x000F,
            PSM::HID_CONTROL => 0x0011,
            PSM::HID_INTERRUPT => 0x0013,
            PSM::AVCTP => 0x0017,
            PSM::AVDTP => 0x0019,
            PSM::AVCTP_BROWSING => 0x001B,
            PSM::Dynamic(value) => *value,
        }
    }

    /// Map a raw value to a PSM; every value maps, validity is separate
    pub fn from_value(value: u16) -> Self {
        match value {
            0x0001 => PSM::SDP,
            0x0003 => PSM::RFCOMM,
            0x0005 => PSM::TCS_BIN,
            0x000F => PSM::BNEP,
            0x0011 => PSM::HID_CONTROL,
            0x0013 => PSM::HID_INTERRUPT,
            0x0017 => PSM::AVCTP,
            0x0019 => PSM::AVDTP,
            0x001B => PSM::AVCTP_BROWSING,
            other => PSM::Dynamic(other),
        }
    }
}

impl fmt::Display for PSM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PSM::SDP => write!(f, "SDP (0x0001)"),
            PSM::RFCOMM => write!(f, "RFCOMM (0x0003)"),
            PSM::TCS_BIN => write!(f, "TCS-BIN (0x0005)"),
            PSM::BNEP => write!(f, "BNEP (0x000F)"),
            PSM::HID_CONTROL => write!(f, "HID-Control (0x0011)"),
            PSM::HID_INTERRUPT => write!(f, "HID-Interrupt (0x0013)"),
            PSM::AVCTP => write!(f, "AVCTP (0x0017)"),
            PSM::AVDTP => write!(f, "AVDTP (0x0019)"),
            PSM::AVCTP_BROWSING => write!(f, "AVCTP-Browsing (0x001B)"),
            PSM::Dynamic(value) => write!(f, "PSM (0x{:04X})", value),
        }
    }
}

/// Upper-layer callback set registered for one PSM.
///
/// Every method has a no-op default so clients implement only what they use.
/// Callbacks run on the L2CAP event loop and must not block.
pub trait L2capCallbacks: Send + Sync {
    /// Peer asked to connect; answer with `connect_rsp`
    fn connect_ind(&self, _bd_addr: BdAddr, _cid: ChannelId, _psm: u16, _id: u8) {}

    /// Outcome of our connection request
    fn connect_cfm(&self, _cid: ChannelId, _result: u16) {}

    /// Peer answered our connection request with "pending"
    fn connect_pnd(&self, _cid: ChannelId) {}

    /// Peer sent a configuration request; answer with `config_rsp`
    fn config_ind(&self, _cid: ChannelId, _cfg: &ConfigInfo) {}

    /// Peer answered our configuration request
    fn config_cfm(&self, _cid: ChannelId, _cfg: &ConfigInfo) {}

    /// Channel went down; `needs_ack` asks for `disconnect_rsp`
    fn disconnect_ind(&self, _cid: ChannelId, _needs_ack: bool) {}

    /// Our disconnection completed
    fn disconnect_cfm(&self, _cid: ChannelId, _result: u16) {}

    fn qos_violation_ind(&self, _bd_addr: BdAddr) {}

    /// One complete SDU received
    fn data_ind(&self, _cid: ChannelId, _sdu: Vec<u8>) {}

    /// Transmit queue crossed its quota in either direction
    fn congestion_status(&self, _cid: ChannelId, _congested: bool) {}

    /// `count` SDUs left the channel; `0xFFFF` means all queues drained
    fn tx_complete(&self, _cid: ChannelId, _count: u16) {}
}

/// Represents a registration for a specific PSM.
#[derive(Clone)]
pub struct Registration {
    /// PSM value
    pub psm: u16,
    /// Client callbacks
    pub callbacks: Arc<dyn L2capCallbacks>,
    /// Mode preferences for channels on this PSM
    pub ertm_info: ErtmInfo,
    /// Largest SDU the client accepts
    pub max_rx_mtu: u16,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("psm", &format_args!("0x{:04x}", self.psm))
            .field("ertm_info", &self.ertm_info)
            .field("max_rx_mtu", &self.max_rx_mtu)
            .finish()
    }
}
