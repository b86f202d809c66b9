//! Type definitions for L2CAP operations
//!
//! This module contains core data structures used in L2CAP operations.

use super::constants::*;
use bitflags::bitflags;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error types specific to L2CAP operations
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Channel not found: 0x{0:04x}")]
    ChannelNotFound(u16),

    #[error("Invalid state for operation: {0}")]
    InvalidState(ChannelState),

    #[error("MTU exceeded: {len} > {mtu}")]
    MtuExceeded { len: usize, mtu: u16 },

    #[error("PSM not registered: 0x{0:04x}")]
    PsmNotRegistered(u16),

    #[error("No link to {0}")]
    LinkNotFound(BdAddr),

    #[error("No resources")]
    NoResources,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("HCI error: {0}")]
    HciError(#[from] crate::error::HciError),
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Local channel identifier
pub type ChannelId = u16;

/// Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5], self.bytes[4], self.bytes[3], self.bytes[2], self.bytes[1], self.bytes[0]
        )
    }
}

/// Quality of Service (QoS) Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosFlowSpec {
    /// Flags (reserved)
    pub flags: u8,
    /// QoS service type
    pub service_type: u8,
    /// Token rate (bytes/second)
    pub token_rate: u32,
    /// Token bucket size (bytes)
    pub token_bucket_size: u32,
    /// Peak bandwidth (bytes/second)
    pub peak_bandwidth: u32,
    /// Latency (microseconds)
    pub latency: u32,
    /// Delay variation (microseconds)
    pub delay_variation: u32,
}

impl Default for QosFlowSpec {
    fn default() -> Self {
        Self {
            flags: 0,
            service_type: L2CAP_QOS_BEST_EFFORT,
            token_rate: 0,
            token_bucket_size: 0,
            peak_bandwidth: 0,
            latency: 0xFFFFFFFF,
            delay_variation: 0xFFFFFFFF,
        }
    }
}

/// Retransmission and Flow Control modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetransmissionMode {
    /// Basic L2CAP mode (no retransmission or flow control)
    #[default]
    Basic,
    /// Legacy retransmission mode
    Retransmission,
    /// Legacy flow control mode
    FlowControl,
    /// Enhanced Retransmission mode
    EnhancedRetransmission,
    /// Streaming mode
    Streaming,
    /// A mode value this stack does not know
    Unknown(u8),
}

impl RetransmissionMode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Basic,
            1 => Self::Retransmission,
            2 => Self::FlowControl,
            3 => Self::EnhancedRetransmission,
            4 => Self::Streaming,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Basic => 0,
            Self::Retransmission => 1,
            Self::FlowControl => 2,
            Self::EnhancedRetransmission => 3,
            Self::Streaming => 4,
            Self::Unknown(other) => *other,
        }
    }

    /// The allowed-modes bit standing for this mode, if this stack implements it
    pub fn mode_bit(&self) -> Option<ChannelModes> {
        match self {
            Self::Basic => Some(ChannelModes::BASIC),
            Self::EnhancedRetransmission => Some(ChannelModes::ERTM),
            Self::Streaming => Some(ChannelModes::STREAMING),
            _ => None,
        }
    }
}

impl fmt::Display for RetransmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => write!(f, "Basic"),
            Self::Retransmission => write!(f, "Retransmission"),
            Self::FlowControl => write!(f, "FlowControl"),
            Self::EnhancedRetransmission => write!(f, "ERTM"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Unknown(v) => write!(f, "Unknown({})", v),
        }
    }
}

/// Retransmission and Flow Control option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FcrOptions {
    /// Mode selection
    pub mode: RetransmissionMode,
    /// Transmission Window size
    pub tx_win_sz: u8,
    /// Maximum number of transmissions of one I-frame (0 = unlimited)
    pub max_transmit: u8,
    /// Retransmission timeout (ms)
    pub rtrans_tout: u16,
    /// Monitor timeout (ms)
    pub mon_tout: u16,
    /// Maximum PDU payload size
    pub mps: u16,
}

impl FcrOptions {
    pub fn basic() -> Self {
        Self::default()
    }

    pub fn ertm(tx_win_sz: u8, max_transmit: u8, mps: u16) -> Self {
        Self {
            mode: RetransmissionMode::EnhancedRetransmission,
            tx_win_sz,
            max_transmit,
            rtrans_tout: 0,
            mon_tout: 0,
            mps,
        }
    }

    pub fn streaming(mps: u16) -> Self {
        Self {
            mode: RetransmissionMode::Streaming,
            mps,
            ..Self::default()
        }
    }
}

/// Extended Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedFlowSpec {
    /// Identifier
    pub identifier: u8,
    /// Service type
    pub service_type: u8,
    /// Maximum SDU size
    pub max_sdu_size: u16,
    /// SDU inter-arrival time
    pub sdu_inter_arrival_time: u32,
    /// Access latency
    pub access_latency: u32,
    /// Flush timeout
    pub flush_timeout: u32,
}

/// Configuration parameters exchanged in Configure Request/Response.
///
/// Each option is present only when its field is `Some`. Callers fill in the
/// options they care about; absent options are never read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigInfo {
    /// Result code (responses only)
    pub result: u16,
    /// Continuation flag and reserved bits
    pub flags: u16,
    /// Maximum Transmission Unit
    pub mtu: Option<u16>,
    /// Flush Timeout
    pub flush_to: Option<u16>,
    /// Quality of Service
    pub qos: Option<QosFlowSpec>,
    /// Retransmission and Flow Control
    pub fcr: Option<FcrOptions>,
    /// Frame Check Sequence
    pub fcs: Option<u8>,
    /// Extended Flow Specification
    pub ext_flow_spec: Option<ExtendedFlowSpec>,
}

impl ConfigInfo {
    /// Mode carried by the FCR option, Basic when absent
    pub fn mode(&self) -> RetransmissionMode {
        self.fcr.map(|f| f.mode).unwrap_or_default()
    }

    /// FCR option, all-zero Basic when absent
    pub fn fcr_or_basic(&self) -> FcrOptions {
        self.fcr.unwrap_or_default()
    }

    pub fn is_continuation(&self) -> bool {
        self.flags & L2CAP_CFG_FLAGS_MASK_CONT != 0
    }
}

bitflags! {
    /// Channel modes a client is willing to use
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChannelModes: u8 {
        const BASIC = 0x01;
        const ERTM = 0x08;
        const STREAMING = 0x10;
    }
}

bitflags! {
    /// Extended features advertised in an Information Response
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExtFeatures: u32 {
        const FLOW_CTRL = L2CAP_EXTFEA_FLOW_CTRL;
        const RETRANS = L2CAP_EXTFEA_RETRANS;
        const QOS = L2CAP_EXTFEA_QOS;
        const ENH_RETRANS = L2CAP_EXTFEA_ENH_RETRANS;
        const STREAM_MODE = L2CAP_EXTFEA_STREAM_MODE;
        const NO_CRC = L2CAP_EXTFEA_NO_CRC;
        const EXT_FLOW_SPEC = L2CAP_EXTFEA_EXT_FLOW_SPEC;
        const FIXED_CHNLS = L2CAP_EXTFEA_FIXED_CHNLS;
        const _ = !0;
    }
}

bitflags! {
    /// Progress of configuration in each direction
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigDone: u8 {
        /// Peer's request accepted
        const IB_DONE = 0x01;
        /// Our request accepted
        const OB_DONE = 0x02;
        /// The channel has been OPEN at least once
        const RECONFIG = 0x04;
    }
}

impl ConfigDone {
    pub const BOTH_DONE: Self = Self::IB_DONE.union(Self::OB_DONE);
}

bitflags! {
    /// Sides that asked to omit the FCS
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BypassFcs: u8 {
        const OURS = 0x01;
        const PEER = 0x02;
    }
}

impl BypassFcs {
    /// FCS is omitted only when both sides asked for it
    pub fn active(&self) -> bool {
        self.contains(Self::OURS | Self::PEER)
    }
}

/// Per-channel mode preferences supplied by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErtmInfo {
    /// Mode we propose first
    pub preferred_mode: RetransmissionMode,
    /// Modes we fall back to during negotiation
    pub allowed_modes: ChannelModes,
}

impl Default for ErtmInfo {
    fn default() -> Self {
        Self {
            preferred_mode: RetransmissionMode::Basic,
            allowed_modes: ChannelModes::BASIC,
        }
    }
}

/// L2CAP Channel State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection activity
    Closed,
    /// Outgoing connection waiting for the security check
    OrigW4SecComp,
    /// Incoming connection waiting for the security check
    TermW4SecComp,
    /// Waiting for the peer's connection response
    W4L2capConnectRsp,
    /// Waiting for the upper layer to accept the connection
    W4L2caConnectRsp,
    /// Configuration in progress
    Config,
    /// Channel is open and ready for data transfer
    Open,
    /// Waiting for the peer's disconnection response
    W4L2capDisconnectRsp,
    /// Waiting for the upper layer to confirm a peer disconnection
    W4L2caDisconnectRsp,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::OrigW4SecComp => write!(f, "ORIG_W4_SEC_COMP"),
            Self::TermW4SecComp => write!(f, "TERM_W4_SEC_COMP"),
            Self::W4L2capConnectRsp => write!(f, "W4_L2CAP_CON_RSP"),
            Self::W4L2caConnectRsp => write!(f, "W4_L2CA_CON_RSP"),
            Self::Config => write!(f, "CONFIG"),
            Self::Open => write!(f, "OPEN"),
            Self::W4L2capDisconnectRsp => write!(f, "W4_L2CAP_DISC_RSP"),
            Self::W4L2caDisconnectRsp => write!(f, "W4_L2CA_DISC_RSP"),
        }
    }
}

/// Protocol timers and limits
#[derive(Debug, Clone)]
pub struct L2capConfig {
    /// Waiting for a connection response
    pub connect_timeout: Duration,
    /// Waiting after a "pending" connection response
    pub connect_ext_timeout: Duration,
    /// Waiting for configuration to finish
    pub config_timeout: Duration,
    /// Waiting for a disconnection response
    pub disconnect_timeout: Duration,
    /// Waiting for encryption after a delayed security check
    pub delay_check_timeout: Duration,
    /// Waiting for the extended features Information Response
    pub info_timeout: Duration,
    /// Link idle time after its last channel is released
    pub link_idle_timeout: Duration,
    /// Delay before a deferred acknowledgment is sent
    pub ack_timeout: Duration,
    /// Monitor timer after answering an unexpected poll
    pub poll_recovery_timeout: Duration,
    /// Monitor timeout used in ERTM (ms)
    pub min_monitor_tout_ms: u16,
    /// Retransmission timeout used in ERTM (ms)
    pub min_retrans_tout_ms: u16,
    /// Mode renegotiation attempts before giving up
    pub max_fcr_cfg_tries: u8,
    /// Largest SDU we can receive
    pub max_rx_mtu: u16,
    /// MPS proposed on BR/EDR when the client leaves it unset
    pub mps_over_br_edr: u16,
    /// Largest PDU we can build for sending
    pub fcr_tx_buf_size: u16,
    /// Held SDUs per channel before congestion is reported
    pub buff_quota: usize,
    /// Controller ACL payload size
    pub acl_data_size: u16,
    /// Extended features we advertise
    pub local_ext_features: ExtFeatures,
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            connect_ext_timeout: Duration::from_secs(120),
            config_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
            delay_check_timeout: Duration::from_secs(2),
            info_timeout: Duration::from_secs(3),
            link_idle_timeout: Duration::from_secs(4),
            ack_timeout: Duration::from_millis(200),
            poll_recovery_timeout: Duration::from_secs(1),
            min_monitor_tout_ms: L2CAP_MIN_MONITOR_TOUT_MS,
            min_retrans_tout_ms: L2CAP_MIN_RETRANS_TOUT_MS,
            max_fcr_cfg_tries: L2CAP_MAX_FCR_CFG_TRIES,
            max_rx_mtu: L2CAP_MTU_SIZE,
            mps_over_br_edr: L2CAP_MPS_OVER_BR_EDR,
            fcr_tx_buf_size: L2CAP_FCR_TX_BUF_SIZE,
            buff_quota: L2CAP_DEFAULT_BUFF_QUOTA,
            acl_data_size: 1021,
            local_ext_features: ExtFeatures::ENH_RETRANS
                | ExtFeatures::STREAM_MODE
                | ExtFeatures::NO_CRC
                | ExtFeatures::FIXED_CHNLS,
        }
    }
}
