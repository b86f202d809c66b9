//! L2CAP protocol constants
//!
//! Values from the Bluetooth Core Specification Vol 3, Part A.

// Header sizes
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
pub const L2CAP_CMD_HEADER_SIZE: usize = 4;
pub const L2CAP_FCR_CONTROL_SIZE: usize = 2;
pub const L2CAP_FCS_LEN: usize = 2;
pub const L2CAP_SDU_LEN_SIZE: usize = 2;
/// Basic header, control word, SDU length and FCS
pub const L2CAP_MAX_HEADER_FCS: u16 =
    (L2CAP_BASIC_HEADER_SIZE + L2CAP_FCR_CONTROL_SIZE + L2CAP_SDU_LEN_SIZE + L2CAP_FCS_LEN) as u16;

// Fixed channel identifiers
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
pub const L2CAP_CONNECTIONLESS_CID: u16 = 0x0002;
pub const L2CAP_BASE_APPL_CID: u16 = 0x0040;
pub const L2CAP_LAST_APPL_CID: u16 = 0xFFFF;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;

// Command reject reasons
pub const L2CAP_CMD_REJ_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_CMD_REJ_INVALID_CID: u16 = 0x0002;

// Connection response results
pub const L2CAP_CONN_OK: u16 = 0x0000;
pub const L2CAP_CONN_PENDING: u16 = 0x0001;
pub const L2CAP_CONN_NO_PSM: u16 = 0x0002;
pub const L2CAP_CONN_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_CONN_NO_RESOURCES: u16 = 0x0004;
// Local-only results reported through connect_cfm
pub const L2CAP_CONN_TIMEOUT: u16 = 0xEEEE;
pub const L2CAP_CONN_NO_LINK: u16 = 0xFF02;

// Disconnection confirm results (local only)
pub const L2CAP_DISC_OK: u16 = 0x0000;
pub const L2CAP_DISC_TIMEOUT: u16 = 0xEEEE;

// Connection response status (result == pending)
pub const L2CAP_CONN_STATUS_NONE: u16 = 0x0000;
pub const L2CAP_CONN_STATUS_AUTHENTICATION: u16 = 0x0001;

// Configuration results
pub const L2CAP_CFG_OK: u16 = 0x0000;
pub const L2CAP_CFG_UNACCEPTABLE_PARAMS: u16 = 0x0001;
pub const L2CAP_CFG_FAILED_NO_REASON: u16 = 0x0002;
pub const L2CAP_CFG_UNKNOWN_OPTIONS: u16 = 0x0003;
pub const L2CAP_CFG_PENDING: u16 = 0x0004;

// Configuration flags
pub const L2CAP_CFG_FLAGS_MASK_CONT: u16 = 0x0001;

// Configuration option types
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
pub const L2CAP_CONF_QOS: u8 = 0x03;
pub const L2CAP_CONF_RFC: u8 = 0x04;
pub const L2CAP_CONF_FCS: u8 = 0x05;
pub const L2CAP_CONF_EXT_FLOW_SPEC: u8 = 0x06;
pub const L2CAP_CONF_HINT: u8 = 0x80;

pub const L2CAP_CONF_MTU_LEN: u8 = 2;
pub const L2CAP_CONF_FLUSH_TIMEOUT_LEN: u8 = 2;
pub const L2CAP_CONF_QOS_LEN: u8 = 22;
pub const L2CAP_CONF_RFC_LEN: u8 = 9;
pub const L2CAP_CONF_FCS_LEN: u8 = 1;
pub const L2CAP_CONF_EXT_FLOW_SPEC_LEN: u8 = 16;

// FCS option values
pub const L2CAP_CFG_FCS_BYPASS: u8 = 0x00;
pub const L2CAP_CFG_FCS_USE: u8 = 0x01;

// QoS service types
pub const L2CAP_QOS_NO_TRAFFIC: u8 = 0x00;
pub const L2CAP_QOS_BEST_EFFORT: u8 = 0x01;
pub const L2CAP_QOS_GUARANTEED: u8 = 0x02;

// Flush timeout special values
pub const L2CAP_NO_AUTOMATIC_FLUSH: u16 = 0xFFFF;
pub const L2CAP_NO_RETRANSMISSION: u16 = 0x0001;

// Information request types
pub const L2CAP_INFO_TYPE_CONNLESS_MTU: u16 = 0x0001;
pub const L2CAP_INFO_TYPE_EXTENDED_FEATURES: u16 = 0x0002;
pub const L2CAP_INFO_TYPE_FIXED_CHANNELS: u16 = 0x0003;

pub const L2CAP_INFO_RESP_RESULT_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_RESP_RESULT_NOT_SUPPORTED: u16 = 0x0001;

// MTU and MPS
pub const L2CAP_MIN_MTU: u16 = 48;
pub const L2CAP_DEFAULT_MTU: u16 = 672;
pub const L2CAP_MTU_SIZE: u16 = 1691;
pub const L2CAP_MPS_OVER_BR_EDR: u16 = 1010;
pub const L2CAP_DEFAULT_ERM_MPS: u16 = 0;
pub const L2CAP_FCR_TX_BUF_SIZE: u16 = 4096;

// FCR defaults
pub const L2CAP_DEFAULT_ERM_TX_WINDOW: u8 = 10;
pub const L2CAP_DEFAULT_ERM_MAX_TRANSMIT: u8 = 20;
pub const L2CAP_MIN_MONITOR_TOUT_MS: u16 = 12000;
pub const L2CAP_MIN_RETRANS_TOUT_MS: u16 = 2000;
pub const L2CAP_MAX_FCR_CFG_TRIES: u8 = 2;
pub const L2CAP_DEFAULT_BUFF_QUOTA: usize = 2;

// Enhanced control field (16 bit)
pub const L2CAP_FCR_S_FRAME_BIT: u16 = 0x0001;
pub const L2CAP_FCR_TX_SEQ_BITS: u16 = 0x007E;
pub const L2CAP_FCR_TX_SEQ_BITS_SHIFT: u16 = 1;
pub const L2CAP_FCR_P_BIT: u16 = 0x0010;
pub const L2CAP_FCR_F_BIT: u16 = 0x0080;
pub const L2CAP_FCR_SUP_BITS: u16 = 0x000C;
pub const L2CAP_FCR_SUP_SHIFT: u16 = 2;
pub const L2CAP_FCR_REQ_SEQ_BITS: u16 = 0x3F00;
pub const L2CAP_FCR_REQ_SEQ_BITS_SHIFT: u16 = 8;
pub const L2CAP_FCR_SAR_BITS: u16 = 0xC000;
pub const L2CAP_FCR_SAR_BITS_SHIFT: u16 = 14;

/// Sequence numbers are modulo 64
pub const L2CAP_FCR_SEQ_MODULO: u8 = 0x3F;

// FCS
pub const L2CAP_FCR_INIT_CRC: u16 = 0;

// Extended feature mask bits
pub const L2CAP_EXTFEA_FLOW_CTRL: u32 = 0x0000_0001;
pub const L2CAP_EXTFEA_RETRANS: u32 = 0x0000_0002;
pub const L2CAP_EXTFEA_QOS: u32 = 0x0000_0004;
pub const L2CAP_EXTFEA_ENH_RETRANS: u32 = 0x0000_0008;
pub const L2CAP_EXTFEA_STREAM_MODE: u32 = 0x0000_0010;
pub const L2CAP_EXTFEA_NO_CRC: u32 = 0x0000_0020;
pub const L2CAP_EXTFEA_EXT_FLOW_SPEC: u32 = 0x0000_0040;
pub const L2CAP_EXTFEA_FIXED_CHNLS: u32 = 0x0000_0080;
