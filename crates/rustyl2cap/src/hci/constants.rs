//! HCI constants used by the L2CAP layer

// HCI packet indicators
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;

// Maximum parameter length for an HCI command
pub const HCI_MAX_PARAM_LEN: usize = 255;

// OGF values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;

// Link Control OCFs
pub const OCF_CREATE_CONN: u16 = 0x0005;
pub const OCF_DISCONNECT: u16 = 0x0006;

// Link Policy OCFs
pub const OCF_EXIT_SNIFF_MODE: u16 = 0x0004;

// Host Controller OCFs
pub const OCF_WRITE_AUTOMATIC_FLUSH_TIMEOUT: u16 = 0x0028;

// ACL header
pub const HCI_ACL_HEADER_SIZE: usize = 4;
pub const HCI_ACL_HANDLE_MASK: u16 = 0x0FFF;
pub const HCI_ACL_PB_SHIFT: u16 = 12;

// Packet boundary flags
pub const ACL_PB_START_NON_FLUSHABLE: u8 = 0x00;
pub const ACL_PB_CONTINUATION: u8 = 0x01;
pub const ACL_PB_START_FLUSHABLE: u8 = 0x02;

// Create Connection parameters
pub const HCI_PKT_TYPES_MASK_DM1_DH1_DM3_DH3_DM5_DH5: u16 = 0xCC18;
pub const HCI_PAGE_SCAN_REP_MODE_R1: u8 = 0x01;

// Largest flush timeout the controller accepts, in 0.625 ms slots
pub const HCI_MAX_AUTO_FLUSH_TOUT: u16 = 0x07FF;

// Status and reason codes
pub const HCI_SUCCESS: u8 = 0x00;
pub const HCI_ERR_AUTH_FAILURE: u8 = 0x05;
pub const HCI_ERR_CONNECTION_EXISTS: u8 = 0x0B;
pub const HCI_ERR_PEER_USER: u8 = 0x13;
