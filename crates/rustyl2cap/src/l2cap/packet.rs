//! L2CAP Packet handling
//!
//! This module provides structures and functions for handling L2CAP packets:
//! the basic header, the enhanced control word used by ERTM and Streaming
//! mode, and the signaling command header.

use super::constants::*;
use super::fcs;
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    /// Create a new L2CAP header
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_BASIC_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        let channel_id = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self { length, channel_id })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_BASIC_HEADER_SIZE];
        result[0..2].copy_from_slice(&self.length.to_le_bytes());
        result[2..4].copy_from_slice(&self.channel_id.to_le_bytes());
        result
    }
}

/// Segmentation and Reassembly marker of an I-frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SarType {
    #[default]
    Unsegmented,
    Start,
    End,
    Continuation,
}

impl SarType {
    pub fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            0 => Self::Unsegmented,
            1 => Self::Start,
            2 => Self::End,
            _ => Self::Continuation,
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            Self::Unsegmented => 0,
            Self::Start => 1,
            Self::End => 2,
            Self::Continuation => 3,
        }
    }

    /// Unsegmented and End frames complete an SDU
    pub fn completes_sdu(self) -> bool {
        matches!(self, Self::Unsegmented | Self::End)
    }
}

/// Supervisory function of an S-frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisoryFunction {
    /// Receiver Ready
    Rr,
    /// Reject
    Rej,
    /// Receiver Not Ready
    Rnr,
    /// Selective Reject
    Srej,
}

impl SupervisoryFunction {
    pub fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            0 => Self::Rr,
            1 => Self::Rej,
            2 => Self::Rnr,
            _ => Self::Srej,
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            Self::Rr => 0,
            Self::Rej => 1,
            Self::Rnr => 2,
            Self::Srej => 3,
        }
    }
}

/// A decoded ERTM/Streaming frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Information frame
    I {
        sar: SarType,
        tx_seq: u8,
        req_seq: u8,
        final_bit: bool,
        payload: Vec<u8>,
    },
    /// Supervisory frame
    S {
        function: SupervisoryFunction,
        poll: bool,
        final_bit: bool,
        req_seq: u8,
    },
}

impl Frame {
    /// Decode a control word and the bytes following it
    pub fn decode(ctrl: u16, payload: &[u8]) -> Self {
        let req_seq = ctrl_req_seq(ctrl);
        let final_bit = ctrl & L2CAP_FCR_F_BIT != 0;

        if ctrl & L2CAP_FCR_S_FRAME_BIT != 0 {
            Frame::S {
                function: SupervisoryFunction::from_bits(
                    (ctrl & L2CAP_FCR_SUP_BITS) >> L2CAP_FCR_SUP_SHIFT,
                ),
                poll: ctrl & L2CAP_FCR_P_BIT != 0,
                final_bit,
                req_seq,
            }
        } else {
            Frame::I {
                sar: ctrl_sar(ctrl),
                tx_seq: ctrl_tx_seq(ctrl),
                req_seq,
                final_bit,
                payload: payload.to_vec(),
            }
        }
    }

    /// Build the 16-bit enhanced control word
    pub fn control_word(&self) -> u16 {
        match *self {
            Frame::I {
                sar,
                tx_seq,
                req_seq,
                final_bit,
                ..
            } => {
                let mut ctrl = (sar.bits() << L2CAP_FCR_SAR_BITS_SHIFT)
                    | (((tx_seq & L2CAP_FCR_SEQ_MODULO) as u16) << L2CAP_FCR_TX_SEQ_BITS_SHIFT)
                    | (((req_seq & L2CAP_FCR_SEQ_MODULO) as u16) << L2CAP_FCR_REQ_SEQ_BITS_SHIFT);
                if final_bit {
                    ctrl |= L2CAP_FCR_F_BIT;
                }
                ctrl
            }
            Frame::S {
                function,
                poll,
                final_bit,
                req_seq,
            } => s_frame_control(function, req_seq, poll, final_bit),
        }
    }

    pub fn req_seq(&self) -> u8 {
        match self {
            Frame::I { req_seq, .. } | Frame::S { req_seq, .. } => *req_seq,
        }
    }

    pub fn is_final(&self) -> bool {
        match self {
            Frame::I { final_bit, .. } | Frame::S { final_bit, .. } => *final_bit,
        }
    }

    /// Encode as a complete PDU on `cid`
    pub fn encode(&self, cid: u16, with_fcs: bool) -> Vec<u8> {
        let payload: &[u8] = match self {
            Frame::I { payload, .. } => payload,
            Frame::S { .. } => &[],
        };
        encode_pdu(cid, self.control_word(), payload, with_fcs)
    }
}

/// Control word of an S-frame
pub fn s_frame_control(function: SupervisoryFunction, req_seq: u8, poll: bool, final_bit: bool) -> u16 {
    let mut ctrl = L2CAP_FCR_S_FRAME_BIT
        | (function.bits() << L2CAP_FCR_SUP_SHIFT)
        | (((req_seq & L2CAP_FCR_SEQ_MODULO) as u16) << L2CAP_FCR_REQ_SEQ_BITS_SHIFT);
    if poll {
        ctrl |= L2CAP_FCR_P_BIT;
    }
    if final_bit {
        ctrl |= L2CAP_FCR_F_BIT;
    }
    ctrl
}

pub fn ctrl_tx_seq(ctrl: u16) -> u8 {
    ((ctrl & L2CAP_FCR_TX_SEQ_BITS) >> L2CAP_FCR_TX_SEQ_BITS_SHIFT) as u8
}

pub fn ctrl_req_seq(ctrl: u16) -> u8 {
    ((ctrl & L2CAP_FCR_REQ_SEQ_BITS) >> L2CAP_FCR_REQ_SEQ_BITS_SHIFT) as u8
}

pub fn ctrl_sar(ctrl: u16) -> SarType {
    SarType::from_bits((ctrl & L2CAP_FCR_SAR_BITS) >> L2CAP_FCR_SAR_BITS_SHIFT)
}

/// Distance from `from` forward to `to`, modulo 64
pub fn seq_distance(to: u8, from: u8) -> u8 {
    to.wrapping_sub(from) & L2CAP_FCR_SEQ_MODULO
}

/// Next sequence number after `seq`
pub fn seq_next(seq: u8) -> u8 {
    seq.wrapping_add(1) & L2CAP_FCR_SEQ_MODULO
}

/// Build an ERTM/Streaming PDU: basic header, control word, payload and
/// optionally the FCS. The header length counts the FCS.
pub fn encode_pdu(cid: u16, ctrl: u16, payload: &[u8], with_fcs: bool) -> Vec<u8> {
    let fcs_len = if with_fcs { L2CAP_FCS_LEN } else { 0 };
    let length = (L2CAP_FCR_CONTROL_SIZE + payload.len() + fcs_len) as u16;

    let mut pdu = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + length as usize);
    pdu.extend_from_slice(&L2capHeader::new(length, cid).to_bytes());
    pdu.extend_from_slice(&ctrl.to_le_bytes());
    pdu.extend_from_slice(payload);
    if with_fcs {
        fcs::append(&mut pdu);
    }
    pdu
}

/// Build a Basic mode (B-frame) PDU
pub fn encode_basic_pdu(cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + payload.len());
    pdu.extend_from_slice(&L2capHeader::new(payload.len() as u16, cid).to_bytes());
    pdu.extend_from_slice(payload);
    pdu
}

/// Decode a complete ERTM/Streaming PDU into its frame.
///
/// Returns `None` when the PDU is too short or the FCS does not match.
pub fn decode_pdu(pdu: &[u8], with_fcs: bool) -> Option<(L2capHeader, Frame)> {
    let header = L2capHeader::parse(pdu)?;
    let body_end = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
    let fcs_len = if with_fcs { L2CAP_FCS_LEN } else { 0 };
    if pdu.len() < body_end || (header.length as usize) < L2CAP_FCR_CONTROL_SIZE + fcs_len {
        return None;
    }
    if with_fcs && !fcs::verify(&pdu[..body_end]) {
        return None;
    }

    let mut cursor = Cursor::new(&pdu[L2CAP_BASIC_HEADER_SIZE..]);
    let ctrl = cursor.read_u16::<LittleEndian>().ok()?;
    let payload = &pdu[L2CAP_BASIC_HEADER_SIZE + L2CAP_FCR_CONTROL_SIZE..body_end - fcs_len];
    Some((header, Frame::decode(ctrl, payload)))
}

/// How the controller may flush a queued PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Follow the channel's flush timeout setting
    #[default]
    ChannelBased,
    /// Always automatically flushable
    Flushable,
    /// Never flushed
    NonFlushable,
}

/// Transmit metadata carried with each outbound SDU and PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxTag {
    pub flush: FlushPolicy,
    pub sar: SarType,
}

/// L2CAP Command header used in signaling packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    /// Command code
    pub code: u8,
    /// Command identifier
    pub identifier: u8,
    /// Length of command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    /// Create a new command header
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    /// Parse a command header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_CMD_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let code = cursor.read_u8().ok()?;
        let identifier = cursor.read_u8().ok()?;
        let length = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            code,
            identifier,
            length,
        })
    }

    /// Serialize the command header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_CMD_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_CMD_HEADER_SIZE];
        result[0] = self.code;
        result[1] = self.identifier;
        result[2..4].copy_from_slice(&self.length.to_le_bytes());
        result
    }
}

/// Decode the SDU length prefix of a Start frame
pub fn read_sdu_len(payload: &[u8]) -> L2capResult<u16> {
    Cursor::new(payload)
        .read_u16::<LittleEndian>()
        .map_err(|_| L2capError::MalformedFrame("start frame without SDU length".into()))
}
