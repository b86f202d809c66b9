//! L2CAP Channel implementation
//!
//! This module provides the channel control block: one per dynamic channel,
//! holding negotiated configuration for both directions, the FCR runtime
//! block and the outbound SDU queue. The block is owned by the manager and
//! refers to its link by address only.

use std::collections::VecDeque;
use std::fmt;

use log::debug;

use super::constants::*;
use super::packet::{FlushPolicy, TxTag};
use super::types::*;

/// Options in force for one direction of a channel.
///
/// Unlike [`ConfigInfo`] the values stay meaningful while an option is
/// marked absent: an absent option in a later request reuses the value
/// accepted earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub mtu: u16,
    pub mtu_present: bool,
    pub flush_to: u16,
    pub flush_to_present: bool,
    pub qos: QosFlowSpec,
    pub qos_present: bool,
    pub fcr: FcrOptions,
    pub fcr_present: bool,
    pub fcs: Option<u8>,
    pub ext_flow_spec: Option<ExtendedFlowSpec>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mtu: L2CAP_DEFAULT_MTU,
            mtu_present: false,
            flush_to: L2CAP_NO_AUTOMATIC_FLUSH,
            flush_to_present: false,
            qos: QosFlowSpec::default(),
            qos_present: false,
            fcr: FcrOptions::basic(),
            fcr_present: false,
            fcs: None,
            ext_flow_spec: None,
        }
    }
}

impl ChannelConfig {
    /// Adopt everything a configuration request carries
    pub fn from_info(cfg: &ConfigInfo) -> Self {
        let mut this = Self::default();
        if let Some(mtu) = cfg.mtu {
            this.mtu = mtu;
            this.mtu_present = true;
        }
        if let Some(flush_to) = cfg.flush_to {
            this.flush_to = flush_to;
            this.flush_to_present = true;
        }
        if let Some(qos) = cfg.qos {
            this.qos = qos;
            this.qos_present = true;
        }
        if let Some(fcr) = cfg.fcr {
            this.fcr = fcr;
            this.fcr_present = true;
        }
        this.fcs = cfg.fcs;
        this.ext_flow_spec = cfg.ext_flow_spec;
        this
    }

    /// The options marked present, as they go on the wire
    pub fn to_info(&self) -> ConfigInfo {
        ConfigInfo {
            mtu: self.mtu_present.then_some(self.mtu),
            flush_to: self.flush_to_present.then_some(self.flush_to),
            qos: self.qos_present.then_some(self.qos),
            fcr: self.fcr_present.then_some(self.fcr),
            fcs: self.fcs,
            ext_flow_spec: self.ext_flow_spec,
            ..ConfigInfo::default()
        }
    }
}

/// An SDU waiting on the channel hold queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSdu {
    /// SDU bytes; in Basic mode the complete B-frame
    pub data: Vec<u8>,
    /// Bytes already handed out as segments
    pub offset: usize,
    pub tag: TxTag,
}

impl TxSdu {
    pub fn new(data: Vec<u8>, flush: FlushPolicy) -> Self {
        Self {
            data,
            offset: 0,
            tag: TxTag {
                flush,
                ..TxTag::default()
            },
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_segmenting(&self) -> bool {
        self.offset > 0
    }
}

/// An I-frame kept for retransmission.
///
/// Stored without the FCS; the control word is rewritten with fresh
/// acknowledgment state each time the frame goes out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPdu {
    pub ctrl: u16,
    /// Payload after the control word (SDU length prefix included)
    pub payload: Vec<u8>,
    pub tag: TxTag,
}

/// Out-of-sequence I-frame held while a selective reject is outstanding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldFrame {
    pub tx_seq: u8,
    pub ctrl: u16,
    pub payload: Vec<u8>,
}

/// FCR runtime state of one channel
#[derive(Debug, Default)]
pub struct FcrBlock {
    /// Sequence number for the next new I-frame
    pub next_tx_seq: u8,
    /// Last ReqSeq received from the peer
    pub last_rx_ack: u8,
    /// TxSeq expected in the next in-order I-frame
    pub next_seq_expected: u8,
    /// Last ReqSeq we sent
    pub last_ack_sent: u8,
    /// Retransmissions of the oldest unacknowledged frame
    pub num_tries: u8,
    /// Frames we let go unacknowledged before sending RR
    pub max_held_acks: u8,

    pub remote_busy: bool,
    pub local_busy: bool,
    pub rej_sent: bool,
    pub srej_sent: bool,
    /// A poll is outstanding; only F-bit frames are accepted
    pub wait_ack: bool,
    pub rej_after_srej: bool,
    /// The next frame we send must carry the F bit
    pub send_f_rsp: bool,

    /// SDU being reassembled
    pub rx_sdu: Option<Vec<u8>>,
    pub rx_sdu_len: u16,

    pub waiting_for_ack_q: VecDeque<TxPdu>,
    pub retrans_q: VecDeque<TxPdu>,
    pub srej_rcv_hold_q: VecDeque<HeldFrame>,
}

/// L2CAP Channel structure
pub struct L2capChannel {
    /// Local Channel Identifier (CID)
    pub(crate) local_cid: ChannelId,
    /// Remote Channel Identifier (CID), 0 until the peer tells us
    pub(crate) remote_cid: ChannelId,
    /// Link the channel rides on
    pub(crate) link: BdAddr,
    pub(crate) psm: u16,
    pub(crate) state: ChannelState,
    /// Identifier of the peer's last request
    pub(crate) remote_id: u8,
    /// Identifier of our last request
    pub(crate) local_id: u8,

    pub(crate) config_done: ConfigDone,
    pub(crate) our_cfg: ChannelConfig,
    pub(crate) peer_cfg: ChannelConfig,
    pub(crate) peer_cfg_already_rejected: bool,
    /// Send the FCR option back in our configuration response
    pub(crate) out_cfg_fcr_present: bool,
    pub(crate) bypass_fcs: BypassFcs,
    /// A "pending" Connection Response already went out
    pub(crate) sent_pending: bool,
    /// Do not hold the channel over a link retry
    pub(crate) no_retry: bool,
    pub(crate) fcr_cfg_tries: u8,
    pub(crate) ertm_info: ErtmInfo,
    pub(crate) max_rx_mtu: u16,
    /// Largest payload per PDU we send
    pub(crate) tx_mps: u16,

    pub(crate) xmit_hold_q: VecDeque<TxSdu>,
    pub(crate) buff_quota: usize,
    pub(crate) cong_sent: bool,
    pub(crate) is_flushable: bool,

    pub(crate) fcrb: FcrBlock,
}

impl L2capChannel {
    /// Create a channel control block bound to `link`
    pub fn new(local_cid: ChannelId, link: BdAddr, psm: u16, config: &L2capConfig) -> Self {
        Self {
            local_cid,
            remote_cid: 0,
            link,
            psm,
            state: ChannelState::Closed,
            remote_id: 0,
            local_id: 0,
            config_done: ConfigDone::empty(),
            our_cfg: ChannelConfig::default(),
            peer_cfg: ChannelConfig::default(),
            peer_cfg_already_rejected: false,
            out_cfg_fcr_present: false,
            bypass_fcs: BypassFcs::empty(),
            sent_pending: false,
            no_retry: false,
            fcr_cfg_tries: config.max_fcr_cfg_tries,
            ertm_info: ErtmInfo::default(),
            max_rx_mtu: config.max_rx_mtu,
            tx_mps: 0,
            xmit_hold_q: VecDeque::new(),
            buff_quota: config.buff_quota,
            cong_sent: false,
            is_flushable: false,
            fcrb: FcrBlock::default(),
        }
    }

    pub fn local_cid(&self) -> ChannelId {
        self.local_cid
    }

    pub fn remote_cid(&self) -> ChannelId {
        self.remote_cid
    }

    pub fn link(&self) -> BdAddr {
        self.link
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            debug!(
                "L2CAP CID 0x{:04x}: {} -> {}",
                self.local_cid, self.state, state
            );
            self.state = state;
        }
    }

    pub fn config_done(&self) -> ConfigDone {
        self.config_done
    }

    /// Mode we send in
    pub fn our_mode(&self) -> RetransmissionMode {
        self.our_cfg.fcr.mode
    }

    /// Mode the peer sends in
    pub fn peer_mode(&self) -> RetransmissionMode {
        self.peer_cfg.fcr.mode
    }

    /// MTU the peer accepts from us
    pub fn peer_mtu(&self) -> u16 {
        self.peer_cfg.mtu
    }

    pub fn tx_mps(&self) -> u16 {
        self.tx_mps
    }

    pub fn fcr(&self) -> &FcrBlock {
        &self.fcrb
    }

    pub fn is_congested(&self) -> bool {
        self.cong_sent
    }

    /// SDUs queued for sending
    pub fn hold_queue_len(&self) -> usize {
        self.xmit_hold_q.len()
    }

    /// FCS goes on every frame unless both sides agreed to drop it
    pub(crate) fn use_fcs(&self) -> bool {
        !self.bypass_fcs.active()
    }

    /// The peer's window is full or it told us to stop
    pub fn is_flow_controlled(&self) -> bool {
        self.peer_cfg.fcr.mode == RetransmissionMode::EnhancedRetransmission
            && (self.fcrb.remote_busy
                || self.fcrb.waiting_for_ack_q.len() >= self.peer_cfg.fcr.tx_win_sz as usize)
    }

    /// Whether a queued PDU may be flushed by the controller
    pub(crate) fn is_pdu_flushable(&self, flush: FlushPolicy) -> bool {
        match flush {
            FlushPolicy::ChannelBased => self.is_flushable,
            FlushPolicy::Flushable => true,
            FlushPolicy::NonFlushable => false,
        }
    }

    /// Re-evaluate the hold queue against the buffer quota.
    ///
    /// Returns the new congestion status when it changed.
    pub(crate) fn check_congestion(&mut self) -> Option<bool> {
        if self.buff_quota == 0 {
            return None;
        }
        let queued = self.xmit_hold_q.len();
        if self.cong_sent && queued <= self.buff_quota / 2 {
            self.cong_sent = false;
            debug!("L2CAP CID 0x{:04x} uncongested, {} queued", self.local_cid, queued);
            Some(false)
        } else if !self.cong_sent && queued > self.buff_quota {
            self.cong_sent = true;
            debug!("L2CAP CID 0x{:04x} congested, {} queued", self.local_cid, queued);
            Some(true)
        } else {
            None
        }
    }

    /// Drop all queued data and zero the FCR block
    pub(crate) fn cleanup(&mut self) {
        self.xmit_hold_q.clear();
        self.fcrb = FcrBlock::default();
    }
}

impl fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capChannel")
            .field("local_cid", &format_args!("0x{:04x}", self.local_cid))
            .field("remote_cid", &format_args!("0x{:04x}", self.remote_cid))
            .field("link", &format_args!("{}", self.link))
            .field("psm", &format_args!("0x{:04x}", self.psm))
            .field("state", &self.state)
            .field("config_done", &self.config_done)
            .field("our_mode", &self.our_cfg.fcr.mode)
            .field("peer_mode", &self.peer_cfg.fcr.mode)
            .field("queued", &self.xmit_hold_q.len())
            .finish()
    }
}
