//! ACL link control block
//!
//! One record per remote device. It tracks the HCI handle, the extended
//! feature exchange, the channels riding on the link, and the link transmit
//! queue that signaling and S-frames bypass the channel queues through.

use std::collections::VecDeque;

use log::trace;

use super::types::{BdAddr, ChannelId, ExtFeatures};
use crate::error::HciError;
use crate::hci::AclPacket;

/// ACL link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Waiting for the baseband connection
    Connecting,
    Connected,
    /// HCI Disconnect sent
    Disconnecting,
}

/// PDU queued directly on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPdu {
    /// Channel whose queue the PDU was moved from, 0 for signaling and
    /// S-frames
    pub cid: ChannelId,
    /// Complete L2CAP PDU
    pub data: Vec<u8>,
    pub flushable: bool,
}

/// Controller-side ACL transmit path
pub trait AclScheduler {
    /// ACL buffers the controller can take right now for `handle`
    fn xmit_window(&self, handle: u16) -> usize;

    /// Hand one packet to the HCI transport
    fn transmit(&mut self, packet: AclPacket) -> Result<(), HciError>;
}

/// Link control block
#[derive(Debug)]
pub struct Link {
    pub(crate) bd_addr: BdAddr,
    pub(crate) handle: Option<u16>,
    pub(crate) state: LinkState,
    /// Extended features Information Request outstanding
    pub(crate) w4_info_rsp: bool,
    pub(crate) peer_ext_fea: ExtFeatures,
    /// Channels in allocation order
    pub(crate) channels: Vec<ChannelId>,
    /// Channel served last by the round robin
    rr_last: Option<ChannelId>,
    pub(crate) xmit_q: VecDeque<QueuedPdu>,
    /// Lowest flush timeout any channel asked for
    pub(crate) link_flush_tout: u16,
    /// Controller reported the link in sniff mode
    pub(crate) sniff: bool,
    /// Drop the ACL as soon as the last channel goes, skipping the idle timer
    pub(crate) disconnect_when_idle: bool,
    signal_id: u8,
}

impl Link {
    pub fn new(bd_addr: BdAddr) -> Self {
        Self {
            bd_addr,
            handle: None,
            state: LinkState::Connecting,
            w4_info_rsp: false,
            peer_ext_fea: ExtFeatures::empty(),
            channels: Vec::new(),
            rr_last: None,
            xmit_q: VecDeque::new(),
            link_flush_tout: 0xFFFF,
            sniff: false,
            disconnect_when_idle: false,
            signal_id: 0,
        }
    }

    pub fn bd_addr(&self) -> BdAddr {
        self.bd_addr
    }

    pub fn handle(&self) -> Option<u16> {
        self.handle
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn peer_ext_features(&self) -> ExtFeatures {
        self.peer_ext_fea
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Next signaling identifier; 0 is never used
    pub(crate) fn next_signal_id(&mut self) -> u8 {
        self.signal_id = self.signal_id.wrapping_add(1);
        if self.signal_id == 0 {
            self.signal_id = 1;
        }
        self.signal_id
    }

    pub(crate) fn add_channel(&mut self, cid: ChannelId) {
        if !self.channels.contains(&cid) {
            self.channels.push(cid);
        }
    }

    pub(crate) fn remove_channel(&mut self, cid: ChannelId) {
        self.channels.retain(|c| *c != cid);
        if self.rr_last == Some(cid) {
            self.rr_last = None;
        }
    }

    pub(crate) fn enqueue(&mut self, cid: ChannelId, data: Vec<u8>, flushable: bool) {
        trace!(
            "Link {} queue PDU for CID 0x{:04x}: {}",
            self.bd_addr,
            cid,
            hex::encode(&data)
        );
        self.xmit_q.push_back(QueuedPdu {
            cid,
            data,
            flushable,
        });
    }

    /// Drop PDUs a channel queued on the link and that have not gone out yet
    pub(crate) fn remove_channel_pdus(&mut self, cid: ChannelId) {
        self.xmit_q.retain(|pdu| pdu.cid != cid);
    }

    /// Channels in round-robin order, starting after the last one served
    pub(crate) fn round_robin_order(&self) -> Vec<ChannelId> {
        let start = self
            .rr_last
            .and_then(|last| self.channels.iter().position(|c| *c == last))
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let n = self.channels.len();
        (0..n).map(|i| self.channels[(start + i) % n]).collect()
    }

    pub(crate) fn set_served(&mut self, cid: ChannelId) {
        self.rr_last = Some(cid);
    }
}
