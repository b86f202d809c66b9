//! L2CAP Core Manager implementation
//!
//! This module provides the core L2CAP manager that handles:
//! - PSM registration and the upper API
//! - Link lifecycle and the extended features exchange
//! - Routing of inbound ACL data and signaling commands
//! - The link transmit path shared by all channels of a link
//!
//! The manager is single threaded. It owns every channel and link record
//! and the collaborators it talks to; the caller drives it from one event
//! loop, feeding in HCI events, ACL data and timer expiries.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use super::channel::{ChannelConfig, L2capChannel, TxSdu};
use super::config::{OurReqVerdict, PeerCfgResult};
use super::constants::*;
use super::csm::{security_event, L2capEvent, Upper};
use super::fcr::{FcrAction, FcrContext};
use super::link::{AclScheduler, Link, LinkState, QueuedPdu};
use super::packet::{encode_basic_pdu, FlushPolicy, L2capHeader};
use super::psm::{L2capCallbacks, Registration, PSM};
use super::security::{SecurityManager, SecurityStatus};
use super::signaling::SignalingMessage;
use super::timer::{TimerId, TimerService};
use super::types::*;
use crate::hci::constants::{
    HCI_ERR_CONNECTION_EXISTS, HCI_ERR_PEER_USER, HCI_PKT_TYPES_MASK_DM1_DH1_DM3_DH3_DM5_DH5,
};
use crate::hci::{AclPacket, CommandSender, HciCommand, PacketBoundary};

/// Outcome of an accepted data write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataWriteStatus {
    /// Queued
    Success,
    /// Queued, but the channel is now over its buffer quota
    Congested,
}

/// Client notification collected while the link transmit path runs
enum TxNotice {
    Congestion(ChannelId, bool),
    TxComplete(ChannelId, u16),
}

/// L2CAP Manager responsible for handling L2CAP operations
pub struct L2capManager {
    /// Channels mapped by local CID
    pub(crate) channels: HashMap<ChannelId, L2capChannel>,

    /// ACL links mapped by remote address
    pub(crate) links: HashMap<BdAddr, Link>,

    /// Registered PSMs
    registrations: HashMap<u16, Registration>,

    /// Next dynamic CID to try
    next_cid: ChannelId,

    /// Channel events waiting for the state machine
    pub(crate) pending: VecDeque<(ChannelId, L2capEvent)>,

    /// Set while the state machine drains `pending`
    pub(crate) dispatching: bool,

    pub(crate) timers: Box<dyn TimerService>,
    pub(crate) security: Box<dyn SecurityManager>,
    hci: Box<dyn CommandSender>,
    scheduler: Box<dyn AclScheduler>,
    pub(crate) config: L2capConfig,
}

impl L2capManager {
    /// Create a new L2CAP manager
    pub fn new(
        config: L2capConfig,
        timers: Box<dyn TimerService>,
        security: Box<dyn SecurityManager>,
        hci: Box<dyn CommandSender>,
        scheduler: Box<dyn AclScheduler>,
    ) -> Self {
        Self {
            channels: HashMap::new(),
            links: HashMap::new(),
            registrations: HashMap::new(),
            next_cid: L2CAP_BASE_APPL_CID,
            pending: VecDeque::new(),
            dispatching: false,
            timers,
            security,
            hci,
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> &L2capConfig {
        &self.config
    }

    pub fn channel(&self, cid: ChannelId) -> Option<&L2capChannel> {
        self.channels.get(&cid)
    }

    pub fn link(&self, bd_addr: BdAddr) -> Option<&Link> {
        self.links.get(&bd_addr)
    }

    pub fn registration(&self, psm: u16) -> Option<&Registration> {
        self.registrations.get(&psm)
    }

    /// Register a PSM with callbacks
    pub fn register(
        &mut self,
        psm: u16,
        callbacks: Arc<dyn L2capCallbacks>,
        ertm_info: ErtmInfo,
    ) -> L2capResult<u16> {
        if !PSM::from_value(psm).is_valid() {
            return Err(L2capError::InvalidParameter(format!(
                "Invalid PSM value: 0x{:04x}",
                psm
            )));
        }
        check_ertm_info(&ertm_info)?;

        if self.registrations.contains_key(&psm) {
            warn!("PSM 0x{:04x} already registered, replacing callbacks", psm);
        }
        self.registrations.insert(
            psm,
            Registration {
                psm,
                callbacks,
                ertm_info,
                max_rx_mtu: self.config.max_rx_mtu,
            },
        );

        info!("Registered {} ({})", PSM::from_value(psm), ertm_info.preferred_mode);
        Ok(psm)
    }

    /// Unregister a PSM, disconnecting the channels still using it
    pub fn deregister(&mut self, psm: u16) -> L2capResult<()> {
        if !self.registrations.contains_key(&psm) {
            return Err(L2capError::PsmNotRegistered(psm));
        }

        let mut cids: Vec<ChannelId> = self
            .channels
            .values()
            .filter(|ch| ch.psm == psm && !is_disconnecting(ch.state))
            .map(|ch| ch.local_cid)
            .collect();
        cids.sort_unstable();
        for cid in cids {
            self.execute(cid, L2capEvent::DisconnectReq);
        }

        self.registrations.remove(&psm);
        info!("Unregistered PSM 0x{:04x}", psm);
        Ok(())
    }

    /// Open a channel to `bd_addr` with the mode preferences given at
    /// registration
    pub fn connect_req(&mut self, bd_addr: BdAddr, psm: u16) -> L2capResult<ChannelId> {
        let ertm_info = self
            .registrations
            .get(&psm)
            .map(|reg| reg.ertm_info)
            .ok_or(L2capError::PsmNotRegistered(psm))?;
        self.ertm_connect_req(bd_addr, psm, ertm_info)
    }

    /// Open a channel to `bd_addr` with explicit mode preferences.
    ///
    /// The ACL link is created when there is none; the connection proceeds
    /// once it is up.
    pub fn ertm_connect_req(
        &mut self,
        bd_addr: BdAddr,
        psm: u16,
        ertm_info: ErtmInfo,
    ) -> L2capResult<ChannelId> {
        let max_rx_mtu = self
            .registrations
            .get(&psm)
            .map(|reg| reg.max_rx_mtu)
            .ok_or(L2capError::PsmNotRegistered(psm))?;
        check_ertm_info(&ertm_info)?;

        let cid = self.alloc_ccb(bd_addr, psm)?;
        if let Some(ch) = self.channels.get_mut(&cid) {
            ch.ertm_info = ertm_info;
            ch.max_rx_mtu = max_rx_mtu;
        }
        info!(
            "Connecting CID 0x{:04x} to {} PSM 0x{:04x} ({})",
            cid, bd_addr, psm, ertm_info.preferred_mode
        );

        let link_state = self.links.get(&bd_addr).map(|link| link.state);
        match link_state {
            Some(LinkState::Connected) => self.execute(cid, L2capEvent::ConnectReq),
            Some(_) => debug!("Link to {} not up yet, CID 0x{:04x} waits", bd_addr, cid),
            None => {
                self.links.insert(bd_addr, Link::new(bd_addr));
                if let Some(link) = self.links.get_mut(&bd_addr) {
                    link.add_channel(cid);
                }
                self.create_connection(bd_addr);
            }
        }
        Ok(cid)
    }

    /// Answer a connect indication
    pub fn connect_rsp(&mut self, cid: ChannelId, result: u16, status: u16) -> L2capResult<()> {
        self.channel_or_err(cid)?;
        let event = if result == L2CAP_CONN_OK || result == L2CAP_CONN_PENDING {
            L2capEvent::ConnectRsp { result, status }
        } else {
            L2capEvent::ConnectRspNeg { result, status }
        };
        self.execute(cid, event);
        Ok(())
    }

    /// Send our Configure Request
    pub fn config_req(&mut self, cid: ChannelId, mut cfg: ConfigInfo) -> L2capResult<()> {
        let bd_addr = self.channel_or_err(cid)?.link;
        let peer_ext_fea = self
            .links
            .get(&bd_addr)
            .map_or(ExtFeatures::empty(), |link| link.peer_ext_fea);

        let Some(ch) = self.channels.get_mut(&cid) else {
            return Err(L2capError::ChannelNotFound(cid));
        };
        match ch.adj_our_req_options(peer_ext_fea, &mut cfg, &self.config) {
            OurReqVerdict::Ok => {}
            OurReqVerdict::Invalid => {
                return Err(L2capError::InvalidParameter(
                    "Configuration exceeds local buffers".to_string(),
                ));
            }
            OurReqVerdict::Disconnect => {
                let upper = self.upper(cid);
                self.disconnect_chnl(cid, &upper);
                return Err(L2capError::ProtocolError(
                    "No channel mode in common with peer".to_string(),
                ));
            }
        }

        if cfg.mode() == RetransmissionMode::Basic {
            cfg.fcs = None;
            cfg.ext_flow_spec = None;
            if let Some(mtu) = cfg.mtu.as_mut() {
                *mtu = (*mtu).min(L2CAP_MTU_SIZE);
            }
        }

        // Mode stays fixed across reconfiguration
        let fcr = ch.our_cfg.fcr;
        ch.our_cfg = ChannelConfig::from_info(&cfg);
        if ch.config_done.contains(ConfigDone::RECONFIG) {
            ch.our_cfg.fcr = fcr;
        }

        self.execute(cid, L2capEvent::ConfigReq(cfg));
        Ok(())
    }

    /// Answer the peer's Configure Request
    pub fn config_rsp(&mut self, cid: ChannelId, mut cfg: ConfigInfo) -> L2capResult<()> {
        let Some(ch) = self.channels.get_mut(&cid) else {
            return Err(L2capError::ChannelNotFound(cid));
        };

        if cfg.result == L2CAP_CFG_OK || cfg.result == L2CAP_CFG_PENDING {
            self.execute(cid, L2capEvent::ConfigRsp(cfg));
        } else {
            // FCR was settled during negotiation; forget refused options
            cfg.fcr = None;
            if cfg.mtu.is_some() {
                ch.peer_cfg.mtu_present = false;
            }
            if cfg.flush_to.is_some() {
                ch.peer_cfg.flush_to_present = false;
            }
            if cfg.qos.is_some() {
                ch.peer_cfg.qos_present = false;
            }
            self.execute(cid, L2capEvent::ConfigRspNeg(cfg));
        }
        Ok(())
    }

    pub fn disconnect_req(&mut self, cid: ChannelId) -> L2capResult<()> {
        self.channel_or_err(cid)?;
        self.execute(cid, L2capEvent::DisconnectReq);
        Ok(())
    }

    pub fn disconnect_rsp(&mut self, cid: ChannelId) -> L2capResult<()> {
        self.channel_or_err(cid)?;
        self.execute(cid, L2capEvent::DisconnectRsp);
        Ok(())
    }

    /// Queue one SDU for sending
    pub fn data_write(
        &mut self,
        cid: ChannelId,
        data: Vec<u8>,
        flush: FlushPolicy,
    ) -> L2capResult<DataWriteStatus> {
        let ch = self.channel_or_err(cid)?;
        if data.len() > ch.peer_mtu() as usize {
            return Err(L2capError::MtuExceeded {
                len: data.len(),
                mtu: ch.peer_mtu(),
            });
        }
        if ch.is_congested() {
            debug!("L2CAP CID 0x{:04x} congested, refusing {} bytes", cid, data.len());
            return Err(L2capError::NoResources);
        }

        self.execute(cid, L2capEvent::DataWrite(TxSdu::new(data, flush)));

        match self.channels.get(&cid) {
            Some(ch) if ch.is_congested() => Ok(DataWriteStatus::Congested),
            _ => Ok(DataWriteStatus::Success),
        }
    }

    /// Enter or leave the ERTM local busy condition
    pub fn set_local_busy(&mut self, cid: ChannelId, busy: bool) -> L2capResult<()> {
        let ch = self.channel_or_err(cid)?;
        if ch.peer_mode() != RetransmissionMode::EnhancedRetransmission {
            return Err(L2capError::InvalidParameter(format!(
                "CID 0x{:04x} is not in ERTM",
                cid
            )));
        }
        self.fcr_op(cid, |ch, ctx| ch.fcr_set_local_busy(ctx, busy));
        Ok(())
    }

    /// Default flushability of packets queued with [`FlushPolicy::ChannelBased`]
    pub fn set_flushable(&mut self, cid: ChannelId, flushable: bool) -> L2capResult<()> {
        let Some(ch) = self.channels.get_mut(&cid) else {
            return Err(L2capError::ChannelNotFound(cid));
        };
        ch.is_flushable = flushable;
        Ok(())
    }

    /// Asynchronous answer to a security access request
    pub fn security_complete(&mut self, cid: ChannelId, status: SecurityStatus) {
        match security_event(status) {
            Some(event) => self.execute(cid, event),
            None => debug!("L2CAP CID 0x{:04x} security still in progress", cid),
        }
    }

    /// Re-issue the security requests of every channel on a link
    pub fn resubmit_security(&mut self, bd_addr: BdAddr) {
        for cid in self.link_channels(bd_addr) {
            self.execute(cid, L2capEvent::SecReSend);
        }
    }

    /// ACL link to `bd_addr` is up
    pub fn link_connected(&mut self, handle: u16, bd_addr: BdAddr) {
        info!("ACL link to {} up, handle 0x{:04x}", bd_addr, handle);
        let link = self.links.entry(bd_addr).or_insert_with(|| Link::new(bd_addr));
        link.handle = Some(handle);
        link.state = LinkState::Connected;
        link.sniff = false;

        // Learn the peer's modes before any channel picks one
        link.w4_info_rsp = true;
        let identifier = link.next_signal_id();
        let request = SignalingMessage::InformationRequest {
            identifier,
            info_type: L2CAP_INFO_TYPE_EXTENDED_FEATURES,
        };
        link.enqueue(0, request.to_pdu(), false);
        self.timers.start(TimerId::Info(bd_addr), self.config.info_timeout);

        let cids = self.link_channels(bd_addr);
        if cids.is_empty() {
            self.timers.start(TimerId::Link(bd_addr), self.config.link_idle_timeout);
        }
        for cid in cids {
            self.execute(cid, L2capEvent::LpConnectCfm);
        }
        self.check_send(bd_addr);
    }

    /// ACL link setup to `bd_addr` failed
    pub fn link_connect_failed(&mut self, bd_addr: BdAddr, status: u8) {
        warn!("ACL link to {} failed, status 0x{:02x}", bd_addr, status);
        for cid in self.link_channels(bd_addr) {
            self.execute(cid, L2capEvent::LpConnectCfmNeg(status));
        }
        if status != HCI_ERR_CONNECTION_EXISTS {
            self.remove_link(bd_addr);
        }
    }

    /// ACL link went down
    pub fn link_disconnected(&mut self, handle: u16, reason: u8) {
        let Some(bd_addr) = self.bd_addr_for_handle(handle) else {
            debug!("Disconnect for unknown handle 0x{:04x}", handle);
            return;
        };
        info!(
            "ACL link to {} down, handle 0x{:04x} reason 0x{:02x}",
            bd_addr, handle, reason
        );

        for cid in self.link_channels(bd_addr) {
            self.execute(cid, L2capEvent::LpDisconnectInd(Some(reason)));
        }

        self.timers.stop(TimerId::Info(bd_addr));
        self.timers.stop(TimerId::Link(bd_addr));
        let retry = match self.links.get_mut(&bd_addr) {
            Some(link) if !link.channels.is_empty() => {
                link.handle = None;
                link.state = LinkState::Connecting;
                link.w4_info_rsp = false;
                link.sniff = false;
                link.xmit_q.clear();
                true
            }
            _ => false,
        };
        if retry {
            debug!("Channels remain on {}, reconnecting", bd_addr);
            self.create_connection(bd_addr);
        } else {
            self.remove_link(bd_addr);
        }
    }

    /// Controller reported a QoS violation on a link
    pub fn qos_violation(&mut self, handle: u16) {
        let Some(bd_addr) = self.bd_addr_for_handle(handle) else {
            return;
        };
        for cid in self.link_channels(bd_addr) {
            self.execute(cid, L2capEvent::LpQosViolationInd);
        }
    }

    /// Controller reported a power mode change
    pub fn link_power_mode_changed(&mut self, handle: u16, sniff: bool) {
        if let Some(link) = self.links.values_mut().find(|link| link.handle == Some(handle)) {
            trace!("Link {} sniff {}", link.bd_addr, sniff);
            link.sniff = sniff;
        }
    }

    /// Controller freed ACL buffers; resume sending
    pub fn acl_buffers_available(&mut self, handle: u16) {
        if let Some(bd_addr) = self.bd_addr_for_handle(handle) {
            self.check_send(bd_addr);
        }
    }

    /// A timer armed through the timer service fired
    pub fn timer_expired(&mut self, id: TimerId) {
        trace!("Timer {:?} expired", id);
        match id {
            TimerId::Channel(cid) | TimerId::MonitorRetrans(cid) => {
                self.execute(cid, L2capEvent::Timeout)
            }
            TimerId::Ack(cid) => self.execute(cid, L2capEvent::AckTimeout),
            TimerId::Info(bd_addr) => self.info_timeout(bd_addr),
            TimerId::Link(bd_addr) => self.link_idle_timeout(bd_addr),
        }
    }

    /// Process a raw HCI ACL data packet (packet indicator stripped) carrying
    /// one complete L2CAP PDU
    pub fn receive_acl_packet(&mut self, packet: &[u8]) -> L2capResult<()> {
        let acl = AclPacket::parse(packet)?;
        if acl.boundary == PacketBoundary::Continuation {
            return Err(L2capError::MalformedFrame(
                "Continuation fragment without a start".to_string(),
            ));
        }
        self.receive_acl(acl.handle, &acl.data)
    }

    /// Process one reassembled L2CAP PDU received on an ACL link
    pub fn receive_acl(&mut self, handle: u16, data: &[u8]) -> L2capResult<()> {
        let bd_addr = self
            .bd_addr_for_handle(handle)
            .ok_or_else(|| L2capError::InvalidParameter(format!("Unknown handle 0x{:04x}", handle)))?;

        let header = L2capHeader::parse(data)
            .ok_or_else(|| L2capError::MalformedFrame("Packet too short for L2CAP header".to_string()))?;
        let end = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
        if data.len() < end {
            return Err(L2capError::MalformedFrame(format!(
                "Length {} exceeds packet size {}",
                header.length,
                data.len() - L2CAP_BASIC_HEADER_SIZE
            )));
        }
        trace!(
            "Received L2CAP packet: CID=0x{:04x}, len={}",
            header.channel_id,
            header.length
        );

        match header.channel_id {
            L2CAP_SIGNALING_CID => {
                self.process_signaling(bd_addr, &data[L2CAP_BASIC_HEADER_SIZE..end]);
            }
            cid if cid >= L2CAP_BASE_APPL_CID => self.process_channel_data(bd_addr, cid, &data[..end]),
            cid => debug!("Dropping PDU for unsupported CID 0x{:04x}", cid),
        }
        Ok(())
    }

    fn process_channel_data(&mut self, bd_addr: BdAddr, cid: ChannelId, pdu: &[u8]) {
        let Some(ch) = self.channels.get(&cid).filter(|ch| ch.link == bd_addr) else {
            debug!("Dropping PDU for unknown CID 0x{:04x}", cid);
            return;
        };

        let fcr_mode = ch.peer_mode() != RetransmissionMode::Basic
            && matches!(ch.state, ChannelState::Open | ChannelState::Config);
        if fcr_mode {
            self.fcr_op(cid, |ch, ctx| ch.fcr_proc_pdu(ctx, pdu));
        } else {
            let payload = pdu[L2CAP_BASIC_HEADER_SIZE..].to_vec();
            self.execute(cid, L2capEvent::PeerData(payload));
        }
    }

    fn process_signaling(&mut self, bd_addr: BdAddr, data: &[u8]) {
        for (header, raw) in SignalingMessage::split_commands(data) {
            match SignalingMessage::parse(raw) {
                Ok(message) => {
                    trace!("Signaling from {}: {:?}", bd_addr, message);
                    self.process_signal(bd_addr, message);
                }
                Err(e) => {
                    warn!("Bad signaling command 0x{:02x} from {}: {}", header.code, bd_addr, e);
                    self.send_signal(
                        bd_addr,
                        SignalingMessage::CommandReject {
                            identifier: header.identifier,
                            reason: L2CAP_CMD_REJ_NOT_UNDERSTOOD,
                            data: Vec::new(),
                        },
                    );
                }
            }
        }
    }

    fn process_signal(&mut self, bd_addr: BdAddr, message: SignalingMessage) {
        match message {
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => self.process_connection_request(bd_addr, identifier, psm, source_cid),
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid,
                source_cid,
                result,
                status,
            } => {
                let Some(cid) = self.find_ccb(bd_addr, source_cid).filter(|cid| {
                    self.channels.get(cid).is_some_and(|ch| ch.local_id == identifier)
                }) else {
                    warn!("Connection response for unknown CID 0x{:04x}", source_cid);
                    return;
                };
                debug!(
                    "L2CAP CID 0x{:04x} connect response result 0x{:04x} status 0x{:04x}",
                    cid, result, status
                );
                let event = match result {
                    L2CAP_CONN_OK => L2capEvent::PeerConnectRsp {
                        remote_cid: destination_cid,
                    },
                    L2CAP_CONN_PENDING => L2capEvent::PeerConnectRspPnd {
                        remote_cid: destination_cid,
                    },
                    result => L2capEvent::PeerConnectRspNeg { result },
                };
                self.execute(cid, event);
            }
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid,
                config,
                unknown,
                ..
            } => {
                let Some(cid) = self.find_ccb(bd_addr, destination_cid) else {
                    warn!("Configure request for unknown CID 0x{:04x}", destination_cid);
                    let mut data = Vec::with_capacity(4);
                    data.extend_from_slice(&destination_cid.to_le_bytes());
                    data.extend_from_slice(&0u16.to_le_bytes());
                    self.send_signal(
                        bd_addr,
                        SignalingMessage::CommandReject {
                            identifier,
                            reason: L2CAP_CMD_REJ_INVALID_CID,
                            data,
                        },
                    );
                    return;
                };
                if let Some(ch) = self.channels.get_mut(&cid) {
                    ch.remote_id = identifier;
                }
                if unknown.is_empty() {
                    self.execute(cid, L2capEvent::PeerConfigReq(config));
                } else {
                    self.send_config_reject(cid, unknown);
                }
            }
            SignalingMessage::ConfigureResponse {
                identifier,
                source_cid,
                result,
                config,
                ..
            } => {
                let Some(cid) = self.find_ccb(bd_addr, source_cid).filter(|cid| {
                    self.channels.get(cid).is_some_and(|ch| ch.local_id == identifier)
                }) else {
                    warn!("Configure response for unknown CID 0x{:04x}", source_cid);
                    return;
                };
                let event = if result == L2CAP_CFG_OK || result == L2CAP_CFG_PENDING {
                    L2capEvent::PeerConfigRsp(config)
                } else {
                    L2capEvent::PeerConfigRspNeg(config)
                };
                self.execute(cid, event);
            }
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid,
                source_cid,
            } => match self.find_ccb(bd_addr, destination_cid) {
                Some(cid) => {
                    let Some(ch) = self.channels.get_mut(&cid) else {
                        return;
                    };
                    if ch.remote_cid != source_cid {
                        warn!(
                            "Disconnect request for CID 0x{:04x} with wrong remote CID 0x{:04x}",
                            cid, source_cid
                        );
                        return;
                    }
                    ch.remote_id = identifier;
                    self.execute(cid, L2capEvent::PeerDisconnectReq);
                }
                None => self.send_signal(
                    bd_addr,
                    SignalingMessage::DisconnectionResponse {
                        identifier,
                        destination_cid,
                        source_cid,
                    },
                ),
            },
            SignalingMessage::DisconnectionResponse {
                identifier,
                destination_cid,
                source_cid,
            } => {
                let matched = self.find_ccb(bd_addr, source_cid).filter(|cid| {
                    self.channels
                        .get(cid)
                        .is_some_and(|ch| ch.remote_cid == destination_cid && ch.local_id == identifier)
                });
                match matched {
                    Some(cid) => self.execute(cid, L2capEvent::PeerDisconnectRsp),
                    None => debug!("Stale disconnect response for CID 0x{:04x}", source_cid),
                }
            }
            SignalingMessage::InformationRequest {
                identifier,
                info_type,
            } => self.send_info_rsp(bd_addr, identifier, info_type),
            SignalingMessage::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                if info_type != L2CAP_INFO_TYPE_EXTENDED_FEATURES {
                    debug!("Ignoring information response type 0x{:04x}", info_type);
                    return;
                }
                let features = (result == L2CAP_INFO_RESP_RESULT_SUCCESS && data.len() >= 4)
                    .then(|| u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
                self.info_rsp_received(bd_addr, features);
            }
            SignalingMessage::CommandReject { reason, .. } => {
                let w4_info_rsp = self.links.get(&bd_addr).is_some_and(|link| link.w4_info_rsp);
                if w4_info_rsp && reason == L2CAP_CMD_REJ_NOT_UNDERSTOOD {
                    // Peer predates the information exchange
                    self.info_rsp_received(bd_addr, None);
                } else {
                    debug!("Command reject from {}, reason 0x{:04x}", bd_addr, reason);
                }
            }
        }
    }

    fn process_connection_request(&mut self, bd_addr: BdAddr, identifier: u8, psm: u16, source_cid: u16) {
        let Some(reg) = self.registrations.get(&psm) else {
            warn!("Connection request for unregistered PSM 0x{:04x}", psm);
            self.send_reject_connection(bd_addr, identifier, source_cid, L2CAP_CONN_NO_PSM);
            return;
        };
        let (ertm_info, max_rx_mtu) = (reg.ertm_info, reg.max_rx_mtu);

        let cid = match self.alloc_ccb(bd_addr, psm) {
            Ok(cid) => cid,
            Err(e) => {
                error!("No channel for PSM 0x{:04x} from {}: {}", psm, bd_addr, e);
                self.send_reject_connection(bd_addr, identifier, source_cid, L2CAP_CONN_NO_RESOURCES);
                return;
            }
        };
        if let Some(ch) = self.channels.get_mut(&cid) {
            ch.remote_id = identifier;
            ch.remote_cid = source_cid;
            ch.ertm_info = ertm_info;
            ch.max_rx_mtu = max_rx_mtu;
        }
        info!(
            "Incoming connection on PSM 0x{:04x} from {}: CID 0x{:04x} (remote 0x{:04x})",
            psm, bd_addr, cid, source_cid
        );
        self.execute(cid, L2capEvent::PeerConnectReq);
    }

    /// Extended features exchange finished on a link
    fn info_rsp_received(&mut self, bd_addr: BdAddr, features: Option<u32>) {
        self.timers.stop(TimerId::Info(bd_addr));
        let Some(link) = self.links.get_mut(&bd_addr) else {
            return;
        };
        if let Some(bits) = features {
            link.peer_ext_fea = ExtFeatures::from_bits_retain(bits);
        }
        link.w4_info_rsp = false;
        debug!("Link {} peer features {:?}", bd_addr, link.peer_ext_fea);

        for cid in self.link_channels(bd_addr) {
            self.execute(cid, L2capEvent::PeerInfoRsp);
        }
    }

    fn info_timeout(&mut self, bd_addr: BdAddr) {
        let cids = self.link_channels(bd_addr);
        let security_pending = cids.iter().any(|cid| {
            self.channels.get(cid).is_some_and(|ch| {
                matches!(ch.state, ChannelState::OrigW4SecComp | ChannelState::TermW4SecComp)
            })
        });
        if security_pending {
            debug!("Link {} info timeout during security, waiting longer", bd_addr);
            self.timers.start(TimerId::Info(bd_addr), self.config.info_timeout);
            return;
        }

        let Some(link) = self.links.get_mut(&bd_addr) else {
            return;
        };
        warn!("Link {} gave no information response", bd_addr);
        link.w4_info_rsp = false;
        if link.state == LinkState::Disconnecting {
            return;
        }
        for cid in cids {
            self.execute(cid, L2capEvent::PeerInfoRsp);
        }
    }

    fn link_idle_timeout(&mut self, bd_addr: BdAddr) {
        let Some(link) = self.links.get_mut(&bd_addr) else {
            return;
        };
        if !link.channels.is_empty() {
            return;
        }
        match link.handle.filter(|_| link.state == LinkState::Connected) {
            Some(handle) => {
                info!("Link {} idle, disconnecting", bd_addr);
                link.state = LinkState::Disconnecting;
                self.send_hci(HciCommand::Disconnect {
                    handle,
                    reason: HCI_ERR_PEER_USER,
                });
            }
            None if link.state != LinkState::Disconnecting => self.remove_link(bd_addr),
            None => {}
        }
    }

    fn remove_link(&mut self, bd_addr: BdAddr) {
        self.timers.stop(TimerId::Info(bd_addr));
        self.timers.stop(TimerId::Link(bd_addr));
        if self.links.remove(&bd_addr).is_some() {
            debug!("Link {} removed", bd_addr);
        }
    }

    fn create_connection(&mut self, bd_addr: BdAddr) {
        self.send_hci(HciCommand::CreateConnection {
            bd_addr: bd_addr.bytes,
            packet_type: HCI_PKT_TYPES_MASK_DM1_DH1_DM3_DH3_DM5_DH5,
            allow_role_switch: true,
        });
    }

    /// Allocate a channel control block on the link to `bd_addr`
    fn alloc_ccb(&mut self, bd_addr: BdAddr, psm: u16) -> L2capResult<ChannelId> {
        let span = (L2CAP_LAST_APPL_CID - L2CAP_BASE_APPL_CID) as u32 + 1;
        let mut candidate = self.next_cid;
        let mut found = None;
        for _ in 0..span {
            if !self.channels.contains_key(&candidate) {
                found = Some(candidate);
                break;
            }
            candidate = next_dynamic_cid(candidate);
        }
        let cid = found.ok_or(L2capError::NoResources)?;
        self.next_cid = next_dynamic_cid(cid);

        self.channels
            .insert(cid, L2capChannel::new(cid, bd_addr, psm, &self.config));
        if let Some(link) = self.links.get_mut(&bd_addr) {
            link.add_channel(cid);
            self.timers.stop(TimerId::Link(bd_addr));
        }
        Ok(cid)
    }

    /// Free a channel; the last channel of a link arms the idle timer
    pub(crate) fn release_ccb(&mut self, cid: ChannelId) {
        let Some(mut ch) = self.channels.remove(&cid) else {
            return;
        };
        debug!("L2CAP CID 0x{:04x} released in {}", cid, ch.state);
        self.timers.stop(TimerId::Channel(cid));
        ch.fcr_cleanup(self.timers.as_mut());

        let bd_addr = ch.link;
        let Some(link) = self.links.get_mut(&bd_addr) else {
            return;
        };
        link.remove_channel(cid);
        if !link.channels.is_empty() || link.state != LinkState::Connected {
            return;
        }

        match link.handle {
            Some(handle) if link.disconnect_when_idle => {
                info!("Link {} has no channels left, disconnecting now", bd_addr);
                link.state = LinkState::Disconnecting;
                self.send_hci(HciCommand::Disconnect {
                    handle,
                    reason: HCI_ERR_PEER_USER,
                });
            }
            _ => self.timers.start(TimerId::Link(bd_addr), self.config.link_idle_timeout),
        }
    }

    /// Tear a channel down without waiting for the peer
    pub(crate) fn disconnect_chnl(&mut self, cid: ChannelId, upper: &Upper) {
        self.send_disc_req(cid);
        self.release_ccb(cid);
        upper.disconnect_ind(cid, false);
    }

    pub(crate) fn upper(&self, cid: ChannelId) -> Upper {
        Upper::new(
            self.channels
                .get(&cid)
                .and_then(|ch| self.registrations.get(&ch.psm))
                .map(|reg| Arc::clone(&reg.callbacks)),
        )
    }

    pub(crate) fn start_chnl_timer(&mut self, cid: ChannelId, timeout: std::time::Duration) {
        self.timers.start(TimerId::Channel(cid), timeout);
    }

    pub(crate) fn stop_chnl_timer(&mut self, cid: ChannelId) {
        self.timers.stop(TimerId::Channel(cid));
    }

    /// Take the link out of sniff mode before talking to the peer
    pub(crate) fn exit_sniff(&mut self, cid: ChannelId) {
        let handle = self
            .channels
            .get(&cid)
            .and_then(|ch| self.links.get(&ch.link))
            .filter(|link| link.sniff)
            .and_then(|link| link.handle);
        if let Some(handle) = handle {
            self.send_hci(HciCommand::ExitSniffMode { handle });
        }
    }

    pub(crate) fn send_hci(&mut self, command: HciCommand) {
        debug!("HCI command {:?}", command);
        if let Err(e) = self.hci.send_command(command) {
            error!("Failed to send HCI command: {}", e);
        }
    }

    pub(crate) fn peer_cfg_req(&mut self, cid: ChannelId, cfg: &mut ConfigInfo) -> Option<PeerCfgResult> {
        let ch = self.channels.get_mut(&cid)?;
        let link = self.links.get_mut(&ch.link)?;
        Some(ch.process_peer_cfg_req(link, cfg, &self.config))
    }

    /// Record the Configure Request about to go out and program a lowered
    /// flush timeout into the controller
    pub(crate) fn apply_our_cfg_req(&mut self, cid: ChannelId, cfg: &mut ConfigInfo) {
        let Some(ch) = self.channels.get_mut(&cid) else {
            return;
        };
        let Some(link) = self.links.get_mut(&ch.link) else {
            return;
        };
        let handle = link.handle;
        if let (Some(timeout), Some(handle)) = (ch.process_our_cfg_req(link, cfg), handle) {
            self.send_hci(HciCommand::WriteAutomaticFlushTimeout { handle, timeout });
        }
    }

    /// Put an SDU on a channel's hold queue
    pub(crate) fn enqueue_sdu(&mut self, cid: ChannelId, mut sdu: TxSdu, upper: &Upper) {
        let Some(ch) = self.channels.get_mut(&cid) else {
            return;
        };
        if ch.peer_mode() == RetransmissionMode::Basic {
            sdu.data = encode_basic_pdu(ch.remote_cid, &sdu.data);
        }
        trace!(
            "L2CAP CID 0x{:04x} queue SDU of {} bytes, {} held",
            cid,
            sdu.data.len(),
            ch.xmit_hold_q.len()
        );
        ch.xmit_hold_q.push_back(sdu);
        if let Some(congested) = ch.check_congestion() {
            upper.congestion_status(cid, congested);
        }
    }

    /// Run the FCR engine on one channel and apply what it asks for
    pub(crate) fn fcr_op(&mut self, cid: ChannelId, f: impl FnOnce(&mut L2capChannel, &mut FcrContext<'_>)) {
        let actions = {
            let Some(ch) = self.channels.get_mut(&cid) else {
                return;
            };
            let Some(link) = self.links.get_mut(&ch.link) else {
                return;
            };
            let mut ctx = FcrContext::new(link, self.timers.as_mut(), &self.config);
            f(ch, &mut ctx);
            ctx.into_actions()
        };
        self.apply_fcr_actions(cid, actions);
    }

    fn apply_fcr_actions(&mut self, cid: ChannelId, actions: Vec<FcrAction>) {
        for action in actions {
            match action {
                FcrAction::CheckSend => {
                    if let Some(bd_addr) = self.channels.get(&cid).map(|ch| ch.link) {
                        self.check_send(bd_addr);
                    }
                }
                FcrAction::TxComplete(count) => self.upper(cid).tx_complete(cid, count),
                FcrAction::Deliver(sdu) => self.execute(cid, L2capEvent::PeerData(sdu)),
                FcrAction::Disconnect => {
                    let upper = self.upper(cid);
                    self.disconnect_chnl(cid, &upper);
                    break;
                }
            }
        }
    }

    /// Send whatever the controller has room for: the link queue first,
    /// then one PDU per channel in round-robin order
    pub(crate) fn check_send(&mut self, bd_addr: BdAddr) {
        let mut notices = Vec::new();

        loop {
            let Some(link) = self.links.get_mut(&bd_addr) else {
                break;
            };
            let Some(handle) = link.handle.filter(|_| link.state == LinkState::Connected) else {
                break;
            };
            if self.scheduler.xmit_window(handle) == 0 {
                trace!("Link {} has no ACL buffers", bd_addr);
                break;
            }

            let queued = link.xmit_q.pop_front();
            let (data, flushable, owner) = match queued {
                Some(QueuedPdu { cid, data, flushable }) => {
                    if let Some(ch) = self.channels.get(&cid) {
                        if ch.peer_mode() != RetransmissionMode::EnhancedRetransmission {
                            notices.push(TxNotice::TxComplete(cid, 1));
                        }
                    }
                    (data, flushable, cid)
                }
                None => match self.next_channel_pdu(bd_addr, &mut notices) {
                    Some(next) => next,
                    None => break,
                },
            };

            let boundary = if flushable {
                PacketBoundary::StartFlushable
            } else {
                PacketBoundary::StartNonFlushable
            };
            trace!(
                "Link {} send {} bytes for CID 0x{:04x}",
                bd_addr,
                data.len(),
                owner
            );
            if let Err(e) = self.scheduler.transmit(AclPacket::new(handle, boundary, data)) {
                warn!("Link {} ACL transmit failed: {}", bd_addr, e);
                break;
            }
        }

        for notice in notices {
            match notice {
                TxNotice::Congestion(cid, congested) => self.upper(cid).congestion_status(cid, congested),
                TxNotice::TxComplete(cid, count) => self.upper(cid).tx_complete(cid, count),
            }
        }
    }

    /// Next PDU from the channels of a link, served round robin
    fn next_channel_pdu(
        &mut self,
        bd_addr: BdAddr,
        notices: &mut Vec<TxNotice>,
    ) -> Option<(Vec<u8>, bool, ChannelId)> {
        let order = self.links.get(&bd_addr)?.round_robin_order();

        for cid in order {
            let Some(ch) = self.channels.get_mut(&cid) else {
                continue;
            };
            if ch.state != ChannelState::Open {
                continue;
            }
            let held = ch.xmit_hold_q.len();

            let next = if ch.peer_mode() != RetransmissionMode::Basic {
                if ch.fcrb.wait_ack || ch.fcrb.remote_busy {
                    continue;
                }
                if ch.fcrb.retrans_q.is_empty() && (held == 0 || ch.is_flow_controlled()) {
                    continue;
                }
                let link = self.links.get_mut(&bd_addr)?;
                let mut ctx = FcrContext::new(link, self.timers.as_mut(), &self.config);
                // Engine requests are moot here: the pump is already running
                ch.get_next_xmit_sdu_seg(&mut ctx)
            } else {
                ch.xmit_hold_q.pop_front().map(|sdu| (sdu.data, sdu.tag.flush))
            };
            let Some((data, flush)) = next else {
                continue;
            };

            if ch.xmit_hold_q.len() != held {
                if let Some(congested) = ch.check_congestion() {
                    notices.push(TxNotice::Congestion(cid, congested));
                }
            }
            if ch.peer_mode() != RetransmissionMode::EnhancedRetransmission {
                notices.push(TxNotice::TxComplete(cid, 1));
            }
            let flushable = ch.is_pdu_flushable(flush);

            if let Some(link) = self.links.get_mut(&bd_addr) {
                link.set_served(cid);
            }
            return Some((data, flushable, cid));
        }
        None
    }

    fn send_signal(&mut self, bd_addr: BdAddr, message: SignalingMessage) {
        let Some(link) = self.links.get_mut(&bd_addr) else {
            return;
        };
        trace!("Signaling to {}: {:?}", bd_addr, message);
        link.enqueue(0, message.to_pdu(), false);
        self.check_send(bd_addr);
    }

    /// Allocate a signaling identifier for a request on the channel's link
    fn next_local_id(&mut self, cid: ChannelId) -> Option<(BdAddr, u8, ChannelId)> {
        let ch = self.channels.get_mut(&cid)?;
        let link = self.links.get_mut(&ch.link)?;
        ch.local_id = link.next_signal_id();
        Some((ch.link, ch.local_id, ch.remote_cid))
    }

    pub(crate) fn send_connect_req(&mut self, cid: ChannelId) {
        let Some(psm) = self.channels.get(&cid).map(|ch| ch.psm) else {
            return;
        };
        let Some((bd_addr, identifier, _)) = self.next_local_id(cid) else {
            return;
        };
        self.send_signal(
            bd_addr,
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid: cid,
            },
        );
    }

    pub(crate) fn send_connect_rsp(&mut self, cid: ChannelId, result: u16, status: u16) {
        let Some(ch) = self.channels.get_mut(&cid) else {
            return;
        };
        if result == L2CAP_CONN_PENDING {
            // One "pending" per connection is enough
            if ch.sent_pending {
                return;
            }
            ch.sent_pending = true;
        }
        let message = SignalingMessage::ConnectionResponse {
            identifier: ch.remote_id,
            destination_cid: cid,
            source_cid: ch.remote_cid,
            result,
            status,
        };
        let bd_addr = ch.link;
        self.send_signal(bd_addr, message);
    }

    fn send_reject_connection(&mut self, bd_addr: BdAddr, identifier: u8, remote_cid: u16, result: u16) {
        self.send_signal(
            bd_addr,
            SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: 0,
                source_cid: remote_cid,
                result,
                status: L2CAP_CONN_STATUS_NONE,
            },
        );
    }

    pub(crate) fn send_config_req(&mut self, cid: ChannelId, cfg: &ConfigInfo) {
        let Some((bd_addr, identifier, remote_cid)) = self.next_local_id(cid) else {
            return;
        };
        self.send_signal(
            bd_addr,
            SignalingMessage::ConfigureRequest {
                identifier,
                destination_cid: remote_cid,
                flags: cfg.flags,
                config: cfg.clone(),
                unknown: Vec::new(),
            },
        );
    }

    pub(crate) fn send_config_rsp(&mut self, cid: ChannelId, cfg: &ConfigInfo) {
        let Some(ch) = self.channels.get(&cid) else {
            return;
        };
        let message = SignalingMessage::ConfigureResponse {
            identifier: ch.remote_id,
            source_cid: ch.remote_cid,
            flags: cfg.flags,
            result: cfg.result,
            config: cfg.clone(),
            unknown: Vec::new(),
        };
        let bd_addr = ch.link;
        self.send_signal(bd_addr, message);
    }

    /// Refuse a Configure Request carrying options we do not know
    fn send_config_reject(&mut self, cid: ChannelId, unknown: Vec<u8>) {
        let Some(ch) = self.channels.get(&cid) else {
            return;
        };
        warn!(
            "L2CAP CID 0x{:04x} rejecting unknown config options {}",
            cid,
            hex::encode(&unknown)
        );
        let message = SignalingMessage::ConfigureResponse {
            identifier: ch.remote_id,
            source_cid: ch.remote_cid,
            flags: 0,
            result: L2CAP_CFG_UNKNOWN_OPTIONS,
            config: ConfigInfo {
                result: L2CAP_CFG_UNKNOWN_OPTIONS,
                ..ConfigInfo::default()
            },
            unknown,
        };
        let bd_addr = ch.link;
        self.send_signal(bd_addr, message);
    }

    pub(crate) fn send_disc_req(&mut self, cid: ChannelId) {
        // Basic mode data already accepted still goes out ahead of the request
        if let Some(ch) = self.channels.get_mut(&cid) {
            if ch.peer_mode() == RetransmissionMode::Basic && !ch.xmit_hold_q.is_empty() {
                let flushable: Vec<bool> = ch
                    .xmit_hold_q
                    .iter()
                    .map(|sdu| ch.is_pdu_flushable(sdu.tag.flush))
                    .collect();
                let sdus: Vec<TxSdu> = ch.xmit_hold_q.drain(..).collect();
                if let Some(link) = self.links.get_mut(&ch.link) {
                    for (sdu, flushable) in sdus.into_iter().zip(flushable) {
                        link.enqueue(cid, sdu.data, flushable);
                    }
                }
            }
        }

        let Some((bd_addr, identifier, remote_cid)) = self.next_local_id(cid) else {
            return;
        };
        self.send_signal(
            bd_addr,
            SignalingMessage::DisconnectionRequest {
                identifier,
                destination_cid: remote_cid,
                source_cid: cid,
            },
        );
    }

    pub(crate) fn send_disc_rsp(&mut self, cid: ChannelId) {
        let Some(ch) = self.channels.get(&cid) else {
            return;
        };
        let message = SignalingMessage::DisconnectionResponse {
            identifier: ch.remote_id,
            destination_cid: cid,
            source_cid: ch.remote_cid,
        };
        let bd_addr = ch.link;
        self.send_signal(bd_addr, message);
    }

    fn send_info_rsp(&mut self, bd_addr: BdAddr, identifier: u8, info_type: u16) {
        let (result, data) = match info_type {
            L2CAP_INFO_TYPE_EXTENDED_FEATURES => (
                L2CAP_INFO_RESP_RESULT_SUCCESS,
                self.config.local_ext_features.bits().to_le_bytes().to_vec(),
            ),
            // Only the signaling channel is supported
            L2CAP_INFO_TYPE_FIXED_CHANNELS => (
                L2CAP_INFO_RESP_RESULT_SUCCESS,
                vec![0x02, 0, 0, 0, 0, 0, 0, 0],
            ),
            _ => (L2CAP_INFO_RESP_RESULT_NOT_SUPPORTED, Vec::new()),
        };
        self.send_signal(
            bd_addr,
            SignalingMessage::InformationResponse {
                identifier,
                info_type,
                result,
                data,
            },
        );
    }

    fn channel_or_err(&self, cid: ChannelId) -> L2capResult<&L2capChannel> {
        self.channels.get(&cid).ok_or(L2capError::ChannelNotFound(cid))
    }

    fn find_ccb(&self, bd_addr: BdAddr, cid: ChannelId) -> Option<ChannelId> {
        self.channels
            .get(&cid)
            .filter(|ch| ch.link == bd_addr)
            .map(|ch| ch.local_cid)
    }

    fn link_channels(&self, bd_addr: BdAddr) -> Vec<ChannelId> {
        self.links
            .get(&bd_addr)
            .map(|link| link.channels.clone())
            .unwrap_or_default()
    }

    fn bd_addr_for_handle(&self, handle: u16) -> Option<BdAddr> {
        self.links
            .values()
            .find(|link| link.handle == Some(handle))
            .map(|link| link.bd_addr)
    }
}

impl fmt::Debug for L2capManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2capManager")
            .field("channels", &self.channels.len())
            .field("links", &self.links.len())
            .field("registrations", &self.registrations.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn next_dynamic_cid(cid: ChannelId) -> ChannelId {
    if cid == L2CAP_LAST_APPL_CID {
        L2CAP_BASE_APPL_CID
    } else {
        cid + 1
    }
}

fn is_disconnecting(state: ChannelState) -> bool {
    matches!(
        state,
        ChannelState::W4L2capDisconnectRsp | ChannelState::W4L2caDisconnectRsp
    )
}

/// The preferred mode has to be one of the allowed ones
fn check_ertm_info(ertm_info: &ErtmInfo) -> L2capResult<()> {
    match ertm_info.preferred_mode.mode_bit() {
        Some(bit) if ertm_info.allowed_modes.contains(bit) => Ok(()),
        _ => Err(L2capError::InvalidParameter(format!(
            "Preferred mode {} not among allowed modes {:?}",
            ertm_info.preferred_mode, ertm_info.allowed_modes
        ))),
    }
}
