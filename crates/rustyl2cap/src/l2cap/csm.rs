//! L2CAP channel state machine
//!
//! Every channel event funnels through [`L2capManager::execute`]. The
//! handler for the channel's current state decides what to send, which
//! timer to run, which client callback to fire and what state comes next.
//! Events raised while a handler runs are queued and processed in order
//! once it returns, so handlers never nest.

use std::sync::Arc;

use log::{debug, warn};

use super::channel::TxSdu;
use super::config::{PeerCfgResult, Renegotiation};
use super::constants::*;
use super::core::L2capManager;
use super::psm::L2capCallbacks;
use super::security::SecurityStatus;
use super::timer::TimerId;
use super::types::*;
use crate::hci::constants::{HCI_ERR_AUTH_FAILURE, HCI_ERR_CONNECTION_EXISTS, HCI_ERR_PEER_USER};
use crate::hci::HciCommand;

/// Input to the channel state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2capEvent {
    // Lower layer
    /// ACL link came up
    LpConnectCfm,
    /// ACL link setup failed with an HCI status
    LpConnectCfmNeg(u8),
    /// ACL link went down, with the HCI reason when known
    LpDisconnectInd(Option<u8>),
    LpQosViolationInd,

    // Security manager
    SecComp,
    /// Access refused; `delay_check` asks to retry once encryption settles
    SecCompNeg { delay_check: bool },
    /// Re-issue a pending access request
    SecReSend,

    // Peer signaling
    PeerConnectReq,
    PeerConnectRsp { remote_cid: ChannelId },
    PeerConnectRspPnd { remote_cid: ChannelId },
    PeerConnectRspNeg { result: u16 },
    PeerConfigReq(ConfigInfo),
    PeerConfigRsp(ConfigInfo),
    PeerConfigRspNeg(ConfigInfo),
    PeerDisconnectReq,
    PeerDisconnectRsp,
    /// One complete SDU received
    PeerData(Vec<u8>),
    /// Extended features exchange finished, successfully or not
    PeerInfoRsp,

    // Upper layer
    ConnectReq,
    ConnectRsp { result: u16, status: u16 },
    ConnectRspNeg { result: u16, status: u16 },
    ConfigReq(ConfigInfo),
    ConfigRsp(ConfigInfo),
    ConfigRspNeg(ConfigInfo),
    DisconnectReq,
    DisconnectRsp,
    DataWrite(TxSdu),

    // Timers
    Timeout,
    AckTimeout,
}

impl L2capEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LpConnectCfm => "LP_CONNECT_CFM",
            Self::LpConnectCfmNeg(_) => "LP_CONNECT_CFM_NEG",
            Self::LpDisconnectInd(_) => "LP_DISCONNECT_IND",
            Self::LpQosViolationInd => "LP_QOS_VIOLATION_IND",
            Self::SecComp => "SEC_COMP",
            Self::SecCompNeg { .. } => "SEC_COMP_NEG",
            Self::SecReSend => "SEC_RE_SEND",
            Self::PeerConnectReq => "L2CAP_CONNECT_REQ",
            Self::PeerConnectRsp { .. } => "L2CAP_CONNECT_RSP",
            Self::PeerConnectRspPnd { .. } => "L2CAP_CONNECT_RSP_PND",
            Self::PeerConnectRspNeg { .. } => "L2CAP_CONNECT_RSP_NEG",
            Self::PeerConfigReq(_) => "L2CAP_CONFIG_REQ",
            Self::PeerConfigRsp(_) => "L2CAP_CONFIG_RSP",
            Self::PeerConfigRspNeg(_) => "L2CAP_CONFIG_RSP_NEG",
            Self::PeerDisconnectReq => "L2CAP_DISCONNECT_REQ",
            Self::PeerDisconnectRsp => "L2CAP_DISCONNECT_RSP",
            Self::PeerData(_) => "L2CAP_DATA",
            Self::PeerInfoRsp => "L2CAP_INFO_RSP",
            Self::ConnectReq => "L2CA_CONNECT_REQ",
            Self::ConnectRsp { .. } => "L2CA_CONNECT_RSP",
            Self::ConnectRspNeg { .. } => "L2CA_CONNECT_RSP_NEG",
            Self::ConfigReq(_) => "L2CA_CONFIG_REQ",
            Self::ConfigRsp(_) => "L2CA_CONFIG_RSP",
            Self::ConfigRspNeg(_) => "L2CA_CONFIG_RSP_NEG",
            Self::DisconnectReq => "L2CA_DISCONNECT_REQ",
            Self::DisconnectRsp => "L2CA_DISCONNECT_RSP",
            Self::DataWrite(_) => "L2CA_DATA_WRITE",
            Self::Timeout => "TIMEOUT",
            Self::AckTimeout => "ACK_TIMEOUT",
        }
    }
}

/// Callback set of the client owning a channel.
///
/// Captured before the handler runs so callbacks still reach the client
/// after the channel has been released.
pub(crate) struct Upper(Option<Arc<dyn L2capCallbacks>>);

impl Upper {
    pub(crate) fn new(callbacks: Option<Arc<dyn L2capCallbacks>>) -> Self {
        Self(callbacks)
    }

    fn with(&self, f: impl FnOnce(&dyn L2capCallbacks)) {
        if let Some(cb) = &self.0 {
            f(cb.as_ref());
        }
    }

    pub(crate) fn connect_ind(&self, bd_addr: BdAddr, cid: ChannelId, psm: u16, id: u8) {
        self.with(|cb| cb.connect_ind(bd_addr, cid, psm, id));
    }

    pub(crate) fn connect_cfm(&self, cid: ChannelId, result: u16) {
        self.with(|cb| cb.connect_cfm(cid, result));
    }

    pub(crate) fn connect_pnd(&self, cid: ChannelId) {
        self.with(|cb| cb.connect_pnd(cid));
    }

    pub(crate) fn config_ind(&self, cid: ChannelId, cfg: &ConfigInfo) {
        self.with(|cb| cb.config_ind(cid, cfg));
    }

    pub(crate) fn config_cfm(&self, cid: ChannelId, cfg: &ConfigInfo) {
        self.with(|cb| cb.config_cfm(cid, cfg));
    }

    pub(crate) fn disconnect_ind(&self, cid: ChannelId, needs_ack: bool) {
        self.with(|cb| cb.disconnect_ind(cid, needs_ack));
    }

    pub(crate) fn disconnect_cfm(&self, cid: ChannelId, result: u16) {
        self.with(|cb| cb.disconnect_cfm(cid, result));
    }

    pub(crate) fn qos_violation_ind(&self, bd_addr: BdAddr) {
        self.with(|cb| cb.qos_violation_ind(bd_addr));
    }

    pub(crate) fn data_ind(&self, cid: ChannelId, sdu: Vec<u8>) {
        self.with(|cb| cb.data_ind(cid, sdu));
    }

    pub(crate) fn congestion_status(&self, cid: ChannelId, congested: bool) {
        self.with(|cb| cb.congestion_status(cid, congested));
    }

    pub(crate) fn tx_complete(&self, cid: ChannelId, count: u16) {
        self.with(|cb| cb.tx_complete(cid, count));
    }
}

impl L2capManager {
    /// Feed one event to a channel's state machine.
    ///
    /// Events raised from inside a handler are queued behind the current one.
    pub fn execute(&mut self, cid: ChannelId, event: L2capEvent) {
        self.pending.push_back((cid, event));
        if self.dispatching {
            return;
        }

        self.dispatching = true;
        while let Some((cid, event)) = self.pending.pop_front() {
            self.dispatch(cid, event);
        }
        self.dispatching = false;
    }

    fn dispatch(&mut self, cid: ChannelId, event: L2capEvent) {
        let Some(state) = self.channels.get(&cid).map(|ch| ch.state) else {
            debug!("L2CAP CID 0x{:04x} gone, dropping {}", cid, event.name());
            return;
        };
        debug!("L2CAP CID 0x{:04x} {} event {}", cid, state, event.name());

        match state {
            ChannelState::Closed => self.csm_closed(cid, event),
            ChannelState::OrigW4SecComp => self.csm_orig_w4_sec_comp(cid, event),
            ChannelState::TermW4SecComp => self.csm_term_w4_sec_comp(cid, event),
            ChannelState::W4L2capConnectRsp => self.csm_w4_l2cap_connect_rsp(cid, event),
            ChannelState::W4L2caConnectRsp => self.csm_w4_l2ca_connect_rsp(cid, event),
            ChannelState::Config => self.csm_config(cid, event),
            ChannelState::Open => self.csm_open(cid, event),
            ChannelState::W4L2capDisconnectRsp => self.csm_w4_l2cap_disconnect_rsp(cid, event),
            ChannelState::W4L2caDisconnectRsp => self.csm_w4_l2ca_disconnect_rsp(cid, event),
        }
    }

    fn set_chnl_state(&mut self, cid: ChannelId, state: ChannelState) {
        if let Some(ch) = self.channels.get_mut(&cid) {
            ch.set_state(state);
        }
    }

    fn ignore(&self, cid: ChannelId, event: &L2capEvent) {
        match event {
            L2capEvent::PeerData(_) | L2capEvent::DataWrite(_) => {
                debug!("L2CAP CID 0x{:04x} dropping data in this state", cid)
            }
            _ => debug!("L2CAP CID 0x{:04x} ignoring {}", cid, event.name()),
        }
    }

    /// Ask the security manager for access and post an immediate answer
    fn request_security(&mut self, cid: ChannelId, is_originator: bool) -> SecurityStatus {
        let Some((bd_addr, psm)) = self.channels.get(&cid).map(|ch| (ch.link, ch.psm)) else {
            return SecurityStatus::Failed(HCI_ERR_AUTH_FAILURE);
        };
        let handle = self.links.get(&bd_addr).and_then(|link| link.handle);

        let status = self
            .security
            .access_request(bd_addr, psm, handle, is_originator, cid);
        debug!(
            "L2CAP CID 0x{:04x} security request (originator {}): {:?}",
            cid, is_originator, status
        );
        if let Some(event) = security_event(status) {
            self.pending.push_back((cid, event));
        }
        status
    }

    /// Security granted on an outgoing channel; connect once the peer's
    /// features are known
    fn sec_comp_send_connect_req(&mut self, cid: ChannelId, upper: &Upper) {
        let Some(bd_addr) = self.channels.get(&cid).map(|ch| ch.link) else {
            return;
        };
        let Some((w4_info_rsp, peer_ext_fea)) = self
            .links
            .get(&bd_addr)
            .map(|link| (link.w4_info_rsp, link.peer_ext_fea))
        else {
            return;
        };
        if w4_info_rsp {
            debug!("L2CAP CID 0x{:04x} waiting for peer features", cid);
            return;
        }

        let modes = match self.channels.get_mut(&cid) {
            Some(ch) => ch.chk_chan_modes(peer_ext_fea),
            None => return,
        };
        if modes.is_empty() {
            self.release_ccb(cid);
            upper.connect_cfm(cid, L2CAP_CONN_NO_LINK);
        } else {
            self.start_chnl_timer(cid, self.config.connect_timeout);
            self.send_connect_req(cid);
        }
    }

    fn csm_closed(&mut self, cid: ChannelId, event: L2capEvent) {
        let upper = self.upper(cid);
        match event {
            L2capEvent::LpDisconnectInd(_) => {
                self.release_ccb(cid);
                upper.disconnect_ind(cid, false);
            }
            L2capEvent::LpConnectCfm => {
                self.set_chnl_state(cid, ChannelState::OrigW4SecComp);
                self.request_security(cid, true);
            }
            L2capEvent::LpConnectCfmNeg(status) => {
                // A connection already up will be reported separately
                if status != HCI_ERR_CONNECTION_EXISTS {
                    self.release_ccb(cid);
                    upper.connect_cfm(cid, status as u16);
                }
            }
            L2capEvent::ConnectReq => {
                self.exit_sniff(cid);
                if self.request_security(cid, true) == SecurityStatus::Started {
                    self.set_chnl_state(cid, ChannelState::OrigW4SecComp);
                }
            }
            L2capEvent::SecComp => {
                self.set_chnl_state(cid, ChannelState::W4L2capConnectRsp);
                self.sec_comp_send_connect_req(cid, &upper);
            }
            L2capEvent::SecCompNeg { .. } => {
                self.release_ccb(cid);
                upper.connect_cfm(cid, L2CAP_CONN_SECURITY_BLOCK);
            }
            L2capEvent::PeerConnectReq => {
                if let Some(bd_addr) = self.channels.get(&cid).map(|ch| ch.link) {
                    self.timers.stop(TimerId::Link(bd_addr));
                }
                self.exit_sniff(cid);
                self.set_chnl_state(cid, ChannelState::TermW4SecComp);
                if self.request_security(cid, false) == SecurityStatus::Started {
                    self.send_connect_rsp(cid, L2CAP_CONN_PENDING, L2CAP_CONN_STATUS_AUTHENTICATION);
                }
            }
            L2capEvent::Timeout => {
                self.release_ccb(cid);
                upper.connect_cfm(cid, L2CAP_CONN_TIMEOUT);
            }
            L2capEvent::DisconnectReq => self.release_ccb(cid),
            other => self.ignore(cid, &other),
        }
    }

    fn csm_orig_w4_sec_comp(&mut self, cid: ChannelId, event: L2capEvent) {
        let upper = self.upper(cid);
        match event {
            L2capEvent::LpDisconnectInd(_) => {
                self.release_ccb(cid);
                upper.disconnect_ind(cid, false);
            }
            L2capEvent::SecReSend | L2capEvent::LpConnectCfm => {
                self.request_security(cid, true);
            }
            L2capEvent::SecComp => {
                self.set_chnl_state(cid, ChannelState::W4L2capConnectRsp);
                self.sec_comp_send_connect_req(cid, &upper);
            }
            L2capEvent::SecCompNeg { .. } => {
                // Last channel on the link: drop the ACL right away
                if let Some(bd_addr) = self.channels.get(&cid).map(|ch| ch.link) {
                    if let Some(link) = self.links.get_mut(&bd_addr) {
                        if link.channels == [cid] {
                            link.disconnect_when_idle = true;
                        }
                    }
                }
                self.release_ccb(cid);
                upper.connect_cfm(cid, HCI_ERR_AUTH_FAILURE as u16);
            }
            L2capEvent::DisconnectReq => {
                if let Some(bd_addr) = self.channels.get(&cid).map(|ch| ch.link) {
                    self.security.abort_access_request(bd_addr);
                }
                self.release_ccb(cid);
            }
            other => self.ignore(cid, &other),
        }
    }

    fn csm_term_w4_sec_comp(&mut self, cid: ChannelId, event: L2capEvent) {
        let upper = self.upper(cid);
        match event {
            L2capEvent::LpDisconnectInd(_) => {
                if let Some(bd_addr) = self.channels.get(&cid).map(|ch| ch.link) {
                    self.security.abort_access_request(bd_addr);
                }
                self.release_ccb(cid);
            }
            L2capEvent::SecComp => {
                self.set_chnl_state(cid, ChannelState::W4L2caConnectRsp);
                let Some((bd_addr, psm, remote_id)) = self
                    .channels
                    .get(&cid)
                    .map(|ch| (ch.link, ch.psm, ch.remote_id))
                else {
                    return;
                };
                let w4_info_rsp = self.links.get(&bd_addr).is_some_and(|link| link.w4_info_rsp);
                if w4_info_rsp {
                    self.send_connect_rsp(cid, L2CAP_CONN_PENDING, L2CAP_CONN_STATUS_NONE);
                } else {
                    self.start_chnl_timer(cid, self.config.connect_timeout);
                    upper.connect_ind(bd_addr, cid, psm, remote_id);
                }
            }
            L2capEvent::SecCompNeg { delay_check: true } => {
                debug!("L2CAP CID 0x{:04x} security delayed, checking again", cid);
                self.start_chnl_timer(cid, self.config.delay_check_timeout);
            }
            L2capEvent::SecCompNeg { delay_check: false } => {
                self.send_connect_rsp(cid, L2CAP_CONN_SECURITY_BLOCK, L2CAP_CONN_STATUS_NONE);
                self.release_ccb(cid);
            }
            L2capEvent::DisconnectReq => self.release_ccb(cid),
            L2capEvent::PeerDisconnectReq => {
                self.send_disc_rsp(cid);
                if let Some(bd_addr) = self.channels.get(&cid).map(|ch| ch.link) {
                    self.security.abort_access_request(bd_addr);
                }
                self.release_ccb(cid);
            }
            L2capEvent::Timeout => {
                // Delayed check ran out; take the whole link down
                let handle = self
                    .channels
                    .get(&cid)
                    .and_then(|ch| self.links.get(&ch.link))
                    .and_then(|link| link.handle);
                if let Some(handle) = handle {
                    self.send_hci(HciCommand::Disconnect {
                        handle,
                        reason: HCI_ERR_AUTH_FAILURE,
                    });
                }
            }
            L2capEvent::SecReSend => {
                self.request_security(cid, false);
            }
            other => self.ignore(cid, &other),
        }
    }

    fn csm_w4_l2cap_connect_rsp(&mut self, cid: ChannelId, event: L2capEvent) {
        let upper = self.upper(cid);
        match event {
            L2capEvent::LpDisconnectInd(reason) => {
                self.set_chnl_state(cid, ChannelState::Closed);
                let no_retry = self.channels.get(&cid).is_some_and(|ch| ch.no_retry);
                // The link is retried once when the peer dropped it
                if no_retry || reason != Some(HCI_ERR_PEER_USER) {
                    self.release_ccb(cid);
                    upper.disconnect_ind(cid, false);
                } else if let Some(ch) = self.channels.get_mut(&cid) {
                    ch.no_retry = true;
                }
            }
            L2capEvent::PeerConnectRsp { remote_cid } => {
                if let Some(ch) = self.channels.get_mut(&cid) {
                    ch.remote_cid = remote_cid;
                    ch.set_state(ChannelState::Config);
                }
                self.start_chnl_timer(cid, self.config.config_timeout);
                upper.connect_cfm(cid, L2CAP_CONN_OK);
            }
            L2capEvent::PeerConnectRspPnd { remote_cid } => {
                if let Some(ch) = self.channels.get_mut(&cid) {
                    ch.remote_cid = remote_cid;
                }
                self.start_chnl_timer(cid, self.config.connect_ext_timeout);
                upper.connect_pnd(cid);
            }
            L2capEvent::PeerConnectRspNeg { result } => {
                self.release_ccb(cid);
                upper.connect_cfm(cid, result);
            }
            L2capEvent::Timeout => {
                self.release_ccb(cid);
                upper.connect_cfm(cid, L2CAP_CONN_TIMEOUT);
            }
            L2capEvent::DisconnectReq => {
                let remote_cid = self.channels.get(&cid).map_or(0, |ch| ch.remote_cid);
                if remote_cid != 0 {
                    self.send_disc_req(cid);
                    self.set_chnl_state(cid, ChannelState::W4L2capDisconnectRsp);
                    self.start_chnl_timer(cid, self.config.disconnect_timeout);
                } else {
                    self.release_ccb(cid);
                }
            }
            L2capEvent::PeerInfoRsp => self.sec_comp_send_connect_req(cid, &upper),
            other => self.ignore(cid, &other),
        }
    }

    fn csm_w4_l2ca_connect_rsp(&mut self, cid: ChannelId, event: L2capEvent) {
        let upper = self.upper(cid);
        match event {
            L2capEvent::LpDisconnectInd(_) => {
                self.release_ccb(cid);
                upper.disconnect_ind(cid, false);
            }
            L2capEvent::ConnectRsp { result, status } => {
                self.send_connect_rsp(cid, result, status);
                if result == L2CAP_CONN_OK {
                    self.set_chnl_state(cid, ChannelState::Config);
                    self.start_chnl_timer(cid, self.config.config_timeout);
                } else {
                    self.start_chnl_timer(cid, self.config.connect_ext_timeout);
                }
            }
            L2capEvent::ConnectRspNeg { result, status } => {
                self.send_connect_rsp(cid, result, status);
                self.release_ccb(cid);
            }
            L2capEvent::Timeout => {
                self.send_connect_rsp(cid, L2CAP_CONN_NO_PSM, L2CAP_CONN_STATUS_NONE);
                self.release_ccb(cid);
                upper.disconnect_ind(cid, false);
            }
            L2capEvent::DisconnectReq => {
                self.send_disc_req(cid);
                self.set_chnl_state(cid, ChannelState::W4L2capDisconnectRsp);
                self.start_chnl_timer(cid, self.config.disconnect_timeout);
            }
            L2capEvent::PeerInfoRsp => {
                let Some((bd_addr, psm, remote_id)) = self
                    .channels
                    .get(&cid)
                    .map(|ch| (ch.link, ch.psm, ch.remote_id))
                else {
                    return;
                };
                self.start_chnl_timer(cid, self.config.connect_timeout);
                upper.connect_ind(bd_addr, cid, psm, remote_id);
            }
            other => self.ignore(cid, &other),
        }
    }

    /// Both directions configured: open the channel, or disconnect when the
    /// modes never converged. Returns whether the channel is now open.
    fn config_complete(&mut self, cid: ChannelId, upper: &Upper) -> bool {
        let Some(ch) = self.channels.get_mut(&cid) else {
            return false;
        };
        if ch.our_mode() != ch.peer_mode() {
            warn!(
                "L2CAP CID 0x{:04x} mode mismatch after config (ours {}, peer {}), disconnecting",
                cid,
                ch.our_mode(),
                ch.peer_mode()
            );
            self.disconnect_chnl(cid, upper);
            return false;
        }

        ch.config_done |= ConfigDone::RECONFIG;
        ch.set_state(ChannelState::Open);
        self.stop_chnl_timer(cid);
        true
    }

    fn csm_config(&mut self, cid: ChannelId, event: L2capEvent) {
        let upper = self.upper(cid);
        match event {
            L2capEvent::LpDisconnectInd(_) => {
                self.release_ccb(cid);
                upper.disconnect_ind(cid, false);
            }
            L2capEvent::PeerConfigReq(mut cfg) => match self.peer_cfg_req(cid, &mut cfg) {
                Some(PeerCfgResult::Ok) => {
                    self.start_chnl_timer(cid, self.config.config_timeout);
                    upper.config_ind(cid, &cfg);
                }
                Some(PeerCfgResult::Disconnect) => {
                    self.pending.push_back((cid, L2capEvent::DisconnectReq));
                }
                Some(PeerCfgResult::Unacceptable) => self.send_config_rsp(cid, &cfg),
                None => {}
            },
            L2capEvent::PeerConfigRsp(cfg) => {
                let mut complete = false;
                if let Some(ch) = self.channels.get_mut(&cid) {
                    ch.process_peer_cfg_rsp(&cfg);
                    if cfg.result != L2CAP_CFG_PENDING {
                        ch.config_done |= ConfigDone::OB_DONE;
                        complete = ch.config_done.contains(ConfigDone::IB_DONE);
                    }
                }
                if complete {
                    if !self.config_complete(cid, &upper) {
                        return;
                    }
                    self.after_open(cid, true);
                }
                upper.config_cfm(cid, &cfg);
            }
            L2capEvent::PeerConfigRspNeg(mut cfg) => {
                self.stop_chnl_timer(cid);
                let verdict = match self.channels.get_mut(&cid) {
                    Some(ch) => ch.renegotiate(&mut cfg),
                    None => return,
                };
                match verdict {
                    Renegotiation::Resend(mut req) => {
                        self.apply_our_cfg_req(cid, &mut req);
                        self.send_config_req(cid, &req);
                        self.start_chnl_timer(cid, self.config.config_timeout);
                    }
                    Renegotiation::Disconnect => self.disconnect_chnl(cid, &upper),
                    Renegotiation::None => upper.config_cfm(cid, &cfg),
                }
            }
            L2capEvent::PeerDisconnectReq => {
                self.start_chnl_timer(cid, self.config.disconnect_timeout);
                self.set_chnl_state(cid, ChannelState::W4L2caDisconnectRsp);
                upper.disconnect_ind(cid, true);
            }
            L2capEvent::ConfigReq(mut cfg) => {
                self.apply_our_cfg_req(cid, &mut cfg);
                self.send_config_req(cid, &cfg);
                self.start_chnl_timer(cid, self.config.config_timeout);
            }
            L2capEvent::ConfigRsp(mut cfg) => {
                let Some(ch) = self.channels.get_mut(&cid) else {
                    return;
                };
                ch.process_our_cfg_rsp(&mut cfg, &self.config);

                if cfg.is_continuation() || cfg.result == L2CAP_CFG_PENDING {
                    self.send_config_rsp(cid, &cfg);
                    return;
                }

                // Cached peer options only live until this exchange ends
                ch.peer_cfg.mtu_present = false;
                ch.peer_cfg.flush_to_present = false;
                ch.peer_cfg.qos_present = false;
                ch.config_done |= ConfigDone::IB_DONE;

                let mut open = false;
                if ch.config_done.contains(ConfigDone::OB_DONE) {
                    if !self.config_complete(cid, &upper) {
                        return;
                    }
                    open = true;
                }
                self.send_config_rsp(cid, &cfg);
                self.after_open(cid, open);
            }
            L2capEvent::ConfigRspNeg(cfg) => {
                self.send_config_rsp(cid, &cfg);
                self.start_chnl_timer(cid, self.config.config_timeout);
            }
            L2capEvent::DisconnectReq => {
                self.send_disc_req(cid);
                self.set_chnl_state(cid, ChannelState::W4L2capDisconnectRsp);
                self.start_chnl_timer(cid, self.config.disconnect_timeout);
            }
            L2capEvent::PeerData(sdu) => upper.data_ind(cid, sdu),
            L2capEvent::DataWrite(sdu) => {
                let ob_done = self
                    .channels
                    .get(&cid)
                    .is_some_and(|ch| ch.config_done.contains(ConfigDone::OB_DONE));
                if ob_done {
                    self.enqueue_sdu(cid, sdu, &upper);
                } else {
                    debug!("L2CAP CID 0x{:04x} dropping data before our config is done", cid);
                }
            }
            L2capEvent::Timeout => {
                warn!("L2CAP CID 0x{:04x} configuration timed out", cid);
                self.disconnect_chnl(cid, &upper);
            }
            other => self.ignore(cid, &other),
        }
    }

    /// Follow-up once a config exchange finished in one direction: resume
    /// a pending poll, settle ERTM timeouts and drain held data
    fn after_open(&mut self, cid: ChannelId, open: bool) {
        let Some(ch) = self.channels.get_mut(&cid) else {
            return;
        };
        if open && ch.our_mode() == RetransmissionMode::EnhancedRetransmission {
            ch.adj_monitor_retran(&self.config);
        }
        let wait_ack = ch.fcrb.wait_ack;
        let flush_held = open && !ch.xmit_hold_q.is_empty();
        let bd_addr = ch.link;

        if wait_ack {
            self.fcr_op(cid, |ch, ctx| ch.fcr_start_timer(ctx));
        }
        if flush_held {
            self.check_send(bd_addr);
        }
    }

    fn csm_open(&mut self, cid: ChannelId, event: L2capEvent) {
        let upper = self.upper(cid);
        match event {
            L2capEvent::LpDisconnectInd(_) => {
                self.release_ccb(cid);
                upper.disconnect_ind(cid, false);
            }
            L2capEvent::LpQosViolationInd => {
                if let Some(bd_addr) = self.channels.get(&cid).map(|ch| ch.link) {
                    upper.qos_violation_ind(bd_addr);
                }
            }
            L2capEvent::PeerConfigReq(mut cfg) => {
                let Some(ch) = self.channels.get_mut(&cid) else {
                    return;
                };
                let saved_done = ch.config_done;
                ch.set_state(ChannelState::Config);
                ch.config_done.remove(ConfigDone::BOTH_DONE);
                self.start_chnl_timer(cid, self.config.config_timeout);

                match self.peer_cfg_req(cid, &mut cfg) {
                    Some(PeerCfgResult::Ok) => upper.config_ind(cid, &cfg),
                    Some(PeerCfgResult::Disconnect) => {
                        self.pending.push_back((cid, L2capEvent::DisconnectReq));
                    }
                    Some(PeerCfgResult::Unacceptable) => {
                        // Refused reconfiguration leaves the channel as it was
                        self.stop_chnl_timer(cid);
                        if let Some(ch) = self.channels.get_mut(&cid) {
                            ch.set_state(ChannelState::Open);
                            ch.config_done = saved_done;
                        }
                        self.send_config_rsp(cid, &cfg);
                    }
                    None => {}
                }
            }
            L2capEvent::PeerDisconnectReq => {
                self.exit_sniff(cid);
                self.set_chnl_state(cid, ChannelState::W4L2caDisconnectRsp);
                self.start_chnl_timer(cid, self.config.disconnect_timeout);
                upper.disconnect_ind(cid, true);
            }
            L2capEvent::PeerData(sdu) => upper.data_ind(cid, sdu),
            L2capEvent::DisconnectReq => {
                self.exit_sniff(cid);
                self.send_disc_req(cid);
                self.set_chnl_state(cid, ChannelState::W4L2capDisconnectRsp);
                self.start_chnl_timer(cid, self.config.disconnect_timeout);
            }
            L2capEvent::DataWrite(sdu) => {
                self.enqueue_sdu(cid, sdu, &upper);
                if let Some(bd_addr) = self.channels.get(&cid).map(|ch| ch.link) {
                    self.check_send(bd_addr);
                }
            }
            L2capEvent::ConfigReq(mut cfg) => {
                if let Some(ch) = self.channels.get_mut(&cid) {
                    ch.set_state(ChannelState::Config);
                    ch.config_done.remove(ConfigDone::BOTH_DONE);
                }
                self.apply_our_cfg_req(cid, &mut cfg);
                self.send_config_req(cid, &cfg);
                self.start_chnl_timer(cid, self.config.config_timeout);
            }
            L2capEvent::Timeout => {
                let ertm = self
                    .channels
                    .get(&cid)
                    .is_some_and(|ch| ch.peer_mode() == RetransmissionMode::EnhancedRetransmission);
                if ertm {
                    self.fcr_op(cid, |ch, ctx| ch.fcr_proc_tout(ctx));
                }
            }
            L2capEvent::AckTimeout => self.fcr_op(cid, |ch, ctx| ch.fcr_proc_ack_tout(ctx)),
            other => self.ignore(cid, &other),
        }
    }

    fn csm_w4_l2cap_disconnect_rsp(&mut self, cid: ChannelId, event: L2capEvent) {
        let upper = self.upper(cid);
        match event {
            L2capEvent::PeerDisconnectRsp => {
                self.release_ccb(cid);
                upper.disconnect_cfm(cid, L2CAP_DISC_OK);
            }
            L2capEvent::PeerDisconnectReq => {
                // Both sides disconnecting at once
                self.send_disc_rsp(cid);
                self.release_ccb(cid);
                upper.disconnect_cfm(cid, L2CAP_DISC_OK);
            }
            L2capEvent::LpDisconnectInd(_) | L2capEvent::Timeout => {
                self.release_ccb(cid);
                upper.disconnect_cfm(cid, L2CAP_DISC_TIMEOUT);
            }
            other => self.ignore(cid, &other),
        }
    }

    fn csm_w4_l2ca_disconnect_rsp(&mut self, cid: ChannelId, event: L2capEvent) {
        let upper = self.upper(cid);
        match event {
            L2capEvent::LpDisconnectInd(_) => {
                self.release_ccb(cid);
                upper.disconnect_ind(cid, false);
            }
            L2capEvent::Timeout => {
                self.send_disc_rsp(cid);
                self.release_ccb(cid);
                upper.disconnect_ind(cid, false);
            }
            L2capEvent::DisconnectReq | L2capEvent::DisconnectRsp => {
                self.send_disc_rsp(cid);
                self.release_ccb(cid);
            }
            other => self.ignore(cid, &other),
        }
    }
}

/// Channel event standing for an immediate security answer
pub(crate) fn security_event(status: SecurityStatus) -> Option<L2capEvent> {
    match status {
        SecurityStatus::Started => None,
        SecurityStatus::Success => Some(L2capEvent::SecComp),
        SecurityStatus::Failed(_) => Some(L2capEvent::SecCompNeg { delay_check: false }),
        SecurityStatus::DelayCheck => Some(L2capEvent::SecCompNeg { delay_check: true }),
    }
}
