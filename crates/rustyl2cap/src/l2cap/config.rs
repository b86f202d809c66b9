//! Configuration option processing
//!
//! Applies Configure Request/Response contents to a channel in both
//! directions and negotiates the FCR mode. The functions here only touch the
//! channel and its link record; sending PDUs, arming timers and calling the
//! client is left to the state machine.

use log::{debug, warn};

use super::channel::L2capChannel;
use super::constants::*;
use super::link::Link;
use super::types::*;

/// Verdict on a peer Configure Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCfgResult {
    /// Accepted; hand it to the client
    Ok,
    /// Answer with the adjusted options and "unacceptable parameters"
    Unacceptable,
    /// Modes cannot be reconciled; tear the channel down
    Disconnect,
}

/// Outcome of checking the options a client wants to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OurReqVerdict {
    Ok,
    /// Options are inconsistent with the local buffers
    Invalid,
    /// No channel mode in common with the peer
    Disconnect,
}

/// What to do after a negative response to our Configure Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Renegotiation {
    /// Nothing to renegotiate; pass the response to the client
    None,
    /// Send this request again with a fallback mode
    Resend(ConfigInfo),
    /// The modes cannot match
    Disconnect,
}

impl L2capChannel {
    /// Apply a peer Configure Request, rewriting `cfg` into the response
    pub(crate) fn process_peer_cfg_req(
        &mut self,
        link: &mut Link,
        cfg: &mut ConfigInfo,
        config: &L2capConfig,
    ) -> PeerCfgResult {
        let mut mtu_ok = true;
        let mut flush_to_ok = true;
        let mut qos_ok = true;

        match cfg.mtu {
            Some(mtu) if mtu >= L2CAP_MIN_MTU => {
                // Basic mode data lands in the ACL pool
                let mtu = if cfg.fcr.is_none() { mtu.min(L2CAP_MTU_SIZE) } else { mtu };
                cfg.mtu = Some(mtu);
                self.peer_cfg.mtu = mtu;
                self.peer_cfg.mtu_present = true;
            }
            Some(_) => {
                cfg.mtu = Some(L2CAP_MIN_MTU);
                mtu_ok = false;
            }
            None if self.peer_cfg.mtu_present => cfg.mtu = Some(self.peer_cfg.mtu),
            None => {}
        }

        match cfg.flush_to {
            Some(0) => {
                cfg.flush_to = Some(L2CAP_NO_AUTOMATIC_FLUSH);
                flush_to_ok = false;
            }
            Some(flush_to) => {
                self.peer_cfg.flush_to = flush_to;
                self.peer_cfg.flush_to_present = true;
            }
            None if self.peer_cfg.flush_to_present => cfg.flush_to = Some(self.peer_cfg.flush_to),
            None => {}
        }

        match cfg.qos.as_mut() {
            Some(qos) if qos.service_type <= L2CAP_QOS_GUARANTEED => {
                self.peer_cfg.qos = *qos;
                self.peer_cfg.qos_present = true;
            }
            Some(qos) => {
                qos.service_type = L2CAP_QOS_BEST_EFFORT;
                qos_ok = false;
            }
            None if self.peer_cfg.qos_present => cfg.qos = Some(self.peer_cfg.qos),
            None => {}
        }

        let fcr_status = self.process_fcr_peer_cfg_req(link, cfg, config);
        if fcr_status == PeerCfgResult::Disconnect {
            cfg.result = L2CAP_CFG_FAILED_NO_REASON;
            cfg.mtu = None;
            cfg.qos = None;
            cfg.flush_to = None;
            return PeerCfgResult::Disconnect;
        }
        let fcr_ok = fcr_status == PeerCfgResult::Ok;

        if mtu_ok && flush_to_ok && qos_ok && fcr_ok {
            self.adjust_out_mps(config);
            return PeerCfgResult::Ok;
        }

        // Echo back only the options being refused
        cfg.result = L2CAP_CFG_UNACCEPTABLE_PARAMS;
        if mtu_ok {
            cfg.mtu = None;
        }
        if flush_to_ok {
            cfg.flush_to = None;
        }
        if qos_ok {
            cfg.qos = None;
        }
        if fcr_ok {
            cfg.fcr = None;
        }
        debug!(
            "L2CAP CID 0x{:04x} peer config unacceptable: mtu {} flush {} qos {} fcr {}",
            self.local_cid, mtu_ok, flush_to_ok, qos_ok, fcr_ok
        );
        PeerCfgResult::Unacceptable
    }

    /// Mode negotiation part of a peer Configure Request
    fn process_fcr_peer_cfg_req(
        &mut self,
        link: &mut Link,
        cfg: &mut ConfigInfo,
        config: &L2capConfig,
    ) -> PeerCfgResult {
        // Some peers answer the config request before our Information Request
        link.w4_info_rsp = false;

        let mut fcr = cfg.fcr_or_basic();
        let preferred = self.ertm_info.preferred_mode;
        let allowed = self.ertm_info.allowed_modes;
        debug!(
            "L2CAP CID 0x{:04x} peer FCR {} (present {}), ours {}, preferred {}, allowed {:?}",
            self.local_cid,
            fcr.mode,
            cfg.fcr.is_some(),
            self.our_cfg.fcr.mode,
            preferred,
            allowed
        );

        let mut status = PeerCfgResult::Ok;
        if fcr.mode == RetransmissionMode::Basic {
            if !allowed.contains(ChannelModes::BASIC) {
                status = PeerCfgResult::Disconnect;
            }
        } else if fcr.mode != preferred {
            if fcr.mode.mode_bit().is_none() || preferred == RetransmissionMode::EnhancedRetransmission {
                // Ask again for the mode we proposed
                fcr.mode = self.our_cfg.fcr.mode;
                fcr.tx_win_sz = self.our_cfg.fcr.tx_win_sz;
                fcr.max_transmit = self.our_cfg.fcr.max_transmit;
                status = PeerCfgResult::Unacceptable;
            } else if preferred == RetransmissionMode::Basic {
                fcr = FcrOptions::basic();
                self.our_cfg.fcr.rtrans_tout = 0;
                self.our_cfg.fcr.mon_tout = 0;
                self.our_cfg.fcr.mps = 0;
                status = PeerCfgResult::Unacceptable;
            } else if fcr.mode != RetransmissionMode::EnhancedRetransmission
                || !allowed.contains(ChannelModes::ERTM)
            {
                // We wanted Streaming; only ERTM is acceptable instead
                status = PeerCfgResult::Disconnect;
            }
        }

        match status {
            PeerCfgResult::Ok => {
                self.out_cfg_fcr_present = false;

                if cfg.fcr.is_some() && fcr.mode != RetransmissionMode::Basic {
                    if let Some(fcs) = cfg.fcs {
                        self.peer_cfg.fcs = Some(fcs);
                        if fcs == L2CAP_CFG_FCS_BYPASS {
                            self.bypass_fcs |= BypassFcs::PEER;
                        }
                    }

                    let max_retrans_size = config.fcr_tx_buf_size.saturating_sub(L2CAP_MAX_HEADER_FCS);

                    if fcr.mps == 0 || fcr.mps > self.peer_cfg.mtu {
                        fcr.mps = self.peer_cfg.mtu;
                        self.out_cfg_fcr_present = true;
                    }
                    if fcr.mps > max_retrans_size {
                        debug!(
                            "L2CAP CID 0x{:04x} overriding MPS to {} (was {})",
                            self.local_cid, max_retrans_size, fcr.mps
                        );
                        fcr.mps = max_retrans_size;
                        self.out_cfg_fcr_present = true;
                    }
                    if matches!(
                        fcr.mode,
                        RetransmissionMode::EnhancedRetransmission | RetransmissionMode::Streaming
                    ) {
                        self.out_cfg_fcr_present = true;
                    }
                }

                self.peer_cfg.fcr = fcr;
                self.peer_cfg.fcr_present = cfg.fcr.is_some();
            }
            PeerCfgResult::Unacceptable => {
                // The peer gets one retry
                if self.peer_cfg_already_rejected {
                    status = PeerCfgResult::Disconnect;
                } else {
                    self.peer_cfg_already_rejected = true;
                }
            }
            PeerCfgResult::Disconnect => {}
        }

        if cfg.fcr.is_some() || status == PeerCfgResult::Unacceptable {
            cfg.fcr = Some(fcr);
        }
        status
    }

    /// Apply the peer's positive response to our Configure Request
    pub(crate) fn process_peer_cfg_rsp(&mut self, cfg: &ConfigInfo) {
        if let Some(qos) = cfg.qos {
            if self.our_cfg.qos_present {
                self.our_cfg.qos = qos;
            }
        }

        if let Some(fcr) = cfg.fcr {
            if fcr.mode == RetransmissionMode::EnhancedRetransmission {
                self.peer_cfg.fcr.rtrans_tout = fcr.rtrans_tout;
                self.peer_cfg.fcr.mon_tout = fcr.mon_tout;
            }

            self.fcrb.max_held_acks = fcr.tx_win_sz.min(self.our_cfg.fcr.tx_win_sz) / 3;
            debug!(
                "L2CAP CID 0x{:04x} peer tx_win {} ours {} max_held_acks {}",
                self.local_cid, fcr.tx_win_sz, self.our_cfg.fcr.tx_win_sz, self.fcrb.max_held_acks
            );
        }
    }

    /// Record the Configure Request we are about to send and normalize it
    /// for the wire.
    ///
    /// Returns the controller flush timeout, in 0.625 ms slots, to program
    /// when this channel lowered the link's flush timeout.
    pub(crate) fn process_our_cfg_req(&mut self, link: &mut Link, cfg: &mut ConfigInfo) -> Option<u16> {
        if let Some(qos) = cfg.qos {
            self.our_cfg.qos = qos;
            self.our_cfg.qos_present = true;
        }

        if let Some(fcr) = cfg.fcr.as_mut() {
            if fcr.mode == RetransmissionMode::Basic {
                *fcr = FcrOptions::basic();
            } else {
                // BR/EDR requests carry zero timeouts
                fcr.mon_tout = 0;
                fcr.rtrans_tout = 0;
                if fcr.mode == RetransmissionMode::Streaming {
                    fcr.max_transmit = 0;
                    fcr.tx_win_sz = 0;
                }
            }

            self.fcrb.max_held_acks = fcr.tx_win_sz / 3;

            if link.peer_ext_fea.contains(ExtFeatures::NO_CRC) {
                if cfg.fcs == Some(L2CAP_CFG_FCS_BYPASS) {
                    self.bypass_fcs |= BypassFcs::OURS;
                }
            } else {
                cfg.fcs = None;
            }
        }

        self.our_cfg.fcr.mode = cfg.mode();
        self.our_cfg.fcr_present = cfg.fcr.is_some();

        let flush_to = cfg.flush_to?;
        if flush_to == 0 || flush_to == L2CAP_NO_AUTOMATIC_FLUSH {
            cfg.flush_to = None;
            return None;
        }
        self.our_cfg.flush_to = flush_to;

        if flush_to >= link.link_flush_tout {
            return None;
        }
        link.link_flush_tout = flush_to;
        if flush_to as u32 <= (crate::hci::constants::HCI_MAX_AUTO_FLUSH_TOUT as u32 * 5) / 8 {
            Some(((flush_to as u32 * 8 + 3) / 5) as u16)
        } else {
            None
        }
    }

    /// Record the Configure Response we are about to send
    pub(crate) fn process_our_cfg_rsp(&mut self, cfg: &mut ConfigInfo, config: &L2capConfig) {
        match cfg.qos {
            Some(qos) if self.peer_cfg.qos_present => self.peer_cfg.qos = qos,
            _ => cfg.qos = None,
        }
        self.adj_our_rsp_options(cfg, config);
    }

    /// Fill the FCR option of our response from what was negotiated
    fn adj_our_rsp_options(&mut self, cfg: &mut ConfigInfo, config: &L2capConfig) {
        self.adj_monitor_retran(config);

        if !self.out_cfg_fcr_present {
            cfg.fcr = None;
            return;
        }

        if self.peer_cfg.fcr.tx_win_sz > self.our_cfg.fcr.tx_win_sz {
            debug!(
                "L2CAP CID 0x{:04x} capping peer tx_win {} to {}",
                self.local_cid, self.peer_cfg.fcr.tx_win_sz, self.our_cfg.fcr.tx_win_sz
            );
            self.peer_cfg.fcr.tx_win_sz = self.our_cfg.fcr.tx_win_sz;
        }

        cfg.fcr = Some(FcrOptions {
            mode: self.peer_cfg.fcr.mode,
            tx_win_sz: self.peer_cfg.fcr.tx_win_sz,
            max_transmit: self.peer_cfg.fcr.max_transmit,
            mps: self.peer_cfg.fcr.mps,
            rtrans_tout: self.our_cfg.fcr.rtrans_tout,
            mon_tout: self.our_cfg.fcr.mon_tout,
        });
    }

    /// Force our monitor and retransmission timeouts to the ERTM minimums
    pub(crate) fn adj_monitor_retran(&mut self, config: &L2capConfig) {
        if !self.out_cfg_fcr_present {
            return;
        }
        if self.our_cfg.fcr.mode == RetransmissionMode::EnhancedRetransmission
            || self.peer_cfg.fcr.mode == RetransmissionMode::EnhancedRetransmission
        {
            self.our_cfg.fcr.mon_tout = config.min_monitor_tout_ms;
            self.our_cfg.fcr.rtrans_tout = config.min_retrans_tout_ms;
        } else {
            self.our_cfg.fcr.mon_tout = 0;
            self.our_cfg.fcr.rtrans_tout = 0;
        }
        debug!(
            "L2CAP CID 0x{:04x} mon_tout {} rtrans_tout {}",
            self.local_cid, self.our_cfg.fcr.mon_tout, self.our_cfg.fcr.rtrans_tout
        );
    }

    /// Size outgoing PDUs as whole multiples of the controller packet size
    pub(crate) fn adjust_out_mps(&mut self, config: &L2capConfig) {
        let overhead = L2CAP_MAX_HEADER_FCS;
        let peer_mps = self.peer_cfg.fcr.mps;

        if config.acl_data_size <= overhead {
            warn!(
                "L2CAP CID 0x{:04x} bad ACL packet size {}, using MPS {}",
                self.local_cid, config.acl_data_size, peer_mps
            );
            self.tx_mps = peer_mps;
            return;
        }

        let packet_size = config.acl_data_size - overhead;
        self.tx_mps = if peer_mps >= packet_size {
            peer_mps / packet_size * packet_size
        } else {
            peer_mps
        };
        debug!(
            "L2CAP CID 0x{:04x} tx MPS {} (peer MPS {}, packet size {})",
            self.local_cid, self.tx_mps, peer_mps, packet_size
        );
    }

    /// Drop the modes the peer's feature mask rules out and return what is left
    pub(crate) fn chk_chan_modes(&mut self, peer_ext_fea: ExtFeatures) -> ChannelModes {
        if !peer_ext_fea.contains(ExtFeatures::ENH_RETRANS) {
            self.ertm_info.allowed_modes.remove(ChannelModes::ERTM);
        }
        if !peer_ext_fea.contains(ExtFeatures::STREAM_MODE) {
            self.ertm_info.allowed_modes.remove(ChannelModes::STREAMING);
        }
        if self.ertm_info.allowed_modes.is_empty() {
            warn!(
                "L2CAP CID 0x{:04x} peer supports none of our channel modes",
                self.local_cid
            );
        }
        self.ertm_info.allowed_modes
    }

    /// Bring a client Configure Request in line with our mode preferences
    /// and the peer's capabilities
    pub(crate) fn adj_our_req_options(
        &mut self,
        peer_ext_fea: ExtFeatures,
        cfg: &mut ConfigInfo,
        config: &L2capConfig,
    ) -> OurReqVerdict {
        let preferred = self.ertm_info.preferred_mode;

        if let Some(fcr) = cfg.fcr.as_mut() {
            if fcr.mode != preferred {
                warn!(
                    "L2CAP CID 0x{:04x} requested mode {} overridden by preferred {}",
                    self.local_cid, fcr.mode, preferred
                );
                fcr.mode = preferred;
            }
            if self.ertm_info.allowed_modes == ChannelModes::BASIC {
                fcr.mode = RetransmissionMode::Basic;
            }
        }

        if cfg.fcr.is_none() || self.config_done.contains(ConfigDone::RECONFIG) {
            self.our_cfg.fcr_present = false;
            return OurReqVerdict::Ok;
        }

        let allowed = self.chk_chan_modes(peer_ext_fea);
        let mut fcr = cfg.fcr_or_basic();

        if allowed.is_empty() {
            return OurReqVerdict::Disconnect;
        } else if allowed == ChannelModes::BASIC {
            // Basic needs no FCR option at all
            fcr.mode = RetransmissionMode::Basic;
            cfg.fcr = None;
            cfg.fcs = None;
            cfg.ext_flow_spec = None;
        } else {
            if fcr.mode == RetransmissionMode::Streaming && !allowed.contains(ChannelModes::STREAMING) {
                debug!("L2CAP CID 0x{:04x} peer lacks streaming, trying ERTM", self.local_cid);
                fcr.mode = RetransmissionMode::EnhancedRetransmission;
            }
            if fcr.mode == RetransmissionMode::EnhancedRetransmission
                && !allowed.contains(ChannelModes::ERTM)
            {
                debug!("L2CAP CID 0x{:04x} peer lacks ERTM, trying Basic", self.local_cid);
                fcr.mode = RetransmissionMode::Basic;
            }
        }

        if fcr.mode != RetransmissionMode::Basic {
            if cfg.mtu.is_some_and(|mtu| mtu > self.max_rx_mtu) {
                warn!(
                    "L2CAP CID 0x{:04x} MTU {:?} larger than buffer {}",
                    self.local_cid, cfg.mtu, self.max_rx_mtu
                );
                return OurReqVerdict::Invalid;
            }

            if fcr.mps == L2CAP_DEFAULT_ERM_MPS {
                fcr.mps = config.mps_over_br_edr;
            } else if fcr.mps > self.max_rx_mtu {
                warn!(
                    "L2CAP CID 0x{:04x} MPS {} larger than MTU {}",
                    self.local_cid, fcr.mps, self.max_rx_mtu
                );
                return OurReqVerdict::Invalid;
            }

            fcr.mps = fcr.mps.min(L2CAP_MTU_SIZE - L2CAP_MAX_HEADER_FCS);
        } else {
            cfg.fcs = None;
            cfg.ext_flow_spec = None;
        }

        if cfg.fcr.is_some() {
            cfg.fcr = Some(fcr);
        }
        self.our_cfg.fcr = fcr;
        OurReqVerdict::Ok
    }

    /// Decide how to answer a negative response to our Configure Request
    pub(crate) fn renegotiate(&mut self, cfg: &mut ConfigInfo) -> Renegotiation {
        let Some(peer_fcr) = cfg.fcr else {
            return Renegotiation::None;
        };
        if self.config_done.contains(ConfigDone::RECONFIG) {
            return Renegotiation::None;
        }

        let our_mode = self.our_cfg.fcr.mode;
        let mut peer_mode = our_mode;

        if cfg.result == L2CAP_CFG_UNACCEPTABLE_PARAMS {
            peer_mode = peer_fcr.mode;

            if our_mode != peer_mode {
                self.fcr_cfg_tries = self.fcr_cfg_tries.saturating_sub(1);
                if self.fcr_cfg_tries == 0 {
                    warn!("L2CAP CID 0x{:04x} mode renegotiation retries exhausted", self.local_cid);
                    cfg.result = L2CAP_CFG_FAILED_NO_REASON;
                }

                let allowed = self.ertm_info.allowed_modes;
                let fallback = match our_mode {
                    RetransmissionMode::Streaming
                        if peer_mode == RetransmissionMode::EnhancedRetransmission
                            && allowed.contains(ChannelModes::ERTM) =>
                    {
                        Some(RetransmissionMode::EnhancedRetransmission)
                    }
                    RetransmissionMode::Streaming | RetransmissionMode::EnhancedRetransmission
                        if allowed.contains(ChannelModes::BASIC) =>
                    {
                        Some(RetransmissionMode::Basic)
                    }
                    _ => None,
                };

                if let Some(mode) = fallback {
                    debug!(
                        "L2CAP CID 0x{:04x} renegotiating {} -> {}",
                        self.local_cid, our_mode, mode
                    );
                    self.our_cfg.fcr.mode = mode;
                    self.our_cfg.fcr_present = true;

                    if mode == RetransmissionMode::Basic {
                        self.our_cfg.fcs = None;
                        self.our_cfg.ext_flow_spec = None;
                        if let Some(mtu) = cfg.mtu.as_mut() {
                            *mtu = (*mtu).min(L2CAP_MTU_SIZE);
                        }
                    }
                    return Renegotiation::Resend(self.our_cfg.to_info());
                }
            }
        }

        if self.our_cfg.fcr.mode != peer_mode {
            warn!(
                "L2CAP CID 0x{:04x} channel modes incompatible (local {}, peer {})",
                self.local_cid, self.our_cfg.fcr.mode, peer_mode
            );
            return Renegotiation::Disconnect;
        }
        Renegotiation::None
    }
}
