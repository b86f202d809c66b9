//! Tests for the L2CAP implementation

#[cfg(test)]
mod tests {
    use super::super::constants::*;
    use super::super::core::*;
    use super::super::link::AclScheduler;
    use super::super::packet::*;
    use super::super::psm::*;
    use super::super::security::*;
    use super::super::signaling::*;
    use super::super::timer::*;
    use super::super::types::*;
    use crate::error::HciError;
    use crate::hci::constants::{HCI_ERR_AUTH_FAILURE, HCI_ERR_PEER_USER};
    use crate::hci::{AclPacket, CommandSender, HciCommand};
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const HANDLE: u16 = 0x0042;
    const TEST_PSM: u16 = 0x1001;
    const REMOTE_CID: u16 = 0x0071;

    fn peer_addr() -> BdAddr {
        BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Upcall {
        ConnectInd { cid: ChannelId, psm: u16, id: u8 },
        ConnectCfm { cid: ChannelId, result: u16 },
        ConnectPnd { cid: ChannelId },
        ConfigInd { cid: ChannelId },
        ConfigCfm { cid: ChannelId, result: u16 },
        DisconnectInd { cid: ChannelId, needs_ack: bool },
        DisconnectCfm { cid: ChannelId, result: u16 },
        Data { cid: ChannelId, sdu: Vec<u8> },
        Congestion { cid: ChannelId, congested: bool },
        TxComplete { cid: ChannelId, count: u16 },
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Upcall>>,
    }

    impl Recorder {
        fn record(&self, call: Upcall) {
            self.calls.lock().unwrap().push(call);
        }

        fn take(&self) -> Vec<Upcall> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl L2capCallbacks for Recorder {
        fn connect_ind(&self, _bd_addr: BdAddr, cid: ChannelId, psm: u16, id: u8) {
            self.record(Upcall::ConnectInd { cid, psm, id });
        }

        fn connect_cfm(&self, cid: ChannelId, result: u16) {
            self.record(Upcall::ConnectCfm { cid, result });
        }

        fn connect_pnd(&self, cid: ChannelId) {
            self.record(Upcall::ConnectPnd { cid });
        }

        fn config_ind(&self, cid: ChannelId, _cfg: &ConfigInfo) {
            self.record(Upcall::ConfigInd { cid });
        }

        fn config_cfm(&self, cid: ChannelId, cfg: &ConfigInfo) {
            self.record(Upcall::ConfigCfm {
                cid,
                result: cfg.result,
            });
        }

        fn disconnect_ind(&self, cid: ChannelId, needs_ack: bool) {
            self.record(Upcall::DisconnectInd { cid, needs_ack });
        }

        fn disconnect_cfm(&self, cid: ChannelId, result: u16) {
            self.record(Upcall::DisconnectCfm { cid, result });
        }

        fn data_ind(&self, cid: ChannelId, sdu: Vec<u8>) {
            self.record(Upcall::Data { cid, sdu });
        }

        fn congestion_status(&self, cid: ChannelId, congested: bool) {
            self.record(Upcall::Congestion { cid, congested });
        }

        fn tx_complete(&self, cid: ChannelId, count: u16) {
            self.record(Upcall::TxComplete { cid, count });
        }
    }

    /// What the manager handed to the controller
    #[derive(Clone)]
    struct Wire {
        acl: Arc<Mutex<Vec<AclPacket>>>,
        commands: Arc<Mutex<Vec<HciCommand>>>,
        window: Arc<Mutex<usize>>,
        /// Transport refuses everything while set
        broken: Arc<Mutex<bool>>,
    }

    impl Wire {
        fn new() -> Self {
            Self {
                acl: Arc::default(),
                commands: Arc::default(),
                window: Arc::new(Mutex::new(8)),
                broken: Arc::default(),
            }
        }
    }

    struct TestScheduler(Wire);

    impl AclScheduler for TestScheduler {
        fn xmit_window(&self, _handle: u16) -> usize {
            *self.0.window.lock().unwrap()
        }

        fn transmit(&mut self, packet: AclPacket) -> Result<(), HciError> {
            if *self.0.broken.lock().unwrap() {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "transport down").into());
            }
            self.0.acl.lock().unwrap().push(packet);
            Ok(())
        }
    }

    struct TestHci(Wire);

    impl CommandSender for TestHci {
        fn send_command(&mut self, command: HciCommand) -> Result<(), HciError> {
            if *self.0.broken.lock().unwrap() {
                return Err(HciError::SendError(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "transport down",
                )));
            }
            self.0.commands.lock().unwrap().push(command);
            Ok(())
        }
    }

    struct SharedTimers(Arc<Mutex<TimerQueue>>);

    impl TimerService for SharedTimers {
        fn start(&mut self, id: TimerId, timeout: Duration) {
            self.0.lock().unwrap().start(id, timeout);
        }

        fn stop(&mut self, id: TimerId) {
            self.0.lock().unwrap().stop(id);
        }

        fn is_running(&self, id: TimerId) -> bool {
            self.0.lock().unwrap().is_running(id)
        }
    }

    /// Answers every access request with a configurable status
    struct ScriptedSecurity {
        answer: Arc<Mutex<SecurityStatus>>,
        aborted: Arc<Mutex<usize>>,
    }

    impl SecurityManager for ScriptedSecurity {
        fn access_request(
            &mut self,
            _bd_addr: BdAddr,
            _psm: u16,
            _handle: Option<u16>,
            _is_originator: bool,
            _cid: ChannelId,
        ) -> SecurityStatus {
            *self.answer.lock().unwrap()
        }

        fn abort_access_request(&mut self, _bd_addr: BdAddr) {
            *self.aborted.lock().unwrap() += 1;
        }
    }

    struct Harness {
        mgr: L2capManager,
        wire: Wire,
        timers: Arc<Mutex<TimerQueue>>,
        security: Arc<Mutex<SecurityStatus>>,
        upper: Arc<Recorder>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_modes(ErtmInfo::default())
        }

        fn with_modes(ertm_info: ErtmInfo) -> Self {
            init_logging();
            let wire = Wire::new();
            let timers = Arc::new(Mutex::new(TimerQueue::new()));
            let security = Arc::new(Mutex::new(SecurityStatus::Success));
            let mut mgr = L2capManager::new(
                L2capConfig::default(),
                Box::new(SharedTimers(Arc::clone(&timers))),
                Box::new(ScriptedSecurity {
                    answer: Arc::clone(&security),
                    aborted: Arc::default(),
                }),
                Box::new(TestHci(wire.clone())),
                Box::new(TestScheduler(wire.clone())),
            );
            let upper = Arc::new(Recorder::default());
            mgr.register(TEST_PSM, upper.clone(), ertm_info).unwrap();

            Self {
                mgr,
                wire,
                timers,
                security,
                upper,
            }
        }

        fn timer_running(&self, id: TimerId) -> bool {
            self.timers.lock().unwrap().is_running(id)
        }

        fn expire(&mut self, id: TimerId) {
            self.timers.lock().unwrap().stop(id);
            self.mgr.timer_expired(id);
        }

        fn set_window(&self, window: usize) {
            *self.wire.window.lock().unwrap() = window;
        }

        fn set_broken(&self, broken: bool) {
            *self.wire.broken.lock().unwrap() = broken;
        }

        fn hci_commands(&self) -> Vec<HciCommand> {
            std::mem::take(&mut *self.wire.commands.lock().unwrap())
        }

        /// Every PDU sent so far; drains the capture
        fn sent(&self) -> Vec<AclPacket> {
            std::mem::take(&mut *self.wire.acl.lock().unwrap())
        }

        /// Signaling commands sent so far; drains the capture
        fn signals(&self) -> Vec<SignalingMessage> {
            self.sent()
                .iter()
                .filter_map(|packet| {
                    let header = L2capHeader::parse(&packet.data)?;
                    (header.channel_id == L2CAP_SIGNALING_CID).then(|| {
                        SignalingMessage::split_commands(&packet.data[L2CAP_BASIC_HEADER_SIZE..])
                            .into_iter()
                            .filter_map(|(_, raw)| SignalingMessage::parse(raw).ok())
                            .collect::<Vec<_>>()
                    })
                })
                .flatten()
                .collect()
        }

        /// I-frames sent to the peer's CID; drains the capture
        fn sent_i_frames(&self) -> Vec<Frame> {
            self.sent()
                .iter()
                .filter_map(|packet| decode_pdu(&packet.data, true))
                .filter(|(header, frame)| header.channel_id == REMOTE_CID && matches!(frame, Frame::I { .. }))
                .map(|(_, frame)| frame)
                .collect()
        }

        fn peer(&mut self, message: SignalingMessage) {
            self.mgr.receive_acl(HANDLE, &message.to_pdu()).unwrap();
        }

        /// Bring the ACL link up and finish the extended features exchange
        fn connect_link(&mut self, features: ExtFeatures) {
            self.mgr.link_connected(HANDLE, peer_addr());
            let identifier = self
                .signals()
                .into_iter()
                .find_map(|msg| match msg {
                    SignalingMessage::InformationRequest {
                        identifier,
                        info_type: L2CAP_INFO_TYPE_EXTENDED_FEATURES,
                    } => Some(identifier),
                    _ => None,
                })
                .expect("information request");
            self.peer(SignalingMessage::InformationResponse {
                identifier,
                info_type: L2CAP_INFO_TYPE_EXTENDED_FEATURES,
                result: L2CAP_INFO_RESP_RESULT_SUCCESS,
                data: features.bits().to_le_bytes().to_vec(),
            });
        }

        fn last_connect_request(&self) -> u8 {
            self.signals()
                .into_iter()
                .find_map(|msg| match msg {
                    SignalingMessage::ConnectionRequest { identifier, .. } => Some(identifier),
                    _ => None,
                })
                .expect("connection request")
        }

        fn last_config_request(&self) -> (u8, ConfigInfo) {
            self.signals()
                .into_iter()
                .filter_map(|msg| match msg {
                    SignalingMessage::ConfigureRequest {
                        identifier, config, ..
                    } => Some((identifier, config)),
                    _ => None,
                })
                .last()
                .expect("configure request")
        }

        fn peer_config_rsp(&mut self, identifier: u8, cid: ChannelId, result: u16, config: ConfigInfo) {
            self.peer(SignalingMessage::ConfigureResponse {
                identifier,
                source_cid: cid,
                flags: 0,
                result,
                config,
                unknown: Vec::new(),
            });
        }

        fn peer_config_req(&mut self, cid: ChannelId, config: ConfigInfo) {
            self.peer(SignalingMessage::ConfigureRequest {
                identifier: 0x20,
                destination_cid: cid,
                flags: 0,
                config,
                unknown: Vec::new(),
            });
        }

        /// Outgoing Basic mode channel taken all the way to OPEN
        fn open_outgoing(&mut self) -> ChannelId {
            self.connect_link(ExtFeatures::ENH_RETRANS | ExtFeatures::FIXED_CHNLS);
            let cid = self.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
            let identifier = self.last_connect_request();
            self.peer(SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: REMOTE_CID,
                source_cid: cid,
                result: L2CAP_CONN_OK,
                status: L2CAP_CONN_STATUS_NONE,
            });

            self.mgr
                .config_req(
                    cid,
                    ConfigInfo {
                        mtu: Some(672),
                        ..ConfigInfo::default()
                    },
                )
                .unwrap();
            let (identifier, _) = self.last_config_request();
            self.peer_config_rsp(identifier, cid, L2CAP_CFG_OK, ConfigInfo::default());
            self.peer_config_req(
                cid,
                ConfigInfo {
                    mtu: Some(672),
                    ..ConfigInfo::default()
                },
            );
            self.mgr
                .config_rsp(
                    cid,
                    ConfigInfo {
                        result: L2CAP_CFG_OK,
                        ..ConfigInfo::default()
                    },
                )
                .unwrap();

            assert_eq!(self.mgr.channel(cid).unwrap().state(), ChannelState::Open);
            self.upper.take();
            self.sent();
            cid
        }

        /// Outgoing ERTM channel taken to OPEN, the peer granting a window
        /// of `peer_tx_win` frames
        fn open_ertm(&mut self, peer_tx_win: u8) -> ChannelId {
            self.connect_link(ExtFeatures::ENH_RETRANS | ExtFeatures::FIXED_CHNLS);
            let cid = self.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
            let identifier = self.last_connect_request();
            self.peer(SignalingMessage::ConnectionResponse {
                identifier,
                destination_cid: REMOTE_CID,
                source_cid: cid,
                result: L2CAP_CONN_OK,
                status: L2CAP_CONN_STATUS_NONE,
            });

            self.mgr
                .config_req(
                    cid,
                    ConfigInfo {
                        mtu: Some(L2CAP_DEFAULT_MTU),
                        fcr: Some(FcrOptions::ertm(10, 3, L2CAP_DEFAULT_ERM_MPS)),
                        ..ConfigInfo::default()
                    },
                )
                .unwrap();
            let (identifier, _) = self.last_config_request();
            self.peer_config_rsp(
                identifier,
                cid,
                L2CAP_CFG_OK,
                ConfigInfo {
                    fcr: Some(FcrOptions::ertm(10, 3, L2CAP_MPS_OVER_BR_EDR)),
                    ..ConfigInfo::default()
                },
            );
            self.peer_config_req(
                cid,
                ConfigInfo {
                    mtu: Some(L2CAP_DEFAULT_MTU),
                    fcr: Some(FcrOptions::ertm(peer_tx_win, 3, 200)),
                    ..ConfigInfo::default()
                },
            );
            self.mgr
                .config_rsp(
                    cid,
                    ConfigInfo {
                        result: L2CAP_CFG_OK,
                        ..ConfigInfo::default()
                    },
                )
                .unwrap();

            let ch = self.mgr.channel(cid).unwrap();
            assert_eq!(ch.state(), ChannelState::Open);
            assert_eq!(ch.peer_mode(), RetransmissionMode::EnhancedRetransmission);
            self.upper.take();
            self.sent();
            cid
        }
    }

    #[test]
    fn test_psm_value_conversion() {
        assert_eq!(PSM::SDP.value(), 0x0001);
        assert_eq!(PSM::RFCOMM.value(), 0x0003);
        assert_eq!(PSM::AVDTP.value(), 0x0019);
        assert_eq!(PSM::Dynamic(0x1001).value(), 0x1001);

        assert_eq!(PSM::from_value(0x0001), PSM::SDP);
        assert_eq!(PSM::from_value(0x0003), PSM::RFCOMM);
        assert_eq!(PSM::from_value(0x1001), PSM::Dynamic(0x1001));

        assert!(PSM::SDP.is_valid());
        assert!(PSM::Dynamic(0x1001).is_valid());
        // Even values and a set bit 8 are reserved
        assert!(!PSM::Dynamic(0x1002).is_valid());
        assert!(!PSM::Dynamic(0x0101).is_valid());
    }

    #[test]
    fn test_register_rejects_bad_psm_and_modes() {
        let mut h = Harness::new();
        let upper: Arc<dyn L2capCallbacks> = h.upper.clone();

        assert!(matches!(
            h.mgr.register(0x1002, Arc::clone(&upper), ErtmInfo::default()),
            Err(L2capError::InvalidParameter(_))
        ));

        let streaming_not_allowed = ErtmInfo {
            preferred_mode: RetransmissionMode::Streaming,
            allowed_modes: ChannelModes::BASIC,
        };
        assert!(matches!(
            h.mgr.register(0x1003, upper, streaming_not_allowed),
            Err(L2capError::InvalidParameter(_))
        ));

        assert!(h.mgr.deregister(0x1005).is_err());
        assert!(h.mgr.deregister(TEST_PSM).is_ok());
        assert!(h.mgr.registration(TEST_PSM).is_none());
    }

    #[test]
    fn test_connect_without_link_creates_acl() {
        let mut h = Harness::new();
        let cid = h.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();

        assert_eq!(cid, L2CAP_BASE_APPL_CID);
        assert_eq!(h.mgr.channel(cid).unwrap().state(), ChannelState::Closed);
        assert!(matches!(
            h.hci_commands().as_slice(),
            [HciCommand::CreateConnection { bd_addr, .. }] if *bd_addr == peer_addr().bytes
        ));

        // Link up: security passes at once, connect waits for the features
        h.mgr.link_connected(HANDLE, peer_addr());
        assert_eq!(h.mgr.channel(cid).unwrap().state(), ChannelState::W4L2capConnectRsp);
        let signals = h.signals();
        assert!(signals
            .iter()
            .all(|msg| !matches!(msg, SignalingMessage::ConnectionRequest { .. })));

        h.peer(SignalingMessage::InformationResponse {
            identifier: 1,
            info_type: L2CAP_INFO_TYPE_EXTENDED_FEATURES,
            result: L2CAP_INFO_RESP_RESULT_SUCCESS,
            data: ExtFeatures::ENH_RETRANS.bits().to_le_bytes().to_vec(),
        });
        assert!(!h.timer_running(TimerId::Info(peer_addr())));
        assert_eq!(
            h.mgr.link(peer_addr()).unwrap().peer_ext_features(),
            ExtFeatures::ENH_RETRANS
        );
        assert!(matches!(
            h.signals().as_slice(),
            [SignalingMessage::ConnectionRequest { psm: TEST_PSM, source_cid, .. }] if *source_cid == cid
        ));
        assert!(h.timer_running(TimerId::Channel(cid)));
    }

    #[test]
    fn test_open_then_close() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::ENH_RETRANS);
        let cid = h.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
        let identifier = h.last_connect_request();

        h.peer(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_CONN_OK,
            status: L2CAP_CONN_STATUS_NONE,
        });
        assert_eq!(h.mgr.channel(cid).unwrap().state(), ChannelState::Config);
        assert_eq!(h.mgr.channel(cid).unwrap().remote_cid(), REMOTE_CID);
        assert_eq!(
            h.upper.take(),
            vec![Upcall::ConnectCfm {
                cid,
                result: L2CAP_CONN_OK
            }]
        );

        h.mgr
            .config_req(
                cid,
                ConfigInfo {
                    mtu: Some(672),
                    ..ConfigInfo::default()
                },
            )
            .unwrap();
        let (identifier, sent) = h.last_config_request();
        assert_eq!(sent.mtu, Some(672));
        assert_eq!(sent.fcr, None);

        h.peer_config_rsp(identifier, cid, L2CAP_CFG_OK, ConfigInfo::default());
        assert!(h
            .mgr
            .channel(cid)
            .unwrap()
            .config_done()
            .contains(ConfigDone::OB_DONE));

        h.peer_config_req(
            cid,
            ConfigInfo {
                mtu: Some(500),
                ..ConfigInfo::default()
            },
        );
        h.mgr
            .config_rsp(
                cid,
                ConfigInfo {
                    result: L2CAP_CFG_OK,
                    ..ConfigInfo::default()
                },
            )
            .unwrap();

        let ch = h.mgr.channel(cid).unwrap();
        assert_eq!(ch.state(), ChannelState::Open);
        assert_eq!(ch.peer_mtu(), 500);
        assert!(ch.config_done().contains(ConfigDone::RECONFIG));
        assert!(!h.timer_running(TimerId::Channel(cid)));
        assert_eq!(
            h.upper.take(),
            vec![
                Upcall::ConfigCfm {
                    cid,
                    result: L2CAP_CFG_OK
                },
                Upcall::ConfigInd { cid },
            ]
        );
        assert!(h.signals().iter().any(|msg| matches!(
            msg,
            SignalingMessage::ConfigureResponse { identifier: 0x20, source_cid: REMOTE_CID, result: L2CAP_CFG_OK, .. }
        )));

        // Local close
        h.mgr.disconnect_req(cid).unwrap();
        assert_eq!(
            h.mgr.channel(cid).unwrap().state(),
            ChannelState::W4L2capDisconnectRsp
        );
        let identifier = h
            .signals()
            .into_iter()
            .find_map(|msg| match msg {
                SignalingMessage::DisconnectionRequest {
                    identifier,
                    destination_cid: REMOTE_CID,
                    source_cid,
                } if source_cid == cid => Some(identifier),
                _ => None,
            })
            .expect("disconnection request");

        h.peer(SignalingMessage::DisconnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
        });
        assert!(h.mgr.channel(cid).is_none());
        assert_eq!(
            h.upper.take(),
            vec![Upcall::DisconnectCfm {
                cid,
                result: L2CAP_DISC_OK
            }]
        );
        // Last channel gone: the link idles out
        assert!(h.timer_running(TimerId::Link(peer_addr())));
    }

    #[test]
    fn test_peer_disconnect_from_open() {
        let mut h = Harness::new();
        let cid = h.open_outgoing();

        h.peer(SignalingMessage::DisconnectionRequest {
            identifier: 0x33,
            destination_cid: cid,
            source_cid: REMOTE_CID,
        });
        assert_eq!(
            h.mgr.channel(cid).unwrap().state(),
            ChannelState::W4L2caDisconnectRsp
        );
        assert_eq!(
            h.upper.take(),
            vec![Upcall::DisconnectInd {
                cid,
                needs_ack: true
            }]
        );

        h.mgr.disconnect_rsp(cid).unwrap();
        assert!(h.mgr.channel(cid).is_none());
        assert_eq!(
            h.signals(),
            vec![SignalingMessage::DisconnectionResponse {
                identifier: 0x33,
                destination_cid: cid,
                source_cid: REMOTE_CID,
            }]
        );
        assert!(h.upper.take().is_empty());
    }

    #[test]
    fn test_disconnect_for_unknown_channel_is_answered() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());

        h.peer(SignalingMessage::DisconnectionRequest {
            identifier: 7,
            destination_cid: 0x0055,
            source_cid: REMOTE_CID,
        });
        assert_eq!(
            h.signals(),
            vec![SignalingMessage::DisconnectionResponse {
                identifier: 7,
                destination_cid: 0x0055,
                source_cid: REMOTE_CID,
            }]
        );
    }

    #[test]
    fn test_security_failure_drops_idle_link() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());
        *h.security.lock().unwrap() = SecurityStatus::Started;

        let cid = h.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
        assert_eq!(h.mgr.channel(cid).unwrap().state(), ChannelState::OrigW4SecComp);

        h.mgr
            .security_complete(cid, SecurityStatus::Failed(HCI_ERR_AUTH_FAILURE));
        assert!(h.mgr.channel(cid).is_none());
        assert_eq!(
            h.upper.take(),
            vec![Upcall::ConnectCfm {
                cid,
                result: HCI_ERR_AUTH_FAILURE as u16
            }]
        );
        assert_eq!(
            h.hci_commands(),
            vec![HciCommand::Disconnect {
                handle: HANDLE,
                reason: HCI_ERR_PEER_USER
            }]
        );
        assert_eq!(
            h.mgr.link(peer_addr()).unwrap().state(),
            super::super::link::LinkState::Disconnecting
        );
    }

    #[test]
    fn test_immediate_security_refusal() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());
        *h.security.lock().unwrap() = SecurityStatus::Failed(HCI_ERR_AUTH_FAILURE);

        let cid = h.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
        assert!(h.mgr.channel(cid).is_none());
        assert_eq!(
            h.upper.take(),
            vec![Upcall::ConnectCfm {
                cid,
                result: L2CAP_CONN_SECURITY_BLOCK
            }]
        );
    }

    #[test]
    fn test_connect_timeout() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());
        let cid = h.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
        assert!(h.timer_running(TimerId::Channel(cid)));

        h.expire(TimerId::Channel(cid));
        assert!(h.mgr.channel(cid).is_none());
        assert_eq!(
            h.upper.take(),
            vec![Upcall::ConnectCfm {
                cid,
                result: L2CAP_CONN_TIMEOUT
            }]
        );
    }

    #[test]
    fn test_pending_connect_response_extends_timer() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());
        let cid = h.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
        let identifier = h.last_connect_request();

        h.peer(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_CONN_PENDING,
            status: L2CAP_CONN_STATUS_AUTHENTICATION,
        });
        assert_eq!(
            h.mgr.channel(cid).unwrap().state(),
            ChannelState::W4L2capConnectRsp
        );
        assert_eq!(h.upper.take(), vec![Upcall::ConnectPnd { cid }]);

        h.peer(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_CONN_NO_RESOURCES,
            status: L2CAP_CONN_STATUS_NONE,
        });
        assert!(h.mgr.channel(cid).is_none());
        assert_eq!(
            h.upper.take(),
            vec![Upcall::ConnectCfm {
                cid,
                result: L2CAP_CONN_NO_RESOURCES
            }]
        );
    }

    #[test]
    fn test_incoming_connection_accepted() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());

        h.peer(SignalingMessage::ConnectionRequest {
            identifier: 0x05,
            psm: TEST_PSM,
            source_cid: REMOTE_CID,
        });
        let cid = L2CAP_BASE_APPL_CID;
        assert_eq!(
            h.mgr.channel(cid).unwrap().state(),
            ChannelState::W4L2caConnectRsp
        );
        assert_eq!(
            h.upper.take(),
            vec![Upcall::ConnectInd {
                cid,
                psm: TEST_PSM,
                id: 0x05
            }]
        );

        h.mgr
            .connect_rsp(cid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
            .unwrap();
        assert_eq!(h.mgr.channel(cid).unwrap().state(), ChannelState::Config);
        assert_eq!(
            h.signals(),
            vec![SignalingMessage::ConnectionResponse {
                identifier: 0x05,
                destination_cid: cid,
                source_cid: REMOTE_CID,
                result: L2CAP_CONN_OK,
                status: L2CAP_CONN_STATUS_NONE,
            }]
        );
    }

    #[test]
    fn test_incoming_connection_during_slow_security_reports_pending_once() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());
        *h.security.lock().unwrap() = SecurityStatus::Started;

        h.peer(SignalingMessage::ConnectionRequest {
            identifier: 0x06,
            psm: TEST_PSM,
            source_cid: REMOTE_CID,
        });
        let cid = L2CAP_BASE_APPL_CID;
        assert_eq!(h.mgr.channel(cid).unwrap().state(), ChannelState::TermW4SecComp);
        assert!(matches!(
            h.signals().as_slice(),
            [SignalingMessage::ConnectionResponse { result: L2CAP_CONN_PENDING, .. }]
        ));

        h.mgr.resubmit_security(peer_addr());
        assert!(h.signals().is_empty());

        h.mgr.security_complete(cid, SecurityStatus::Failed(HCI_ERR_AUTH_FAILURE));
        assert!(h.mgr.channel(cid).is_none());
        assert!(matches!(
            h.signals().as_slice(),
            [SignalingMessage::ConnectionResponse { result: L2CAP_CONN_SECURITY_BLOCK, .. }]
        ));
    }

    #[test]
    fn test_unknown_psm_rejected() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());

        h.peer(SignalingMessage::ConnectionRequest {
            identifier: 0x09,
            psm: 0x1003,
            source_cid: REMOTE_CID,
        });
        assert!(h.mgr.channel(L2CAP_BASE_APPL_CID).is_none());
        assert_eq!(
            h.signals(),
            vec![SignalingMessage::ConnectionResponse {
                identifier: 0x09,
                destination_cid: 0,
                source_cid: REMOTE_CID,
                result: L2CAP_CONN_NO_PSM,
                status: L2CAP_CONN_STATUS_NONE,
            }]
        );
        assert!(h.upper.take().is_empty());
    }

    #[test]
    fn test_unknown_config_option_rejected() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());
        h.peer(SignalingMessage::ConnectionRequest {
            identifier: 0x05,
            psm: TEST_PSM,
            source_cid: REMOTE_CID,
        });
        let cid = L2CAP_BASE_APPL_CID;
        h.mgr
            .connect_rsp(cid, L2CAP_CONN_OK, L2CAP_CONN_STATUS_NONE)
            .unwrap();
        h.sent();
        h.upper.take();

        // Configure Request with an MTU and a non-hint option type 0x7f
        let mut params = Vec::new();
        params.extend_from_slice(&cid.to_le_bytes());
        params.extend_from_slice(&0u16.to_le_bytes());
        params.extend_from_slice(&[L2CAP_CONF_MTU, 2, 0xa0, 0x02, 0x7f, 1, 0xaa]);
        let mut command = L2capCommandHeader::new(L2CAP_CONFIGURE_REQUEST, 0x0a, params.len() as u16)
            .to_bytes()
            .to_vec();
        command.extend_from_slice(&params);
        h.mgr
            .receive_acl(HANDLE, &encode_basic_pdu(L2CAP_SIGNALING_CID, &command))
            .unwrap();

        assert_eq!(
            h.signals(),
            vec![SignalingMessage::ConfigureResponse {
                identifier: 0x0a,
                source_cid: REMOTE_CID,
                flags: 0,
                result: L2CAP_CFG_UNKNOWN_OPTIONS,
                config: ConfigInfo {
                    result: L2CAP_CFG_UNKNOWN_OPTIONS,
                    ..ConfigInfo::default()
                },
                unknown: vec![0x7f, 1, 0xaa],
            }]
        );
        assert!(h.upper.take().is_empty());
        assert_eq!(h.mgr.channel(cid).unwrap().state(), ChannelState::Config);
    }

    #[test]
    fn test_config_timeout_disconnects() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());
        let cid = h.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
        let identifier = h.last_connect_request();
        h.peer(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_CONN_OK,
            status: L2CAP_CONN_STATUS_NONE,
        });
        h.upper.take();

        h.expire(TimerId::Channel(cid));
        assert!(h.mgr.channel(cid).is_none());
        assert_eq!(
            h.upper.take(),
            vec![Upcall::DisconnectInd {
                cid,
                needs_ack: false
            }]
        );
        assert!(matches!(
            h.signals().as_slice(),
            [SignalingMessage::DisconnectionRequest { destination_cid: REMOTE_CID, .. }]
        ));
    }

    #[test]
    fn test_ertm_request_falls_back_to_basic() {
        let mut h = Harness::with_modes(ErtmInfo {
            preferred_mode: RetransmissionMode::EnhancedRetransmission,
            allowed_modes: ChannelModes::ERTM | ChannelModes::BASIC,
        });
        h.connect_link(ExtFeatures::ENH_RETRANS);
        let cid = h.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
        let identifier = h.last_connect_request();
        h.peer(SignalingMessage::ConnectionResponse {
            identifier,
            destination_cid: REMOTE_CID,
            source_cid: cid,
            result: L2CAP_CONN_OK,
            status: L2CAP_CONN_STATUS_NONE,
        });

        h.mgr
            .config_req(
                cid,
                ConfigInfo {
                    mtu: Some(672),
                    fcr: Some(FcrOptions::ertm(10, 3, L2CAP_DEFAULT_ERM_MPS)),
                    ..ConfigInfo::default()
                },
            )
            .unwrap();
        let (identifier, sent) = h.last_config_request();
        let fcr = sent.fcr.expect("RFC option");
        assert_eq!(fcr.mode, RetransmissionMode::EnhancedRetransmission);
        assert_eq!(fcr.mps, L2CAP_MPS_OVER_BR_EDR);

        // Peer only speaks Basic mode
        h.peer_config_rsp(
            identifier,
            cid,
            L2CAP_CFG_UNACCEPTABLE_PARAMS,
            ConfigInfo {
                fcr: Some(FcrOptions::basic()),
                ..ConfigInfo::default()
            },
        );
        let (identifier, resent) = h.last_config_request();
        assert_eq!(resent.mode(), RetransmissionMode::Basic);
        assert_eq!(h.mgr.channel(cid).unwrap().our_mode(), RetransmissionMode::Basic);

        h.peer_config_rsp(identifier, cid, L2CAP_CFG_OK, ConfigInfo::default());
        h.peer_config_req(
            cid,
            ConfigInfo {
                mtu: Some(672),
                ..ConfigInfo::default()
            },
        );
        h.mgr
            .config_rsp(
                cid,
                ConfigInfo {
                    result: L2CAP_CFG_OK,
                    ..ConfigInfo::default()
                },
            )
            .unwrap();

        let ch = h.mgr.channel(cid).unwrap();
        assert_eq!(ch.state(), ChannelState::Open);
        assert_eq!(ch.our_mode(), RetransmissionMode::Basic);
        assert_eq!(ch.peer_mode(), RetransmissionMode::Basic);
    }

    #[test]
    fn test_basic_data_path() {
        let mut h = Harness::new();
        let cid = h.open_outgoing();

        let status = h
            .mgr
            .data_write(cid, b"hello".to_vec(), FlushPolicy::NonFlushable)
            .unwrap();
        assert_eq!(status, DataWriteStatus::Success);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].handle, HANDLE);
        assert_eq!(sent[0].boundary, crate::hci::PacketBoundary::StartNonFlushable);
        assert_eq!(sent[0].data, encode_basic_pdu(REMOTE_CID, b"hello"));
        assert_eq!(h.upper.take(), vec![Upcall::TxComplete { cid, count: 1 }]);

        h.mgr
            .receive_acl(HANDLE, &encode_basic_pdu(cid, b"world"))
            .unwrap();
        assert_eq!(
            h.upper.take(),
            vec![Upcall::Data {
                cid,
                sdu: b"world".to_vec()
            }]
        );
    }

    #[test]
    fn test_data_write_checks_mtu() {
        let mut h = Harness::new();
        let cid = h.open_outgoing();

        let result = h
            .mgr
            .data_write(cid, vec![0u8; 673], FlushPolicy::ChannelBased);
        assert!(matches!(
            result,
            Err(L2capError::MtuExceeded { len: 673, mtu: 672 })
        ));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_congestion_reported_and_cleared() {
        let mut h = Harness::new();
        let cid = h.open_outgoing();
        h.set_window(0);

        for _ in 0..2 {
            assert_eq!(
                h.mgr
                    .data_write(cid, vec![1, 2, 3], FlushPolicy::ChannelBased)
                    .unwrap(),
                DataWriteStatus::Success
            );
        }
        assert_eq!(
            h.mgr
                .data_write(cid, vec![4, 5, 6], FlushPolicy::ChannelBased)
                .unwrap(),
            DataWriteStatus::Congested
        );
        assert_eq!(
            h.upper.take(),
            vec![Upcall::Congestion {
                cid,
                congested: true
            }]
        );
        assert!(matches!(
            h.mgr.data_write(cid, vec![7], FlushPolicy::ChannelBased),
            Err(L2capError::NoResources)
        ));
        assert!(h.sent().is_empty());

        h.set_window(8);
        h.mgr.acl_buffers_available(HANDLE);
        assert_eq!(h.sent().len(), 3);
        let calls = h.upper.take();
        assert!(calls.contains(&Upcall::Congestion {
            cid,
            congested: false
        }));
        assert_eq!(
            calls
                .iter()
                .filter(|call| matches!(call, Upcall::TxComplete { count: 1, .. }))
                .count(),
            3
        );
        assert!(!h.mgr.channel(cid).unwrap().is_congested());
    }

    #[test]
    fn test_link_loss_closes_open_channel() {
        let mut h = Harness::new();
        let cid = h.open_outgoing();

        h.mgr.link_disconnected(HANDLE, 0x08);
        assert!(h.mgr.channel(cid).is_none());
        assert!(h.mgr.link(peer_addr()).is_none());
        assert_eq!(
            h.upper.take(),
            vec![Upcall::DisconnectInd {
                cid,
                needs_ack: false
            }]
        );
    }

    #[test]
    fn test_link_idle_timeout_disconnects_acl() {
        let mut h = Harness::new();
        let cid = h.open_outgoing();
        h.mgr.disconnect_req(cid).unwrap();
        h.expire(TimerId::Channel(cid));
        assert_eq!(
            h.upper.take(),
            vec![Upcall::DisconnectCfm {
                cid,
                result: L2CAP_DISC_TIMEOUT
            }]
        );

        h.expire(TimerId::Link(peer_addr()));
        assert_eq!(
            h.hci_commands(),
            vec![HciCommand::Disconnect {
                handle: HANDLE,
                reason: HCI_ERR_PEER_USER
            }]
        );
    }

    #[test]
    fn test_information_request_answered() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());

        h.peer(SignalingMessage::InformationRequest {
            identifier: 0x44,
            info_type: L2CAP_INFO_TYPE_EXTENDED_FEATURES,
        });
        h.peer(SignalingMessage::InformationRequest {
            identifier: 0x45,
            info_type: L2CAP_INFO_TYPE_CONNLESS_MTU,
        });

        let local = h.mgr.config().local_ext_features.bits().to_le_bytes().to_vec();
        assert_eq!(
            h.signals(),
            vec![
                SignalingMessage::InformationResponse {
                    identifier: 0x44,
                    info_type: L2CAP_INFO_TYPE_EXTENDED_FEATURES,
                    result: L2CAP_INFO_RESP_RESULT_SUCCESS,
                    data: local,
                },
                SignalingMessage::InformationResponse {
                    identifier: 0x45,
                    info_type: L2CAP_INFO_TYPE_CONNLESS_MTU,
                    result: L2CAP_INFO_RESP_RESULT_NOT_SUPPORTED,
                    data: Vec::new(),
                },
            ]
        );
    }

    #[test]
    fn test_short_acl_packet_is_malformed() {
        let mut h = Harness::new();
        h.connect_link(ExtFeatures::empty());

        assert!(matches!(
            h.mgr.receive_acl(HANDLE, &[0x05, 0x00, 0x40]),
            Err(L2capError::MalformedFrame(_))
        ));
        assert!(matches!(
            h.mgr.receive_acl(HANDLE, &[0x05, 0x00, 0x40, 0x00, 0x01]),
            Err(L2capError::MalformedFrame(_))
        ));
    }

    fn ertm_harness() -> Harness {
        Harness::with_modes(ErtmInfo {
            preferred_mode: RetransmissionMode::EnhancedRetransmission,
            allowed_modes: ChannelModes::ERTM | ChannelModes::BASIC,
        })
    }

    fn tx_seqs(frames: &[Frame]) -> Vec<u8> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::I { tx_seq, .. } => Some(*tx_seq),
                Frame::S { .. } => None,
            })
            .collect()
    }

    fn peer_s_frame(h: &mut Harness, cid: ChannelId, function: SupervisoryFunction, req_seq: u8) {
        let pdu = encode_pdu(cid, s_frame_control(function, req_seq, false, false), &[], true);
        h.mgr.receive_acl(HANDLE, &pdu).unwrap();
    }

    #[test]
    fn test_ertm_send_window_limits_outstanding_frames() {
        let mut h = ertm_harness();
        let cid = h.open_ertm(2);
        assert_eq!(h.mgr.channel(cid).unwrap().peer_cfg.fcr.tx_win_sz, 2);

        for sdu in [b"one".to_vec(), b"two".to_vec(), b"three".to_vec()] {
            h.mgr.data_write(cid, sdu, FlushPolicy::NonFlushable).unwrap();
        }
        let frames = h.sent_i_frames();
        assert_eq!(tx_seqs(&frames), vec![0, 1]);
        assert!(matches!(&frames[0], Frame::I { payload, .. } if payload.as_slice() == b"one"));
        let ch = h.mgr.channel(cid).unwrap();
        assert!(ch.is_flow_controlled());
        assert_eq!(ch.hold_queue_len(), 1);

        // Acknowledging frame 0 opens one slot
        peer_s_frame(&mut h, cid, SupervisoryFunction::Rr, 1);
        let frames = h.sent_i_frames();
        assert_eq!(tx_seqs(&frames), vec![2]);
        assert!(matches!(&frames[0], Frame::I { payload, .. } if payload.as_slice() == b"three"));
        assert_eq!(h.upper.take(), vec![Upcall::TxComplete { cid, count: 1 }]);
        assert_eq!(h.mgr.channel(cid).unwrap().hold_queue_len(), 0);
    }

    #[test]
    fn test_ertm_remote_busy_blocks_sending() {
        let mut h = ertm_harness();
        let cid = h.open_ertm(2);

        for sdu in [b"one".to_vec(), b"two".to_vec()] {
            h.mgr.data_write(cid, sdu, FlushPolicy::NonFlushable).unwrap();
        }
        assert_eq!(tx_seqs(&h.sent_i_frames()), vec![0, 1]);

        // RNR acknowledges frame 0 but leaves the peer busy
        peer_s_frame(&mut h, cid, SupervisoryFunction::Rnr, 1);
        assert_eq!(h.upper.take(), vec![Upcall::TxComplete { cid, count: 1 }]);
        let ch = h.mgr.channel(cid).unwrap();
        assert!(ch.fcr().remote_busy);
        assert!(ch.is_flow_controlled());

        // A free window slot does not matter while the peer is busy
        h.mgr
            .data_write(cid, b"three".to_vec(), FlushPolicy::NonFlushable)
            .unwrap();
        assert!(h.sent_i_frames().is_empty());
        assert_eq!(h.mgr.channel(cid).unwrap().hold_queue_len(), 1);

        // RR clears the busy condition and acknowledges frame 1
        peer_s_frame(&mut h, cid, SupervisoryFunction::Rr, 2);
        let frames = h.sent_i_frames();
        assert_eq!(tx_seqs(&frames), vec![2]);
        assert!(matches!(&frames[0], Frame::I { payload, .. } if payload.as_slice() == b"three"));
        assert!(!h.mgr.channel(cid).unwrap().fcr().remote_busy);
        assert_eq!(h.upper.take(), vec![Upcall::TxComplete { cid, count: 1 }]);
    }

    #[test]
    fn test_transmit_failure_does_not_wedge_channel() {
        let mut h = Harness::new();
        let cid = h.open_outgoing();

        h.set_broken(true);
        let status = h
            .mgr
            .data_write(cid, b"lost".to_vec(), FlushPolicy::NonFlushable)
            .unwrap();
        assert_eq!(status, DataWriteStatus::Success);
        assert!(h.sent().is_empty());

        h.set_broken(false);
        h.upper.take();
        h.mgr
            .data_write(cid, b"again".to_vec(), FlushPolicy::NonFlushable)
            .unwrap();
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, encode_basic_pdu(REMOTE_CID, b"again"));
        assert_eq!(h.mgr.channel(cid).unwrap().state(), ChannelState::Open);
    }

    #[test]
    fn test_command_failure_leaves_channel_waiting_for_link() {
        let mut h = Harness::new();
        h.set_broken(true);

        let cid = h.mgr.connect_req(peer_addr(), TEST_PSM).unwrap();
        assert!(h.hci_commands().is_empty());
        assert!(h.mgr.channel(cid).is_some());
        assert!(h.mgr.link(peer_addr()).is_some());
    }

    #[test]
    fn test_raw_acl_packet_routed_and_parse_errors_surface() {
        let mut h = Harness::new();
        let cid = h.open_outgoing();

        let raw = AclPacket::new(
            HANDLE,
            crate::hci::PacketBoundary::StartFlushable,
            encode_basic_pdu(cid, b"raw"),
        )
        .to_packet(1021);
        h.mgr.receive_acl_packet(&raw[1..]).unwrap();
        assert_eq!(
            h.upper.take(),
            vec![Upcall::Data {
                cid,
                sdu: b"raw".to_vec()
            }]
        );

        assert!(matches!(
            h.mgr.receive_acl_packet(&[0x42, 0x20]),
            Err(L2capError::HciError(HciError::InvalidPacketFormat))
        ));
        assert!(matches!(
            h.mgr.receive_acl_packet(&[0x42, 0x20, 0x0A, 0x00, 0xAA]),
            Err(L2capError::HciError(HciError::InvalidParamLength(1)))
        ));

        let fragment = AclPacket::new(
            HANDLE,
            crate::hci::PacketBoundary::Continuation,
            vec![0x01, 0x02],
        )
        .to_packet(1021);
        assert!(matches!(
            h.mgr.receive_acl_packet(&fragment[1..]),
            Err(L2capError::MalformedFrame(_))
        ));
        assert!(h.upper.take().is_empty());
    }

    fn sar_type() -> impl Strategy<Value = SarType> {
        prop_oneof![
            Just(SarType::Unsegmented),
            Just(SarType::Start),
            Just(SarType::End),
            Just(SarType::Continuation),
        ]
    }

    fn supervisory_function() -> impl Strategy<Value = SupervisoryFunction> {
        prop_oneof![
            Just(SupervisoryFunction::Rr),
            Just(SupervisoryFunction::Rej),
            Just(SupervisoryFunction::Rnr),
            Just(SupervisoryFunction::Srej),
        ]
    }

    proptest! {
        #[test]
        fn prop_seq_distance_counts_steps(from in 0u8..64, steps in 0u8..64) {
            let mut to = from;
            for _ in 0..steps {
                to = seq_next(to);
            }
            prop_assert!(to < 64);
            prop_assert_eq!(seq_distance(to, from), steps);
        }

        #[test]
        fn prop_i_frame_survives_the_wire(
            sar in sar_type(),
            tx_seq in 0u8..64,
            req_seq in 0u8..64,
            final_bit in any::<bool>(),
            payload in proptest::collection::vec(any::<u8>(), 0..=L2CAP_MPS_OVER_BR_EDR as usize),
            with_fcs in any::<bool>(),
        ) {
            let frame = Frame::I { sar, tx_seq, req_seq, final_bit, payload };
            let pdu = frame.encode(REMOTE_CID, with_fcs);

            let (header, decoded) = decode_pdu(&pdu, with_fcs).expect("I-frame decodes");
            prop_assert_eq!(header.channel_id, REMOTE_CID);
            prop_assert_eq!(header.length as usize, pdu.len() - L2CAP_BASIC_HEADER_SIZE);
            prop_assert_eq!(decoded, frame);
        }

        #[test]
        fn prop_s_frame_survives_the_wire(
            function in supervisory_function(),
            poll in any::<bool>(),
            final_bit in any::<bool>(),
            req_seq in 0u8..64,
            with_fcs in any::<bool>(),
        ) {
            let frame = Frame::S { function, poll, final_bit, req_seq };
            let pdu = frame.encode(REMOTE_CID, with_fcs);

            let (header, decoded) = decode_pdu(&pdu, with_fcs).expect("S-frame decodes");
            prop_assert_eq!(header.channel_id, REMOTE_CID);
            prop_assert_eq!(decoded, frame);
        }

        #[test]
        fn prop_fcs_detects_single_bit_errors(
            payload in proptest::collection::vec(any::<u8>(), 1..64),
            bit in 0usize..512,
        ) {
            let mut pdu = encode_pdu(REMOTE_CID, 0x0102, &payload, true);
            prop_assert!(super::super::fcs::verify(&pdu));

            let bit = bit % ((pdu.len() - 2) * 8);
            pdu[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(!super::super::fcs::verify(&pdu));
        }
    }
}
