//! L2CAP Signaling channel implementation
//!
//! This module encodes and decodes the BR/EDR signaling commands carried on
//! CID 0x0001: connection, configuration, disconnection and information
//! requests with their responses, plus Command Reject.

use super::constants::*;
use super::packet::{encode_basic_pdu, L2capCommandHeader};
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Connection Request
    ConnectionRequest {
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    },

    /// Connection Response
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },

    /// Configuration Request
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        flags: u16,
        config: ConfigInfo,
        /// Raw non-hint options this stack does not understand
        unknown: Vec<u8>,
    },

    /// Configuration Response
    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        flags: u16,
        result: u16,
        config: ConfigInfo,
        /// Options echoed back with an "unknown options" result
        unknown: Vec<u8>,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Information Request
    InformationRequest {
        identifier: SignalId,
        info_type: u16,
    },

    /// Information Response
    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },
}

fn short(what: &str) -> L2capError {
    L2capError::MalformedFrame(format!("{} too short", what))
}

impl SignalingMessage {
    /// Get the command code for this message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
        }
    }

    /// Get the identifier for this message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. } => *identifier,
        }
    }

    /// Parse configuration options.
    ///
    /// Returns the recognized options and the raw bytes of any non-hint
    /// option this stack does not know. Unknown hint options are skipped.
    pub fn parse_config_options(data: &[u8]) -> L2capResult<(ConfigInfo, Vec<u8>)> {
        let mut cfg = ConfigInfo::default();
        let mut unknown = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            if offset + 2 > data.len() {
                return Err(short("Configuration option header"));
            }
            let raw_type = data[offset];
            let option_type = raw_type & !L2CAP_CONF_HINT;
            let option_length = data[offset + 1] as usize;
            let end = offset + 2 + option_length;

            if end > data.len() {
                return Err(short("Configuration option"));
            }

            let option_data = &data[offset + 2..end];
            let mut cursor = Cursor::new(option_data);

            match option_type {
                L2CAP_CONF_MTU => {
                    cfg.mtu = Some(cursor.read_u16::<LittleEndian>().map_err(|_| short("MTU option"))?);
                }
                L2CAP_CONF_FLUSH_TIMEOUT => {
                    cfg.flush_to = Some(
                        cursor
                            .read_u16::<LittleEndian>()
                            .map_err(|_| short("Flush timeout option"))?,
                    );
                }
                L2CAP_CONF_QOS => {
                    if option_length < L2CAP_CONF_QOS_LEN as usize {
                        return Err(short("QoS option"));
                    }
                    cfg.qos = Some(QosFlowSpec {
                        flags: option_data[0],
                        service_type: option_data[1],
                        token_rate: u32::from_le_bytes([option_data[2], option_data[3], option_data[4], option_data[5]]),
                        token_bucket_size: u32::from_le_bytes([option_data[6], option_data[7], option_data[8], option_data[9]]),
                        peak_bandwidth: u32::from_le_bytes([option_data[10], option_data[11], option_data[12], option_data[13]]),
                        latency: u32::from_le_bytes([option_data[14], option_data[15], option_data[16], option_data[17]]),
                        delay_variation: u32::from_le_bytes([option_data[18], option_data[19], option_data[20], option_data[21]]),
                    });
                }
                L2CAP_CONF_RFC => {
                    let mode = cursor.read_u8().map_err(|_| short("RFC option"))?;
                    let mut fcr = FcrOptions {
                        mode: RetransmissionMode::from_u8(mode),
                        ..FcrOptions::default()
                    };
                    // Some peers send a bare mode byte for Basic mode
                    if option_length >= L2CAP_CONF_RFC_LEN as usize {
                        fcr.tx_win_sz = cursor.read_u8().map_err(|_| short("RFC option"))?;
                        fcr.max_transmit = cursor.read_u8().map_err(|_| short("RFC option"))?;
                        fcr.rtrans_tout = cursor.read_u16::<LittleEndian>().map_err(|_| short("RFC option"))?;
                        fcr.mon_tout = cursor.read_u16::<LittleEndian>().map_err(|_| short("RFC option"))?;
                        fcr.mps = cursor.read_u16::<LittleEndian>().map_err(|_| short("RFC option"))?;
                    }
                    cfg.fcr = Some(fcr);
                }
                L2CAP_CONF_FCS => {
                    cfg.fcs = Some(cursor.read_u8().map_err(|_| short("FCS option"))?);
                }
                L2CAP_CONF_EXT_FLOW_SPEC => {
                    if option_length < L2CAP_CONF_EXT_FLOW_SPEC_LEN as usize {
                        return Err(short("Extended flow spec option"));
                    }
                    let read = |c: &mut Cursor<&[u8]>| -> std::io::Result<ExtendedFlowSpec> {
                        Ok(ExtendedFlowSpec {
                            identifier: c.read_u8()?,
                            service_type: c.read_u8()?,
                            max_sdu_size: c.read_u16::<LittleEndian>()?,
                            sdu_inter_arrival_time: c.read_u32::<LittleEndian>()?,
                            access_latency: c.read_u32::<LittleEndian>()?,
                            flush_timeout: c.read_u32::<LittleEndian>()?,
                        })
                    };
                    cfg.ext_flow_spec = Some(read(&mut cursor).map_err(|_| short("Extended flow spec option"))?);
                }
                _ if raw_type & L2CAP_CONF_HINT != 0 => {}
                _ => unknown.extend_from_slice(&data[offset..end]),
            }

            offset = end;
        }

        Ok((cfg, unknown))
    }

    /// Serialize configuration options to bytes
    pub fn serialize_config_options(cfg: &ConfigInfo) -> Vec<u8> {
        let mut result = Vec::new();

        if let Some(mtu) = cfg.mtu {
            result.push(L2CAP_CONF_MTU);
            result.push(L2CAP_CONF_MTU_LEN);
            result.extend_from_slice(&mtu.to_le_bytes());
        }

        if let Some(flush_to) = cfg.flush_to {
            result.push(L2CAP_CONF_FLUSH_TIMEOUT);
            result.push(L2CAP_CONF_FLUSH_TIMEOUT_LEN);
            result.extend_from_slice(&flush_to.to_le_bytes());
        }

        if let Some(qos) = cfg.qos {
            result.push(L2CAP_CONF_QOS);
            result.push(L2CAP_CONF_QOS_LEN);
            result.push(qos.flags);
            result.push(qos.service_type);
            result.extend_from_slice(&qos.token_rate.to_le_bytes());
            result.extend_from_slice(&qos.token_bucket_size.to_le_bytes());
            result.extend_from_slice(&qos.peak_bandwidth.to_le_bytes());
            result.extend_from_slice(&qos.latency.to_le_bytes());
            result.extend_from_slice(&qos.delay_variation.to_le_bytes());
        }

        if let Some(fcr) = cfg.fcr {
            result.push(L2CAP_CONF_RFC);
            result.push(L2CAP_CONF_RFC_LEN);
            result.push(fcr.mode.as_u8());
            result.push(fcr.tx_win_sz);
            result.push(fcr.max_transmit);
            result.extend_from_slice(&fcr.rtrans_tout.to_le_bytes());
            result.extend_from_slice(&fcr.mon_tout.to_le_bytes());
            result.extend_from_slice(&fcr.mps.to_le_bytes());
        }

        if let Some(fcs) = cfg.fcs {
            result.push(L2CAP_CONF_FCS);
            result.push(L2CAP_CONF_FCS_LEN);
            result.push(fcs);
        }

        if let Some(efs) = cfg.ext_flow_spec {
            result.push(L2CAP_CONF_EXT_FLOW_SPEC);
            result.push(L2CAP_CONF_EXT_FLOW_SPEC_LEN);
            result.push(efs.identifier);
            result.push(efs.service_type);
            result.extend_from_slice(&efs.max_sdu_size.to_le_bytes());
            result.extend_from_slice(&efs.sdu_inter_arrival_time.to_le_bytes());
            result.extend_from_slice(&efs.access_latency.to_le_bytes());
            result.extend_from_slice(&efs.flush_timeout.to_le_bytes());
        }

        result
    }

    /// Split a signaling PDU payload into its commands.
    ///
    /// Each slice holds one command header and its parameters. A truncated
    /// trailing command ends the walk.
    pub fn split_commands(data: &[u8]) -> Vec<(L2capCommandHeader, &[u8])> {
        let mut commands = Vec::new();
        let mut offset = 0;

        while let Some(header) = L2capCommandHeader::parse(&data[offset..]) {
            let end = offset + L2CAP_CMD_HEADER_SIZE + header.length as usize;
            if end > data.len() {
                break;
            }
            commands.push((header, &data[offset..end]));
            offset = end;
        }

        commands
    }

    /// Parse a signaling message from raw bytes
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let cmd_header = L2capCommandHeader::parse(data).ok_or_else(|| short("Command header"))?;

        let params = &data[L2CAP_CMD_HEADER_SIZE..];
        if params.len() < cmd_header.length as usize {
            return Err(short("Command parameters"));
        }
        let params = &params[..cmd_header.length as usize];
        let identifier = cmd_header.identifier;
        let mut cursor = Cursor::new(params);

        let message = match cmd_header.code {
            L2CAP_COMMAND_REJECT => {
                let reason = cursor.read_u16::<LittleEndian>().map_err(|_| short("Command reject"))?;
                Self::CommandReject {
                    identifier,
                    reason,
                    data: params[2..].to_vec(),
                }
            }

            L2CAP_CONNECTION_REQUEST => {
                let psm = cursor.read_u16::<LittleEndian>().map_err(|_| short("Connection request"))?;
                let source_cid = cursor.read_u16::<LittleEndian>().map_err(|_| short("Connection request"))?;
                Self::ConnectionRequest {
                    identifier,
                    psm,
                    source_cid,
                }
            }

            L2CAP_CONNECTION_RESPONSE => {
                let mut fields = [0u16; 4];
                for field in fields.iter_mut() {
                    *field = cursor.read_u16::<LittleEndian>().map_err(|_| short("Connection response"))?;
                }
                Self::ConnectionResponse {
                    identifier,
                    destination_cid: fields[0],
                    source_cid: fields[1],
                    result: fields[2],
                    status: fields[3],
                }
            }

            L2CAP_CONFIGURE_REQUEST => {
                let destination_cid = cursor.read_u16::<LittleEndian>().map_err(|_| short("Configure request"))?;
                let flags = cursor.read_u16::<LittleEndian>().map_err(|_| short("Configure request"))?;
                let (mut config, unknown) = Self::parse_config_options(&params[4..])?;
                config.flags = flags;
                Self::ConfigureRequest {
                    identifier,
                    destination_cid,
                    flags,
                    config,
                    unknown,
                }
            }

            L2CAP_CONFIGURE_RESPONSE => {
                let source_cid = cursor.read_u16::<LittleEndian>().map_err(|_| short("Configure response"))?;
                let flags = cursor.read_u16::<LittleEndian>().map_err(|_| short("Configure response"))?;
                let result = cursor.read_u16::<LittleEndian>().map_err(|_| short("Configure response"))?;
                let (mut config, unknown) = Self::parse_config_options(&params[6..])?;
                config.flags = flags;
                config.result = result;
                Self::ConfigureResponse {
                    identifier,
                    source_cid,
                    flags,
                    result,
                    config,
                    unknown,
                }
            }

            L2CAP_DISCONNECTION_REQUEST | L2CAP_DISCONNECTION_RESPONSE => {
                let destination_cid = cursor.read_u16::<LittleEndian>().map_err(|_| short("Disconnection"))?;
                let source_cid = cursor.read_u16::<LittleEndian>().map_err(|_| short("Disconnection"))?;
                if cmd_header.code == L2CAP_DISCONNECTION_REQUEST {
                    Self::DisconnectionRequest {
                        identifier,
                        destination_cid,
                        source_cid,
                    }
                } else {
                    Self::DisconnectionResponse {
                        identifier,
                        destination_cid,
                        source_cid,
                    }
                }
            }

            L2CAP_INFORMATION_REQUEST => {
                let info_type = cursor.read_u16::<LittleEndian>().map_err(|_| short("Information request"))?;
                Self::InformationRequest { identifier, info_type }
            }

            L2CAP_INFORMATION_RESPONSE => {
                let info_type = cursor.read_u16::<LittleEndian>().map_err(|_| short("Information response"))?;
                let result = cursor.read_u16::<LittleEndian>().map_err(|_| short("Information response"))?;
                Self::InformationResponse {
                    identifier,
                    info_type,
                    result,
                    data: params[4..].to_vec(),
                }
            }

            code => {
                return Err(L2capError::ProtocolError(format!(
                    "Unsupported signaling command 0x{:02x}",
                    code
                )))
            }
        };

        Ok(message)
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = Vec::new();

        match self {
            Self::CommandReject { reason, data, .. } => {
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
            }

            Self::ConnectionRequest { psm, source_cid, .. } => {
                params.extend_from_slice(&psm.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }

            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&status.to_le_bytes());
            }

            Self::ConfigureRequest {
                destination_cid,
                flags,
                config,
                unknown,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&Self::serialize_config_options(config));
                params.extend_from_slice(unknown);
            }

            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                config,
                unknown,
                ..
            } => {
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&Self::serialize_config_options(config));
                params.extend_from_slice(unknown);
            }

            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }

            Self::InformationRequest { info_type, .. } => {
                params.extend_from_slice(&info_type.to_le_bytes());
            }

            Self::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                params.extend_from_slice(&info_type.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(data);
            }
        }

        let cmd_header = L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16);

        let mut result = Vec::with_capacity(L2CAP_CMD_HEADER_SIZE + params.len());
        result.extend_from_slice(&cmd_header.to_bytes());
        result.append(&mut params);
        result
    }

    /// Complete signaling channel PDU carrying this message
    pub fn to_pdu(&self) -> Vec<u8> {
        encode_basic_pdu(L2CAP_SIGNALING_CID, &self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_request_wire_format() {
        let msg = SignalingMessage::ConnectionRequest {
            identifier: 7,
            psm: 0x0019,
            source_cid: 0x0040,
        };
        assert_eq!(msg.serialize(), vec![0x02, 0x07, 0x04, 0x00, 0x19, 0x00, 0x40, 0x00]);

        let pdu = msg.to_pdu();
        assert_eq!(&pdu[..4], &[0x08, 0x00, 0x01, 0x00]);
        assert_eq!(SignalingMessage::parse(&pdu[4..]).unwrap(), msg);
    }

    #[test]
    fn test_command_header_bytes() {
        let header = L2capCommandHeader::new(0x04, 0x9A, 0x0312);
        assert_eq!(header.to_bytes(), [0x04, 0x9A, 0x12, 0x03]);
        assert_eq!(L2capCommandHeader::parse(&header.to_bytes()), Some(header));
    }

    #[test]
    fn test_configure_request_with_rfc_option() {
        let config = ConfigInfo {
            mtu: Some(1691),
            fcr: Some(FcrOptions {
                rtrans_tout: 2000,
                mon_tout: 12000,
                ..FcrOptions::ertm(10, 20, 1010)
            }),
            fcs: Some(L2CAP_CFG_FCS_BYPASS),
            ..ConfigInfo::default()
        };
        let msg = SignalingMessage::ConfigureRequest {
            identifier: 3,
            destination_cid: 0x0041,
            flags: 0,
            config: config.clone(),
            unknown: Vec::new(),
        };

        let bytes = msg.serialize();
        // MTU, RFC and FCS options after the 4 fixed bytes
        assert_eq!(bytes.len(), 4 + 4 + 4 + 11 + 3);
        assert_eq!(
            &bytes[12..23],
            &[0x04, 0x09, 0x03, 0x0A, 0x14, 0xD0, 0x07, 0xE0, 0x2E, 0xF2, 0x03]
        );

        match SignalingMessage::parse(&bytes).unwrap() {
            SignalingMessage::ConfigureRequest { config: parsed, .. } => assert_eq!(parsed, config),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_options_split_by_hint_bit() {
        // Unknown hint option 0x87, MTU, unknown non-hint option 0x09
        let options = [0x87, 0x01, 0xAA, 0x01, 0x02, 0x00, 0x01, 0x09, 0x02, 0x01, 0x02];
        let (cfg, unknown) = SignalingMessage::parse_config_options(&options).unwrap();
        assert_eq!(cfg.mtu, Some(256));
        assert_eq!(unknown, vec![0x09, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn test_truncated_option_is_malformed() {
        let options = [0x01, 0x02, 0x00];
        assert!(matches!(
            SignalingMessage::parse_config_options(&options),
            Err(L2capError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_bare_basic_rfc_option() {
        let (cfg, _) = SignalingMessage::parse_config_options(&[0x04, 0x01, 0x00]).unwrap();
        assert_eq!(cfg.fcr, Some(FcrOptions::basic()));
    }

    #[test]
    fn test_split_commands() {
        let a = SignalingMessage::InformationRequest {
            identifier: 1,
            info_type: L2CAP_INFO_TYPE_EXTENDED_FEATURES,
        };
        let b = SignalingMessage::DisconnectionRequest {
            identifier: 2,
            destination_cid: 0x40,
            source_cid: 0x41,
        };
        let mut data = a.serialize();
        data.extend(b.serialize());
        // Truncated trailing command
        data.extend([0x06, 0x03, 0x04, 0x00, 0x40]);

        let commands = SignalingMessage::split_commands(&data);
        assert_eq!(commands.len(), 2);
        assert_eq!(SignalingMessage::parse(commands[0].1).unwrap(), a);
        assert_eq!(SignalingMessage::parse(commands[1].1).unwrap(), b);
    }

    #[test]
    fn test_unsupported_command() {
        // Echo request
        let data = [0x08, 0x05, 0x00, 0x00];
        assert!(matches!(
            SignalingMessage::parse(&data),
            Err(L2capError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_information_response_carries_feature_mask() {
        let msg = SignalingMessage::InformationResponse {
            identifier: 9,
            info_type: L2CAP_INFO_TYPE_EXTENDED_FEATURES,
            result: L2CAP_INFO_RESP_RESULT_SUCCESS,
            data: 0x0000_00B8u32.to_le_bytes().to_vec(),
        };
        let parsed = SignalingMessage::parse(&msg.serialize()).unwrap();
        assert_eq!(parsed, msg);
    }
}
