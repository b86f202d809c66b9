//! Flow Control and Retransmission engine
//!
//! ERTM and Streaming mode run on top of a dynamic channel. The engine works
//! on one [`L2capChannel`] at a time through an [`FcrContext`] that lends it
//! the channel's link, the timer service and the protocol settings. Anything
//! that has to go back through the channel state machine (delivering an SDU,
//! pumping the link, reporting completed SDUs, tearing the channel down) is
//! recorded as an [`FcrAction`] and applied by the manager once the engine
//! returns.

use log::{debug, trace, warn};

use super::channel::{FcrBlock, HeldFrame, L2capChannel, TxPdu};
use super::constants::*;
use super::link::Link;
use super::packet::{
    ctrl_sar, ctrl_tx_seq, decode_pdu, encode_pdu, read_sdu_len, s_frame_control, seq_distance,
    seq_next, FlushPolicy, Frame, SarType, SupervisoryFunction, TxTag,
};
use super::timer::{TimerId, TimerService};
use super::types::{ChannelState, L2capConfig, RetransmissionMode};

/// Follow-up work the engine leaves for the manager, applied in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FcrAction {
    /// Pump the link transmit path
    CheckSend,
    /// SDUs acknowledged by the peer; 0xFFFF when every queue drained
    TxComplete(u16),
    /// A complete SDU was received
    Deliver(Vec<u8>),
    /// Unrecoverable protocol error; the channel must be disconnected
    Disconnect,
}

/// Resources the engine borrows while working on one channel
pub struct FcrContext<'a> {
    pub link: &'a mut Link,
    pub timers: &'a mut dyn TimerService,
    pub config: &'a L2capConfig,
    pub actions: Vec<FcrAction>,
    /// Set once a disconnect has been requested; nothing else is queued after
    pub disconnected: bool,
}

impl<'a> FcrContext<'a> {
    pub fn new(link: &'a mut Link, timers: &'a mut dyn TimerService, config: &'a L2capConfig) -> Self {
        Self {
            link,
            timers,
            config,
            actions: Vec::new(),
            disconnected: false,
        }
    }

    fn push(&mut self, action: FcrAction) {
        if !self.disconnected {
            self.actions.push(action);
        }
    }

    fn check_send(&mut self) {
        self.push(FcrAction::CheckSend);
    }

    fn disconnect(&mut self) {
        self.push(FcrAction::Disconnect);
        self.disconnected = true;
    }

    pub fn into_actions(self) -> Vec<FcrAction> {
        self.actions
    }
}

/// Poll/Final bit carried by an S-frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PfBit {
    None,
    Poll,
    Final,
}

/// Which frames a retransmission covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retransmit {
    All,
    Single(u8),
}

impl L2capChannel {
    fn peer_is_ertm(&self) -> bool {
        self.peer_cfg.fcr.mode == RetransmissionMode::EnhancedRetransmission
    }

    /// Start the monitor timer while a poll is outstanding, otherwise the
    /// retransmission timer. A running timer is left alone.
    pub(crate) fn fcr_start_timer(&self, ctx: &mut FcrContext<'_>) {
        let id = TimerId::MonitorRetrans(self.local_cid);
        if ctx.timers.is_running(id) {
            return;
        }
        let tout = if self.fcrb.wait_ack {
            self.our_cfg.fcr.mon_tout
        } else {
            self.our_cfg.fcr.rtrans_tout
        };
        ctx.timers.start(id, std::time::Duration::from_millis(tout as u64));
    }

    pub(crate) fn fcr_stop_timer(&self, ctx: &mut FcrContext<'_>) {
        ctx.timers.stop(TimerId::MonitorRetrans(self.local_cid));
    }

    fn stop_ack_timer(&self, ctx: &mut FcrContext<'_>) {
        ctx.timers.stop(TimerId::Ack(self.local_cid));
    }

    /// Stop both FCR timers and drop every FCR queue
    pub(crate) fn fcr_cleanup(&mut self, timers: &mut dyn TimerService) {
        timers.stop(TimerId::MonitorRetrans(self.local_cid));
        timers.stop(TimerId::Ack(self.local_cid));
        self.cleanup();
    }

    /// Supervisory function answering a poll, given our receive state
    fn poll_response_function(&self) -> SupervisoryFunction {
        if self.fcrb.srej_sent {
            SupervisoryFunction::Srej
        } else if self.fcrb.local_busy {
            SupervisoryFunction::Rnr
        } else {
            SupervisoryFunction::Rr
        }
    }

    fn ready_function(&self) -> SupervisoryFunction {
        if self.fcrb.local_busy {
            SupervisoryFunction::Rnr
        } else {
            SupervisoryFunction::Rr
        }
    }

    /// Queue an S-frame on the link, acknowledging everything received so far
    pub(crate) fn send_s_frame(
        &mut self,
        ctx: &mut FcrContext<'_>,
        function: SupervisoryFunction,
        pf: PfBit,
    ) {
        if self.state != ChannelState::Open {
            return;
        }

        if pf == PfBit::Poll {
            self.fcrb.wait_ack = true;
            self.fcr_stop_timer(ctx);
            self.fcr_start_timer(ctx);
        }

        let req_seq = self.fcrb.next_seq_expected;
        let ctrl = s_frame_control(function, req_seq, pf == PfBit::Poll, pf == PfBit::Final);
        trace!(
            "L2CAP CID 0x{:04x} send S-frame {:?} ReqSeq {} {:?} ctrl 0x{:04x}",
            self.local_cid,
            function,
            req_seq,
            pf,
            ctrl
        );

        let pdu = encode_pdu(self.remote_cid, ctrl, &[], self.use_fcs());
        ctx.link.enqueue(0, pdu, false);
        ctx.check_send();

        self.fcrb.last_ack_sent = req_seq;
        self.stop_ack_timer(ctx);
    }

    /// Stamp the control word and FCS on an I-frame about to go out
    fn prepare_i_frame(&mut self, ctx: &mut FcrContext<'_>, pdu: &mut TxPdu, retrans: bool) -> Vec<u8> {
        let set_f = std::mem::take(&mut self.fcrb.send_f_rsp);

        let mut ctrl = if retrans {
            pdu.ctrl & !(L2CAP_FCR_REQ_SEQ_BITS | L2CAP_FCR_F_BIT)
        } else {
            let ctrl = (pdu.tag.sar.bits() << L2CAP_FCR_SAR_BITS_SHIFT)
                | ((self.fcrb.next_tx_seq as u16) << L2CAP_FCR_TX_SEQ_BITS_SHIFT);
            self.fcrb.next_tx_seq = seq_next(self.fcrb.next_tx_seq);
            ctrl
        };

        if self.peer_is_ertm() {
            if set_f {
                ctrl |= L2CAP_FCR_F_BIT;
            }
            ctrl |= (self.fcrb.next_seq_expected as u16) << L2CAP_FCR_REQ_SEQ_BITS_SHIFT;
            self.fcrb.last_ack_sent = self.fcrb.next_seq_expected;
            self.stop_ack_timer(ctx);
        }
        pdu.ctrl = ctrl;

        trace!(
            "L2CAP CID 0x{:04x} {} I-frame TxSeq {} SAR {:?} len {}",
            self.local_cid,
            if retrans { "resend" } else { "send" },
            ctrl_tx_seq(ctrl),
            pdu.tag.sar,
            pdu.payload.len()
        );
        let bytes = encode_pdu(self.remote_cid, ctrl, &pdu.payload, self.use_fcs());

        if self.peer_is_ertm() {
            self.fcr_start_timer(ctx);
        }
        bytes
    }

    /// Next PDU this channel wants on the air: a pending retransmission
    /// first, otherwise the next segment of the SDU at the head of the hold
    /// queue.
    pub(crate) fn get_next_xmit_sdu_seg(
        &mut self,
        ctx: &mut FcrContext<'_>,
    ) -> Option<(Vec<u8>, FlushPolicy)> {
        if let Some(mut pdu) = self.fcrb.retrans_q.pop_front() {
            let bytes = self.prepare_i_frame(ctx, &mut pdu, true);
            return Some((bytes, pdu.tag.flush));
        }

        let max_pdu = match self.tx_mps as usize {
            0 => usize::MAX,
            mps => mps,
        };

        let sdu = self.xmit_hold_q.front_mut()?;
        let flush = sdu.tag.flush;
        let (sar, payload) = if sdu.remaining() > max_pdu {
            let first = !sdu.is_segmenting();
            let mut payload = Vec::with_capacity(max_pdu + L2CAP_SDU_LEN_SIZE);
            if first {
                payload.extend_from_slice(&(sdu.data.len() as u16).to_le_bytes());
            }
            payload.extend_from_slice(&sdu.data[sdu.offset..sdu.offset + max_pdu]);
            sdu.offset += max_pdu;
            let sar = if first { SarType::Start } else { SarType::Continuation };
            (sar, payload)
        } else {
            let sdu = self.xmit_hold_q.pop_front()?;
            let sar = if sdu.is_segmenting() { SarType::End } else { SarType::Unsegmented };
            (sar, sdu.data[sdu.offset..].to_vec())
        };

        let mut pdu = TxPdu {
            ctrl: 0,
            payload,
            tag: TxTag { flush, sar },
        };
        let bytes = self.prepare_i_frame(ctx, &mut pdu, false);

        if self.peer_is_ertm() {
            self.fcrb.waiting_for_ack_q.push_back(pdu);
        }
        Some((bytes, flush))
    }

    /// Process one ERTM or Streaming PDU received on this channel. `pdu`
    /// starts with the basic L2CAP header.
    pub(crate) fn fcr_proc_pdu(&mut self, ctx: &mut FcrContext<'_>, pdu: &[u8]) {
        let with_fcs = self.use_fcs();
        let min_len = L2CAP_FCR_CONTROL_SIZE + if with_fcs { L2CAP_FCS_LEN } else { 0 };
        if pdu.len() < L2CAP_BASIC_HEADER_SIZE + min_len {
            warn!(
                "L2CAP CID 0x{:04x} dropping short PDU, len {}",
                self.local_cid,
                pdu.len()
            );
            return;
        }

        if self.peer_cfg.fcr.mode == RetransmissionMode::Streaming {
            self.process_stream_frame(ctx, pdu);
            return;
        }

        let Some((_, mut frame)) = decode_pdu(pdu, with_fcs) else {
            warn!("L2CAP CID 0x{:04x} dropping PDU with bad FCS", self.local_cid);
            return;
        };
        trace!("L2CAP CID 0x{:04x} rx {:?}", self.local_cid, frame_summary(&frame));

        if self.fcrb.wait_ack {
            if !frame.is_final() {
                if let Frame::S { poll: true, .. } = frame {
                    debug!(
                        "L2CAP CID 0x{:04x} peer polled while we wait for F-bit",
                        self.local_cid
                    );
                    let function = self.poll_response_function();
                    self.send_s_frame(ctx, function, PfBit::Final);
                    ctx.timers.start(
                        TimerId::MonitorRetrans(self.local_cid),
                        ctx.config.poll_recovery_timeout,
                    );
                }
                debug!(
                    "L2CAP CID 0x{:04x} dropping frame without F-bit while waiting for ack",
                    self.local_cid
                );
                return;
            }

            self.fcrb.wait_ack = false;
            if let Frame::S { poll, .. } = &mut frame {
                *poll = false;
            }
            if self.fcrb.waiting_for_ack_q.is_empty() {
                self.fcrb.num_tries = 0;
            }
            self.fcr_stop_timer(ctx);
        } else {
            match &mut frame {
                Frame::I { final_bit, .. } | Frame::S { final_bit, .. } => *final_bit = false,
            }
        }

        if !self.process_reqseq(ctx, &frame) {
            return;
        }

        let ctrl = frame.control_word();
        match frame {
            Frame::S {
                function,
                poll,
                final_bit,
                req_seq,
            } => self.process_s_frame(ctx, function, poll, final_bit, req_seq),
            Frame::I { payload, .. } => self.process_i_frame(ctx, ctrl, payload, false),
        }

        if ctx.disconnected || self.state != ChannelState::Open {
            return;
        }

        // Replay frames held for a selective reject once the gap is filled
        if !self.fcrb.local_busy && !self.fcrb.srej_sent && !self.fcrb.srej_rcv_hold_q.is_empty() {
            let held = std::mem::take(&mut self.fcrb.srej_rcv_hold_q);
            debug!(
                "L2CAP CID 0x{:04x} replaying {} held frames",
                self.local_cid,
                held.len()
            );
            for frame in held {
                if self.state != ChannelState::Open || ctx.disconnected {
                    break;
                }
                self.process_i_frame(ctx, frame.ctrl, frame.payload, true);
                if self.fcrb.rej_after_srej {
                    self.fcrb.rej_after_srej = false;
                    self.fcrb.rej_sent = true;
                    self.send_s_frame(ctx, SupervisoryFunction::Rej, PfBit::None);
                }
            }

            if !self.fcrb.local_busy
                && !self.fcrb.rej_sent
                && !self.fcrb.srej_sent
                && self.fcrb.next_seq_expected != self.fcrb.last_ack_sent
            {
                self.send_s_frame(ctx, SupervisoryFunction::Rr, PfBit::None);
            }
        }

        if (!self.fcrb.retrans_q.is_empty() || !self.xmit_hold_q.is_empty())
            && !self.fcrb.wait_ack
            && !self.is_flow_controlled()
        {
            ctx.check_send();
        }
    }

    /// Monitor or retransmission timer expired
    pub(crate) fn fcr_proc_tout(&mut self, ctx: &mut FcrContext<'_>) {
        debug!(
            "L2CAP CID 0x{:04x} FCR timeout, tries {} wait_ack {} unacked {}",
            self.local_cid,
            self.fcrb.num_tries,
            self.fcrb.wait_ack,
            self.fcrb.waiting_for_ack_q.len()
        );

        let max_transmit = self.peer_cfg.fcr.max_transmit;
        if max_transmit != 0 {
            self.fcrb.num_tries = self.fcrb.num_tries.saturating_add(1);
            if self.fcrb.num_tries > max_transmit {
                warn!(
                    "L2CAP CID 0x{:04x} max transmit {} exceeded, disconnecting",
                    self.local_cid, max_transmit
                );
                ctx.disconnect();
                return;
            }
        }

        if !self.fcrb.srej_sent && !self.fcrb.rej_sent {
            let function = self.ready_function();
            self.send_s_frame(ctx, function, PfBit::Poll);
        }
    }

    /// Deferred acknowledgment timer expired
    pub(crate) fn fcr_proc_ack_tout(&mut self, ctx: &mut FcrContext<'_>) {
        trace!(
            "L2CAP CID 0x{:04x} ack timeout, expected {} last ack sent {}",
            self.local_cid,
            self.fcrb.next_seq_expected,
            self.fcrb.last_ack_sent
        );
        if self.state == ChannelState::Open
            && !self.fcrb.wait_ack
            && self.fcrb.last_ack_sent != self.fcrb.next_seq_expected
        {
            let function = self.ready_function();
            self.send_s_frame(ctx, function, PfBit::None);
        }
    }

    /// Retire the frames the peer acknowledged through ReqSeq
    fn process_reqseq(&mut self, ctx: &mut FcrContext<'_>, frame: &Frame) -> bool {
        // SREJ without P only asks for one frame; it acknowledges nothing
        if let Frame::S {
            function: SupervisoryFunction::Srej,
            poll: false,
            ..
        } = frame
        {
            if !self.fcrb.waiting_for_ack_q.is_empty() {
                self.fcr_start_timer(ctx);
            }
            return true;
        }

        let req_seq = frame.req_seq();
        let num_acked = seq_distance(req_seq, self.fcrb.last_rx_ack) as usize;
        if num_acked > self.fcrb.waiting_for_ack_q.len() {
            warn!(
                "L2CAP CID 0x{:04x} bad ReqSeq {}: last ack {} with {} unacked",
                self.local_cid,
                req_seq,
                self.fcrb.last_rx_ack,
                self.fcrb.waiting_for_ack_q.len()
            );
            ctx.disconnect();
            return false;
        }
        self.fcrb.last_rx_ack = req_seq;

        if num_acked != 0 {
            self.fcrb.num_tries = 0;
            let full_sdus = self
                .fcrb
                .waiting_for_ack_q
                .drain(..num_acked)
                .filter(|pdu| pdu.tag.sar.completes_sdu())
                .count() as u16;

            if !self.fcrb.wait_ack {
                self.fcr_stop_timer(ctx);
            }

            if full_sdus > 0 {
                let count = if self.fcrb.waiting_for_ack_q.is_empty() && self.xmit_hold_q.is_empty() {
                    0xFFFF
                } else {
                    full_sdus
                };
                ctx.push(FcrAction::TxComplete(count));
            }
        }

        if !self.fcrb.waiting_for_ack_q.is_empty() {
            self.fcr_start_timer(ctx);
        }
        true
    }

    fn process_s_frame(
        &mut self,
        ctx: &mut FcrContext<'_>,
        function: SupervisoryFunction,
        poll: bool,
        final_bit: bool,
        req_seq: u8,
    ) {
        if poll {
            self.fcrb.rej_sent = false;
            self.fcrb.send_f_rsp = true;
        }

        let all_ok = match function {
            SupervisoryFunction::Rr => {
                let was_busy = std::mem::replace(&mut self.fcrb.remote_busy, false);
                if final_bit || was_busy {
                    self.retransmit_i_frames(ctx, Retransmit::All)
                } else {
                    true
                }
            }
            SupervisoryFunction::Rej => {
                self.fcrb.remote_busy = false;
                self.retransmit_i_frames(ctx, Retransmit::All)
            }
            SupervisoryFunction::Rnr => {
                self.fcrb.remote_busy = true;
                self.fcr_stop_timer(ctx);
                true
            }
            SupervisoryFunction::Srej => {
                self.fcrb.remote_busy = false;
                self.retransmit_i_frames(ctx, Retransmit::Single(req_seq))
            }
        };

        if all_ok && self.fcrb.send_f_rsp {
            let function = self.poll_response_function();
            self.send_s_frame(ctx, function, PfBit::Final);
            self.fcrb.send_f_rsp = false;
        }
    }

    fn process_i_frame(&mut self, ctx: &mut FcrContext<'_>, ctrl: u16, payload: Vec<u8>, delay_ack: bool) {
        let tx_seq = ctrl_tx_seq(ctrl);

        if ctrl & L2CAP_FCR_F_BIT != 0 && !self.retransmit_i_frames(ctx, Retransmit::All) {
            return;
        }

        if tx_seq != self.fcrb.next_seq_expected {
            if self.fcrb.local_busy {
                debug!(
                    "L2CAP CID 0x{:04x} busy, dropping TxSeq {}",
                    self.local_cid, tx_seq
                );
                self.send_s_frame(ctx, SupervisoryFunction::Rnr, PfBit::None);
                return;
            }
            self.process_out_of_sequence(ctx, tx_seq, ctrl, payload);
            return;
        }

        self.fcrb.rej_sent = false;
        self.fcrb.srej_sent = false;
        // Advance before delivery so data sent from the callback acks this frame
        self.fcrb.next_seq_expected = seq_next(tx_seq);

        if !self.do_sar_reassembly(ctx, ctrl_sar(ctrl), payload) {
            warn!(
                "L2CAP CID 0x{:04x} reassembly failed at TxSeq {}, disconnecting",
                self.local_cid, tx_seq
            );
            ctx.disconnect();
            return;
        }

        let num_to_ack = seq_distance(self.fcrb.next_seq_expected, self.fcrb.last_ack_sent);
        let delay_ack =
            delay_ack || (num_to_ack < self.fcrb.max_held_acks && !self.fcrb.local_busy);

        if num_to_ack == 0 || self.state != ChannelState::Open || ctx.disconnected {
            return;
        }

        if delay_ack {
            let id = TimerId::Ack(self.local_cid);
            if !ctx.timers.is_running(id) {
                ctx.timers.start(id, ctx.config.ack_timeout);
            }
        } else if (self.xmit_hold_q.is_empty() || self.is_flow_controlled())
            && self.fcrb.srej_rcv_hold_q.is_empty()
        {
            let function = self.ready_function();
            self.send_s_frame(ctx, function, PfBit::None);
        }
    }

    fn process_out_of_sequence(&mut self, ctx: &mut FcrContext<'_>, tx_seq: u8, ctrl: u16, payload: Vec<u8>) {
        let expected = self.fcrb.next_seq_expected;
        let num_lost = seq_distance(tx_seq, expected);
        let tx_win = self.our_cfg.fcr.tx_win_sz;

        if num_lost >= tx_win {
            debug!(
                "L2CAP CID 0x{:04x} duplicate TxSeq {}, expected {}",
                self.local_cid, tx_seq, expected
            );
            return;
        }

        if self.fcrb.srej_sent {
            let next_held = self
                .fcrb
                .srej_rcv_hold_q
                .back()
                .map(|held| seq_next(held.tx_seq));
            if next_held == Some(tx_seq) && self.fcrb.srej_rcv_hold_q.len() < tx_win as usize {
                trace!(
                    "L2CAP CID 0x{:04x} holding TxSeq {} behind SREJ",
                    self.local_cid,
                    tx_seq
                );
                self.fcrb.srej_rcv_hold_q.push_back(HeldFrame {
                    tx_seq,
                    ctrl,
                    payload,
                });
            } else {
                debug!(
                    "L2CAP CID 0x{:04x} lost frame while SREJ outstanding, TxSeq {}",
                    self.local_cid, tx_seq
                );
                self.fcrb.rej_after_srej = true;
            }
        } else if self.fcrb.rej_sent {
            debug!(
                "L2CAP CID 0x{:04x} REJ outstanding, dropping TxSeq {}",
                self.local_cid, tx_seq
            );
        } else if num_lost > 1 {
            debug!(
                "L2CAP CID 0x{:04x} lost {} frames, sending REJ for {}",
                self.local_cid, num_lost, expected
            );
            self.fcrb.rej_sent = true;
            self.send_s_frame(ctx, SupervisoryFunction::Rej, PfBit::None);
            self.stop_ack_timer(ctx);
        } else {
            debug!(
                "L2CAP CID 0x{:04x} lost TxSeq {}, sending SREJ",
                self.local_cid, expected
            );
            self.fcrb.srej_rcv_hold_q.push_back(HeldFrame {
                tx_seq,
                ctrl,
                payload,
            });
            self.fcrb.srej_sent = true;
            self.send_s_frame(ctx, SupervisoryFunction::Srej, PfBit::None);
            self.stop_ack_timer(ctx);
        }
    }

    fn process_stream_frame(&mut self, ctx: &mut FcrContext<'_>, pdu: &[u8]) {
        let Some((_, frame)) = decode_pdu(pdu, self.use_fcs()) else {
            warn!("L2CAP CID 0x{:04x} dropping stream PDU with bad FCS", self.local_cid);
            return;
        };

        let Frame::I {
            sar,
            tx_seq,
            payload,
            ..
        } = frame
        else {
            debug!("L2CAP CID 0x{:04x} dropping S-frame in streaming mode", self.local_cid);
            return;
        };

        if tx_seq != self.fcrb.next_seq_expected {
            debug!(
                "L2CAP CID 0x{:04x} stream gap: TxSeq {} expected {}",
                self.local_cid, tx_seq, self.fcrb.next_seq_expected
            );
            self.fcrb.rx_sdu = None;
        }
        self.fcrb.next_seq_expected = seq_next(tx_seq);

        if !self.do_sar_reassembly(ctx, sar, payload) {
            debug!(
                "L2CAP CID 0x{:04x} discarding partial SDU at TxSeq {}",
                self.local_cid, tx_seq
            );
            self.fcrb.rx_sdu = None;
        }
    }

    /// Append one I-frame payload to the SDU being rebuilt
    fn do_sar_reassembly(&mut self, ctx: &mut FcrContext<'_>, sar: SarType, payload: Vec<u8>) -> bool {
        let fcrb = &mut self.fcrb;
        match sar {
            SarType::Unsegmented => {
                if fcrb.rx_sdu.is_some() {
                    return false;
                }
                ctx.push(FcrAction::Deliver(payload));
                true
            }
            SarType::Start => {
                if fcrb.rx_sdu.is_some() {
                    return false;
                }
                let Ok(sdu_len) = read_sdu_len(&payload) else {
                    return false;
                };
                if sdu_len > self.max_rx_mtu {
                    warn!(
                        "L2CAP CID 0x{:04x} SDU length {} above MTU {}",
                        self.local_cid, sdu_len, self.max_rx_mtu
                    );
                    return false;
                }
                fcrb.rx_sdu_len = sdu_len;
                fcrb.rx_sdu = Some(Vec::with_capacity(sdu_len as usize));
                Self::append_segment(fcrb, ctx, &payload[L2CAP_SDU_LEN_SIZE..], false)
            }
            SarType::Continuation | SarType::End => {
                if fcrb.rx_sdu.is_none() {
                    return false;
                }
                Self::append_segment(fcrb, ctx, &payload, sar == SarType::End)
            }
        }
    }

    fn append_segment(
        fcrb: &mut FcrBlock,
        ctx: &mut FcrContext<'_>,
        data: &[u8],
        is_end: bool,
    ) -> bool {
        let expected = fcrb.rx_sdu_len as usize;
        let Some(sdu) = fcrb.rx_sdu.as_mut() else {
            return false;
        };
        let total = sdu.len() + data.len();
        if total > expected || (is_end && total != expected) {
            return false;
        }
        sdu.extend_from_slice(data);

        if is_end {
            if let Some(sdu) = fcrb.rx_sdu.take() {
                ctx.push(FcrAction::Deliver(sdu));
            }
        }
        true
    }

    fn retransmit_i_frames(&mut self, ctx: &mut FcrContext<'_>, which: Retransmit) -> bool {
        let max_transmit = self.peer_cfg.fcr.max_transmit;
        if !self.fcrb.waiting_for_ack_q.is_empty()
            && max_transmit != 0
            && self.fcrb.num_tries >= max_transmit
        {
            warn!(
                "L2CAP CID 0x{:04x} retransmit limit {} reached, disconnecting",
                self.local_cid, max_transmit
            );
            ctx.disconnect();
            return false;
        }

        match which {
            Retransmit::Single(seq) => {
                let Some(pdu) = self
                    .fcrb
                    .waiting_for_ack_q
                    .iter()
                    .find(|pdu| ctrl_tx_seq(pdu.ctrl) == seq)
                    .cloned()
                else {
                    debug!(
                        "L2CAP CID 0x{:04x} SREJ for TxSeq {} not in the unacked window",
                        self.local_cid, seq
                    );
                    return true;
                };
                debug!("L2CAP CID 0x{:04x} retransmitting TxSeq {}", self.local_cid, seq);
                self.fcrb.retrans_q.push_back(pdu);
            }
            Retransmit::All => {
                ctx.link.remove_channel_pdus(self.local_cid);
                self.fcrb.retrans_q.clear();
                debug!(
                    "L2CAP CID 0x{:04x} retransmitting {} unacked frames",
                    self.local_cid,
                    self.fcrb.waiting_for_ack_q.len()
                );
                let unacked: Vec<TxPdu> = self.fcrb.waiting_for_ack_q.iter().cloned().collect();
                self.fcrb.retrans_q.extend(unacked);
            }
        }

        ctx.check_send();

        if !self.fcrb.waiting_for_ack_q.is_empty() {
            self.fcrb.num_tries = self.fcrb.num_tries.saturating_add(1);
            self.fcr_start_timer(ctx);
        }
        true
    }

    /// Change the local busy condition and tell the peer
    pub(crate) fn fcr_set_local_busy(&mut self, ctx: &mut FcrContext<'_>, busy: bool) {
        if !self.peer_is_ertm() || self.fcrb.local_busy == busy {
            return;
        }
        debug!("L2CAP CID 0x{:04x} local busy {}", self.local_cid, busy);
        self.fcrb.local_busy = busy;

        if self.state == ChannelState::Open && !self.fcrb.wait_ack {
            if busy {
                self.send_s_frame(ctx, SupervisoryFunction::Rnr, PfBit::None);
            } else {
                self.send_s_frame(ctx, SupervisoryFunction::Rr, PfBit::Poll);
            }
        }
    }
}

fn frame_summary(frame: &Frame) -> String {
    match frame {
        Frame::I {
            sar,
            tx_seq,
            req_seq,
            final_bit,
            payload,
        } => format!(
            "I TxSeq {} ReqSeq {} {:?} F {} [{}]",
            tx_seq,
            req_seq,
            sar,
            final_bit,
            hex::encode(&payload[..payload.len().min(16)])
        ),
        Frame::S {
            function,
            poll,
            final_bit,
            req_seq,
        } => format!(
            "S {:?} ReqSeq {} P {} F {}",
            function, req_seq, poll, final_bit
        ),
    }
}

#[cfg(test)]
mod tests;
