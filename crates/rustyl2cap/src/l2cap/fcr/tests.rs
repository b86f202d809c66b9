//! Unit tests for the FCR engine

use super::*;
use crate::l2cap::channel::TxSdu;
use crate::l2cap::timer::TimerQueue;
use crate::l2cap::types::{BdAddr, FcrOptions};

const LOCAL_CID: u16 = 0x0040;
const REMOTE_CID: u16 = 0x0050;

struct Harness {
    channel: L2capChannel,
    link: Link,
    timers: TimerQueue,
    config: L2capConfig,
}

impl Harness {
    fn ertm() -> Self {
        let config = L2capConfig::default();
        let mut channel = L2capChannel::new(LOCAL_CID, BdAddr::default(), 0x1001, &config);
        let fcr = FcrOptions {
            mode: RetransmissionMode::EnhancedRetransmission,
            tx_win_sz: 10,
            max_transmit: 3,
            rtrans_tout: 2000,
            mon_tout: 12000,
            mps: 100,
        };
        channel.remote_cid = REMOTE_CID;
        channel.state = ChannelState::Open;
        channel.our_cfg.fcr = fcr;
        channel.peer_cfg.fcr = fcr;
        channel.tx_mps = 100;
        channel.fcrb.max_held_acks = 3;

        Self {
            channel,
            link: Link::new(BdAddr::default()),
            timers: TimerQueue::new(),
            config,
        }
    }

    fn streaming() -> Self {
        let mut harness = Self::ertm();
        let fcr = FcrOptions::streaming(100);
        harness.channel.our_cfg.fcr = fcr;
        harness.channel.peer_cfg.fcr = fcr;
        harness
    }

    fn run(&mut self, f: impl FnOnce(&mut L2capChannel, &mut FcrContext<'_>)) -> Vec<FcrAction> {
        let mut ctx = FcrContext::new(&mut self.link, &mut self.timers, &self.config);
        f(&mut self.channel, &mut ctx);
        ctx.into_actions()
    }

    fn receive(&mut self, frame: Frame) -> Vec<FcrAction> {
        let pdu = frame.encode(LOCAL_CID, true);
        self.run(|ch, ctx| ch.fcr_proc_pdu(ctx, &pdu))
    }

    /// S-frames queued on the link, oldest first; drains the queue
    fn sent_frames(&mut self) -> Vec<Frame> {
        self.link
            .xmit_q
            .drain(..)
            .filter_map(|pdu| decode_pdu(&pdu.data, true).map(|(_, frame)| frame))
            .collect()
    }

    fn pull(&mut self) -> Option<Vec<u8>> {
        self.run_pull().map(|(bytes, _)| bytes)
    }

    fn run_pull(&mut self) -> Option<(Vec<u8>, FlushPolicy)> {
        let mut ctx = FcrContext::new(&mut self.link, &mut self.timers, &self.config);
        self.channel.get_next_xmit_sdu_seg(&mut ctx)
    }
}

fn i_frame(tx_seq: u8, sar: SarType, payload: &[u8]) -> Frame {
    Frame::I {
        sar,
        tx_seq,
        req_seq: 0,
        final_bit: false,
        payload: payload.to_vec(),
    }
}

fn s_frame(function: SupervisoryFunction, req_seq: u8, poll: bool, final_bit: bool) -> Frame {
    Frame::S {
        function,
        poll,
        final_bit,
        req_seq,
    }
}

fn delivered(actions: &[FcrAction]) -> Vec<Vec<u8>> {
    actions
        .iter()
        .filter_map(|a| match a {
            FcrAction::Deliver(sdu) => Some(sdu.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_in_sequence_frame_is_delivered_and_ack_deferred() {
    let mut h = Harness::ertm();
    let actions = h.receive(i_frame(0, SarType::Unsegmented, b"hello"));

    assert_eq!(delivered(&actions), vec![b"hello".to_vec()]);
    assert_eq!(h.channel.fcrb.next_seq_expected, 1);
    assert!(h.sent_frames().is_empty());
    assert!(h.timers.is_running(TimerId::Ack(LOCAL_CID)));
}

#[test]
fn test_ack_timeout_sends_rr() {
    let mut h = Harness::ertm();
    h.receive(i_frame(0, SarType::Unsegmented, b"a"));
    h.run(|ch, ctx| ch.fcr_proc_ack_tout(ctx));

    let sent = h.sent_frames();
    assert_eq!(sent, vec![s_frame(SupervisoryFunction::Rr, 1, false, false)]);
    assert_eq!(h.channel.fcrb.last_ack_sent, 1);
}

#[test]
fn test_ack_sent_once_held_acks_reached() {
    let mut h = Harness::ertm();
    for seq in 0..3 {
        h.receive(i_frame(seq, SarType::Unsegmented, &[seq]));
    }
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Rr, 3, false, false)]);
}

#[test]
fn test_two_lost_frames_send_rej() {
    let mut h = Harness::ertm();
    let actions = h.receive(i_frame(2, SarType::Unsegmented, b"late"));

    assert!(delivered(&actions).is_empty());
    assert_eq!(h.channel.fcrb.next_seq_expected, 0);
    assert!(h.channel.fcrb.rej_sent);
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Rej, 0, false, false)]);

    // Further gaps are ignored while the REJ is outstanding
    h.receive(i_frame(3, SarType::Unsegmented, b"later"));
    assert!(h.sent_frames().is_empty());
}

#[test]
fn test_single_lost_frame_recovered_with_srej() {
    let mut h = Harness::ertm();
    let actions = h.receive(i_frame(1, SarType::Unsegmented, b"second"));
    assert!(delivered(&actions).is_empty());
    assert!(h.channel.fcrb.srej_sent);
    assert_eq!(h.channel.fcrb.srej_rcv_hold_q.len(), 1);
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Srej, 0, false, false)]);

    let actions = h.receive(i_frame(0, SarType::Unsegmented, b"first"));
    assert_eq!(
        delivered(&actions),
        vec![b"first".to_vec(), b"second".to_vec()]
    );
    assert_eq!(h.channel.fcrb.next_seq_expected, 2);
    assert!(h.channel.fcrb.srej_rcv_hold_q.is_empty());
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Rr, 2, false, false)]);
}

#[test]
fn test_gap_while_srej_outstanding_sends_rej_after_replay() {
    let mut h = Harness::ertm();
    h.receive(i_frame(1, SarType::Unsegmented, b"1"));
    h.sent_frames();

    // 3 does not follow the held frame 1
    h.receive(i_frame(3, SarType::Unsegmented, b"3"));
    assert!(h.channel.fcrb.rej_after_srej);

    h.receive(i_frame(0, SarType::Unsegmented, b"0"));
    assert!(h.channel.fcrb.rej_sent);
    assert!(!h.channel.fcrb.rej_after_srej);
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Rej, 2, false, false)]);
}

#[test]
fn test_srej_hold_list_bounded_by_window() {
    let mut h = Harness::ertm();
    let mut actions = Vec::new();
    for tx_seq in 1..10u8 {
        actions.extend(h.receive(i_frame(tx_seq, SarType::Unsegmented, &[tx_seq])));
    }
    assert_eq!(h.channel.fcrb.srej_rcv_hold_q.len(), 9);
    assert!(!h.channel.fcrb.rej_after_srej);

    // TxSeq 10 lies a full window past the expected frame
    actions.extend(h.receive(i_frame(10, SarType::Unsegmented, &[10])));
    assert_eq!(h.channel.fcrb.srej_rcv_hold_q.len(), 9);
    assert!(!h.channel.fcrb.rej_after_srej);
    assert!(!actions.iter().any(|a| matches!(a, FcrAction::Disconnect)));

    let actions = h.receive(i_frame(0, SarType::Unsegmented, &[0]));
    assert_eq!(delivered(&actions), (0..10u8).map(|seq| vec![seq]).collect::<Vec<_>>());
    assert_eq!(h.channel.fcrb.next_seq_expected, 10);
}

#[test]
fn test_duplicate_frame_is_ignored() {
    let mut h = Harness::ertm();
    h.receive(i_frame(0, SarType::Unsegmented, b"once"));
    let actions = h.receive(i_frame(0, SarType::Unsegmented, b"once"));

    assert!(delivered(&actions).is_empty());
    assert_eq!(h.channel.fcrb.next_seq_expected, 1);
    assert!(h.sent_frames().is_empty());
}

#[test]
fn test_bad_fcs_is_dropped() {
    let mut h = Harness::ertm();
    let mut pdu = i_frame(0, SarType::Unsegmented, b"data").encode(LOCAL_CID, true);
    let last = pdu.len() - 1;
    pdu[last] ^= 0xFF;

    let actions = h.run(|ch, ctx| ch.fcr_proc_pdu(ctx, &pdu));
    assert!(actions.is_empty());
    assert_eq!(h.channel.fcrb.next_seq_expected, 0);
}

#[test]
fn test_short_pdu_is_dropped() {
    let mut h = Harness::ertm();
    let actions = h.run(|ch, ctx| ch.fcr_proc_pdu(ctx, &[0x02, 0x00, 0x40, 0x00, 0x00]));
    assert!(actions.is_empty());
}

#[test]
fn test_continuation_without_start_disconnects() {
    let mut h = Harness::ertm();
    let actions = h.receive(i_frame(0, SarType::Continuation, b"orphan"));
    assert_eq!(actions.last(), Some(&FcrAction::Disconnect));
}

#[test]
fn test_segmentation_and_reassembly() {
    let sdu: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

    let mut tx = Harness::ertm();
    tx.channel
        .xmit_hold_q
        .push_back(TxSdu::new(sdu.clone(), FlushPolicy::NonFlushable));

    let mut pdus = Vec::new();
    while let Some(pdu) = tx.pull() {
        pdus.push(pdu);
    }
    assert_eq!(pdus.len(), 10);
    assert_eq!(tx.channel.fcrb.waiting_for_ack_q.len(), 10);

    let sars: Vec<SarType> = tx
        .channel
        .fcrb
        .waiting_for_ack_q
        .iter()
        .map(|pdu| pdu.tag.sar)
        .collect();
    assert_eq!(sars[0], SarType::Start);
    assert!(sars[1..9].iter().all(|sar| *sar == SarType::Continuation));
    assert_eq!(sars[9], SarType::End);

    let mut rx = Harness::ertm();
    let mut received = Vec::new();
    for pdu in &pdus {
        let actions = rx.run(|ch, ctx| ch.fcr_proc_pdu(ctx, pdu));
        assert!(!actions.contains(&FcrAction::Disconnect));
        received.extend(delivered(&actions));
    }
    assert_eq!(received, vec![sdu]);
    assert_eq!(rx.channel.fcrb.next_seq_expected, 10);
}

#[test]
fn test_window_full_is_flow_controlled_until_acked() {
    let mut h = Harness::ertm();
    h.channel.peer_cfg.fcr.tx_win_sz = 2;
    for byte in 0..3u8 {
        h.channel
            .xmit_hold_q
            .push_back(TxSdu::new(vec![byte], FlushPolicy::ChannelBased));
    }

    assert!(h.pull().is_some());
    assert!(!h.channel.is_flow_controlled());
    assert!(h.pull().is_some());
    assert!(h.channel.is_flow_controlled());
    assert!(h.timers.is_running(TimerId::MonitorRetrans(LOCAL_CID)));

    let actions = h.receive(s_frame(SupervisoryFunction::Rr, 1, false, false));
    assert!(actions.contains(&FcrAction::TxComplete(1)));
    assert_eq!(h.channel.fcrb.waiting_for_ack_q.len(), 1);
    assert!(!h.channel.is_flow_controlled());
    assert!(actions.contains(&FcrAction::CheckSend));
}

#[test]
fn test_last_ack_reports_all_drained() {
    let mut h = Harness::ertm();
    h.channel
        .xmit_hold_q
        .push_back(TxSdu::new(vec![1, 2, 3], FlushPolicy::ChannelBased));
    h.pull();

    let actions = h.receive(s_frame(SupervisoryFunction::Rr, 1, false, false));
    assert!(actions.contains(&FcrAction::TxComplete(0xFFFF)));
    assert!(!h.timers.is_running(TimerId::MonitorRetrans(LOCAL_CID)));
}

#[test]
fn test_req_seq_beyond_window_disconnects() {
    let mut h = Harness::ertm();
    let actions = h.receive(s_frame(SupervisoryFunction::Rr, 5, false, false));
    assert_eq!(actions, vec![FcrAction::Disconnect]);
}

#[test]
fn test_rej_retransmits_unacked_frames() {
    let mut h = Harness::ertm();
    for byte in 0..2u8 {
        h.channel
            .xmit_hold_q
            .push_back(TxSdu::new(vec![byte], FlushPolicy::ChannelBased));
    }
    h.pull();
    h.pull();

    h.receive(s_frame(SupervisoryFunction::Rej, 0, false, false));
    assert_eq!(h.channel.fcrb.retrans_q.len(), 2);
    assert_eq!(h.channel.fcrb.num_tries, 1);

    let resent = h.pull().and_then(|pdu| decode_pdu(&pdu, true));
    match resent {
        Some((_, Frame::I { tx_seq, payload, .. })) => {
            assert_eq!(tx_seq, 0);
            assert_eq!(payload, vec![0]);
        }
        other => panic!("expected I-frame, got {:?}", other),
    }
    assert_eq!(h.channel.fcrb.next_tx_seq, 2);
}

#[test]
fn test_srej_retransmits_one_frame() {
    let mut h = Harness::ertm();
    for byte in 0..3u8 {
        h.channel
            .xmit_hold_q
            .push_back(TxSdu::new(vec![byte], FlushPolicy::ChannelBased));
    }
    for _ in 0..3 {
        h.pull();
    }

    h.receive(s_frame(SupervisoryFunction::Srej, 1, false, false));
    assert_eq!(h.channel.fcrb.retrans_q.len(), 1);
    assert_eq!(ctrl_tx_seq(h.channel.fcrb.retrans_q[0].ctrl), 1);
    // SREJ without poll acknowledges nothing
    assert_eq!(h.channel.fcrb.waiting_for_ack_q.len(), 3);
}

#[test]
fn test_rnr_marks_remote_busy() {
    let mut h = Harness::ertm();
    h.channel
        .xmit_hold_q
        .push_back(TxSdu::new(vec![9], FlushPolicy::ChannelBased));
    h.pull();

    h.receive(s_frame(SupervisoryFunction::Rnr, 0, false, false));
    assert!(h.channel.fcrb.remote_busy);
    assert!(h.channel.is_flow_controlled());
    assert!(!h.timers.is_running(TimerId::MonitorRetrans(LOCAL_CID)));

    // RR after RNR resends what the peer could not take
    h.receive(s_frame(SupervisoryFunction::Rr, 0, false, false));
    assert!(!h.channel.fcrb.remote_busy);
    assert_eq!(h.channel.fcrb.retrans_q.len(), 1);
}

#[test]
fn test_max_transmit_exceeded_disconnects() {
    let mut h = Harness::ertm();
    for _ in 0..3 {
        let actions = h.run(|ch, ctx| ch.fcr_proc_tout(ctx));
        assert!(!actions.contains(&FcrAction::Disconnect));
    }
    assert!(h.channel.fcrb.wait_ack);
    let polls = h.sent_frames();
    assert_eq!(polls.len(), 3);
    assert!(polls
        .iter()
        .all(|f| *f == s_frame(SupervisoryFunction::Rr, 0, true, false)));

    let actions = h.run(|ch, ctx| ch.fcr_proc_tout(ctx));
    assert_eq!(actions, vec![FcrAction::Disconnect]);
}

#[test]
fn test_wait_ack_drops_frames_without_final() {
    let mut h = Harness::ertm();
    h.run(|ch, ctx| ch.fcr_proc_tout(ctx));
    h.sent_frames();

    let actions = h.receive(i_frame(0, SarType::Unsegmented, b"x"));
    assert!(delivered(&actions).is_empty());

    // A poll from the peer is still answered
    h.receive(s_frame(SupervisoryFunction::Rr, 0, true, false));
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Rr, 0, false, true)]);

    h.receive(s_frame(SupervisoryFunction::Rr, 0, false, true));
    assert!(!h.channel.fcrb.wait_ack);
}

#[test]
fn test_peer_poll_gets_final_response() {
    let mut h = Harness::ertm();
    h.receive(s_frame(SupervisoryFunction::Rr, 0, true, false));
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Rr, 0, false, true)]);
    assert!(!h.channel.fcrb.send_f_rsp);
}

#[test]
fn test_local_busy_sends_rnr_then_polled_rr() {
    let mut h = Harness::ertm();
    h.run(|ch, ctx| ch.fcr_set_local_busy(ctx, true));
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Rnr, 0, false, false)]);

    // Out-of-sequence data while busy is refused with RNR
    h.receive(i_frame(1, SarType::Unsegmented, b"x"));
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Rnr, 0, false, false)]);

    h.run(|ch, ctx| ch.fcr_set_local_busy(ctx, false));
    assert_eq!(h.sent_frames(), vec![s_frame(SupervisoryFunction::Rr, 0, true, false)]);
    assert!(h.channel.fcrb.wait_ack);
}

#[test]
fn test_streaming_reassembly_and_gap() {
    let mut h = Harness::streaming();

    let mut start = 6u16.to_le_bytes().to_vec();
    start.extend_from_slice(b"abc");
    let actions = h.receive(i_frame(0, SarType::Start, &start));
    assert!(delivered(&actions).is_empty());

    // TxSeq 1 lost: the partial SDU is thrown away and End has nothing to finish
    let actions = h.receive(i_frame(2, SarType::End, b"def"));
    assert!(delivered(&actions).is_empty());
    assert!(!actions.contains(&FcrAction::Disconnect));
    assert!(h.channel.fcrb.rx_sdu.is_none());
    assert_eq!(h.channel.fcrb.next_seq_expected, 3);

    let actions = h.receive(i_frame(3, SarType::Unsegmented, b"ok"));
    assert_eq!(delivered(&actions), vec![b"ok".to_vec()]);
    assert!(h.sent_frames().is_empty());
}

#[test]
fn test_streaming_send_does_not_keep_frames() {
    let mut h = Harness::streaming();
    h.channel
        .xmit_hold_q
        .push_back(TxSdu::new(vec![1; 10], FlushPolicy::ChannelBased));
    let pdu = h.pull().and_then(|pdu| decode_pdu(&pdu, true));

    assert!(matches!(pdu, Some((_, Frame::I { tx_seq: 0, req_seq: 0, .. }))));
    assert!(h.channel.fcrb.waiting_for_ack_q.is_empty());
    assert!(!h.timers.is_running(TimerId::MonitorRetrans(LOCAL_CID)));
}

#[test]
fn test_start_frame_longer_than_mtu_disconnects() {
    let mut h = Harness::ertm();
    h.channel.max_rx_mtu = 100;
    let mut start = 200u16.to_le_bytes().to_vec();
    start.extend_from_slice(&[0; 10]);
    let actions = h.receive(i_frame(0, SarType::Start, &start));
    assert_eq!(actions.last(), Some(&FcrAction::Disconnect));
}
