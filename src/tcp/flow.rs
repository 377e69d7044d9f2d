//! Per-flow TCP state machine: handshake, segmentation/reassembly,
//! retransmission with Karn's rule, Jacobson/Karels RTO estimation, NewReno
//! congestion control, delayed ACK, persist/keepalive timers, and TIME_WAIT.
//! Grounded on the `tcp_flow_t` struct and `tcp_core.c`/`tcp_rx.c`/`tcp_tx.c`
//! state machine of the original client this crate's behavior is drawn from;
//! expressed as owned Rust state instead of a fixed `tcp_flows[MAX_TCP_FLOWS]`
//! C array, since `heapless::Vec` already gives us that bound.

use alloc::vec::Vec;
use core::net::IpAddr;

use crate::config::{
    MAX_BACKLOG, MAX_REASSEMBLY_SEGMENTS, MAX_TX_SEGMENTS, TCP_DEFAULT_RCV_BUF, TCP_DELAYED_ACK_MS,
    TCP_INITIAL_RTO_MS, TCP_MAX_RTO_MS, TCP_MIN_RTO_MS, TCP_MSS_V4_MIN, TCP_MSS_V6_MIN,
    TCP_PERSIST_MAX_MS, TCP_PERSIST_MIN_MS, TCP_SYN_RETRIES, TCP_TIME_WAIT_MS,
};
use crate::types::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

#[derive(Debug, Clone)]
pub struct TxSegment {
    pub seq: u32,
    pub data: Vec<u8>,
    pub syn: bool,
    pub fin: bool,
    pub retransmit_count: u8,
    pub rtt_sample_eligible: bool,
    pub timer_ms: u64,
    pub timeout_ms: u64,
}

impl TxSegment {
    pub fn end(&self) -> u32 {
        self.seq
            .wrapping_add(self.data.len() as u32)
            .wrapping_add(self.syn as u32)
            .wrapping_add(self.fin as u32)
    }
}

#[derive(Debug, Clone)]
pub struct ReassSegment {
    pub seq: u32,
    pub data: Vec<u8>,
}

/// One TCP flow. `owner` links it back to the process-facing socket handle;
/// `local`/`remote` are the endpoint pair identifying it in the flow table.
/// A listening flow has `remote` left unspecified and accumulates completed
/// children's owners in `accept_backlog` rather than carrying its own data.
pub struct Flow {
    pub owner: u32,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub ifindex: u8,
    pub state: State,

    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub iss: u32,

    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    pub rcv_wnd_max: u32,
    pub rcv_buf_used: u32,
    pub rcv_adv_edge: u32,
    pub irs: u32,

    pub srtt_ms: Option<u32>,
    pub rttvar_ms: u32,
    pub rto_ms: u64,

    pub cwnd: u32,
    pub ssthresh: u32,
    pub mss: u16,
    pub dup_acks: u8,
    pub in_fast_recovery: bool,
    pub recover: u32,

    pub ws_send: u8,
    pub ws_recv: u8,
    pub ws_ok: bool,
    pub sack_ok: bool,

    pub retries: u8,

    pub txq: heapless::Vec<TxSegment, MAX_TX_SEGMENTS>,
    pub reass: heapless::Vec<ReassSegment, MAX_REASSEMBLY_SEGMENTS>,
    pub recv_buf: Vec<u8>,

    pub fin_pending: bool,
    pub fin_seq: u32,

    pub time_wait_ms: u64,
    pub fin_wait2_ms: u64,

    pub delayed_ack_pending: bool,
    pub delayed_ack_timer_ms: u64,

    pub keepalive_on: bool,
    pub keepalive_idle_ms: u64,
    pub keepalive_timer_ms: u64,

    pub persist_active: bool,
    pub persist_timer_ms: u64,
    pub persist_timeout_ms: u64,

    pub backlog_cap: usize,
    pub accept_backlog: heapless::Vec<u32, MAX_BACKLOG>,

    pub ttl: u8,
    pub dontfrag: bool,
}

impl Flow {
    pub fn new(owner: u32, local: Endpoint, remote: Endpoint, ifindex: u8, iss: u32) -> Self {
        let mss = match local.ip {
            IpAddr::V4(_) => TCP_MSS_V4_MIN,
            IpAddr::V6(_) => TCP_MSS_V6_MIN,
        };
        Self {
            owner,
            local,
            remote,
            ifindex,
            state: State::Closed,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            iss,
            rcv_nxt: 0,
            rcv_wnd: TCP_DEFAULT_RCV_BUF.min(u16::MAX as u32),
            rcv_wnd_max: TCP_DEFAULT_RCV_BUF,
            rcv_buf_used: 0,
            rcv_adv_edge: 0,
            irs: 0,
            srtt_ms: None,
            rttvar_ms: 0,
            rto_ms: TCP_INITIAL_RTO_MS,
            cwnd: mss as u32 * 4,
            ssthresh: u32::MAX,
            mss,
            dup_acks: 0,
            in_fast_recovery: false,
            recover: iss,
            ws_send: 0,
            ws_recv: 0,
            ws_ok: false,
            sack_ok: false,
            retries: 0,
            txq: heapless::Vec::new(),
            reass: heapless::Vec::new(),
            recv_buf: Vec::new(),
            fin_pending: false,
            fin_seq: 0,
            time_wait_ms: 0,
            fin_wait2_ms: 0,
            delayed_ack_pending: false,
            delayed_ack_timer_ms: 0,
            keepalive_on: false,
            keepalive_idle_ms: 0,
            keepalive_timer_ms: 0,
            persist_active: false,
            persist_timer_ms: 0,
            persist_timeout_ms: TCP_PERSIST_MIN_MS,
            backlog_cap: 0,
            accept_backlog: heapless::Vec::new(),
            ttl: 64,
            dontfrag: false,
        }
    }

    /// Recompute the advertised window field, folding in window scale and
    /// keeping the advertised right edge monotonically non-decreasing
    /// (never shrinking the window once offered). Mirrors
    /// `tcp_calc_adv_wnd_field`.
    pub fn advertised_window(&mut self, apply_scale: bool) -> u16 {
        let quantum: u32 = if apply_scale && self.ws_ok && self.ws_send > 0 {
            1u32 << self.ws_send
        } else {
            1
        };
        let free = self.rcv_wnd_max.saturating_sub(self.rcv_buf_used);
        let free_q = if quantum == 1 { free } else { free & !(quantum - 1) };

        if self.rcv_adv_edge < self.rcv_nxt {
            self.rcv_adv_edge = self.rcv_nxt;
        }
        let candidate_edge = self.rcv_nxt.wrapping_add(free_q);
        if candidate_edge > self.rcv_adv_edge {
            self.rcv_adv_edge = candidate_edge;
        }

        let adv = self.rcv_adv_edge.wrapping_sub(self.rcv_nxt);
        let field = if quantum == 1 {
            adv.min(u16::MAX as u32)
        } else {
            (adv >> self.ws_send).min(u16::MAX as u32)
        };
        let adv = if quantum == 1 { field } else { field << self.ws_send };

        self.rcv_wnd = adv;
        self.rcv_adv_edge = self.rcv_nxt.wrapping_add(adv);
        field as u16
    }

    /// Jacobson/Karels RTT estimator (RFC 6298), applied only to an
    /// unambiguous sample (Karn's rule: never from a retransmitted segment).
    pub fn rtt_sample(&mut self, sample_ms: u32) {
        match self.srtt_ms {
            None => {
                self.srtt_ms = Some(sample_ms);
                self.rttvar_ms = sample_ms / 2;
            }
            Some(srtt) => {
                let delta = (srtt as i64 - sample_ms as i64).unsigned_abs() as u32;
                self.rttvar_ms = (3 * self.rttvar_ms + delta) / 4;
                self.srtt_ms = Some((7 * srtt + sample_ms) / 8);
            }
        }
        let srtt = self.srtt_ms.unwrap();
        self.rto_ms = (srtt as u64 + (4 * self.rttvar_ms) as u64).clamp(TCP_MIN_RTO_MS, TCP_MAX_RTO_MS);
    }

    /// Exponential backoff on a retransmission timeout, capped at
    /// `TCP_MAX_RTO_MS` (RFC 6298 §5.5).
    pub fn backoff_rto(&mut self) {
        self.rto_ms = (self.rto_ms * 2).min(TCP_MAX_RTO_MS);
    }

    /// NewReno: halve `cwnd`/set `ssthresh` on loss, collapse `cwnd` to one
    /// segment on a full RTO (tcp_core.c's `tcp_cc_on_timeout`).
    pub fn cc_on_timeout(&mut self) {
        self.ssthresh = (self.flight_size() / 2).max(2 * self.mss as u32);
        self.cwnd = self.mss as u32;
        self.in_fast_recovery = false;
        self.dup_acks = 0;
    }

    /// `ack` is the cumulative ACK field just processed; NewReno only exits
    /// fast recovery once it covers `recover` (the `snd_nxt` at the moment
    /// fast retransmit fired). A partial ACK below that just inflates `cwnd`
    /// by one segment and stays in recovery (tcp_core.c's partial-ACK path).
    pub fn cc_on_new_ack(&mut self, ack: u32, acked: u32) {
        if self.in_fast_recovery {
            if !super::seq_gt(self.recover, ack) {
                self.in_fast_recovery = false;
                self.dup_acks = 0;
                self.cwnd = self.ssthresh;
            } else {
                self.cwnd += self.mss as u32;
            }
            return;
        }
        if self.cwnd < self.ssthresh {
            // Slow start: one MSS per ACK'd segment.
            self.cwnd += acked.min(self.mss as u32);
        } else {
            // Congestion avoidance: roughly one MSS per RTT.
            let increment = ((self.mss as u64 * self.mss as u64) / self.cwnd.max(1) as u64).max(1) as u32;
            self.cwnd += increment;
        }
    }

    /// Third duplicate ACK: fast retransmit + fast recovery entry
    /// (tcp_core.c dup-ack handling).
    pub fn cc_on_dup_ack(&mut self) -> bool {
        self.dup_acks += 1;
        if self.dup_acks == 3 && !self.in_fast_recovery {
            self.ssthresh = (self.flight_size() / 2).max(2 * self.mss as u32);
            self.cwnd = self.ssthresh + 3 * self.mss as u32;
            self.in_fast_recovery = true;
            self.recover = self.snd_nxt;
            return true;
        }
        if self.in_fast_recovery {
            self.cwnd += self.mss as u32;
        }
        false
    }

    pub fn flight_size(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    pub fn effective_window(&self) -> u32 {
        self.snd_wnd.min(self.cwnd)
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub fn syn_retries_exhausted(&self) -> bool {
        self.retries >= TCP_SYN_RETRIES
    }

    pub fn arm_delayed_ack(&mut self, now_ms: u64) {
        self.delayed_ack_pending = true;
        self.delayed_ack_timer_ms = now_ms + TCP_DELAYED_ACK_MS;
    }

    pub fn enter_time_wait(&mut self, now_ms: u64) {
        self.state = State::TimeWait;
        self.time_wait_ms = now_ms + TCP_TIME_WAIT_MS;
    }

    pub fn arm_persist(&mut self, now_ms: u64) {
        self.persist_active = true;
        self.persist_timer_ms = now_ms + self.persist_timeout_ms;
    }

    pub fn backoff_persist(&mut self) {
        self.persist_timeout_ms = (self.persist_timeout_ms * 2).clamp(TCP_PERSIST_MIN_MS, TCP_PERSIST_MAX_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv4Addr;

    fn flow() -> Flow {
        Flow::new(
            1,
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1234),
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 80),
            1,
            1000,
        )
    }

    #[test]
    fn rtt_sample_initializes_then_smooths() {
        let mut f = flow();
        f.rtt_sample(100);
        assert_eq!(f.srtt_ms, Some(100));
        f.rtt_sample(200);
        assert!(f.srtt_ms.unwrap() > 100);
    }

    #[test]
    fn three_dup_acks_triggers_fast_retransmit_once() {
        let mut f = flow();
        assert!(!f.cc_on_dup_ack());
        assert!(!f.cc_on_dup_ack());
        assert!(f.cc_on_dup_ack());
        assert!(f.in_fast_recovery);
    }

    #[test]
    fn timeout_collapses_cwnd_to_one_segment() {
        let mut f = flow();
        f.cwnd = 20_000;
        f.snd_nxt = f.snd_una.wrapping_add(10_000);
        f.cc_on_timeout();
        assert_eq!(f.cwnd, f.mss as u32);
    }
}
