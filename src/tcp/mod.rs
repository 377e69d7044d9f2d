//! TCP transport: wire header/options codec, the flow table, and the
//! process-facing connect/listen/accept/send/recv/close operations. The
//! state machine is grounded on `tcp_core.c`/`tcp_rx.c`/`tcp_tx.c`, adapted
//! from a fixed `tcp_flows[MAX_TCP_FLOWS]` C array of heap-allocated structs
//! to an owned `heapless::Vec<Flow, MAX_TCP_FLOWS>` of plain Rust values.

pub mod flow;

use alloc::vec::Vec;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::checksum;
use crate::config::{MAX_BACKLOG, MAX_TCP_FLOWS, TCP_MAX_SYN_RECEIVED, TCP_MAX_SYN_RECEIVED_PER_PORT};
use crate::error::{Error, Result};
use crate::types::{BindSpec, Endpoint, Protocol};
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

pub use flow::{Flow, State, TxSegment};

pub const HEADER_LEN: usize = 20;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;
pub const FLAG_URG: u8 = 0x20;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WSCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_SACK: u8 = 5;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl Header {
    pub fn decode(data: &[u8]) -> core::result::Result<(Self, usize), WireError> {
        let mut bytes = BytesIn::new(data);
        let src_port = bytes.u16()?;
        let dst_port = bytes.u16()?;
        let seq = bytes.u32()?;
        let ack = bytes.u32()?;
        let offset_reserved_flags = bytes.u16()?;
        let header_len = ((offset_reserved_flags >> 12) as usize) * 4;
        let flags = (offset_reserved_flags & 0x3f) as u8;
        let window = bytes.u16()?;
        let checksum = bytes.u16()?;
        let urgent_ptr = bytes.u16()?;
        if header_len < HEADER_LEN || header_len > data.len() {
            return Err(WireError::Underflow);
        }
        let header = Self {
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window,
            checksum,
            urgent_ptr,
        };
        Ok((header, header_len))
    }

    pub fn encode<'o>(&self, opts_len: usize, buf: &'o mut [u8]) -> core::result::Result<&'o [u8], WireError> {
        let header_words = ((HEADER_LEN + opts_len) / 4) as u16;
        let mut bytes = BytesOut::new(buf);
        bytes
            .u16(self.src_port)?
            .u16(self.dst_port)?
            .u32(self.seq)?
            .u32(self.ack)?
            .u16((header_words << 12) | (self.flags as u16))?
            .u16(self.window)?
            .u16(0)?
            .u16(self.urgent_ptr)?;
        Ok(&buf[..bytes.len()])
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ParsedOptions {
    mss: Option<u16>,
    wscale: Option<u8>,
    sack_permitted: bool,
}

fn parse_options(opts: &[u8]) -> ParsedOptions {
    let mut out = ParsedOptions::default();
    let mut i = 0;
    while i < opts.len() {
        let kind = opts[i];
        if kind == OPT_END {
            break;
        }
        if kind == OPT_NOP {
            i += 1;
            continue;
        }
        if i + 1 >= opts.len() {
            break;
        }
        let olen = opts[i + 1] as usize;
        if olen < 2 || i + olen > opts.len() {
            break;
        }
        match (kind, olen) {
            (k, 4) if k == OPT_MSS => out.mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]])),
            (k, 3) if k == OPT_WSCALE => out.wscale = Some(opts[i + 2]),
            (k, 2) if k == OPT_SACK_PERMITTED => out.sack_permitted = true,
            _ => {}
        }
        i += olen;
    }
    out
}

/// Build SYN/SYN-ACK options (MSS always, window scale unless `wscale ==
/// None`, SACK-permitted if offered), padded to a 4-byte boundary.
fn build_syn_options(mss: u16, wscale: Option<u8>, sack_permitted: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.push(OPT_MSS);
    out.push(4);
    out.extend_from_slice(&mss.to_be_bytes());
    if let Some(ws) = wscale {
        out.push(OPT_NOP);
        out.push(OPT_WSCALE);
        out.push(3);
        out.push(ws);
    }
    if sack_permitted {
        out.push(OPT_NOP);
        out.push(OPT_NOP);
        out.push(OPT_SACK_PERMITTED);
        out.push(2);
    }
    while out.len() % 4 != 0 {
        out.push(OPT_NOP);
    }
    out
}

/// Build a SACK option (kind 5) from up to 4 reassembly holes, most
/// recently received block first (RFC 2018), preceded by two NOPs so the
/// option area stays 4-byte aligned. Empty if there's nothing to report.
fn build_sack_option(reass: &[flow::ReassSegment]) -> Vec<u8> {
    if reass.is_empty() {
        return Vec::new();
    }
    let mut blocks: Vec<(u32, u32)> = reass.iter().map(|s| (s.seq, s.seq.wrapping_add(s.data.len() as u32))).collect();
    blocks.sort_by(|a, b| b.0.cmp(&a.0));
    blocks.truncate(4);

    let mut out = Vec::with_capacity(4 + blocks.len() * 8);
    out.push(OPT_NOP);
    out.push(OPT_NOP);
    out.push(OPT_SACK);
    out.push((2 + blocks.len() * 8) as u8);
    for (left, right) in blocks {
        out.extend_from_slice(&left.to_be_bytes());
        out.extend_from_slice(&right.to_be_bytes());
    }
    out
}

/// SACK option to attach to the next outgoing segment, if fast recovery and
/// SACK were negotiated and there's a hole to report.
fn sack_option_for(flow: &Flow) -> Vec<u8> {
    if flow.sack_ok && flow.in_fast_recovery {
        build_sack_option(&flow.reass)
    } else {
        Vec::new()
    }
}

pub struct TcpState {
    flows: heapless::Vec<Flow, MAX_TCP_FLOWS>,
    next_owner: u32,
}

impl TcpState {
    pub fn new(_config: &crate::config::StackConfig) -> Self {
        Self {
            flows: heapless::Vec::new(),
            next_owner: 1,
        }
    }

    fn alloc_owner(&mut self) -> u32 {
        let owner = self.next_owner;
        self.next_owner = self.next_owner.wrapping_add(1).max(1);
        owner
    }

    fn by_owner_mut(&mut self, owner: u32) -> Option<&mut Flow> {
        self.flows.iter_mut().find(|f| f.owner == owner)
    }

    fn by_owner(&self, owner: u32) -> Option<&Flow> {
        self.flows.iter().find(|f| f.owner == owner)
    }

    /// Exact 4-tuple match first, falling back to a wildcard/bound listener
    /// on `local`, mirroring `find_flow`'s two-pass lookup.
    fn find_connected_mut(&mut self, local: Endpoint, remote: Endpoint) -> Option<&mut Flow> {
        self.flows
            .iter_mut()
            .find(|f| f.state != State::Closed && f.state != State::Listen && f.local == local && f.remote == remote)
    }

    fn find_listener_mut(&mut self, local: Endpoint) -> Option<&mut Flow> {
        self.flows.iter_mut().find(|f| {
            f.state == State::Listen
                && f.local.port == local.port
                && (f.local.ip.is_unspecified() || f.local.ip == local.ip)
        })
    }

    fn syn_received_count(&self, local_port: u16, ifindex: u8) -> (usize, usize) {
        let total = self.flows.iter().filter(|f| f.state == State::SynReceived).count();
        let per_port = self
            .flows
            .iter()
            .filter(|f| f.state == State::SynReceived && f.local.port == local_port && f.ifindex == ifindex)
            .count();
        (total, per_port)
    }
}

impl Default for TcpState {
    fn default() -> Self {
        Self::new(&crate::config::StackConfig::default())
    }
}

/// Passive open: register a listening flow bound through the port manager,
/// accepting up to `backlog` completed connections before `accept` must
/// drain the queue (`backlog` is capped at `MAX_BACKLOG`).
pub fn listen(stack: &mut Stack, spec: BindSpec, port: u16, backlog: usize) -> Result<u32> {
    let owner = stack.tcp.alloc_owner();

    let (bound_port, local_addrs) = match spec {
        BindSpec::L3(_) | BindSpec::L2(_) => {
            let addrs = expand_bind_spec(stack, spec)?;
            let bound_port = stack.ports.bind_addrs(Protocol::Tcp, &addrs, port, owner)?;
            (bound_port, addrs)
        }
        BindSpec::Ip(ip) => (stack.ports.bind(Protocol::Tcp, spec, port, owner)?, alloc::vec![ip]),
        BindSpec::Any => (
            stack.ports.bind(Protocol::Tcp, spec, port, owner)?,
            alloc::vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
        ),
    };

    for ip in &local_addrs {
        let mut f = Flow::new(owner, Endpoint::new(*ip, bound_port), Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), 0, 0);
        f.state = State::Listen;
        f.backlog_cap = backlog.min(MAX_BACKLOG);
        if stack.tcp.flows.push(f).is_err() {
            stack.tcp.flows.retain(|fl| fl.owner != owner);
            let _ = stack.ports.unbind(Protocol::Tcp, bound_port, owner);
            return Err(Error::Sys);
        }
    }
    debug!("tcp: listen(owner={owner}, port={bound_port}, backlog={backlog})");
    Ok(owner)
}

/// Expand `L3`/`L2` into their concrete local addresses: an `L3` bind names
/// exactly one address, an `L2` bind every address (v4 and v6) configured
/// on that interface.
fn expand_bind_spec(stack: &Stack, spec: BindSpec) -> Result<Vec<IpAddr>> {
    match spec {
        BindSpec::L3(id) => {
            let addr = stack
                .ifaces
                .find_by_id_v4(id)
                .map(|a| IpAddr::V4(a.ip))
                .or_else(|| stack.ifaces.find_by_id_v6(id).map(|a| IpAddr::V6(a.addr)))
                .ok_or(Error::Proto)?;
            Ok(alloc::vec![addr])
        }
        BindSpec::L2(ifindex) => {
            let iface = stack.ifaces.get(ifindex).ok_or(Error::Proto)?;
            let mut addrs: Vec<IpAddr> = iface.v4.iter().map(|a| IpAddr::V4(a.ip)).collect();
            addrs.extend(iface.v6.iter().filter(|a| a.is_enabled()).map(|a| IpAddr::V6(a.addr)));
            if addrs.is_empty() {
                return Err(Error::Proto);
            }
            Ok(addrs)
        }
        BindSpec::Any | BindSpec::Ip(_) => Err(Error::Inval),
    }
}

/// Pop one completed connection from a listener's accept backlog -- a
/// listener bound to several addresses (`BindSpec::L2`) registers one
/// `Listen` flow per address sharing this owner, so every one is searched.
pub fn accept(stack: &mut Stack, listener_owner: u32) -> Result<u32> {
    let mut any_listener = false;
    for flow in stack.tcp.flows.iter_mut() {
        if flow.owner != listener_owner || flow.state != State::Listen {
            continue;
        }
        any_listener = true;
        if !flow.accept_backlog.is_empty() {
            return Ok(flow.accept_backlog.remove(0));
        }
    }
    if !any_listener {
        return Err(Error::Inval);
    }
    Err(Error::WouldBlock)
}

/// Active open: allocate a flow, send the initial SYN, and return its
/// owner immediately (ESTABLISHED is reached asynchronously via
/// `on_recv_v4`/`on_recv_v6`; callers poll `state`/`is_established`).
pub fn connect(stack: &mut Stack, spec: BindSpec, local_port: u16, dest: Endpoint, now_ms: u64) -> Result<u32> {
    let owner = stack.tcp.alloc_owner();
    let bound_port = stack.ports.bind(Protocol::Tcp, spec, local_port, owner)?;

    let (ifindex, local_ip) = match dest.ip {
        IpAddr::V4(d) => {
            let id = stack.ifaces.resolve_ipv4_to_interface(d).ok_or(Error::Proto)?;
            let ip = stack.ifaces.find_by_id_v4(id).map(|a| a.ip).ok_or(Error::Proto)?;
            (id.ifindex(), IpAddr::V4(ip))
        }
        IpAddr::V6(d) => {
            let id = stack.ifaces.resolve_ipv6_to_interface(d).ok_or(Error::Proto)?;
            let ifindex = id.ifindex();
            let ip = default_src_v6(stack, ifindex).ok_or(Error::Proto)?;
            (ifindex, IpAddr::V6(ip))
        }
    };

    let iss = next_iss(stack, now_ms);
    let local = Endpoint::new(local_ip, bound_port);
    let mut f = Flow::new(owner, local, dest, ifindex, iss);
    f.state = State::SynSent;
    f.retries = 0;
    f.snd_una = iss;
    f.snd_nxt = iss;
    f.mss = mss_for(dest.ip);
    if f.rcv_wnd_max > u16::MAX as u32 {
        f.ws_send = 8;
        f.ws_ok = true;
    }
    f.sack_ok = true;

    let syn = TxSegment {
        seq: iss,
        data: Vec::new(),
        syn: true,
        fin: false,
        retransmit_count: 0,
        rtt_sample_eligible: true,
        timer_ms: now_ms,
        timeout_ms: f.rto_ms,
    };
    f.txq.push(syn).map_err(|_| Error::Sys)?;
    f.snd_nxt = f.snd_nxt.wrapping_add(1);

    stack.tcp.flows.push(f).map_err(|_| Error::Sys)?;
    transmit_syn(stack, owner, now_ms);
    debug!("tcp: connect(owner={owner}, dst={:?})", dest);
    Ok(owner)
}

fn transmit_syn(stack: &mut Stack, owner: u32, now_ms: u64) {
    let Some(flow) = stack.tcp.by_owner(owner) else { return };
    let wscale = if flow.ws_ok { Some(flow.ws_send) } else { None };
    let opts = build_syn_options(flow.mss, wscale, flow.sack_ok);
    let header = Header {
        src_port: flow.local.port,
        dst_port: flow.remote.port,
        seq: flow.iss,
        ack: 0,
        flags: FLAG_SYN,
        window: flow.rcv_wnd.min(u16::MAX as u32) as u16,
        checksum: 0,
        urgent_ptr: 0,
    };
    let local = flow.local;
    let remote = flow.remote;
    let ifindex = flow.ifindex;
    let dontfrag = flow.dontfrag;
    send_segment(stack, ifindex, local, remote, &header, &opts, &[], dontfrag, now_ms);
}

/// Draw an initial sequence number from a PRNG seeded off the clock and
/// the identification counter, mirroring `rng_next32` in spirit: this
/// `no_std` stack has no OS entropy source to seed a CSPRNG from.
fn next_iss(stack: &mut Stack, now_ms: u64) -> u32 {
    use rand::{Rng, SeedableRng};
    let seed = now_ms ^ ((stack.ipv4_ident as u64) << 32);
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    stack.ipv4_ident = stack.ipv4_ident.wrapping_add(1);
    rng.gen()
}

fn mss_for(dst: IpAddr) -> u16 {
    let mtu = match dst {
        IpAddr::V4(_) => crate::config::IPV4_DEFAULT_MTU,
        IpAddr::V6(_) => crate::config::IPV6_DEFAULT_MTU,
    };
    let ip_hdr = match dst {
        IpAddr::V4(_) => 20u16,
        IpAddr::V6(_) => 40u16,
    };
    mtu.saturating_sub(ip_hdr).saturating_sub(HEADER_LEN as u16).max(256)
}

fn default_src_v6(stack: &Stack, ifindex: u8) -> Option<Ipv6Addr> {
    use crate::iface::l3v6::V6Kind;
    stack
        .ifaces
        .get(ifindex)?
        .v6
        .iter()
        .find(|a| a.kind.contains(V6Kind::GLOBAL) && a.is_enabled())
        .or_else(|| stack.ifaces.get(ifindex)?.v6.iter().find(|a| a.kind.contains(V6Kind::LINK_LOCAL)))
        .map(|a| a.addr)
}

/// Queue `data` for transmission, segmenting by MSS and the lesser of
/// `cwnd`/`snd_wnd` (persisting with a zero-window probe if the peer's
/// window is closed), mirroring `tcp_flow_send`.
pub fn send(stack: &mut Stack, owner: u32, data: &[u8], now_ms: u64) -> Result<usize> {
    let Some(flow) = stack.tcp.by_owner_mut(owner) else {
        return Err(Error::Inval);
    };
    if flow.state != State::Established && flow.state != State::CloseWait {
        return Err(Error::State);
    }
    if flow.snd_wnd == 0 {
        flow.arm_persist(now_ms);
        return Err(Error::WouldBlock);
    }

    let eff_wnd = flow.effective_window().max(1);
    let in_flight = flow.flight_size();
    if in_flight >= eff_wnd {
        return Err(Error::WouldBlock);
    }
    let mut can_send = (eff_wnd - in_flight) as usize;
    let mss = flow.mss as usize;

    let mut sent = 0usize;
    while sent < data.len() && can_send > 0 {
        let chunk_len = (data.len() - sent).min(can_send).min(mss);
        let seq = flow.snd_nxt;
        let seg = TxSegment {
            seq,
            data: data[sent..sent + chunk_len].to_vec(),
            syn: false,
            fin: false,
            retransmit_count: 0,
            rtt_sample_eligible: flow.srtt_ms.is_none() && sent == 0,
            timer_ms: now_ms,
            timeout_ms: flow.rto_ms,
        };
        if flow.txq.push(seg).is_err() {
            break;
        }
        flow.snd_nxt = flow.snd_nxt.wrapping_add(chunk_len as u32);
        sent += chunk_len;
        can_send -= chunk_len;

        let idx = flow.txq.len() - 1;
        transmit_segment(stack, owner, idx, now_ms);
        let Some(flow) = stack.tcp.by_owner_mut(owner) else { break };
        let _ = flow;
    }

    Ok(sent)
}

/// Pull reassembled in-order bytes out of the flow's receive buffer.
pub fn recv(stack: &mut Stack, owner: u32, out: &mut [u8]) -> Result<usize> {
    let flow = stack.tcp.by_owner_mut(owner).ok_or(Error::Inval)?;
    if flow.recv_buf.is_empty() {
        if flow.state == State::CloseWait || flow.state == State::Closing || flow.state == State::LastAck {
            return Ok(0);
        }
        return Err(Error::WouldBlock);
    }
    let n = flow.recv_buf.len().min(out.len());
    out[..n].copy_from_slice(&flow.recv_buf[..n]);
    flow.recv_buf.drain(..n);
    flow.advertised_window(true);
    Ok(n)
}

/// Send a FIN and move to FIN_WAIT_1 (from ESTABLISHED) or LAST_ACK (from
/// CLOSE_WAIT), mirroring `tcp_flow_close`.
pub fn close(stack: &mut Stack, owner: u32, now_ms: u64) -> Result<()> {
    let Some(flow) = stack.tcp.by_owner_mut(owner) else {
        return Err(Error::Inval);
    };
    if flow.state == State::Listen {
        let port = flow.local.port;
        stack.tcp.flows.retain(|f| f.owner != owner);
        let _ = stack.ports.unbind(Protocol::Tcp, port, owner);
        return Ok(());
    }
    if flow.state != State::Established && flow.state != State::CloseWait {
        return Err(Error::State);
    }

    let seq = flow.snd_nxt;
    let seg = TxSegment {
        seq,
        data: Vec::new(),
        syn: false,
        fin: true,
        retransmit_count: 0,
        rtt_sample_eligible: false,
        timer_ms: now_ms,
        timeout_ms: flow.rto_ms,
    };
    flow.txq.push(seg).map_err(|_| Error::Sys)?;
    flow.snd_nxt = flow.snd_nxt.wrapping_add(1);
    flow.state = if flow.state == State::Established { State::FinWait1 } else { State::LastAck };
    let idx = flow.txq.len() - 1;
    transmit_segment(stack, owner, idx, now_ms);
    Ok(())
}

fn transmit_segment(stack: &mut Stack, owner: u32, idx: usize, now_ms: u64) {
    let Some(flow) = stack.tcp.by_owner(owner) else { return };
    let Some(seg) = flow.txq.get(idx) else { return };
    let mut flags = FLAG_ACK;
    if seg.syn {
        flags |= FLAG_SYN;
    }
    if seg.fin {
        flags |= FLAG_FIN;
    }
    let header = Header {
        src_port: flow.local.port,
        dst_port: flow.remote.port,
        seq: seg.seq,
        ack: flow.rcv_nxt,
        flags,
        window: flow.rcv_wnd.min(u16::MAX as u32) as u16,
        checksum: 0,
        urgent_ptr: 0,
    };
    let payload = seg.data.clone();
    let opts = sack_option_for(flow);
    let local = flow.local;
    let remote = flow.remote;
    let ifindex = flow.ifindex;
    let dontfrag = flow.dontfrag;
    send_segment(stack, ifindex, local, remote, &header, &opts, &payload, dontfrag, now_ms);
}

fn send_ack_now(stack: &mut Stack, owner: u32, now_ms: u64) {
    let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
    let window = flow.advertised_window(true);
    let opts = sack_option_for(flow);
    let header = Header {
        src_port: flow.local.port,
        dst_port: flow.remote.port,
        seq: flow.snd_nxt,
        ack: flow.rcv_nxt,
        flags: FLAG_ACK,
        window,
        checksum: 0,
        urgent_ptr: 0,
    };
    let local = flow.local;
    let remote = flow.remote;
    let ifindex = flow.ifindex;
    let dontfrag = flow.dontfrag;
    flow.delayed_ack_pending = false;
    send_segment(stack, ifindex, local, remote, &header, &opts, &[], dontfrag, now_ms);
}

fn send_reset(stack: &mut Stack, ifindex: u8, local: Endpoint, remote: Endpoint, seq: u32, ack: Option<u32>, now_ms: u64) {
    let (flags, seq, ack) = match ack {
        Some(a) => (FLAG_RST | FLAG_ACK, 0, a),
        None => (FLAG_RST, seq, 0),
    };
    let header = Header {
        src_port: local.port,
        dst_port: remote.port,
        seq,
        ack,
        flags,
        window: 0,
        checksum: 0,
        urgent_ptr: 0,
    };
    // A bare RST/ACK carries no application data and never exceeds any MTU.
    send_segment(stack, ifindex, local, remote, &header, &[], &[], false, now_ms);
}

fn send_segment(
    stack: &mut Stack,
    ifindex: u8,
    local: Endpoint,
    remote: Endpoint,
    header: &Header,
    opts: &[u8],
    payload: &[u8],
    dontfrag: bool,
    now_ms: u64,
) {
    let tcp_len = HEADER_LEN + opts.len() + payload.len();
    let mut buf = alloc::vec![0u8; tcp_len];
    if header.encode(opts.len(), &mut buf).is_err() {
        return;
    }
    buf[HEADER_LEN..HEADER_LEN + opts.len()].copy_from_slice(opts);
    buf[HEADER_LEN + opts.len()..].copy_from_slice(payload);

    let protocol = match remote.ip {
        IpAddr::V4(_) => crate::ipv4::PROTO_TCP,
        IpAddr::V6(_) => crate::ipv6::NEXT_HEADER_TCP,
    };
    let pseudo = checksum::pseudo_header(local.ip, remote.ip, protocol, tcp_len as u32);
    let sum = checksum::combine(&[pseudo, checksum::accumulate(&buf, Some(8))]);
    buf[16..18].copy_from_slice(&sum.to_be_bytes());

    match (local.ip, remote.ip) {
        (IpAddr::V4(s), IpAddr::V4(d)) => crate::ipv4::send_raw(stack, ifindex, s, d, crate::ipv4::PROTO_TCP, &buf),
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            crate::ipv6::send_raw(stack, ifindex, s, d, crate::ipv6::NEXT_HEADER_TCP, &buf, dontfrag, now_ms)
        }
        _ => {}
    }
}

pub fn on_recv_v4(stack: &mut Stack, ifindex: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8], now_ms: u64) {
    on_recv(stack, ifindex, IpAddr::V4(src), IpAddr::V4(dst), payload, now_ms);
}

pub fn on_recv_v6(stack: &mut Stack, ifindex: u8, src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8], now_ms: u64) {
    on_recv(stack, ifindex, IpAddr::V6(src), IpAddr::V6(dst), payload, now_ms);
}

/// Shared receive-path entry for IPv4/IPv6: checksum verify, flow lookup
/// (connected 4-tuple, then listener), connection-establishment and RST/ACK
/// processing, then data/FIN delivery in the order `tcp_input` follows.
fn on_recv(stack: &mut Stack, ifindex: u8, src: IpAddr, dst: IpAddr, data: &[u8], now_ms: u64) {
    let Ok((header, header_len)) = Header::decode(data) else {
        return;
    };
    let protocol = match dst {
        IpAddr::V4(_) => crate::ipv4::PROTO_TCP,
        IpAddr::V6(_) => crate::ipv6::NEXT_HEADER_TCP,
    };
    let pseudo = checksum::pseudo_header(src, dst, protocol, data.len() as u32);
    if checksum::combine(&[pseudo, checksum::accumulate(data, Some(8))]) != 0 {
        return;
    }

    let opts = &data[HEADER_LEN..header_len];
    let payload = &data[header_len..];
    let local = Endpoint::new(dst, header.dst_port);
    let remote = Endpoint::new(src, header.src_port);

    if stack.tcp.find_connected_mut(local, remote).is_none() {
        handle_no_flow(stack, ifindex, local, remote, &header, opts, now_ms);
        return;
    }
    let owner = stack.tcp.find_connected_mut(local, remote).map(|f| f.owner).unwrap();
    process_segment(stack, ifindex, owner, &header, payload, now_ms);
}

fn handle_no_flow(stack: &mut Stack, ifindex: u8, local: Endpoint, remote: Endpoint, header: &Header, opts: &[u8], now_ms: u64) {
    let is_syn_only = header.flags & FLAG_SYN != 0 && header.flags & FLAG_ACK == 0;
    if is_syn_only && stack.tcp.find_listener_mut(local).is_some() {
        spawn_syn_received(stack, ifindex, local, remote, header, opts, now_ms);
        return;
    }
    if header.flags & FLAG_RST == 0 {
        if header.flags & FLAG_ACK != 0 {
            send_reset(stack, ifindex, local, remote, 0, Some(header.ack), now_ms);
        } else {
            let mut seg_len = 0u32;
            if header.flags & FLAG_SYN != 0 {
                seg_len += 1;
            }
            if header.flags & FLAG_FIN != 0 {
                seg_len += 1;
            }
            send_reset(stack, ifindex, local, remote, header.seq.wrapping_add(seg_len), None, now_ms);
        }
    }
}

fn spawn_syn_received(stack: &mut Stack, ifindex: u8, local: Endpoint, remote: Endpoint, header: &Header, opts: &[u8], now_ms: u64) {
    let (total, per_port) = stack.tcp.syn_received_count(local.port, ifindex);
    if total >= TCP_MAX_SYN_RECEIVED || per_port >= TCP_MAX_SYN_RECEIVED_PER_PORT {
        return;
    }
    let (listener_owner, listener_ws_ok, listener_sack_ok, listener_rcv_wnd_max, listener_keepalive, listener_ip_opts) = {
        let Some(l) = stack.tcp.find_listener_mut(local) else { return };
        (l.owner, l.ws_ok, l.sack_ok, l.rcv_wnd_max, (l.keepalive_on, l.keepalive_idle_ms), (l.ttl, l.dontfrag))
    };

    let parsed = parse_options(opts);
    let iss = next_iss(stack, now_ms);
    let owner = stack.tcp.alloc_owner();
    let mut f = Flow::new(owner, local, remote, ifindex, iss);
    f.state = State::SynReceived;
    f.rcv_nxt = header.seq.wrapping_add(1);
    f.snd_una = iss;
    f.snd_nxt = iss;
    f.rcv_wnd_max = listener_rcv_wnd_max;
    f.ws_ok = listener_ws_ok && parsed.wscale.is_some();
    f.ws_recv = if f.ws_ok { parsed.wscale.unwrap_or(0).min(14) } else { 0 };
    f.ws_send = if f.ws_ok { 8 } else { 0 };
    f.sack_ok = listener_sack_ok && parsed.sack_permitted;
    let local_max_mss = mss_for(remote.ip);
    f.mss = parsed
        .mss
        .map(|m| m.max(if matches!(local.ip, IpAddr::V6(_)) { 1220 } else { 536 }).min(local_max_mss))
        .unwrap_or(local_max_mss);
    f.keepalive_on = listener_keepalive.0;
    f.keepalive_idle_ms = listener_keepalive.1;
    f.keepalive_timer_ms = now_ms;
    f.ttl = listener_ip_opts.0;
    f.dontfrag = listener_ip_opts.1;
    f.snd_wnd = if f.ws_ok && f.ws_recv > 0 { (header.window as u32) << f.ws_recv } else { header.window as u32 };

    let window = f.advertised_window(false);
    let wscale = if f.ws_ok { Some(f.ws_send) } else { None };
    let syn_opts = build_syn_options(f.mss, wscale, f.sack_ok);
    let resp = Header {
        src_port: local.port,
        dst_port: remote.port,
        seq: iss,
        ack: f.rcv_nxt,
        flags: FLAG_SYN | FLAG_ACK,
        window,
        checksum: 0,
        urgent_ptr: 0,
    };
    f.snd_nxt = f.snd_nxt.wrapping_add(1);

    let dontfrag = f.dontfrag;
    let _ = listener_owner;
    stack.tcp.flows.push(f).is_ok().then(|| {
        send_segment(stack, ifindex, local, remote, &resp, &syn_opts, &[], dontfrag, now_ms);
    });
}

fn process_segment(stack: &mut Stack, ifindex: u8, owner: u32, header: &Header, payload: &[u8], now_ms: u64) {
    if header.flags & FLAG_RST != 0 {
        let Some(flow) = stack.tcp.by_owner(owner) else { return };
        if flow.state != State::TimeWait {
            stack.tcp.flows.retain(|f| f.owner != owner);
        }
        return;
    }

    if stack.tcp.by_owner(owner).map(|f| f.state) == Some(State::TimeWait) {
        handle_time_wait(stack, owner, header, payload, now_ms);
        return;
    }

    if let Some(flow) = stack.tcp.by_owner_mut(owner) {
        flow.keepalive_timer_ms = now_ms;
    }

    update_window(stack, owner, header, now_ms);

    if header.flags & FLAG_ACK != 0 {
        process_ack(stack, owner, header, now_ms);
    }

    let state = stack.tcp.by_owner(owner).map(|f| f.state);
    match state {
        Some(State::SynSent) => {
            handle_syn_sent(stack, ifindex, owner, header, now_ms);
            return;
        }
        Some(State::SynReceived) => {
            handle_syn_received(stack, owner, header, now_ms);
            return;
        }
        _ => {}
    }

    process_data_and_fin(stack, owner, header, payload, now_ms);
}

fn update_window(stack: &mut Stack, owner: u32, header: &Header, now_ms: u64) {
    let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
    let new_wnd = if flow.ws_ok && flow.ws_recv > 0 { (header.window as u32) << flow.ws_recv } else { header.window as u32 };
    flow.snd_wnd = new_wnd;
    if new_wnd > 0 {
        flow.persist_active = false;
    } else {
        flow.arm_persist(now_ms);
    }
}

fn process_ack(stack: &mut Stack, owner: u32, header: &Header, now_ms: u64) {
    let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
    let ack = header.ack;
    let una = flow.snd_una;
    let nxt = flow.snd_nxt;
    let acceptable = seq_gt(ack, una) && !seq_gt(ack, nxt);

    if acceptable {
        flow.snd_una = ack;
        flow.dup_acks = 0;
        let mut newly_acked = 0u32;
        let mut i = 0;
        while i < flow.txq.len() {
            let done = !seq_gt(flow.txq[i].end(), ack);
            if done {
                let seg = flow.txq.remove(i);
                newly_acked += (seg.end().wrapping_sub(seg.seq)).max(1);
                if seg.rtt_sample_eligible && seg.retransmit_count == 0 {
                    let sample = now_ms.saturating_sub(seg.timer_ms) as u32;
                    flow.rtt_sample(sample.max(1));
                }
            } else {
                i += 1;
            }
        }
        flow.cc_on_new_ack(ack, newly_acked.max(1));

        match flow.state {
            State::FinWait1 if !seq_gt(flow.snd_nxt, ack) => {
                flow.state = State::FinWait2;
                flow.fin_wait2_ms = now_ms;
            }
            State::LastAck | State::Closing if !seq_gt(flow.snd_nxt, ack) => {
                stack.tcp.flows.retain(|f| f.owner != owner);
                return;
            }
            _ => {}
        }
    } else if ack == una {
        let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
        if flow.dup_acks < u8::MAX && flow.cc_on_dup_ack() && !flow.txq.is_empty() {
            flow.txq[0].retransmit_count += 1;
            flow.txq[0].timer_ms = now_ms;
            retransmit_segment(stack, owner, 0, now_ms);
        }
    }
}

fn handle_syn_sent(stack: &mut Stack, ifindex: u8, owner: u32, header: &Header, now_ms: u64) {
    let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
    if header.flags & FLAG_SYN == 0 || header.flags & FLAG_ACK == 0 {
        if header.flags & FLAG_RST != 0 {
            stack.tcp.flows.retain(|f| f.owner != owner);
        }
        return;
    }
    flow.rcv_nxt = header.seq.wrapping_add(1);
    flow.snd_una = header.ack;
    flow.state = State::Established;
    flow.delayed_ack_pending = false;
    let local = flow.local;
    let remote = flow.remote;
    send_ack_now(stack, owner, now_ms);
    debug!("tcp: connection established owner={owner} {:?}<->{:?}", local, remote);
    let _ = ifindex;
}

fn handle_syn_received(stack: &mut Stack, owner: u32, header: &Header, _now_ms: u64) {
    if header.flags & FLAG_SYN != 0 || header.flags & FLAG_ACK == 0 {
        return;
    }
    let local = {
        let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
        if header.ack != flow.snd_nxt {
            return;
        }
        flow.state = State::Established;
        flow.delayed_ack_pending = false;
        flow.local
    };
    if let Some(listener) = stack.tcp.find_listener_mut(local) {
        let _ = listener.accept_backlog.push(owner);
    }
}

fn process_data_and_fin(stack: &mut Stack, owner: u32, header: &Header, payload: &[u8], now_ms: u64) {
    let fin = header.flags & FLAG_FIN != 0;
    if payload.is_empty() && !fin {
        return;
    }
    let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };

    let rcv_nxt = flow.rcv_nxt;
    let wnd_end = rcv_nxt.wrapping_add(flow.rcv_wnd);
    let data_len = payload.len() as u32;
    let seg_end = header.seq.wrapping_add(data_len).wrapping_add(fin as u32);

    if !seq_gt(seg_end, rcv_nxt) || !seq_gt(wnd_end, header.seq) {
        send_ack_now(stack, owner, now_ms);
        return;
    }

    let mut seq = header.seq;
    let mut body = payload;
    if seq_gt(rcv_nxt, seq) {
        let skip = rcv_nxt.wrapping_sub(seq) as usize;
        if skip >= body.len() {
            body = &[];
        } else {
            body = &body[skip..];
        }
        seq = rcv_nxt;
    }

    if seq == flow.rcv_nxt {
        if !body.is_empty() {
            let free = flow.rcv_wnd_max.saturating_sub(flow.rcv_buf_used) as usize;
            let take = body.len().min(free);
            flow.recv_buf.extend_from_slice(&body[..take]);
            flow.rcv_buf_used += take as u32;
            flow.rcv_nxt = flow.rcv_nxt.wrapping_add(take as u32);
        }
        if fin && flow.rcv_nxt == seq.wrapping_add(body.len() as u32) {
            flow.rcv_nxt = flow.rcv_nxt.wrapping_add(1);
            advance_on_fin(flow, now_ms);
        } else if fin {
            flow.fin_pending = true;
            flow.fin_seq = header.seq.wrapping_add(data_len);
        }
        drain_reassembly(flow, now_ms);
        flow.advertised_window(true);
        send_ack_now(stack, owner, now_ms);
    } else if !body.is_empty() {
        let seg = flow::ReassSegment { seq, data: body.to_vec() };
        if flow.reass.len() == flow.reass.capacity() {
            flow.reass.remove(0);
        }
        let _ = flow.reass.push(seg);
        if fin {
            flow.fin_pending = true;
            flow.fin_seq = header.seq.wrapping_add(data_len);
        }
        send_ack_now(stack, owner, now_ms);
    } else if fin {
        flow.fin_pending = true;
        flow.fin_seq = header.seq.wrapping_add(data_len);
        send_ack_now(stack, owner, now_ms);
    }
}

fn advance_on_fin(flow: &mut Flow, now_ms: u64) {
    flow.fin_pending = false;
    match flow.state {
        State::Established => flow.state = State::CloseWait,
        State::FinWait1 => flow.state = State::Closing,
        State::FinWait2 => flow.enter_time_wait(now_ms),
        _ => {}
    }
}

fn drain_reassembly(flow: &mut Flow, now_ms: u64) {
    loop {
        let idx = flow.reass.iter().position(|s| s.seq == flow.rcv_nxt);
        let Some(idx) = idx else { break };
        let seg = flow.reass.remove(idx);
        let free = flow.rcv_wnd_max.saturating_sub(flow.rcv_buf_used) as usize;
        let take = seg.data.len().min(free);
        flow.recv_buf.extend_from_slice(&seg.data[..take]);
        flow.rcv_buf_used += take as u32;
        flow.rcv_nxt = flow.rcv_nxt.wrapping_add(take as u32);
        if take < seg.data.len() {
            break;
        }
    }
    if flow.fin_pending && flow.fin_seq == flow.rcv_nxt {
        advance_on_fin(flow, now_ms);
    }
}

fn handle_time_wait(stack: &mut Stack, owner: u32, header: &Header, payload: &[u8], now_ms: u64) {
    let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
    let mut seg_len = payload.len() as u32;
    if header.flags & FLAG_SYN != 0 {
        seg_len += 1;
    }
    if header.flags & FLAG_FIN != 0 {
        seg_len += 1;
    }
    let seg_end = header.seq.wrapping_add(seg_len);
    if !seq_gt(header.seq, flow.rcv_nxt) && !seq_gt(flow.rcv_nxt, seg_end) {
        flow.enter_time_wait(now_ms);
        send_ack_now(stack, owner, now_ms);
    }
}

fn retransmit_segment(stack: &mut Stack, owner: u32, idx: usize, now_ms: u64) {
    transmit_segment(stack, owner, idx, now_ms);
    if let Some(flow) = stack.tcp.by_owner_mut(owner) {
        if let Some(seg) = flow.txq.get_mut(idx) {
            seg.timer_ms = now_ms;
        }
    }
}

/// Serial wraparound comparison (RFC 793 §3.3): true if `a` is strictly
/// ahead of `b` in sequence-number space.
fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Drive every flow's retransmission/persist/delayed-ack/keepalive timers
/// and expire TIME_WAIT, mirroring the `tcp_daemon_kick` event-driven tick.
pub fn tick(stack: &mut Stack, _dt_ms: u64, now_ms: u64) {
    let owners: Vec<u32> = stack.tcp.flows.iter().map(|f| f.owner).collect();
    for owner in owners {
        tick_flow(stack, owner, now_ms);
    }
    stack.tcp.flows.retain(|f| !(f.state == State::TimeWait && now_ms >= f.time_wait_ms));
}

fn tick_flow(stack: &mut Stack, owner: u32, now_ms: u64) {
    let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };

    if flow.delayed_ack_pending && now_ms >= flow.delayed_ack_timer_ms {
        send_ack_now(stack, owner, now_ms);
    }

    if flow.persist_active && now_ms >= flow.persist_timer_ms {
        let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
        flow.backoff_persist();
        flow.arm_persist(now_ms);
        send_probe(stack, owner, now_ms);
    }

    let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
    if let Some(seg) = flow.txq.first() {
        if now_ms.saturating_sub(seg.timer_ms) >= seg.timeout_ms {
            if flow.state == State::SynSent || flow.state == State::SynReceived {
                flow.retries += 1;
                if flow.syn_retries_exhausted() {
                    stack.tcp.flows.retain(|f| f.owner != owner);
                    return;
                }
            }
            flow.backoff_rto();
            flow.cc_on_timeout();
            let timeout = flow.rto_ms;
            if let Some(seg) = flow.txq.first_mut() {
                seg.retransmit_count += 1;
                seg.timer_ms = now_ms;
                seg.timeout_ms = timeout;
            }
            retransmit_segment(stack, owner, 0, now_ms);
        }
    }

    let Some(flow) = stack.tcp.by_owner_mut(owner) else { return };
    if flow.state == State::FinWait2 && now_ms.saturating_sub(flow.fin_wait2_ms) > crate::config::TCP_TIME_WAIT_MS {
        flow.enter_time_wait(now_ms);
    }

    let due = flow.keepalive_on && flow.state == State::Established && now_ms.saturating_sub(flow.keepalive_timer_ms) >= flow.keepalive_idle_ms;
    if due {
        if let Some(flow) = stack.tcp.by_owner_mut(owner) {
            flow.keepalive_timer_ms = now_ms;
        }
        send_probe(stack, owner, now_ms);
    }
}

fn send_probe(stack: &mut Stack, owner: u32, now_ms: u64) {
    let Some(flow) = stack.tcp.by_owner(owner) else { return };
    let header = Header {
        src_port: flow.local.port,
        dst_port: flow.remote.port,
        seq: flow.snd_una.wrapping_sub(1),
        ack: flow.rcv_nxt,
        flags: FLAG_ACK,
        window: flow.rcv_wnd.min(u16::MAX as u32) as u16,
        checksum: 0,
        urgent_ptr: 0,
    };
    let local = flow.local;
    let remote = flow.remote;
    let ifindex = flow.ifindex;
    let dontfrag = flow.dontfrag;
    send_segment(stack, ifindex, local, remote, &header, &[], &[0u8], dontfrag, now_ms);
}

pub fn is_established(stack: &Stack, owner: u32) -> bool {
    stack.tcp.by_owner(owner).map(|f| f.state == State::Established).unwrap_or(false)
}

pub fn state_of(stack: &Stack, owner: u32) -> Option<State> {
    stack.tcp.by_owner(owner).map(|f| f.state)
}

/// Socket extra option: per-flow IPv4 TTL / IPv6 hop limit carried by every
/// segment this flow sends.
pub fn set_ttl(stack: &mut Stack, owner: u32, ttl: u8) -> Result<()> {
    stack.tcp.by_owner_mut(owner).ok_or(Error::Inval)?.ttl = ttl;
    Ok(())
}

/// Socket extra option: whether this flow's IPv4 segments carry Don't-Fragment.
pub fn set_dontfrag(stack: &mut Stack, owner: u32, dontfrag: bool) -> Result<()> {
    stack.tcp.by_owner_mut(owner).ok_or(Error::Inval)?.dontfrag = dontfrag;
    Ok(())
}

/// Socket extra option: enable/disable keepalive probing and its idle timeout.
pub fn set_keepalive(stack: &mut Stack, owner: u32, on: bool, idle_ms: u64, now_ms: u64) -> Result<()> {
    let flow = stack.tcp.by_owner_mut(owner).ok_or(Error::Inval)?;
    flow.keepalive_on = on;
    flow.keepalive_idle_ms = idle_ms;
    flow.keepalive_timer_ms = now_ms;
    Ok(())
}

/// Socket extra option: advertised receive window ceiling.
pub fn set_rcv_buf(stack: &mut Stack, owner: u32, bytes: u32) -> Result<()> {
    stack.tcp.by_owner_mut(owner).ok_or(Error::Inval)?.rcv_wnd_max = bytes;
    Ok(())
}

/// Whether `recv` would return data without blocking.
pub fn has_pending(stack: &Stack, owner: u32) -> bool {
    stack.tcp.by_owner(owner).map(|f| !f.recv_buf.is_empty()).unwrap_or(false)
}

/// Whether a listener has a completed connection waiting in `accept`.
pub fn has_backlog(stack: &Stack, owner: u32) -> bool {
    stack.tcp.by_owner(owner).map(|f| !f.accept_backlog.is_empty()).unwrap_or(false)
}

/// Earliest timestamp at which some flow has a timer due (retransmit,
/// persist, delayed-ack, keepalive, FIN_WAIT_2-to-TIME_WAIT, or TIME_WAIT
/// expiry), so the daemon driver can schedule its next wakeup instead of
/// polling blindly.
pub fn next_deadline(stack: &Stack, now_ms: u64) -> Option<u64> {
    let mut min: Option<u64> = None;
    let mut consider = |t: u64| min = Some(min.map_or(t, |m| m.min(t)));

    for flow in stack.tcp.flows.iter() {
        if flow.delayed_ack_pending {
            consider(flow.delayed_ack_timer_ms);
        }
        if flow.persist_active {
            consider(flow.persist_timer_ms);
        }
        if let Some(seg) = flow.txq.first() {
            consider(seg.timer_ms.saturating_add(seg.timeout_ms));
        }
        if flow.state == State::FinWait2 {
            consider(flow.fin_wait2_ms.saturating_add(crate::config::TCP_TIME_WAIT_MS));
        }
        if flow.keepalive_on && flow.state == State::Established {
            consider(flow.keepalive_timer_ms.saturating_add(flow.keepalive_idle_ms));
        }
        if flow.state == State::TimeWait {
            consider(flow.time_wait_ms);
        }
    }
    min.map(|t| t.max(now_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = Header {
            src_port: 1234,
            dst_port: 80,
            seq: 1000,
            ack: 0,
            flags: FLAG_SYN,
            window: 65535,
            checksum: 0,
            urgent_ptr: 0,
        };
        let mut buf = [0u8; HEADER_LEN];
        let encoded = h.encode(0, &mut buf).unwrap();
        let (decoded, hdr_len) = Header::decode(encoded).unwrap();
        assert_eq!(decoded.src_port, 1234);
        assert_eq!(decoded.seq, 1000);
        assert_eq!(hdr_len, HEADER_LEN);
    }

    #[test]
    fn syn_options_round_trip_through_parse() {
        let opts = build_syn_options(1460, Some(7), true);
        let parsed = parse_options(&opts);
        assert_eq!(parsed.mss, Some(1460));
        assert_eq!(parsed.wscale, Some(7));
        assert!(parsed.sack_permitted);
    }

    #[test]
    fn seq_gt_handles_wraparound() {
        assert!(seq_gt(10, 5));
        assert!(!seq_gt(5, 10));
        assert!(seq_gt(5, u32::MAX - 2));
    }
}
