//! UDP transport: bind/send/recv fan-out on top of the port manager, plus
//! the special-cased ports (DHCPv6 client 546, mDNS 5353) that this crate's
//! own daemons own rather than a process-facing socket. Grounded on
//! `net::udp`'s datagram shape (`Header{src_port,dst_port,len,crc}`)
//! and its `socket::udp::UdpSocket` fan-out-to-`incoming` pattern, adapted
//! from a single global `HANDLERS` map to per-`Stack` owner queues since
//! this crate has no process/fd layer of its own.

use alloc::vec::Vec;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::checksum;
use crate::config::DHCPV6_CLIENT_PORT;
use crate::dns::MDNS_PORT;
use crate::error::{Error, Result};
use crate::types::{BindSpec, Endpoint, Protocol};
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub src_port: u16,
    pub dst_port: u16,
    pub len: u16,
    pub checksum: u16,
}

impl Header {
    pub fn decode(bytes: &mut BytesIn) -> core::result::Result<Self, WireError> {
        Ok(Self {
            src_port: bytes.u16()?,
            dst_port: bytes.u16()?,
            len: bytes.u16()?,
            checksum: bytes.u16()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: Endpoint,
    pub data: Vec<u8>,
}

struct Socket {
    owner: u32,
    local_port: u16,
    connected: Option<Endpoint>,
    incoming: heapless::Vec<Datagram, 16>,
}

pub struct UdpState {
    sockets: heapless::Vec<Socket, { crate::config::MAX_TCP_FLOWS }>,
    next_owner: u32,
}

impl UdpState {
    pub fn new() -> Self {
        Self {
            sockets: heapless::Vec::new(),
            next_owner: 1,
        }
    }

    fn socket_mut(&mut self, owner: u32) -> Option<&mut Socket> {
        self.sockets.iter_mut().find(|s| s.owner == owner)
    }

    fn socket_by_port_mut(&mut self, port: u16) -> Option<&mut Socket> {
        self.sockets.iter_mut().find(|s| s.local_port == port)
    }
}

impl Default for UdpState {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a new UDP socket and bind it, mirroring
/// `UdpSocket::new()` + `INodeInterface::bind`.
///
/// `L3`/`L2` specs expand into the concrete set of local addresses they
/// name (one for `L3`, every address on the interface for `L2`) and are
/// registered per-address with rollback on partial failure, so a single
/// socket can be bound to a specific interface rather than every address.
pub fn bind(stack: &mut Stack, spec: BindSpec, port: u16) -> Result<u32> {
    let owner = stack.udp.next_owner;
    stack.udp.next_owner = stack.udp.next_owner.wrapping_add(1).max(1);

    let bound_port = match spec {
        BindSpec::L3(_) | BindSpec::L2(_) => {
            let addrs = expand_bind_spec(stack, spec)?;
            stack.ports.bind_addrs(Protocol::Udp, &addrs, port, owner)?
        }
        BindSpec::Any | BindSpec::Ip(_) => stack.ports.bind(Protocol::Udp, spec, port, owner)?,
    };
    let socket = Socket {
        owner,
        local_port: bound_port,
        connected: None,
        incoming: heapless::Vec::new(),
    };
    if stack.udp.sockets.push(socket).is_err() {
        let _ = stack.ports.unbind(Protocol::Udp, bound_port, owner);
        return Err(Error::Sys);
    }
    debug!("udp: bind(owner={owner}, port={bound_port})");
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

pub fn connect(stack: &mut Stack, owner: u32, dest: Endpoint) -> Result<()> {
    let socket = stack.udp.socket_mut(owner).ok_or(Error::Inval)?;
    socket.connected = Some(dest);
    Ok(())
}

pub fn close(stack: &mut Stack, owner: u32) -> Result<()> {
    let idx = stack.udp.sockets.iter().position(|s| s.owner == owner).ok_or(Error::Inval)?;
    let port = stack.udp.sockets[idx].local_port;
    stack.udp.sockets.swap_remove(idx);
    let _ = stack.ports.unbind(Protocol::Udp, port, owner);
    Ok(())
}

pub fn recv(stack: &mut Stack, owner: u32) -> Result<Datagram> {
    let socket = stack.udp.socket_mut(owner).ok_or(Error::Inval)?;
    if socket.incoming.is_empty() {
        return Err(Error::WouldBlock);
    }
    Ok(socket.incoming.remove(0))
}

pub fn has_pending(stack: &Stack, owner: u32) -> bool {
    stack
        .udp
        .sockets
        .iter()
        .find(|s| s.owner == owner)
        .map(|s| !s.incoming.is_empty())
        .unwrap_or(false)
}

/// Send `payload` from the bound local port of `owner` to `dest`, or to the
/// connected peer if `dest` is `None`.
pub fn send(stack: &mut Stack, owner: u32, dest: Option<Endpoint>, payload: &[u8], now_ms: u64) -> Result<()> {
    let (local_port, dest) = {
        let socket = stack.udp.socket_mut(owner).ok_or(Error::Inval)?;
        let dest = dest.or(socket.connected).ok_or(Error::State)?;
        (socket.local_port, dest)
    };
    send_from(stack, local_port, dest, payload, now_ms)
}

fn send_from(stack: &mut Stack, src_port: u16, dest: Endpoint, payload: &[u8], now_ms: u64) -> Result<()> {
    match dest.ip {
        IpAddr::V4(dst) => send_from_v4(stack, src_port, dst, dest.port, payload),
        IpAddr::V6(dst) => send_from_v6(stack, src_port, dst, dest.port, payload, now_ms),
    }
}

/// Every non-disabled IPv4 address currently bound, as `(ifindex, addr)`.
fn every_bound_l3_v4(stack: &Stack) -> Vec<(u8, Ipv4Addr)> {
    stack
        .ifaces
        .iter()
        .flat_map(|i| i.v4.iter().filter(|a| a.mode != crate::iface::l3v4::V4Mode::Disabled).map(|a| (i.ifindex, a.ip)))
        .collect()
}

fn send_from_v4(stack: &mut Stack, src_port: u16, dst: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Result<()> {
    if dst.is_broadcast() {
        for (ifindex, src) in every_bound_l3_v4(stack) {
            let datagram = build_datagram(IpAddr::V4(src), IpAddr::V4(dst), src_port, dst_port, payload);
            crate::ipv4::send_raw(stack, ifindex, src, dst, crate::ipv4::PROTO_UDP, &datagram);
        }
        return Ok(());
    }

    if dst.is_multicast() {
        for (ifindex, src) in every_bound_l3_v4(stack) {
            crate::igmp::join(stack, ifindex, dst);
            let datagram = build_datagram(IpAddr::V4(src), IpAddr::V4(dst), src_port, dst_port, payload);
            crate::ipv4::send_raw(stack, ifindex, src, dst, crate::ipv4::PROTO_UDP, &datagram);
        }
        return Ok(());
    }

    // Directed broadcast (e.g. 10.0.0.255 on a /24): send once on the
    // interface whose subnet it's the broadcast address for.
    let directed = stack.ifaces.iter().find_map(|i| i.v4.iter().find(|a| a.is_broadcast_for(dst)).map(|a| (i.ifindex, a.ip)));
    if let Some((ifindex, src)) = directed {
        let datagram = build_datagram(IpAddr::V4(src), IpAddr::V4(dst), src_port, dst_port, payload);
        crate::ipv4::send_raw(stack, ifindex, src, dst, crate::ipv4::PROTO_UDP, &datagram);
        return Ok(());
    }

    let Some(id) = stack.ifaces.resolve_ipv4_to_interface(dst) else {
        return Err(Error::Proto);
    };
    let ifindex = id.ifindex();
    let Some(src) = default_src_v4(stack, dst) else {
        return Err(Error::Proto);
    };
    let datagram = build_datagram(IpAddr::V4(src), IpAddr::V4(dst), src_port, dst_port, payload);
    crate::ipv4::send_raw(stack, ifindex, src, dst, crate::ipv4::PROTO_UDP, &datagram);
    Ok(())
}

fn send_from_v6(stack: &mut Stack, src_port: u16, dst: Ipv6Addr, dst_port: u16, payload: &[u8], now_ms: u64) -> Result<()> {
    if dst.is_multicast() {
        use crate::iface::l3v6::V6Kind;
        let targets: Vec<(u8, Ipv6Addr)> = stack
            .ifaces
            .iter()
            .flat_map(|i| {
                i.v6.iter()
                    .find(|a| a.is_enabled() && a.kind.contains(V6Kind::GLOBAL))
                    .or_else(|| i.v6.iter().find(|a| a.is_enabled() && a.kind.contains(V6Kind::LINK_LOCAL)))
                    .map(|a| (i.ifindex, a.addr))
            })
            .collect();
        for (ifindex, src) in targets {
            crate::mld::join(stack, ifindex, dst);
            let datagram = build_datagram(IpAddr::V6(src), IpAddr::V6(dst), src_port, dst_port, payload);
            crate::ipv6::send_raw(stack, ifindex, src, dst, crate::ipv6::NEXT_HEADER_UDP, &datagram, false, now_ms);
        }
        return Ok(());
    }

    let Some(id) = stack.ifaces.resolve_ipv6_to_interface(dst) else {
        return Err(Error::Proto);
    };
    let ifindex = id.ifindex();
    let Some(src) = default_src_v6(stack, ifindex) else {
        return Err(Error::Proto);
    };
    let datagram = build_datagram(IpAddr::V6(src), IpAddr::V6(dst), src_port, dst_port, payload);
    crate::ipv6::send_raw(stack, ifindex, src, dst, crate::ipv6::NEXT_HEADER_UDP, &datagram, false, now_ms);
    Ok(())
}

fn default_src_v4(stack: &Stack, dst: Ipv4Addr) -> Option<Ipv4Addr> {
    let id = stack.ifaces.resolve_ipv4_to_interface(dst)?;
    stack.ifaces.find_by_id_v4(id).map(|a| a.ip)
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

fn build_datagram(src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, payload: &[u8]) -> alloc::vec::Vec<u8> {
    let total_len = HEADER_LEN + payload.len();
    let mut buf = alloc::vec![0u8; total_len];
    {
        let mut b = BytesOut::new(&mut buf);
        let _ = b
            .u16(src_port)
            .and_then(|b| b.u16(dst_port))
            .and_then(|b| b.u16(total_len as u16))
            .and_then(|b| b.u16(0));
    }
    buf[HEADER_LEN..].copy_from_slice(payload);
    let pseudo = checksum::pseudo_header(src, dst, protocol_for(dst), total_len as u32);
    let sum = checksum::combine(&[pseudo, checksum::accumulate(&buf, None)]);
    let sum = if sum == 0 { 0xffff } else { sum };
    buf[6..8].copy_from_slice(&sum.to_be_bytes());
    buf
}

fn protocol_for(dst: IpAddr) -> u8 {
    match dst {
        IpAddr::V4(_) => crate::ipv4::PROTO_UDP,
        IpAddr::V6(_) => crate::ipv6::NEXT_HEADER_UDP,
    }
}

/// Entry point for a decoded UDP datagram arriving over IPv4. DHCPv6 doesn't run over IPv4; everything lands on
/// a bound socket or is dropped.
pub fn on_recv_v4(stack: &mut Stack, _ifindex: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8], now_ms: u64) {
    let mut b = BytesIn::new(payload);
    let Ok(header) = Header::decode(&mut b) else {
        return;
    };
    let body = b.remaining();
    deliver(stack, IpAddr::V4(src), IpAddr::V4(dst), header.src_port, header.dst_port, body, now_ms);
}

/// Entry point for a decoded UDP datagram arriving over IPv6. Port 546
/// (DHCPv6 client) and 5353 (mDNS) are intercepted before the ordinary
/// bound-socket fan-out, matching the daemons that own those ports.
pub fn on_recv_v6(stack: &mut Stack, ifindex: u8, src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8], now_ms: u64) {
    let mut b = BytesIn::new(payload);
    let Ok(header) = Header::decode(&mut b) else {
        return;
    };
    let body = b.remaining();

    if header.dst_port == DHCPV6_CLIENT_PORT {
        crate::dhcpv6::on_recv(stack, ifindex, src, body, now_ms);
        return;
    }
    if header.dst_port == MDNS_PORT {
        let _ = crate::dns::on_mdns_packet(stack, body, now_ms);
        return;
    }
    deliver(stack, IpAddr::V6(src), IpAddr::V6(dst), header.src_port, header.dst_port, body, now_ms);
}

fn deliver(stack: &mut Stack, src: IpAddr, dst: IpAddr, src_port: u16, dst_port: u16, body: &[u8], _now_ms: u64) {
    let Some(owner) = stack.ports.owner_of(Protocol::Udp, dst_port, dst) else {
        return;
    };
    let Some(socket) = stack.udp.socket_by_port_mut(dst_port) else {
        return;
    };
    if socket.owner != owner {
        return;
    }
    if let Some(connected) = socket.connected {
        if connected.ip != src || connected.port != src_port {
            return;
        }
    }
    let datagram = Datagram {
        from: Endpoint::new(src, src_port),
        data: body.to_vec(),
    };
    if socket.incoming.push(datagram).is_err() {
        socket.incoming.remove(0);
        let _ = socket.incoming.push(Datagram {
            from: Endpoint::new(src, src_port),
            data: body.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let buf = build_datagram(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            1234,
            53,
            b"hello",
        );
        let mut b = BytesIn::new(&buf);
        let header = Header::decode(&mut b).unwrap();
        assert_eq!(header.src_port, 1234);
        assert_eq!(header.dst_port, 53);
        assert_eq!(b.remaining(), b"hello");
    }
}
