//! IPv4 datapath: header parse/build, checksum, fragmentation/reassembly,
//! ARP-backed output path down to ethernet. Grounded on `net::ip::Ipv4`,
//! generalized to route through the interface manager and routing table
//! rather than one global interface.

use alloc::vec::Vec;
use core::net::Ipv4Addr;
use core::num::NonZeroUsize;

use lru::LruCache;

use crate::checksum;
use crate::config::{IPV4_DEFAULT_MTU, REASSEMBLY_MAX_FRAGMENTS, REASSEMBLY_TABLE_SIZE, REASSEMBLY_TIMEOUT_MS};
use crate::ethernet::{self, EtherType, MacAddr};
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_IGMP: u8 = 2;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub dscp_ecn: u8,
    pub total_len: u16,
    pub identification: u16,
    pub flags: u8,
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Header {
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let mut bytes = BytesIn::new(data);
        let version_ihl = bytes.u8()?;
        let ihl = (version_ihl & 0x0f) as usize * 4;
        if ihl < HEADER_LEN {
            return Err(WireError::Underflow);
        }
        let dscp_ecn = bytes.u8()?;
        let total_len = bytes.u16()?;
        let identification = bytes.u16()?;
        let flags_frag = bytes.u16()?;
        let flags = (flags_frag >> 13) as u8;
        let frag_offset = (flags_frag & 0x1fff) * 8;
        let ttl = bytes.u8()?;
        let protocol = bytes.u8()?;
        let checksum = bytes.u16()?;
        let src = Ipv4Addr::from(bytes.u32()?);
        let dst = Ipv4Addr::from(bytes.u32()?);
        if ihl > HEADER_LEN {
            bytes.skip(ihl - HEADER_LEN)?;
        }
        let header = Self {
            dscp_ecn,
            total_len,
            identification,
            flags,
            frag_offset,
            ttl,
            protocol,
            checksum,
            src,
            dst,
        };
        let payload_len = (total_len as usize).saturating_sub(ihl);
        Ok((header, bytes.slice(payload_len.min(bytes.remaining_len()))?))
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], WireError> {
        let version_ihl = (4u8 << 4) | 5;
        let flags_frag = ((self.flags as u16) << 13) | (self.frag_offset / 8);
        let mut bytes = BytesOut::new(buf);
        bytes
            .u8(version_ihl)?
            .u8(self.dscp_ecn)?
            .u16(self.total_len)?
            .u16(self.identification)?
            .u16(flags_frag)?
            .u8(self.ttl)?
            .u8(self.protocol)?
            .u16(0)?
            .push(&self.src.octets())?
            .push(&self.dst.octets())?;
        let len = bytes.len();
        let sum = checksum::header_checksum(&buf[..len], None);
        buf[10..12].copy_from_slice(&sum.to_be_bytes());
        Ok(&buf[..len])
    }
}

pub fn pmtu_hint(stack: &mut Stack, dst: Ipv4Addr, mtu: u16) {
    stack.icmpv4.pmtu_update(dst, mtu);
}

#[derive(Debug, Clone)]
struct Fragment {
    offset: u16,
    more: bool,
    data: Vec<u8>,
}

struct Reassembly {
    protocol: u8,
    fragments: heapless::Vec<Fragment, REASSEMBLY_MAX_FRAGMENTS>,
    age_ms: u64,
}

pub struct ReassemblyTable {
    entries: LruCache<(Ipv4Addr, Ipv4Addr, u16), Reassembly>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(REASSEMBLY_TABLE_SIZE).unwrap()),
        }
    }

    fn insert_fragment(
        &mut self,
        key: (Ipv4Addr, Ipv4Addr, u16),
        protocol: u8,
        offset: u16,
        more: bool,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        if !self.entries.contains(&key) {
            self.entries.put(
                key,
                Reassembly {
                    protocol,
                    fragments: heapless::Vec::new(),
                    age_ms: 0,
                },
            );
        }
        let reasm = self.entries.get_mut(&key)?;
        reasm.age_ms = 0;
        if reasm
            .fragments
            .push(Fragment {
                offset,
                more,
                data: data.to_vec(),
            })
            .is_err()
        {
            self.entries.pop(&key);
            return None;
        }
        if reasm.fragments.iter().any(|f| !f.more) {
            let mut frags: Vec<&Fragment> = reasm.fragments.iter().collect();
            frags.sort_by_key(|f| f.offset);
            let mut expected = 0u16;
            let mut complete = true;
            for f in &frags {
                if f.offset != expected {
                    complete = false;
                    break;
                }
                expected = expected.saturating_add(f.data.len() as u16);
            }
            if complete {
                let mut out = Vec::new();
                for f in frags {
                    out.extend_from_slice(&f.data);
                }
                self.entries.pop(&key);
                return Some(out);
            }
        }
        None
    }

    pub fn age(&mut self, dt_ms: u64) {
        let keys: Vec<(Ipv4Addr, Ipv4Addr, u16)> = self.entries.iter().map(|(k, _)| *k).collect();
        for key in keys {
            if let Some(r) = self.entries.peek_mut(&key) {
                r.age_ms += dt_ms;
                if r.age_ms > REASSEMBLY_TIMEOUT_MS {
                    self.entries.pop(&key);
                }
            }
        }
    }
}

impl Default for ReassemblyTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for a decoded IPv4 packet arriving on `ifindex`. Delivers unicast/broadcast/multicast the same way,
/// learns the sender into ARP, and reassembles fragments before dispatch.
pub fn on_recv(stack: &mut Stack, ifindex: u8, src_mac: MacAddr, data: &[u8], now_ms: u64) {
    let Ok((header, payload)) = Header::decode(data) else {
        return;
    };
    if header.ttl == 0 {
        return;
    }

    if !header.src.is_unspecified() && !header.src.is_broadcast() {
        stack.arp.learn(ifindex, header.src, src_mac, 180_000);
    }

    const MORE_FRAGMENTS: u8 = 0b001;
    if header.flags & MORE_FRAGMENTS != 0 || header.frag_offset != 0 {
        let key = (header.src, header.dst, header.identification);
        let more = header.flags & MORE_FRAGMENTS != 0;
        match stack
            .reassembly_v4
            .insert_fragment(key, header.protocol, header.frag_offset, more, payload)
        {
            Some(full) => dispatch_upper(stack, ifindex, header.src, header.dst, header.protocol, &full, now_ms),
            None => {}
        }
        return;
    }

    dispatch_upper(stack, ifindex, header.src, header.dst, header.protocol, payload, now_ms);
}

fn dispatch_upper(
    stack: &mut Stack,
    ifindex: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload: &[u8],
    now_ms: u64,
) {
    match protocol {
        PROTO_ICMP => crate::icmpv4::on_recv(stack, ifindex, src, dst, payload),
        PROTO_IGMP => {
            if let Ok(msg) = crate::igmp::Message::decode(payload) {
                crate::igmp::on_recv(stack, ifindex, &msg, now_ms);
            }
        }
        PROTO_UDP => crate::udp::on_recv_v4(stack, ifindex, src, dst, payload, now_ms),
        PROTO_TCP => crate::tcp::on_recv_v4(stack, ifindex, src, dst, payload, now_ms),
        _ => {}
    }
}

/// Resolve the route, resolve the next hop via ARP, and transmit an IPv4
/// packet carrying `payload` as the upper-layer body.
pub fn send_raw(stack: &mut Stack, ifindex: u8, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) {
    let total_len = (HEADER_LEN + payload.len()) as u16;
    let header = Header {
        dscp_ecn: 0,
        total_len,
        identification: next_identification(stack),
        flags: 0b010, // Don't Fragment; this stack doesn't originate fragmented packets
        frag_offset: 0,
        ttl: 64,
        protocol,
        checksum: 0,
        src,
        dst,
    };
    let mut packet = alloc::vec![0u8; HEADER_LEN + payload.len()];
    if header.encode(&mut packet).is_err() {
        return;
    }
    packet[HEADER_LEN..].copy_from_slice(payload);

    let Some(next_hop_mac) = resolve_next_hop(stack, ifindex, dst) else {
        return;
    };

    let src_mac = stack.ifaces.get(ifindex).map(|i| i.mac).unwrap_or(MacAddr::ZERO);
    let eth = ethernet::Header {
        dest_mac: next_hop_mac,
        src_mac,
        ethertype: EtherType::Ipv4,
    };
    let mut frame = alloc::vec![0u8; ethernet::HEADER_LEN + packet.len()];
    if eth.encode(&mut frame).is_err() {
        return;
    }
    frame[ethernet::HEADER_LEN..].copy_from_slice(&packet);
    stack.send_frame(ifindex, &frame);
}

fn next_identification(stack: &mut Stack) -> u16 {
    stack.ipv4_ident = stack.ipv4_ident.wrapping_add(1);
    stack.ipv4_ident
}

fn resolve_next_hop(stack: &mut Stack, ifindex: u8, dst: Ipv4Addr) -> Option<MacAddr> {
    use crate::arp::ResolveOutcome;

    if dst.is_broadcast() {
        return Some(MacAddr::BROADCAST);
    }
    if dst.is_multicast() {
        return Some(MacAddr::ipv4_multicast(dst));
    }
    // Off-link destinations ARP the gateway, never the unreachable dst itself.
    let next_hop = stack.ifaces.next_hop_v4(ifindex, dst);
    match stack.arp.begin_resolve(ifindex, next_hop) {
        ResolveOutcome::Resolved(mac) => Some(mac),
        ResolveOutcome::SendRequest => {
            crate::arp::send_request(stack, ifindex, next_hop);
            None
        }
        ResolveOutcome::Pending => None,
    }
}

pub const _DEFAULT_MTU: u16 = IPV4_DEFAULT_MTU;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_with_checksum() {
        let h = Header {
            dscp_ecn: 0,
            total_len: 28,
            identification: 7,
            flags: 0,
            frag_offset: 0,
            ttl: 64,
            protocol: PROTO_UDP,
            checksum: 0,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
        };
        let mut buf = [0u8; HEADER_LEN];
        let encoded = h.encode(&mut buf).unwrap();
        assert_eq!(checksum::header_checksum(encoded, None), 0);
        let (decoded, _) = Header::decode(encoded).unwrap();
        assert_eq!(decoded.src, h.src);
        assert_eq!(decoded.protocol, PROTO_UDP);
    }

    #[test]
    fn fragments_reassemble_in_order() {
        let mut t = ReassemblyTable::new();
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let key = (src, dst, 99);
        assert!(t.insert_fragment(key, PROTO_UDP, 0, true, &[1, 2, 3, 4]).is_none());
        let full = t.insert_fragment(key, PROTO_UDP, 4, false, &[5, 6]);
        assert_eq!(full, Some(alloc::vec![1, 2, 3, 4, 5, 6]));
    }
}
