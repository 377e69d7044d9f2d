//! IPv6 datapath: header parse/build, extension header walk, fragmentation
//! and reassembly, PMTU cache, output path down to ethernet.
//! Grounded on `net::ip`, generalized from a single default-route IPv4
//! sender into the interface-manager-driven multi-L3 design both address
//! families in this crate share.

use alloc::vec::Vec;
use core::net::Ipv6Addr;
use core::num::NonZeroUsize;

use lru::LruCache;

use crate::checksum;
use crate::config::{
    IPV6_DEFAULT_MTU, IPV6_MIN_MTU, PMTU_AGE_MS, PMTU_CACHE_SIZE, REASSEMBLY_MAX_FRAGMENTS, REASSEMBLY_TABLE_SIZE,
    REASSEMBLY_TIMEOUT_MS,
};
use crate::ethernet::{self, EtherType, MacAddr};
use crate::ndp::{self, NeighborMessage};
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

pub const NEXT_HEADER_HOP_BY_HOP: u8 = 0;
pub const NEXT_HEADER_TCP: u8 = 6;
pub const NEXT_HEADER_UDP: u8 = 17;
pub const NEXT_HEADER_ROUTING: u8 = 43;
pub const NEXT_HEADER_FRAGMENT: u8 = 44;
pub const NEXT_HEADER_ICMPV6: u8 = 58;
pub const NEXT_HEADER_NO_NEXT: u8 = 59;
pub const NEXT_HEADER_DEST_OPTS: u8 = 60;

pub const HEADER_LEN: usize = 40;
const FRAGMENT_HEADER_LEN: usize = 8;

fn is_link_local(addr: Ipv6Addr) -> bool {
    let o = addr.octets();
    o[0] == 0xfe && (o[1] & 0xc0) == 0x80
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Header {
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let mut bytes = BytesIn::new(data);
        let word0 = bytes.u32()?;
        let payload_len = bytes.u16()?;
        let next_header = bytes.u8()?;
        let hop_limit = bytes.u8()?;
        let src = Ipv6Addr::from(bytes.u128()?);
        let dst = Ipv6Addr::from(bytes.u128()?);
        let header = Self {
            traffic_class: ((word0 >> 20) & 0xff) as u8,
            flow_label: word0 & 0x000f_ffff,
            payload_len,
            next_header,
            hop_limit,
            src,
            dst,
        };
        Ok((header, bytes.remaining()))
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], WireError> {
        let word0 = (6u32 << 28) | ((self.traffic_class as u32) << 20) | (self.flow_label & 0x000f_ffff);
        let mut bytes = BytesOut::new(buf);
        bytes
            .u32(word0)?
            .u16(self.payload_len)?
            .u8(self.next_header)?
            .u8(self.hop_limit)?
            .push(&self.src.octets())?
            .push(&self.dst.octets())?;
        let len = bytes.len();
        Ok(&buf[..len])
    }
}

/// Per-destination path MTU cache, refreshed by Packet Too Big messages and
/// aged back up to the link MTU after `PMTU_AGE_MS` of inactivity.
pub struct PmtuCache {
    entries: LruCache<Ipv6Addr, (u16, u64)>,
}

impl PmtuCache {
    pub fn new() -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(PMTU_CACHE_SIZE).unwrap()),
        }
    }

    pub fn update(&mut self, dst: Ipv6Addr, mtu: u16, now_ms: u64) {
        let mtu = mtu.max(IPV6_MIN_MTU);
        self.entries.put(dst, (mtu, now_ms));
    }

    pub fn lookup(&mut self, dst: Ipv6Addr, link_mtu: u16, now_ms: u64) -> u16 {
        match self.entries.get(&dst) {
            Some((mtu, last)) if now_ms.saturating_sub(*last) < PMTU_AGE_MS => (*mtu).min(link_mtu),
            _ => link_mtu,
        }
    }
}

impl Default for PmtuCache {
    fn default() -> Self {
        Self::new()
    }
}

pub fn pmtu_update(stack: &mut Stack, dst: Ipv6Addr, mtu: u16, now_ms: u64) {
    stack.pmtu.update(dst, mtu, now_ms);
}

#[derive(Debug, Clone)]
struct Fragment {
    offset: u16,
    more: bool,
    data: Vec<u8>,
}

struct Reassembly {
    fragments: heapless::Vec<Fragment, REASSEMBLY_MAX_FRAGMENTS>,
    age_ms: u64,
}

/// `(ifindex, identification, src, dst, inner next-header)`: a fragment set
/// is only the same set if all five agree, so concurrent fragment trains
/// from different interfaces or different upper protocols can't collide.
pub type ReassemblyKey = (u8, u32, Ipv6Addr, Ipv6Addr, u8);

pub enum FragmentOutcome {
    Pending,
    Complete(Vec<u8>),
    /// Non-8-byte-aligned non-last fragment, or overlap with an existing
    /// fragment; the whole slot was dropped (RFC 5722).
    Invalid,
    /// Fragment 0 didn't carry the whole of the upper-layer header; the
    /// slot was dropped and the caller should reply Parameter Problem.
    MissingUpperHeader,
}

fn min_upper_header_len(next_header: u8) -> usize {
    match next_header {
        NEXT_HEADER_TCP => 20,
        NEXT_HEADER_UDP => 8,
        NEXT_HEADER_ICMPV6 => 4,
        _ => 0,
    }
}

fn ranges_overlap(a_off: u32, a_len: u32, b_off: u32, b_len: u32) -> bool {
    a_off < b_off.saturating_add(b_len) && b_off < a_off.saturating_add(a_len)
}

/// Bounded fragment reassembly table, keyed by [`ReassemblyKey`].
pub struct ReassemblyTable {
    entries: LruCache<ReassemblyKey, Reassembly>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(REASSEMBLY_TABLE_SIZE).unwrap()),
        }
    }

    fn insert_fragment(&mut self, key: ReassemblyKey, offset: u16, more: bool, data: &[u8]) -> FragmentOutcome {
        if more && data.len() % 8 != 0 {
            self.entries.pop(&key);
            return FragmentOutcome::Invalid;
        }
        if offset == 0 && data.len() < min_upper_header_len(key.4) {
            self.entries.pop(&key);
            return FragmentOutcome::MissingUpperHeader;
        }

        if !self.entries.contains(&key) {
            self.entries.put(
                key,
                Reassembly {
                    fragments: heapless::Vec::new(),
                    age_ms: 0,
                },
            );
        }
        let Some(reasm) = self.entries.get_mut(&key) else {
            return FragmentOutcome::Pending;
        };
        reasm.age_ms = 0;

        let new_off = offset as u32;
        let new_len = data.len() as u32;
        if reasm.fragments.iter().any(|f| ranges_overlap(f.offset as u32, f.data.len() as u32, new_off, new_len)) {
            self.entries.pop(&key);
            return FragmentOutcome::Invalid;
        }

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
            return FragmentOutcome::Invalid;
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
                return FragmentOutcome::Complete(out);
            }
        }
        FragmentOutcome::Pending
    }
}

impl Default for ReassemblyTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Age every pending fragment set by `dt_ms`; a set that outlives
/// `REASSEMBLY_TIMEOUT_MS` is dropped, and if it had received fragment 0,
/// the origin gets an ICMPv6 Time Exceeded (RFC 8200 §4.5).
pub fn age_reassembly(stack: &mut Stack, dt_ms: u64) {
    let keys: Vec<ReassemblyKey> = stack.reassembly.entries.iter().map(|(k, _)| *k).collect();
    let mut expired: Vec<(ReassemblyKey, bool)> = Vec::new();
    for key in keys {
        if let Some(r) = stack.reassembly.entries.peek_mut(&key) {
            r.age_ms += dt_ms;
            if r.age_ms > REASSEMBLY_TIMEOUT_MS {
                expired.push((key, r.fragments.iter().any(|f| f.offset == 0)));
            }
        }
    }
    for (key, had_first_fragment) in expired {
        stack.reassembly.entries.pop(&key);
        if had_first_fragment {
            let (ifindex, _ident, src, dst, _next_header) = key;
            crate::icmpv6::send_error(
                stack,
                ifindex,
                dst,
                src,
                crate::icmpv6::TYPE_TIME_EXCEEDED,
                crate::icmpv6::CODE_FRAGMENT_REASSEMBLY,
                0,
                &[],
            );
        }
    }
}

/// Entry point for a decoded IPv6 packet arriving on `ifindex`. Walks extension headers, reassembles fragments, and
/// dispatches the final upper-layer payload.
pub fn on_recv(stack: &mut Stack, ifindex: u8, src_mac: MacAddr, data: &[u8], now_ms: u64) {
    if data.len() < HEADER_LEN || (data[0] >> 4) != 6 {
        return;
    }
    let Ok((header, mut payload)) = Header::decode(data) else {
        return;
    };
    if header.hop_limit == 0 {
        return;
    }
    if payload.len() < header.payload_len as usize {
        return;
    }
    payload = &payload[..header.payload_len as usize];

    if is_link_local(header.src) {
        let dst_ok = is_link_local(header.dst)
            || header.dst.is_multicast()
            || stack.ifaces.get(ifindex).map(|i| i.v6.iter().any(|a| a.addr == header.dst)).unwrap_or(false);
        if !dst_ok {
            return;
        }
    }

    let mut next_header = header.next_header;
    let mut frag_info = None;
    loop {
        match next_header {
            NEXT_HEADER_HOP_BY_HOP | NEXT_HEADER_DEST_OPTS | NEXT_HEADER_ROUTING => {
                if payload.len() < 2 {
                    return;
                }
                let nh = payload[0];
                let ext_len = (payload[1] as usize + 1) * 8;
                if payload.len() < ext_len {
                    return;
                }
                next_header = nh;
                payload = &payload[ext_len..];
            }
            NEXT_HEADER_FRAGMENT => {
                if payload.len() < 8 {
                    return;
                }
                let nh = payload[0];
                let frag_off_res_m = u16::from_be_bytes([payload[2], payload[3]]);
                let offset = (frag_off_res_m >> 3) * 8;
                let more = frag_off_res_m & 1 != 0;
                let id = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                frag_info = Some((nh, offset, more, id));
                next_header = 0xff; // sentinel, handled below
                payload = &payload[8..];
                break;
            }
            _ => break,
        }
    }

    if let Some((nh, offset, more, id)) = frag_info {
        let key: ReassemblyKey = (ifindex, id, header.src, header.dst, nh);
        match stack.reassembly.insert_fragment(key, offset, more, payload) {
            FragmentOutcome::Complete(full) => {
                dispatch_upper(stack, ifindex, header.src, header.dst, src_mac, nh, &full, now_ms)
            }
            FragmentOutcome::MissingUpperHeader => {
                crate::icmpv6::send_error(
                    stack,
                    ifindex,
                    header.dst,
                    header.src,
                    crate::icmpv6::TYPE_PARAM_PROBLEM,
                    crate::icmpv6::CODE_MISSING_UPPER_HEADER,
                    0,
                    payload,
                );
            }
            FragmentOutcome::Pending | FragmentOutcome::Invalid => {}
        }
        return;
    }

    dispatch_upper(stack, ifindex, header.src, header.dst, src_mac, next_header, payload, now_ms);
}

fn dispatch_upper(
    stack: &mut Stack,
    ifindex: u8,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_mac: MacAddr,
    next_header: u8,
    payload: &[u8],
    now_ms: u64,
) {
    match next_header {
        NEXT_HEADER_ICMPV6 => crate::icmpv6::on_recv(stack, ifindex, src, dst, src_mac, payload, now_ms),
        NEXT_HEADER_UDP => crate::udp::on_recv_v6(stack, ifindex, src, dst, payload, now_ms),
        NEXT_HEADER_TCP => crate::tcp::on_recv_v6(stack, ifindex, src, dst, payload, now_ms),
        NEXT_HEADER_NO_NEXT => {}
        _ => {
            crate::icmpv6::send_error(
                stack,
                ifindex,
                dst,
                src,
                crate::icmpv6::TYPE_PARAM_PROBLEM,
                1,
                HEADER_LEN as u32,
                payload,
            );
        }
    }
}

/// Resolve the next hop and transmit an IPv6 packet with `payload` as the
/// upper-layer body. `src`/`dst` are already
/// selected by the caller.
/// Send `payload` as `next_header` from `src` to `dst`: if it fits the
/// current path MTU, send unfragmented; otherwise either drop (`dontfrag`)
/// or split into 8-byte-aligned fragments (RFC 8200 §4.5).
pub fn send_raw(
    stack: &mut Stack,
    ifindex: u8,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: u8,
    payload: &[u8],
    dontfrag: bool,
    now_ms: u64,
) {
    let link_mtu = stack
        .ifaces
        .get(ifindex)
        .and_then(|i| i.v6.iter().find(|a| a.addr == src))
        .map(|a| a.mtu)
        .unwrap_or(IPV6_DEFAULT_MTU);
    let mtu = stack.pmtu.lookup(dst, link_mtu, now_ms);

    if HEADER_LEN + payload.len() <= mtu as usize {
        send_unfragmented(stack, ifindex, src, dst, next_header, payload);
        return;
    }
    if dontfrag {
        return;
    }
    fragment_and_send(stack, ifindex, src, dst, next_header, payload, mtu);
}

fn send_unfragmented(stack: &mut Stack, ifindex: u8, src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, payload: &[u8]) {
    let header = Header {
        traffic_class: 0,
        flow_label: 0,
        payload_len: payload.len() as u16,
        next_header,
        hop_limit: 64,
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
        ethertype: EtherType::Ipv6,
    };
    let mut frame = alloc::vec![0u8; ethernet::HEADER_LEN + packet.len()];
    if eth.encode(&mut frame).is_err() {
        return;
    }
    frame[ethernet::HEADER_LEN..].copy_from_slice(&packet);
    stack.send_frame(ifindex, &frame);
}

/// Split `payload` into `mtu`-sized, 8-byte-aligned chunks, each wrapped in
/// its own Fragment extension header sharing one 32-bit identification.
fn fragment_and_send(
    stack: &mut Stack,
    ifindex: u8,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    next_header: u8,
    payload: &[u8],
    mtu: u16,
) {
    let max_chunk = (mtu as usize).saturating_sub(HEADER_LEN + FRAGMENT_HEADER_LEN) / 8 * 8;
    if max_chunk == 0 {
        return;
    }
    let id = next_fragment_id(stack);
    let mut offset = 0usize;
    while offset < payload.len() {
        let end = (offset + max_chunk).min(payload.len());
        let more = end < payload.len();
        let chunk = &payload[offset..end];

        let mut frag_payload = alloc::vec![0u8; FRAGMENT_HEADER_LEN + chunk.len()];
        frag_payload[0] = next_header;
        frag_payload[1] = 0;
        let off_flags = (((offset / 8) as u16) << 3) | (more as u16);
        frag_payload[2..4].copy_from_slice(&off_flags.to_be_bytes());
        frag_payload[4..8].copy_from_slice(&id.to_be_bytes());
        frag_payload[8..].copy_from_slice(chunk);

        send_unfragmented(stack, ifindex, src, dst, NEXT_HEADER_FRAGMENT, &frag_payload);
        offset = end;
    }
}

fn next_fragment_id(stack: &mut Stack) -> u32 {
    stack.ipv6_ident = stack.ipv6_ident.wrapping_add(1);
    stack.ipv6_ident
}

fn resolve_next_hop(stack: &mut Stack, ifindex: u8, dst: Ipv6Addr) -> Option<MacAddr> {
    use crate::arp::ResolveOutcome;
    use crate::iface::l3v6::V6Kind;

    if dst.is_multicast() {
        return Some(MacAddr::ipv6_multicast(dst));
    }
    // Off-link destinations get Neighbor-Solicited at the gateway, never the
    // unreachable dst itself.
    let next_hop = stack.ifaces.next_hop_v6(ifindex, dst);
    match stack.ndp.begin_resolve(ifindex, next_hop) {
        ResolveOutcome::Resolved(mac) => Some(mac),
        ResolveOutcome::SendRequest => {
            let our_mac = stack.ifaces.get(ifindex).map(|i| i.mac).unwrap_or(MacAddr::ZERO);
            let src = stack
                .ifaces
                .get(ifindex)
                .and_then(|i| i.v6.iter().find(|a| a.kind.contains(V6Kind::LINK_LOCAL)))
                .map(|a| a.addr)
                .unwrap_or(Ipv6Addr::UNSPECIFIED);
            let target_mcast = crate::iface::l3v6::solicited_node_multicast(next_hop);
            let ns = NeighborMessage::encode_ns(next_hop, Some(our_mac));
            crate::icmpv6::send_control(stack, ifindex, src, target_mcast, ndp::TYPE_NS, &ns);
            None
        }
        ResolveOutcome::Pending => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = Header {
            traffic_class: 0,
            flow_label: 0,
            payload_len: 8,
            next_header: NEXT_HEADER_UDP,
            hop_limit: 64,
            src: Ipv6Addr::LOCALHOST,
            dst: Ipv6Addr::LOCALHOST,
        };
        let mut buf = [0u8; HEADER_LEN];
        let encoded = h.encode(&mut buf).unwrap();
        let (decoded, _) = Header::decode(encoded).unwrap();
        assert_eq!(decoded.next_header, NEXT_HEADER_UDP);
        assert_eq!(decoded.src, Ipv6Addr::LOCALHOST);
    }

    #[test]
    fn fragments_reassemble_in_order() {
        let mut t = ReassemblyTable::new();
        let src = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        let key: ReassemblyKey = (1, 42, src, dst, NEXT_HEADER_UDP);
        assert!(matches!(
            t.insert_fragment(key, 0, true, &[1, 2, 3, 4, 5, 6, 7, 8]),
            FragmentOutcome::Pending
        ));
        match t.insert_fragment(key, 8, false, &[9, 10]) {
            FragmentOutcome::Complete(full) => assert_eq!(full, alloc::vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]),
            _ => panic!("expected reassembly to complete"),
        }
    }

    #[test]
    fn different_interfaces_do_not_collide_on_matching_id_and_addresses() {
        let mut t = ReassemblyTable::new();
        let src = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        let key_a: ReassemblyKey = (1, 7, src, dst, NEXT_HEADER_UDP);
        let key_b: ReassemblyKey = (2, 7, src, dst, NEXT_HEADER_UDP);
        assert!(matches!(t.insert_fragment(key_a, 0, true, &[1, 2, 3, 4, 5, 6, 7, 8]), FragmentOutcome::Pending));
        assert!(matches!(t.insert_fragment(key_b, 0, true, &[9, 9, 9, 9, 9, 9, 9, 9]), FragmentOutcome::Pending));
        match t.insert_fragment(key_a, 8, false, &[0xaa]) {
            FragmentOutcome::Complete(full) => assert_eq!(full, alloc::vec![1, 2, 3, 4, 5, 6, 7, 8, 0xaa]),
            _ => panic!("expected key_a's own fragment set to complete"),
        }
    }

    #[test]
    fn non_aligned_non_last_fragment_invalidates_slot() {
        let mut t = ReassemblyTable::new();
        let src = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        let key: ReassemblyKey = (1, 5, src, dst, NEXT_HEADER_UDP);
        assert!(matches!(t.insert_fragment(key, 0, true, &[1, 2, 3]), FragmentOutcome::Invalid));
    }

    #[test]
    fn overlapping_fragment_invalidates_whole_slot() {
        let mut t = ReassemblyTable::new();
        let src = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        let key: ReassemblyKey = (1, 6, src, dst, NEXT_HEADER_UDP);
        assert!(matches!(t.insert_fragment(key, 0, true, &[1, 2, 3, 4, 5, 6, 7, 8]), FragmentOutcome::Pending));
        assert!(matches!(t.insert_fragment(key, 4, false, &[0, 0, 0, 0, 9]), FragmentOutcome::Invalid));
    }

    #[test]
    fn fragment_zero_too_short_for_upper_header_is_rejected() {
        let mut t = ReassemblyTable::new();
        let src = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2);
        let key: ReassemblyKey = (1, 9, src, dst, NEXT_HEADER_TCP);
        assert!(matches!(t.insert_fragment(key, 0, true, &[1, 2, 3, 4]), FragmentOutcome::MissingUpperHeader));
    }
}
