//! ICMPv6: common header, echo request/reply tracking, error dispatch, and
//! the NDP send path every other module reaches through.
//! Grounded on `net::icmp`'s bare structure, extended with a pending-echo
//! table this crate's echo-request tracking additionally needs.

use alloc::collections::BTreeMap;
use core::net::Ipv6Addr;

use crate::checksum;
use crate::ethernet::MacAddr;
use crate::ndp::{self, NeighborMessage, RouterAdvert};
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

pub const TYPE_DEST_UNREACHABLE: u8 = 1;
pub const TYPE_PACKET_TOO_BIG: u8 = 2;
pub const TYPE_TIME_EXCEEDED: u8 = 3;
pub const TYPE_PARAM_PROBLEM: u8 = 4;
pub const TYPE_ECHO_REQUEST: u8 = 128;
pub const TYPE_ECHO_REPLY: u8 = 129;

pub const CODE_NO_ROUTE: u8 = 0;
pub const CODE_ADMIN_PROHIBITED: u8 = 1;
pub const CODE_ADDR_UNREACHABLE: u8 = 3;
pub const CODE_PORT_UNREACHABLE: u8 = 4;

/// Time Exceeded code 1: fragment reassembly timer expired (RFC 4443 §3.3).
pub const CODE_FRAGMENT_REASSEMBLY: u8 = 1;
/// Parameter Problem code 3: first fragment didn't contain the whole of the
/// upper-layer header (RFC 8200 §4.5).
pub const CODE_MISSING_UPPER_HEADER: u8 = 3;

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
}

impl Header {
    pub fn decode(bytes: &mut BytesIn) -> Result<Self, WireError> {
        Ok(Self {
            icmp_type: bytes.u8()?,
            code: bytes.u8()?,
            checksum: bytes.u16()?,
        })
    }

    pub fn encode(&self, bytes: &mut BytesOut) -> Result<(), WireError> {
        bytes.u8(self.icmp_type)?.u8(self.code)?.u16(self.checksum)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingEcho {
    deadline_ms: u64,
}

/// ICMPv6 runtime state: in-flight echo requests keyed by (identifier,
/// sequence) so a timeout can be reported if no reply lands.
pub struct IcmpV6State {
    pending: BTreeMap<(u16, u16), PendingEcho>,
}

impl IcmpV6State {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    pub fn track_echo(&mut self, id: u16, seq: u16, deadline_ms: u64) {
        self.pending.insert((id, seq), PendingEcho { deadline_ms });
    }

    pub fn complete_echo(&mut self, id: u16, seq: u16) -> bool {
        self.pending.remove(&(id, seq)).is_some()
    }

    pub fn expire(&mut self, now_ms: u64) -> alloc::vec::Vec<(u16, u16)> {
        let expired: alloc::vec::Vec<(u16, u16)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline_ms <= now_ms)
            .map(|(k, _)| *k)
            .collect();
        for k in &expired {
            self.pending.remove(k);
        }
        expired
    }
}

impl Default for IcmpV6State {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch a decoded ICMPv6 message arriving on `ifindex` from `src` to
/// `dst`. Neighbor Discovery types are handed to `ndp`;
/// Echo Request gets an automatic reply; everything else is logged.
pub fn on_recv(
    stack: &mut Stack,
    ifindex: u8,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_mac: MacAddr,
    body: &[u8],
    now_ms: u64,
) {
    let mut bytes = BytesIn::new(body);
    let Ok(header) = Header::decode(&mut bytes) else {
        return;
    };
    let payload = bytes.remaining();

    match header.icmp_type {
        ndp::TYPE_NS => {
            if let Ok(msg) = NeighborMessage::decode(payload) {
                if let Some(na) = ndp::on_ns(stack, ifindex, src, src_mac, &msg) {
                    let reply_dst = if src.is_unspecified() {
                        Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1)
                    } else {
                        src
                    };
                    send_control(stack, ifindex, msg.target, reply_dst, ndp::TYPE_NA, &na);
                }
            }
        }
        ndp::TYPE_NA => {
            if let Ok(msg) = NeighborMessage::decode(payload) {
                ndp::on_na(stack, ifindex, &msg);
            }
        }
        ndp::TYPE_RA => {
            if let Ok(ra) = RouterAdvert::decode(payload) {
                ndp::ndp_on_ra(stack, ifindex, src, &ra, now_ms);
            }
        }
        ndp::TYPE_RS => {
            // Only relevant to a router implementation; this stack is a host.
        }
        TYPE_ECHO_REQUEST => {
            let reply = build_echo_reply(payload);
            send_control(stack, ifindex, dst, src, TYPE_ECHO_REPLY, &reply);
        }
        TYPE_ECHO_REPLY => {
            if payload.len() >= 4 {
                let id = u16::from_be_bytes([payload[0], payload[1]]);
                let seq = u16::from_be_bytes([payload[2], payload[3]]);
                stack.icmpv6.complete_echo(id, seq);
            }
        }
        TYPE_PACKET_TOO_BIG => {
            // payload: 4-byte MTU field, then the original packet that
            // triggered it (original dst is the address the PMTU applies to).
            if payload.len() >= 4 + 40 {
                let mtu = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                let mut dst_octets = [0u8; 16];
                dst_octets.copy_from_slice(&payload[4 + 24..4 + 40]);
                crate::ipv6::pmtu_update(stack, Ipv6Addr::from(dst_octets), mtu as u16, now_ms);
            }
        }
        TYPE_DEST_UNREACHABLE | TYPE_TIME_EXCEEDED | TYPE_PARAM_PROBLEM => {
            debug!("icmpv6: error type={} code={} from={}", header.icmp_type, header.code, src);
        }
        crate::mld::TYPE_QUERY | crate::mld::TYPE_REPORT | crate::mld::TYPE_DONE | crate::mld::TYPE_V2_REPORT => {
            if let Ok(msg) = crate::mld::Message::decode(header.icmp_type, payload) {
                crate::mld::on_recv(stack, ifindex, &msg, now_ms);
            }
        }
        _ => {}
    }
}

fn build_echo_reply(request: &[u8]) -> alloc::vec::Vec<u8> {
    request.to_vec()
}

/// Build and transmit an ICMPv6 control message: a NS/NA/RS/RA/Echo Reply
/// body with its own 4-byte header and a full IPv6 packet wrapped around it.
pub fn send_control(stack: &mut Stack, ifindex: u8, src: Ipv6Addr, dst: Ipv6Addr, icmp_type: u8, body: &[u8]) {
    let mut packet = alloc::vec![0u8; 4 + body.len()];
    {
        let mut bytes = BytesOut::new(&mut packet);
        let _ = bytes.u8(icmp_type).and_then(|b| b.u8(0)).and_then(|b| b.u16(0));
    }
    packet[4..].copy_from_slice(body);

    let upper_len = packet.len() as u32;
    let pseudo = checksum::pseudo_header_v6(src, dst, crate::ipv6::NEXT_HEADER_ICMPV6, upper_len);
    let sum = checksum::combine(&[pseudo, checksum::accumulate(&packet, None)]);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());

    // NDP/echo control bodies are always well under the IPv6 minimum MTU;
    // RFC 4861 also requires Neighbor Discovery packets never be fragmented.
    crate::ipv6::send_raw(stack, ifindex, src, dst, crate::ipv6::NEXT_HEADER_ICMPV6, &packet, true, 0);
}

/// Send an Echo Request and register it with the pending-echo table
///.
pub fn send_echo_request(
    stack: &mut Stack,
    ifindex: u8,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    id: u16,
    seq: u16,
    payload: &[u8],
    timeout_ms: u64,
    now_ms: u64,
) {
    let mut body = alloc::vec![0u8; 4 + payload.len()];
    body[0..2].copy_from_slice(&id.to_be_bytes());
    body[2..4].copy_from_slice(&seq.to_be_bytes());
    body[4..].copy_from_slice(payload);
    stack.icmpv6.track_echo(id, seq, now_ms + timeout_ms);
    send_control(stack, ifindex, src, dst, TYPE_ECHO_REQUEST, &body);
}

/// Send a Destination Unreachable / Time Exceeded / Packet Too Big error in
/// response to an undeliverable packet. `mtu` is
/// only meaningful for Packet Too Big.
pub fn send_error(
    stack: &mut Stack,
    ifindex: u8,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    icmp_type: u8,
    code: u8,
    mtu_or_unused: u32,
    original: &[u8],
) {
    let max_original = 1232usize.saturating_sub(8);
    let original = &original[..original.len().min(max_original)];
    let mut body = alloc::vec![0u8; 4 + original.len()];
    body[0..4].copy_from_slice(&mtu_or_unused.to_be_bytes());
    body[4..].copy_from_slice(original);

    let mut packet = alloc::vec![0u8; 4 + body.len()];
    {
        let mut bytes = BytesOut::new(&mut packet);
        let _ = bytes
            .u8(icmp_type)
            .and_then(|b| b.u8(code))
            .and_then(|b| b.u16(0));
    }
    packet[4..].copy_from_slice(&body);
    let upper_len = packet.len() as u32;
    let pseudo = checksum::pseudo_header_v6(src, dst, crate::ipv6::NEXT_HEADER_ICMPV6, upper_len);
    let sum = checksum::combine(&[pseudo, checksum::accumulate(&packet, None)]);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    // ICMPv6 error bodies are truncated to fit the IPv6 minimum MTU, so they
    // never need fragmentation; RFC 4443 also discourages fragmenting errors.
    crate::ipv6::send_raw(stack, ifindex, src, dst, crate::ipv6::NEXT_HEADER_ICMPV6, &packet, true, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_echo_tracked_and_completed() {
        let mut s = IcmpV6State::new();
        s.track_echo(1, 1, 5_000);
        assert!(s.complete_echo(1, 1));
        assert!(!s.complete_echo(1, 1));
    }

    #[test]
    fn pending_echo_expires() {
        let mut s = IcmpV6State::new();
        s.track_echo(2, 1, 1_000);
        assert!(s.expire(500).is_empty());
        assert_eq!(s.expire(1_000), alloc::vec![(2, 1)]);
    }
}
