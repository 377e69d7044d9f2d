//! ICMPv4: echo request/reply tracking and error dispatch.
//! Mirrors `icmpv6.rs`'s shape; ARP (not ICMP) owns neighbor resolution on
//! this address family, so this module is purely the control-message side.

use alloc::collections::BTreeMap;
use core::net::Ipv4Addr;

use crate::checksum;
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const TYPE_ECHO_REQUEST: u8 = 8;
pub const TYPE_TIME_EXCEEDED: u8 = 11;

pub const CODE_NET_UNREACHABLE: u8 = 0;
pub const CODE_HOST_UNREACHABLE: u8 = 1;
pub const CODE_PORT_UNREACHABLE: u8 = 3;
pub const CODE_FRAG_NEEDED: u8 = 4;

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
}

#[derive(Debug, Clone, Copy)]
struct PendingEcho {
    deadline_ms: u64,
}

pub struct IcmpV4State {
    pending: BTreeMap<(u16, u16), PendingEcho>,
    pmtu: BTreeMap<Ipv4Addr, u16>,
}

impl IcmpV4State {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            pmtu: BTreeMap::new(),
        }
    }

    pub fn pmtu_update(&mut self, dst: Ipv4Addr, mtu: u16) {
        self.pmtu.insert(dst, mtu);
    }

    pub fn pmtu_lookup(&self, dst: Ipv4Addr, link_mtu: u16) -> u16 {
        self.pmtu.get(&dst).copied().unwrap_or(link_mtu).min(link_mtu)
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

impl Default for IcmpV4State {
    fn default() -> Self {
        Self::new()
    }
}

pub fn on_recv(stack: &mut Stack, ifindex: u8, src: Ipv4Addr, dst: Ipv4Addr, body: &[u8]) {
    let mut bytes = BytesIn::new(body);
    let Ok(header) = Header::decode(&mut bytes) else {
        return;
    };
    let payload = bytes.remaining();

    match header.icmp_type {
        TYPE_ECHO_REQUEST => {
            send_control(stack, ifindex, dst, src, TYPE_ECHO_REPLY, 0, payload);
        }
        TYPE_ECHO_REPLY => {
            if payload.len() >= 4 {
                let id = u16::from_be_bytes([payload[0], payload[1]]);
                let seq = u16::from_be_bytes([payload[2], payload[3]]);
                stack.icmpv4.complete_echo(id, seq);
            }
        }
        TYPE_DEST_UNREACHABLE if header.code == CODE_FRAG_NEEDED => {
            if payload.len() >= 8 {
                let mtu = u16::from_be_bytes([payload[6], payload[7]]);
                if payload.len() >= 8 + 20 {
                    let orig_dst = Ipv4Addr::new(payload[8 + 16], payload[8 + 17], payload[8 + 18], payload[8 + 19]);
                    crate::ipv4::pmtu_hint(stack, orig_dst, mtu);
                }
            }
        }
        _ => {
            debug!("icmpv4: type={} code={} from={}", header.icmp_type, header.code, src);
        }
    }
}

fn send_control(stack: &mut Stack, ifindex: u8, src: Ipv4Addr, dst: Ipv4Addr, icmp_type: u8, code: u8, body: &[u8]) {
    let mut packet = alloc::vec![0u8; 4 + body.len()];
    {
        let mut bytes = BytesOut::new(&mut packet);
        let _ = bytes.u8(icmp_type).and_then(|b| b.u8(code)).and_then(|b| b.u16(0));
    }
    packet[4..].copy_from_slice(body);
    let sum = checksum::finish(checksum::accumulate(&packet, None));
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    crate::ipv4::send_raw(stack, ifindex, src, dst, crate::ipv4::PROTO_ICMP, &packet);
}

pub fn send_echo_request(
    stack: &mut Stack,
    ifindex: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
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
    stack.icmpv4.track_echo(id, seq, now_ms + timeout_ms);
    send_control(stack, ifindex, src, dst, TYPE_ECHO_REQUEST, 0, &body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_echo_tracked_and_completed() {
        let mut s = IcmpV4State::new();
        s.track_echo(7, 1, 5_000);
        assert!(s.complete_echo(7, 1));
        assert!(!s.complete_echo(7, 1));
    }
}
