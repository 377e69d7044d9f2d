//! Address Resolution Protocol: per-L2 table, resolve/probe state machine,
//! gratuitous replies. Grounded on `net::arp::Cache`, generalized from a
//! MAC-only map into the full UNUSED/INCOMPLETE/REACHABLE/STALE/DELAY/PROBE
//! state machine, and bounded with the `lru` crate rather than an
//! unbounded `BTreeMap`.

use core::net::Ipv4Addr;
use core::num::NonZeroUsize;

use lru::LruCache;

use crate::config::{ARP_MAX_PROBES, ARP_RETRANS_MS, MAX_ARP_ENTRIES, NEIGHBOR_STALE_MS};
use crate::ethernet::{self, EtherType, MacAddr};
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

pub const HTYPE_ETHERNET: u16 = 1;
pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    pub op: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut bytes = BytesIn::new(data);
        let _htype = bytes.u16()?;
        let ptype = bytes.u16()?;
        let _hlen = bytes.u8()?;
        let _plen = bytes.u8()?;
        let op = bytes.u16()?;
        let sender_mac = MacAddr(bytes.arr()?);
        let sender_ip = Ipv4Addr::from(bytes.u32()?);
        let target_mac = MacAddr(bytes.arr()?);
        let target_ip = Ipv4Addr::from(bytes.u32()?);
        if ptype != EtherType::Ipv4 as u16 {
            return Err(WireError::Underflow);
        }
        Ok(Self {
            op,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    pub fn encode(&self) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; 28];
        let mut bytes = BytesOut::new(&mut buf);
        let _ = bytes
            .u16(HTYPE_ETHERNET)
            .and_then(|b| b.u16(EtherType::Ipv4 as u16))
            .and_then(|b| b.u8(6))
            .and_then(|b| b.u8(4))
            .and_then(|b| b.u16(self.op))
            .and_then(|b| b.push(&self.sender_mac.0))
            .and_then(|b| b.push(&self.sender_ip.octets()))
            .and_then(|b| b.push(&self.target_mac.0))
            .and_then(|b| b.push(&self.target_ip.octets()));
        buf
    }
}

/// Process an incoming ARP frame: learn the
/// sender unconditionally, and answer requests for addresses we own.
pub fn on_recv(stack: &mut Stack, ifindex: u8, pkt: &ArpPacket) {
    if !pkt.sender_ip.is_unspecified() {
        stack.arp.learn(ifindex, pkt.sender_ip, pkt.sender_mac, NEIGHBOR_STALE_MS);
    }
    if pkt.op == OP_REPLY {
        stack.arp.on_reply(ifindex, pkt.sender_ip, pkt.sender_mac);
        return;
    }
    if pkt.op != OP_REQUEST {
        return;
    }
    let we_own_target = stack
        .ifaces
        .get(ifindex)
        .map(|i| i.v4.iter().any(|a| a.ip == pkt.target_ip && a.mode != crate::iface::l3v4::V4Mode::Disabled))
        .unwrap_or(false);
    if !we_own_target {
        return;
    }
    let our_mac = stack.ifaces.get(ifindex).map(|i| i.mac).unwrap_or(MacAddr::ZERO);
    let reply = ArpPacket {
        op: OP_REPLY,
        sender_mac: our_mac,
        sender_ip: pkt.target_ip,
        target_mac: pkt.sender_mac,
        target_ip: pkt.sender_ip,
    };
    send_frame(stack, ifindex, pkt.sender_mac, &reply);
}

/// Broadcast an ARP request for `ip` on `ifindex`.
pub fn send_request(stack: &mut Stack, ifindex: u8, ip: Ipv4Addr) {
    let Some(iface) = stack.ifaces.get(ifindex) else {
        return;
    };
    let our_mac = iface.mac;
    let Some(our_ip) = iface.v4.first().map(|a| a.ip) else {
        return;
    };
    let request = ArpPacket {
        op: OP_REQUEST,
        sender_mac: our_mac,
        sender_ip: our_ip,
        target_mac: MacAddr::ZERO,
        target_ip: ip,
    };
    send_frame(stack, ifindex, MacAddr::BROADCAST, &request);
}

fn send_frame(stack: &Stack, ifindex: u8, dest_mac: MacAddr, pkt: &ArpPacket) {
    let body = pkt.encode();
    let src_mac = stack.ifaces.get(ifindex).map(|i| i.mac).unwrap_or(MacAddr::ZERO);
    let eth = ethernet::Header {
        dest_mac,
        src_mac,
        ethertype: EtherType::Arp,
    };
    let mut frame = alloc::vec![0u8; ethernet::HEADER_LEN + body.len()];
    if eth.encode(&mut frame).is_err() {
        return;
    }
    frame[ethernet::HEADER_LEN..].copy_from_slice(&body);
    stack.send_frame(ifindex, &frame);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Unused,
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
}

#[derive(Debug, Clone)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub ttl_ms: u64,
    pub retransmit_timer_ms: u64,
    pub state: NeighborState,
    pub probes_sent: u8,
}

/// Per-L2 ARP table, keyed by `(ifindex, ip)`.
pub struct ArpTables {
    entries: LruCache<(u8, Ipv4Addr), ArpEntry>,
}

impl ArpTables {
    pub fn new() -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(MAX_ARP_ENTRIES).unwrap()),
        }
    }

    pub fn get(&mut self, ifindex: u8, ip: Ipv4Addr) -> Option<&ArpEntry> {
        self.entries.get(&(ifindex, ip))
    }

    pub fn peek(&self, ifindex: u8, ip: Ipv4Addr) -> Option<&ArpEntry> {
        self.entries.peek(&(ifindex, ip))
    }

    /// Look up a resolved MAC without touching recency (used on the fast
    /// path of output; `resolve` drives the state machine separately).
    pub fn resolved_mac(&self, ifindex: u8, ip: Ipv4Addr) -> Option<MacAddr> {
        match self.entries.peek(&(ifindex, ip)) {
            Some(e) if matches!(e.state, NeighborState::Reachable | NeighborState::Stale) => {
                Some(e.mac)
            }
            _ => None,
        }
    }

    /// Learn (or refresh) a mapping from ingress traffic.
    pub fn learn(&mut self, ifindex: u8, ip: Ipv4Addr, mac: MacAddr, ttl_ms: u64) {
        let entry = ArpEntry {
            ip,
            mac,
            ttl_ms,
            retransmit_timer_ms: 0,
            state: NeighborState::Reachable,
            probes_sent: 0,
        };
        self.entries.put((ifindex, ip), entry);
    }

    /// Begin resolving `ip` on `ifindex`: if already REACHABLE/STALE return
    /// the MAC immediately; otherwise allocate an INCOMPLETE entry and
    /// report that a request must be sent by the caller").
    pub fn begin_resolve(&mut self, ifindex: u8, ip: Ipv4Addr) -> ResolveOutcome {
        if let Some(mac) = self.resolved_mac(ifindex, ip) {
            return ResolveOutcome::Resolved(mac);
        }
        if self.entries.peek(&(ifindex, ip)).is_none() {
            self.entries.put(
                (ifindex, ip),
                ArpEntry {
                    ip,
                    mac: MacAddr::ZERO,
                    ttl_ms: 0,
                    retransmit_timer_ms: 0,
                    state: NeighborState::Incomplete,
                    probes_sent: 0,
                },
            );
            ResolveOutcome::SendRequest
        } else {
            ResolveOutcome::Pending
        }
    }

    /// Process an ARP reply (or gratuitous ARP) updating the entry for
    /// `ip` on `ifindex`.
    pub fn on_reply(&mut self, ifindex: u8, ip: Ipv4Addr, mac: MacAddr) {
        self.learn(ifindex, ip, mac, NEIGHBOR_STALE_MS);
    }

    /// Age every entry by `dt_ms`, driving INCOMPLETE -> PROBE -> UNUSED
    /// (eviction) and REACHABLE -> STALE.
    pub fn age(&mut self, dt_ms: u64) {
        let keys: alloc::vec::Vec<(u8, Ipv4Addr)> = self
            .entries
            .iter()
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            let Some(entry) = self.entries.peek_mut(&key) else {
                continue;
            };
            entry.ttl_ms = entry.ttl_ms.saturating_sub(dt_ms);
            match entry.state {
                NeighborState::Reachable if entry.ttl_ms == 0 => {
                    entry.state = NeighborState::Stale;
                }
                NeighborState::Incomplete | NeighborState::Probe => {
                    entry.retransmit_timer_ms = entry.retransmit_timer_ms.saturating_sub(dt_ms);
                    if entry.retransmit_timer_ms == 0 {
                        entry.probes_sent += 1;
                        entry.retransmit_timer_ms = ARP_RETRANS_MS;
                        entry.state = NeighborState::Probe;
                        if entry.probes_sent > ARP_MAX_PROBES {
                            self.entries.pop(&key);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl Default for ArpTables {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ResolveOutcome {
    Resolved(MacAddr),
    SendRequest,
    Pending,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learn_then_resolve_hits_cache() {
        let mut t = ArpTables::new();
        let ip = Ipv4Addr::new(192, 168, 1, 20);
        let mac = MacAddr([1, 2, 3, 4, 5, 6]);
        t.learn(1, ip, mac, 180_000);
        assert_eq!(t.resolved_mac(1, ip), Some(mac));
    }

    #[test]
    fn unresolved_entry_ages_out_after_max_probes() {
        let mut t = ArpTables::new();
        let ip = Ipv4Addr::new(192, 168, 1, 30);
        assert!(matches!(
            t.begin_resolve(1, ip),
            ResolveOutcome::SendRequest
        ));
        for _ in 0..(ARP_MAX_PROBES as u32 + 2) {
            t.age(ARP_RETRANS_MS);
        }
        assert!(t.peek(1, ip).is_none());
    }
}
