//! Neighbor Discovery Protocol: per-L2 neighbor cache, NS/NA/RS/RA
//! processing, DAD, SLAAC prefix bookkeeping. Shaped like
//! `arp.rs` (same state machine, same `lru`-bounded cache) but carries the
//! IPv6-specific control-plane logic ARP has no equivalent of.

use alloc::vec::Vec;
use core::net::Ipv6Addr;
use core::num::NonZeroUsize;

use lru::LruCache;

use crate::config::{
    DAD_PROBE_INTERVAL_MS, MAX_NDP_ENTRIES, NDP_MAX_PROBES, NDP_RETRANS_MS, NEIGHBOR_STALE_MS,
    RS_INTERVAL_MS,
};
use crate::ethernet::MacAddr;
use crate::iface::l3v6::{solicited_node_multicast, DadState, V6Kind};
use crate::types::L3Id;
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

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
pub struct NdpEntry {
    pub ip: Ipv6Addr,
    pub mac: MacAddr,
    pub ttl_ms: u64,
    pub retransmit_timer_ms: u64,
    pub state: NeighborState,
    pub probes_sent: u8,
    pub is_router: bool,
    pub router_lifetime_ms: u64,
}

pub struct NdpTables {
    entries: LruCache<(u8, Ipv6Addr), NdpEntry>,
}

impl NdpTables {
    pub fn new() -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(MAX_NDP_ENTRIES).unwrap()),
        }
    }

    pub fn peek(&self, ifindex: u8, ip: Ipv6Addr) -> Option<&NdpEntry> {
        self.entries.peek(&(ifindex, ip))
    }

    pub fn resolved_mac(&self, ifindex: u8, ip: Ipv6Addr) -> Option<MacAddr> {
        match self.entries.peek(&(ifindex, ip)) {
            Some(e) if matches!(e.state, NeighborState::Reachable | NeighborState::Stale) => {
                Some(e.mac)
            }
            _ => None,
        }
    }

    pub fn begin_resolve(&mut self, ifindex: u8, ip: Ipv6Addr) -> super::arp::ResolveOutcome {
        use super::arp::ResolveOutcome;
        if let Some(mac) = self.resolved_mac(ifindex, ip) {
            return ResolveOutcome::Resolved(mac);
        }
        if self.entries.peek(&(ifindex, ip)).is_none() {
            self.entries.put(
                (ifindex, ip),
                NdpEntry {
                    ip,
                    mac: MacAddr::ZERO,
                    ttl_ms: 0,
                    retransmit_timer_ms: 0,
                    state: NeighborState::Incomplete,
                    probes_sent: 0,
                    is_router: false,
                    router_lifetime_ms: 0,
                },
            );
            ResolveOutcome::SendRequest
        } else {
            ResolveOutcome::Pending
        }
    }

    pub fn learn(&mut self, ifindex: u8, ip: Ipv6Addr, mac: MacAddr, ttl_ms: u64) {
        let is_router = self
            .entries
            .peek(&(ifindex, ip))
            .map(|e| e.is_router)
            .unwrap_or(false);
        let router_lifetime_ms = self
            .entries
            .peek(&(ifindex, ip))
            .map(|e| e.router_lifetime_ms)
            .unwrap_or(0);
        self.entries.put(
            (ifindex, ip),
            NdpEntry {
                ip,
                mac,
                ttl_ms,
                retransmit_timer_ms: 0,
                state: NeighborState::Reachable,
                probes_sent: 0,
                is_router,
                router_lifetime_ms,
            },
        );
    }

    /// NA processing update rule: override or prior
    /// INCOMPLETE replaces the MAC; solicited -> REACHABLE, unsolicited ->
    /// STALE; router flag promotes to router status.
    pub fn on_na(
        &mut self,
        ifindex: u8,
        ip: Ipv6Addr,
        mac: MacAddr,
        override_flag: bool,
        solicited: bool,
        router_flag: bool,
        router_lifetime_ms: u64,
    ) {
        let key = (ifindex, ip);
        let was_incomplete = self
            .entries
            .peek(&key)
            .map(|e| e.state == NeighborState::Incomplete)
            .unwrap_or(true);
        let mac = if override_flag || was_incomplete {
            mac
        } else {
            self.entries.peek(&key).map(|e| e.mac).unwrap_or(mac)
        };
        let state = if solicited {
            NeighborState::Reachable
        } else {
            NeighborState::Stale
        };
        self.entries.put(
            key,
            NdpEntry {
                ip,
                mac,
                ttl_ms: NEIGHBOR_STALE_MS,
                retransmit_timer_ms: 0,
                state,
                probes_sent: 0,
                is_router: router_flag,
                router_lifetime_ms,
            },
        );
    }

    pub fn age(&mut self, dt_ms: u64) {
        let keys: Vec<(u8, Ipv6Addr)> = self.entries.iter().map(|(k, _)| *k).collect();
        for key in keys {
            let Some(entry) = self.entries.peek_mut(&key) else {
                continue;
            };
            entry.ttl_ms = entry.ttl_ms.saturating_sub(dt_ms);
            if entry.is_router {
                entry.router_lifetime_ms = entry.router_lifetime_ms.saturating_sub(dt_ms);
            }
            match entry.state {
                NeighborState::Reachable if entry.ttl_ms == 0 => {
                    entry.state = NeighborState::Stale;
                }
                NeighborState::Incomplete | NeighborState::Probe => {
                    entry.retransmit_timer_ms = entry.retransmit_timer_ms.saturating_sub(dt_ms);
                    if entry.retransmit_timer_ms == 0 {
                        entry.probes_sent += 1;
                        entry.retransmit_timer_ms = NDP_RETRANS_MS;
                        entry.state = NeighborState::Probe;
                        if entry.probes_sent > NDP_MAX_PROBES {
                            self.entries.pop(&key);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl Default for NdpTables {
    fn default() -> Self {
        Self::new()
    }
}

// ---- wire messages ---------------------------------------------------------

pub const TYPE_RS: u8 = 133;
pub const TYPE_RA: u8 = 134;
pub const TYPE_NS: u8 = 135;
pub const TYPE_NA: u8 = 136;
pub const TYPE_REDIRECT: u8 = 137;

const OPT_SRC_LL: u8 = 1;
const OPT_TARGET_LL: u8 = 2;
const OPT_PREFIX_INFO: u8 = 3;
const OPT_MTU: u8 = 5;
const OPT_RDNSS: u8 = 25;

pub const NA_FLAG_ROUTER: u32 = 1 << 31;
pub const NA_FLAG_SOLICITED: u32 = 1 << 30;
pub const NA_FLAG_OVERRIDE: u32 = 1 << 29;

/// A decoded Neighbor Solicitation / Advertisement body (type-specific data
/// after the common ICMPv6 4-byte header).
#[derive(Debug, Clone)]
pub struct NeighborMessage {
    pub flags: u32,
    pub target: Ipv6Addr,
    pub link_layer: Option<MacAddr>,
}

impl NeighborMessage {
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut bytes = BytesIn::new(body);
        let flags = bytes.u32()?;
        let target = Ipv6Addr::from(bytes.u128()?);
        let mut link_layer = None;
        while bytes.remaining_len() >= 8 {
            let opt_type = bytes.u8()?;
            let opt_len = bytes.u8()? as usize;
            if opt_len == 0 {
                break;
            }
            let payload_len = opt_len * 8 - 2;
            let payload = bytes.slice(payload_len)?;
            if matches!(opt_type, OPT_SRC_LL | OPT_TARGET_LL) && payload.len() >= 6 {
                link_layer = Some(MacAddr([
                    payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
                ]));
            }
        }
        Ok(Self {
            flags,
            target,
            link_layer,
        })
    }

    pub fn encode_ns(target: Ipv6Addr, src_ll: Option<MacAddr>) -> alloc::vec::Vec<u8> {
        Self::encode(0, target, src_ll, OPT_SRC_LL)
    }

    pub fn encode_na(
        target: Ipv6Addr,
        target_ll: Option<MacAddr>,
        router: bool,
        solicited: bool,
        override_flag: bool,
    ) -> alloc::vec::Vec<u8> {
        let mut flags = 0u32;
        if router {
            flags |= NA_FLAG_ROUTER;
        }
        if solicited {
            flags |= NA_FLAG_SOLICITED;
        }
        if override_flag {
            flags |= NA_FLAG_OVERRIDE;
        }
        Self::encode(flags, target, target_ll, OPT_TARGET_LL)
    }

    fn encode(flags: u32, target: Ipv6Addr, ll: Option<MacAddr>, opt_type: u8) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; 24];
        {
            let mut bytes = BytesOut::new(&mut buf);
            let _ = bytes.u32(flags).and_then(|b| b.u128(u128::from(target)));
        }
        if let Some(mac) = ll {
            buf.push(opt_type);
            buf.push(1); // length in units of 8 bytes
            buf.extend_from_slice(&mac.0);
        }
        buf
    }
}

/// Router Solicitation body: 4 reserved bytes plus an optional Source
/// Link-Layer Address option.
pub struct RouterSolicit;

impl RouterSolicit {
    pub fn encode(src_ll: Option<MacAddr>) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; 4];
        if let Some(mac) = src_ll {
            buf.push(OPT_SRC_LL);
            buf.push(1);
            buf.extend_from_slice(&mac.0);
        }
        buf
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrefixInfo {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
    pub on_link: bool,
    pub autonomous: bool,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RouterAdvert {
    pub cur_hop_limit: u8,
    pub managed: bool,
    pub other_config: bool,
    pub router_lifetime_secs: u16,
    pub reachable_ms: u32,
    pub retrans_ms: u32,
    pub mtu: Option<u32>,
    pub prefixes: heapless::Vec<PrefixInfo, 4>,
    pub rdnss: heapless::Vec<Ipv6Addr, 2>,
}

impl RouterAdvert {
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut bytes = BytesIn::new(body);
        let cur_hop_limit = bytes.u8()?;
        let flags = bytes.u8()?;
        let router_lifetime_secs = bytes.u16()?;
        let reachable_ms = bytes.u32()?;
        let retrans_ms = bytes.u32()?;
        let mut ra = RouterAdvert {
            cur_hop_limit,
            managed: flags & 0x80 != 0,
            other_config: flags & 0x40 != 0,
            router_lifetime_secs,
            reachable_ms,
            retrans_ms,
            mtu: None,
            prefixes: heapless::Vec::new(),
            rdnss: heapless::Vec::new(),
        };
        while bytes.remaining_len() >= 8 {
            let opt_type = bytes.u8()?;
            let opt_len = bytes.u8()? as usize;
            if opt_len == 0 {
                break;
            }
            let payload_len = opt_len * 8 - 2;
            let payload = bytes.slice(payload_len)?;
            match opt_type {
                OPT_PREFIX_INFO if payload.len() >= 30 => {
                    let prefix_len = payload[0];
                    let pflags = payload[1];
                    let valid_lifetime = u32::from_be_bytes(payload[2..6].try_into().unwrap());
                    let preferred_lifetime = u32::from_be_bytes(payload[6..10].try_into().unwrap());
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&payload[14..30]);
                    let _ = ra.prefixes.push(PrefixInfo {
                        prefix: Ipv6Addr::from(octets),
                        prefix_len,
                        on_link: pflags & 0x80 != 0,
                        autonomous: pflags & 0x40 != 0,
                        valid_lifetime,
                        preferred_lifetime,
                    });
                }
                OPT_MTU if payload.len() >= 6 => {
                    ra.mtu = Some(u32::from_be_bytes(payload[2..6].try_into().unwrap()));
                }
                OPT_RDNSS if payload.len() >= 22 => {
                    let mut off = 6;
                    while off + 16 <= payload.len() && ra.rdnss.len() < 2 {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(&payload[off..off + 16]);
                        let _ = ra.rdnss.push(Ipv6Addr::from(octets));
                        off += 16;
                    }
                }
                _ => {}
            }
        }
        Ok(ra)
    }
}

// ---- orchestration, operates on the shared Stack --------------------------

/// Process an RA and fold its Prefix Information / MTU / RDNSS options into
/// the interface manager.
pub fn ndp_on_ra(stack: &mut Stack, ifindex: u8, src: Ipv6Addr, ra: &RouterAdvert, now_ms: u64) {
    stack.ndp.entries.put(
        (ifindex, src),
        NdpEntry {
            ip: src,
            mac: stack
                .ndp
                .peek(ifindex, src)
                .map(|e| e.mac)
                .unwrap_or(MacAddr::ZERO),
            ttl_ms: NEIGHBOR_STALE_MS,
            retransmit_timer_ms: 0,
            state: NeighborState::Stale,
            probes_sent: 0,
            is_router: ra.router_lifetime_secs > 0,
            router_lifetime_ms: ra.router_lifetime_secs as u64 * 1000,
        },
    );

    if let Some(mtu) = ra.mtu {
        if let Some(iface) = stack.ifaces.get_mut(ifindex) {
            for a in iface.v6.iter_mut() {
                a.mtu = mtu as u16;
            }
        }
    }

    for prefix in ra.prefixes.iter() {
        on_ra_prefix(stack, ifindex, prefix, now_ms);
    }

    if !ra.rdnss.is_empty() {
        crate::dns::on_rdnss(stack, ifindex, &ra.rdnss);
    }

    if ra.managed {
        crate::dhcpv6::on_ra_managed(stack, ifindex, false);
    } else if ra.other_config {
        crate::dhcpv6::on_ra_managed(stack, ifindex, true);
    }
}

fn on_ra_prefix(stack: &mut Stack, ifindex: u8, prefix: &PrefixInfo, now_ms: u64) {
    let Some(iface) = stack.ifaces.get_mut(ifindex) else {
        return;
    };
    // Find the placeholder or matching GUA SLAAC slot.
    let slot = iface.v6.iter_mut().find(|a| {
        a.kind.contains(V6Kind::GLOBAL)
            && (a.is_placeholder_gua() || (a.contains(prefix.prefix) && a.prefix_len == prefix.prefix_len))
    });
    let Some(addr) = slot else { return };

    if prefix.autonomous && addr.is_placeholder_gua() {
        let mut octets = prefix.prefix.octets();
        octets[8..16].copy_from_slice(&addr_iid_or_default(addr));
        addr.addr = Ipv6Addr::from(octets);
        addr.prefix_len = prefix.prefix_len;
    }
    addr.preferred_lifetime_secs = prefix.preferred_lifetime;
    addr.valid_lifetime_secs = prefix.valid_lifetime;
    addr.ra.has_ra = true;
    addr.ra.autonomous = prefix.autonomous;
    addr.ra.is_default = true;
    addr.ra.last_update_ms = now_ms;
}

fn addr_iid_or_default(addr: &crate::iface::l3v6::L3V6Address) -> [u8; 8] {
    if addr.iid != [0u8; 8] {
        addr.iid
    } else {
        let o = addr.addr.octets();
        let mut iid = [0u8; 8];
        iid.copy_from_slice(&o[8..16]);
        iid
    }
}

/// Process an incoming Neighbor Solicitation.
/// Returns `Some(na_payload)` when a solicited NA must be sent back.
pub fn on_ns(
    stack: &mut Stack,
    ifindex: u8,
    src_ip: Ipv6Addr,
    src_mac: MacAddr,
    msg: &NeighborMessage,
) -> Option<alloc::vec::Vec<u8>> {
    let target = msg.target;
    let is_dad_probe = src_ip.is_unspecified();

    if let Some(iface) = stack.ifaces.get_mut(ifindex) {
        if let Some(addr) = iface
            .v6
            .iter_mut()
            .find(|a| a.addr == target && a.dad_state == DadState::InProgress)
        {
            if is_dad_probe {
                addr.dad_state = DadState::Failed;
                return None;
            }
        }
    }

    if !is_dad_probe {
        stack.ndp.learn(ifindex, src_ip, src_mac, NEIGHBOR_STALE_MS);
    }

    let we_own_target = stack
        .ifaces
        .get(ifindex)
        .map(|i| i.v6.iter().any(|a| a.addr == target && a.is_enabled()))
        .unwrap_or(false);
    if !we_own_target {
        return None;
    }

    let our_mac = stack.ifaces.get(ifindex).map(|i| i.mac).unwrap_or(MacAddr::ZERO);
    Some(NeighborMessage::encode_na(
        target,
        Some(our_mac),
        false,
        true,
        true,
    ))
}

/// Process an incoming Neighbor Advertisement.
pub fn on_na(stack: &mut Stack, ifindex: u8, msg: &NeighborMessage) {
    let target = msg.target;
    if let Some(iface) = stack.ifaces.get_mut(ifindex) {
        if let Some(addr) = iface
            .v6
            .iter_mut()
            .find(|a| a.addr == target && a.dad_state == DadState::InProgress)
        {
            addr.dad_state = DadState::Failed;
            return;
        }
    }
    let solicited = msg.flags & NA_FLAG_SOLICITED != 0;
    let override_flag = msg.flags & NA_FLAG_OVERRIDE != 0;
    let router_flag = msg.flags & NA_FLAG_ROUTER != 0;
    if let Some(mac) = msg.link_layer {
        stack.ndp.on_na(
            ifindex,
            target,
            mac,
            override_flag,
            solicited,
            router_flag,
            0,
        );
    }
}

/// Begin DAD on a newly-added unicast v6 address.
pub fn start_dad(stack: &mut Stack, id: L3Id) {
    let _ = stack.ifaces.update_v6(id, |a| {
        a.dad_state = DadState::InProgress;
        a.dad_requested = false;
        a.dad_probes_sent = 0;
        a.dad_timer_ms = 0;
    });
}

/// Periodic NDP daemon tick. Ages the
/// neighbor table, drives DAD and RS, expires RA-derived address
/// lifetimes.
pub fn tick(stack: &mut Stack, dt_ms: u64, now_ms: u64) {
    stack.ndp.age(dt_ms);
    dad_tick(stack, dt_ms, now_ms);
    rs_tick(stack, dt_ms);
    lifetime_tick(stack, now_ms);
}

fn dad_tick(stack: &mut Stack, dt_ms: u64, now_ms: u64) {
    let max_probes = stack.config.dad_max_probes;
    let ids: Vec<L3Id> = stack
        .ifaces
        .iter()
        .flat_map(|i| i.v6.iter().map(|a| a.id))
        .collect();
    for id in ids {
        let Some(addr) = stack.ifaces.find_by_id_v6(id) else {
            continue;
        };
        if addr.localhost || addr.dad_state != DadState::InProgress {
            continue;
        }
        let (ifindex, target, timer_due, probes_sent) =
            (addr.ifindex, addr.addr, addr.dad_timer_ms <= dt_ms, addr.dad_probes_sent);
        if !timer_due {
            let _ = stack
                .ifaces
                .update_v6(id, |a| a.dad_timer_ms = a.dad_timer_ms.saturating_sub(dt_ms));
            continue;
        }
        if probes_sent >= max_probes {
            let _ = stack.ifaces.update_v6(id, |a| a.dad_state = DadState::Ok);
            let our_mac = stack.ifaces.get(ifindex).map(|i| i.mac).unwrap_or(MacAddr::ZERO);
            let na = NeighborMessage::encode_na(target, Some(our_mac), false, false, true);
            send_icmpv6(stack, ifindex, target, Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1), TYPE_NA, &na);
            continue;
        }
        let dst = solicited_node_multicast(target);
        let _ = stack.ifaces.ipv6_mcast_join(ifindex, dst);
        let ns = NeighborMessage::encode_ns(target, None);
        send_icmpv6(stack, ifindex, Ipv6Addr::UNSPECIFIED, dst, TYPE_NS, &ns);
        let _ = stack.ifaces.update_v6(id, |a| {
            a.dad_probes_sent += 1;
            a.dad_timer_ms = DAD_PROBE_INTERVAL_MS;
        });
        let _ = now_ms;
    }
}

/// Send Router Solicitations from each interface's link-local until an RA
/// arrives or `rs_max_count` solicitations have gone unanswered.
fn rs_tick(stack: &mut Stack, dt_ms: u64) {
    let max_rs = stack.config.rs_max_count;
    let ids: Vec<L3Id> = stack
        .ifaces
        .iter()
        .flat_map(|i| i.v6.iter().map(|a| a.id))
        .collect();
    for id in ids {
        let Some(addr) = stack.ifaces.find_by_id_v6(id) else {
            continue;
        };
        if !addr.kind.contains(V6Kind::LINK_LOCAL)
            || addr.dad_state != DadState::Ok
            || addr.ra.has_ra
            || addr.rs_sent >= max_rs
        {
            continue;
        }
        if addr.rs_timer_ms > dt_ms {
            let _ = stack
                .ifaces
                .update_v6(id, |a| a.rs_timer_ms -= dt_ms);
            continue;
        }
        let ifindex = addr.ifindex;
        let src = addr.addr;
        let our_mac = stack.ifaces.get(ifindex).map(|i| i.mac).unwrap_or(MacAddr::ZERO);
        let rs = RouterSolicit::encode(Some(our_mac));
        send_icmpv6(
            stack,
            ifindex,
            src,
            Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2),
            TYPE_RS,
            &rs,
        );
        let _ = stack.ifaces.update_v6(id, |a| {
            a.rs_sent += 1;
            a.rs_timer_ms = RS_INTERVAL_MS;
        });
    }
}

fn lifetime_tick(stack: &mut Stack, now_ms: u64) {
    let ids: Vec<L3Id> = stack
        .ifaces
        .iter()
        .flat_map(|i| i.v6.iter().map(|a| a.id))
        .collect();
    for id in ids {
        let Some(addr) = stack.ifaces.find_by_id_v6(id) else {
            continue;
        };
        if addr.kind.contains(V6Kind::LINK_LOCAL) || !addr.ra.has_ra {
            continue;
        }
        let age_ms = now_ms.saturating_sub(addr.ra.last_update_ms);
        if addr.valid_lifetime_secs != 0 && age_ms > addr.valid_lifetime_secs as u64 * 1000 {
            let _ = stack.ifaces.remove_v6(id);
        }
    }
}

fn send_icmpv6(stack: &mut Stack, ifindex: u8, src: Ipv6Addr, dst: Ipv6Addr, icmp_type: u8, body: &[u8]) {
    crate::icmpv6::send_control(stack, ifindex, src, dst, icmp_type, body);
}
