//! DHCPv6 client: stateful (IA_NA address lease) and stateless
//! (Information-Request only) paths, driven off the M/O bits a Router
//! Advertisement carries. One FSM entry per IPv6 address slot that asked
//! for DHCPv6, keyed by its [`L3Id`].
//!
//! Grounded on the client state machine and backoff algorithm of
//! `dhcpv6_daemon.c`'s `fsm_once`/`next_backoff_ms`, adapted to this crate's
//! per-`Stack` polling shape instead of a standalone daemon
//! thread. The wire format (message types, option tags, DUID-LL/IAID
//! derivation) follows the same source's `dhcpv6.h`.

use alloc::vec::Vec;
use core::net::Ipv6Addr;

use crate::config::{
    DHCPV6_CLIENT_PORT, DHCPV6_INITIAL_BACKOFF_MS, DHCPV6_JITTER_MS, DHCPV6_MAX_BACKOFF_MS,
    DHCPV6_RETRIES_LONG, DHCPV6_RETRIES_SHORT, DHCPV6_SERVER_PORT,
};
use crate::ethernet::MacAddr;
use crate::types::L3Id;
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

const MSG_SOLICIT: u8 = 1;
const MSG_ADVERTISE: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_RENEW: u8 = 5;
const MSG_REBIND: u8 = 6;
const MSG_REPLY: u8 = 7;
const MSG_INFORMATION_REQUEST: u8 = 11;

const OPT_CLIENTID: u16 = 1;
const OPT_SERVERID: u16 = 2;
const OPT_IA_NA: u16 = 3;
const OPT_IAADDR: u16 = 5;
const OPT_ORO: u16 = 6;
const OPT_ELAPSED: u16 = 8;
const OPT_STATUS_CODE: u16 = 13;
const OPT_DNS_SERVERS: u16 = 23;

const LINK_LOCAL_ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Init,
    Soliciting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
    InformationRequesting,
    InformationObtained,
}

/// Per-address DHCPv6 client FSM. Lives alongside the `L3V6Address` it
/// negotiates for, keyed by that address's [`L3Id`] the way NDP's DAD/RS
/// timers are keyed.
#[derive(Debug, Clone)]
struct ClientEntry {
    ifindex: u8,
    id: L3Id,
    stateless: bool,
    state: ClientState,
    xid: u32,
    iaid: u32,
    retries: u8,
    backoff_ms: u64,
    retransmit_at_ms: u64,
    server_id: heapless::Vec<u8, 128>,
    server_addr: Ipv6Addr,
    lease_addr: Ipv6Addr,
    preferred_secs: u32,
    valid_secs: u32,
    t1_secs: u32,
    t2_secs: u32,
    lease_deadline_ms: u64,
    t1_deadline_ms: u64,
    t2_deadline_ms: u64,
}

pub struct Dhcpv6State {
    clients: heapless::Vec<ClientEntry, { crate::config::MAX_L2_INTERFACES }>,
    next_xid: u32,
}

impl Dhcpv6State {
    pub fn new() -> Self {
        Self {
            clients: heapless::Vec::new(),
            next_xid: 1,
        }
    }

    fn entry_mut(&mut self, ifindex: u8, id: L3Id) -> Option<&mut ClientEntry> {
        self.clients.iter_mut().find(|c| c.ifindex == ifindex && c.id == id)
    }

    fn entry_by_xid_mut(&mut self, xid: u32) -> Option<&mut ClientEntry> {
        self.clients.iter_mut().find(|c| c.xid == xid)
    }
}

impl Default for Dhcpv6State {
    fn default() -> Self {
        Self::new()
    }
}

fn next_backoff_ms(prev_ms: u64, seed: u32) -> u64 {
    let doubled = if prev_ms == 0 {
        DHCPV6_INITIAL_BACKOFF_MS
    } else {
        (prev_ms * 2).min(DHCPV6_MAX_BACKOFF_MS)
    };
    let jitter = (seed % (2 * DHCPV6_JITTER_MS as u32)) as i64 - DHCPV6_JITTER_MS;
    (doubled as i64 + jitter).max(1_000) as u64
}

fn duid_ll_from_mac(mac: MacAddr) -> heapless::Vec<u8, 128> {
    let mut out = heapless::Vec::new();
    let _ = out.extend_from_slice(&1u16.to_be_bytes()); // DUID-LL
    let _ = out.extend_from_slice(&1u16.to_be_bytes()); // hardware type: ethernet
    let _ = out.extend_from_slice(&mac.0);
    out
}

fn iaid_from_mac(mac: MacAddr) -> u32 {
    u32::from_be_bytes([mac.0[2], mac.0[3], mac.0[4], mac.0[5]])
}

/// Entry point called from [`crate::ndp::ndp_on_ra`] when a Router
/// Advertisement carries the M bit (`stateless = false`, full IA_NA lease)
/// or the O bit alone (`stateless = true`, Information-Request only).
pub fn on_ra_managed(stack: &mut Stack, ifindex: u8, stateless: bool) {
    let Some(iface) = stack.ifaces.get(ifindex) else {
        return;
    };
    let mac = iface.mac;
    let Some(slot) = iface
        .v6
        .iter()
        .find(|a| matches!(a.config, crate::iface::l3v6::V6Config::Dhcpv6) || a.dhcpv6_stateless)
        .map(|a| a.id)
    else {
        return;
    };

    if stack.dhcpv6.entry_mut(ifindex, slot).is_some() {
        return;
    }

    let xid = stack.dhcpv6.next_xid;
    stack.dhcpv6.next_xid = stack.dhcpv6.next_xid.wrapping_add(1).max(1);

    let entry = ClientEntry {
        ifindex,
        id: slot,
        stateless,
        state: ClientState::Init,
        xid,
        iaid: iaid_from_mac(mac),
        retries: 0,
        backoff_ms: 0,
        retransmit_at_ms: 0,
        server_id: heapless::Vec::new(),
        server_addr: Ipv6Addr::UNSPECIFIED,
        lease_addr: Ipv6Addr::UNSPECIFIED,
        preferred_secs: 0,
        valid_secs: 0,
        t1_secs: 0,
        t2_secs: 0,
        lease_deadline_ms: 0,
        t1_deadline_ms: 0,
        t2_deadline_ms: 0,
    };
    let _ = stack.dhcpv6.clients.push(entry);
}

fn link_local_src(stack: &Stack, ifindex: u8) -> Ipv6Addr {
    use crate::iface::l3v6::V6Kind;
    stack
        .ifaces
        .get(ifindex)
        .and_then(|i| i.v6.iter().find(|a| a.kind.contains(V6Kind::LINK_LOCAL)))
        .map(|a| a.addr)
        .unwrap_or(Ipv6Addr::UNSPECIFIED)
}

/// Periodic DHCPv6 daemon tick (250 ms cadence): drives retransmission,
/// T1/T2 renewal, and lease expiry for every address slot with a client FSM.
pub fn tick(stack: &mut Stack, dt_ms: u64, now_ms: u64) {
    let keys: Vec<(u8, L3Id)> = stack.dhcpv6.clients.iter().map(|c| (c.ifindex, c.id)).collect();
    for (ifindex, id) in keys {
        step(stack, ifindex, id, dt_ms, now_ms);
    }
}

fn step(stack: &mut Stack, ifindex: u8, id: L3Id, _dt_ms: u64, now_ms: u64) {
    let Some(entry) = stack.dhcpv6.entry_mut(ifindex, id) else {
        return;
    };

    match entry.state {
        ClientState::Init => {
            let stateless = entry.stateless;
            entry.state = if stateless {
                ClientState::InformationRequesting
            } else {
                ClientState::Soliciting
            };
            entry.retransmit_at_ms = now_ms;
        }
        ClientState::Bound => {
            if entry.t1_deadline_ms != 0 && now_ms >= entry.t1_deadline_ms {
                entry.state = ClientState::Renewing;
                entry.retries = 0;
                entry.backoff_ms = 0;
                entry.retransmit_at_ms = now_ms;
            } else if entry.lease_deadline_ms != 0 && now_ms >= entry.lease_deadline_ms {
                entry.state = ClientState::Init;
            }
        }
        ClientState::Renewing => {
            if entry.t2_deadline_ms != 0 && now_ms >= entry.t2_deadline_ms {
                entry.state = ClientState::Rebinding;
                entry.retries = 0;
                entry.backoff_ms = 0;
                entry.retransmit_at_ms = now_ms;
            } else if entry.lease_deadline_ms != 0 && now_ms >= entry.lease_deadline_ms {
                entry.state = ClientState::Init;
            }
        }
        ClientState::Rebinding => {
            if entry.lease_deadline_ms != 0 && now_ms >= entry.lease_deadline_ms {
                entry.state = ClientState::Init;
            }
        }
        ClientState::InformationObtained => {}
        ClientState::Soliciting | ClientState::Requesting | ClientState::InformationRequesting => {}
    }

    let Some(entry) = stack.dhcpv6.entry_mut(ifindex, id) else {
        return;
    };
    if now_ms < entry.retransmit_at_ms {
        return;
    }

    let max_retries = match entry.state {
        ClientState::InformationRequesting => DHCPV6_RETRIES_SHORT,
        ClientState::Requesting => DHCPV6_RETRIES_SHORT,
        _ => DHCPV6_RETRIES_LONG,
    };
    if entry.retries >= max_retries && entry.state != ClientState::Bound {
        entry.state = ClientState::Init;
        entry.retries = 0;
        entry.backoff_ms = 0;
        return;
    }

    let seed = now_ms as u32 ^ entry.xid ^ ((ifindex as u32) << 24);
    entry.backoff_ms = next_backoff_ms(entry.backoff_ms, seed);
    entry.retransmit_at_ms = now_ms + entry.backoff_ms;
    entry.retries += 1;

    let msg_type = match entry.state {
        ClientState::Soliciting => MSG_SOLICIT,
        ClientState::Requesting => MSG_REQUEST,
        ClientState::Renewing => MSG_RENEW,
        ClientState::Rebinding => MSG_REBIND,
        ClientState::InformationRequesting => MSG_INFORMATION_REQUEST,
        ClientState::Bound | ClientState::InformationObtained => return,
    };

    send_message(stack, ifindex, id, msg_type, now_ms);
}

fn send_message(stack: &mut Stack, ifindex: u8, id: L3Id, msg_type: u8, now_ms: u64) {
    let Some(mac) = stack.ifaces.get(ifindex).map(|i| i.mac) else {
        return;
    };
    let Some(entry) = stack.dhcpv6.entry_mut(ifindex, id) else {
        return;
    };
    let xid = entry.xid;
    let iaid = entry.iaid;
    let want_address = !entry.stateless;
    let server_id = entry.server_id.clone();
    let lease_addr = entry.lease_addr;

    let mut body = Vec::new();
    body.push(msg_type);
    body.push(((xid >> 16) & 0xff) as u8);
    body.push(((xid >> 8) & 0xff) as u8);
    body.push((xid & 0xff) as u8);

    let client_duid = duid_ll_from_mac(mac);
    push_option(&mut body, OPT_CLIENTID, &client_duid);

    if !server_id.is_empty() && matches!(msg_type, MSG_REQUEST | MSG_RENEW | MSG_REBIND) {
        push_option(&mut body, OPT_SERVERID, &server_id);
    }

    push_option(&mut body, OPT_ELAPSED, &0u16.to_be_bytes());

    if want_address {
        let mut ia_na = Vec::new();
        ia_na.extend_from_slice(&iaid.to_be_bytes());
        ia_na.extend_from_slice(&0u32.to_be_bytes()); // T1: let server decide
        ia_na.extend_from_slice(&0u32.to_be_bytes()); // T2
        if msg_type == MSG_REQUEST || msg_type == MSG_RENEW || msg_type == MSG_REBIND {
            if !lease_addr.is_unspecified() {
                let mut iaaddr = Vec::new();
                iaaddr.extend_from_slice(&lease_addr.octets());
                iaaddr.extend_from_slice(&0u32.to_be_bytes());
                iaaddr.extend_from_slice(&0u32.to_be_bytes());
                push_option(&mut ia_na, OPT_IAADDR, &iaaddr);
            }
        }
        push_option(&mut body, OPT_IA_NA, &ia_na);
    } else {
        push_option(&mut body, OPT_ORO, &OPT_DNS_SERVERS.to_be_bytes());
    }

    let src = link_local_src(stack, ifindex);
    let dst = if msg_type == MSG_RENEW && !entry.server_addr.is_unspecified() {
        entry.server_addr
    } else {
        LINK_LOCAL_ALL_DHCP_RELAY_AGENTS_AND_SERVERS
    };
    send_udp6(stack, ifindex, src, dst, &body, now_ms);
}

fn push_option(buf: &mut Vec<u8>, code: u16, data: &[u8]) {
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

/// Build a minimal UDP/IPv6 datagram and hand it to `ipv6::send_raw`
/// directly; the transport-layer UDP module isn't a consumer of this
/// traffic (DHCPv6 owns ports 546/547 end to end), so there is no
/// `udp::send` fan-out to route through here.
fn send_udp6(stack: &mut Stack, ifindex: u8, src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8], now_ms: u64) {
    let mut datagram = alloc::vec![0u8; 8 + payload.len()];
    {
        let mut b = BytesOut::new(&mut datagram);
        let _ = b
            .u16(DHCPV6_CLIENT_PORT)
            .and_then(|b| b.u16(DHCPV6_SERVER_PORT))
            .and_then(|b| b.u16((8 + payload.len()) as u16))
            .and_then(|b| b.u16(0));
    }
    datagram[8..].copy_from_slice(payload);

    let pseudo = crate::checksum::pseudo_header_v6(src, dst, crate::ipv6::NEXT_HEADER_UDP, datagram.len() as u32);
    let sum = crate::checksum::combine(&[pseudo, crate::checksum::accumulate(&datagram, None)]);
    let sum = if sum == 0 { 0xffff } else { sum };
    datagram[6..8].copy_from_slice(&sum.to_be_bytes());

    // DHCPv6 messages are small and fixed-format; never worth fragmenting.
    crate::ipv6::send_raw(stack, ifindex, src, dst, crate::ipv6::NEXT_HEADER_UDP, &datagram, true, now_ms);
}

/// Handle a UDP datagram landing on the client port 546 from `src` (the
/// entry point for the transport layer handing DHCPv6 traffic off).
pub fn on_recv(stack: &mut Stack, ifindex: u8, src: Ipv6Addr, payload: &[u8], now_ms: u64) {
    let Ok(parsed) = parse_message(payload) else {
        return;
    };

    let Some(entry) = stack.dhcpv6.entry_by_xid_mut(parsed.xid) else {
        return;
    };
    if entry.ifindex != ifindex {
        return;
    }

    match parsed.msg_type {
        MSG_ADVERTISE => {
            if entry.state != ClientState::Soliciting {
                return;
            }
            entry.server_id = parsed.server_id.clone();
            entry.server_addr = src;
            entry.retries = 0;
            entry.backoff_ms = 0;
            entry.state = ClientState::Requesting;
            entry.retransmit_at_ms = now_ms;
        }
        MSG_REPLY => {
            apply_reply(stack, ifindex, parsed, src, now_ms);
        }
        _ => {}
    }
}

fn apply_reply(stack: &mut Stack, ifindex: u8, parsed: ParsedMessage, src: Ipv6Addr, now_ms: u64) {
    let Some(entry) = stack.dhcpv6.entry_by_xid_mut(parsed.xid) else {
        return;
    };
    match entry.state {
        ClientState::Requesting | ClientState::Renewing | ClientState::Rebinding => {
            if let Some(addr) = parsed.lease_addr {
                entry.lease_addr = addr;
                entry.preferred_secs = parsed.preferred_secs;
                entry.valid_secs = parsed.valid_secs;
                let t1 = if parsed.t1_secs != 0 { parsed.t1_secs } else { parsed.valid_secs / 2 };
                let t2 = if parsed.t2_secs != 0 {
                    parsed.t2_secs
                } else {
                    parsed.valid_secs / 8 * 7
                };
                entry.t1_secs = t1;
                entry.t2_secs = t2;
                entry.t1_deadline_ms = now_ms + t1 as u64 * 1000;
                entry.t2_deadline_ms = now_ms + t2 as u64 * 1000;
                entry.lease_deadline_ms = now_ms + parsed.valid_secs as u64 * 1000;
            }
            entry.server_addr = src;
            entry.retries = 0;
            entry.backoff_ms = 0;
            entry.state = ClientState::Bound;
            let id = entry.id;
            let lease_addr = entry.lease_addr;
            let preferred = entry.preferred_secs;
            let valid = entry.valid_secs;
            apply_lease_to_address(stack, ifindex, id, lease_addr, preferred, valid);
        }
        ClientState::InformationRequesting => {
            entry.state = ClientState::InformationObtained;
        }
        _ => {}
    }
    for dns in &parsed.dns_servers {
        crate::dns::set_resolver_v6(stack, *dns);
    }
}

fn apply_lease_to_address(stack: &mut Stack, ifindex: u8, id: L3Id, addr: Ipv6Addr, preferred_secs: u32, valid_secs: u32) {
    use crate::iface::l3v6::{Dhcpv6AddrState, V6Kind};
    let Some(iface) = stack.ifaces.get_mut(ifindex) else {
        return;
    };
    let Some(slot) = iface.v6.iter_mut().find(|a| a.id == id) else {
        return;
    };
    if !addr.is_unspecified() {
        slot.addr = addr;
        slot.prefix_len = 128;
        slot.kind = V6Kind::GLOBAL;
    }
    slot.preferred_lifetime_secs = preferred_secs;
    slot.valid_lifetime_secs = valid_secs;
    slot.dhcpv6_state = Dhcpv6AddrState::Stateful;
}

struct ParsedMessage {
    msg_type: u8,
    xid: u32,
    server_id: heapless::Vec<u8, 128>,
    lease_addr: Option<Ipv6Addr>,
    preferred_secs: u32,
    valid_secs: u32,
    t1_secs: u32,
    t2_secs: u32,
    dns_servers: heapless::Vec<Ipv6Addr, 2>,
}

fn parse_message(data: &[u8]) -> Result<ParsedMessage, WireError> {
    let mut b = BytesIn::new(data);
    let msg_type = b.u8()?;
    let xid_bytes = b.arr::<3>()?;
    let xid = u32::from_be_bytes([0, xid_bytes[0], xid_bytes[1], xid_bytes[2]]);

    let mut out = ParsedMessage {
        msg_type,
        xid,
        server_id: heapless::Vec::new(),
        lease_addr: None,
        preferred_secs: 0,
        valid_secs: 0,
        t1_secs: 0,
        t2_secs: 0,
        dns_servers: heapless::Vec::new(),
    };

    while b.remaining_len() >= 4 {
        let code = b.u16()?;
        let len = b.u16()? as usize;
        let opt = b.slice(len)?;
        match code {
            OPT_SERVERID => {
                let _ = out.server_id.extend_from_slice(opt);
            }
            OPT_IA_NA if opt.len() >= 12 => {
                out.t1_secs = u32::from_be_bytes([opt[4], opt[5], opt[6], opt[7]]);
                out.t2_secs = u32::from_be_bytes([opt[8], opt[9], opt[10], opt[11]]);
                let mut ob = BytesIn::new(&opt[12..]);
                while ob.remaining_len() >= 4 {
                    let sub_code = ob.u16()?;
                    let sub_len = ob.u16()? as usize;
                    let sub = ob.slice(sub_len)?;
                    if sub_code == OPT_IAADDR && sub.len() >= 24 {
                        let octets: [u8; 16] = sub[0..16].try_into().unwrap();
                        out.lease_addr = Some(Ipv6Addr::from(octets));
                        out.preferred_secs = u32::from_be_bytes([sub[16], sub[17], sub[18], sub[19]]);
                        out.valid_secs = u32::from_be_bytes([sub[20], sub[21], sub[22], sub[23]]);
                    }
                }
            }
            OPT_DNS_SERVERS => {
                let mut ob = BytesIn::new(opt);
                while ob.remaining_len() >= 16 {
                    let octets = ob.arr::<16>()?;
                    let _ = out.dns_servers.push(Ipv6Addr::from(octets));
                }
            }
            OPT_STATUS_CODE | OPT_CLIENTID | OPT_ORO => {}
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let first = next_backoff_ms(0, 0);
        assert!((DHCPV6_INITIAL_BACKOFF_MS as i64 - first as i64).unsigned_abs() <= DHCPV6_JITTER_MS as u64);
        let second = next_backoff_ms(DHCPV6_MAX_BACKOFF_MS, 0);
        assert!(second <= DHCPV6_MAX_BACKOFF_MS + DHCPV6_JITTER_MS as u64);
    }

    #[test]
    fn option_round_trips_through_push_and_parse() {
        let mut body = Vec::new();
        body.push(MSG_REPLY);
        body.extend_from_slice(&[0, 1, 2]); // xid
        let duid = duid_ll_from_mac(MacAddr([0, 1, 2, 3, 4, 5]));
        push_option(&mut body, OPT_CLIENTID, &duid);

        let mut ia_na = Vec::new();
        ia_na.extend_from_slice(&1u32.to_be_bytes());
        ia_na.extend_from_slice(&0u32.to_be_bytes());
        ia_na.extend_from_slice(&0u32.to_be_bytes());
        let mut iaaddr = Vec::new();
        iaaddr.extend_from_slice(&Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).octets());
        iaaddr.extend_from_slice(&3600u32.to_be_bytes());
        iaaddr.extend_from_slice(&7200u32.to_be_bytes());
        push_option(&mut ia_na, OPT_IAADDR, &iaaddr);
        push_option(&mut body, OPT_IA_NA, &ia_na);

        let parsed = parse_message(&body).unwrap();
        assert_eq!(parsed.msg_type, MSG_REPLY);
        assert_eq!(parsed.xid, 0x000102);
        assert_eq!(parsed.lease_addr, Some(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)));
        assert_eq!(parsed.preferred_secs, 3600);
        assert_eq!(parsed.valid_secs, 7200);
    }
}
