//! MLDv1 host-side membership reporting, the IPv6 analogue of [`crate::igmp`]:
//! carried inside ICMPv6 instead of its own IP protocol number, and keyed by
//! 128-bit group addresses.

use alloc::vec::Vec;
use core::net::Ipv6Addr;

use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

pub const TYPE_QUERY: u8 = 130;
pub const TYPE_REPORT: u8 = 131;
pub const TYPE_DONE: u8 = 132;
pub const TYPE_V2_REPORT: u8 = 143;

const LINK_LOCAL_ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
const LINK_LOCAL_ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub msg_type: u8,
    pub max_resp_delay_ms: u64,
    pub group: Ipv6Addr,
}

impl Message {
    /// Decode the part of an MLD message past the shared ICMPv6 header
    /// (type/code/checksum), which [`crate::icmpv6::on_recv`] has already
    /// consumed and passes `msg_type` for separately.
    pub fn decode(msg_type: u8, bytes: &[u8]) -> Result<Self, WireError> {
        let mut b = BytesIn::new(bytes);
        let max_resp_delay = b.u16()?;
        let _reserved = b.u16()?;
        let group = Ipv6Addr::from(b.arr::<16>()?);
        Ok(Self {
            msg_type,
            max_resp_delay_ms: max_resp_delay as u64,
            group,
        })
    }

    /// Encode the body `icmpv6::send_control` wraps with its own header.
    fn body(group: Ipv6Addr) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; 20];
        let mut b = BytesOut::new(&mut buf);
        let _ = b
            .u16(0)
            .and_then(|b| b.u16(0))
            .and_then(|b| b.push(&group.octets()));
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportState {
    Idle,
    DelayingReport,
}

#[derive(Debug, Clone, Copy)]
struct GroupTimer {
    ifindex: u8,
    group: Ipv6Addr,
    state: ReportState,
    delay_ms: u64,
}

pub struct MldState {
    timers: heapless::Vec<GroupTimer, { crate::config::MAX_MCAST_GROUPS_PER_L2 * crate::config::MAX_L2_INTERFACES }>,
}

impl MldState {
    pub fn new() -> Self {
        Self {
            timers: heapless::Vec::new(),
        }
    }

    fn timer_mut(&mut self, ifindex: u8, group: Ipv6Addr) -> Option<&mut GroupTimer> {
        self.timers.iter_mut().find(|t| t.ifindex == ifindex && t.group == group)
    }
}

impl Default for MldState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn join(stack: &mut Stack, ifindex: u8, group: Ipv6Addr) {
    use crate::iface::mcast::MembershipChange;
    if stack.ifaces.ipv6_mcast_join(ifindex, group) == Ok(MembershipChange::Joined) {
        send_report(stack, ifindex, group);
    }
}

pub fn leave(stack: &mut Stack, ifindex: u8, group: Ipv6Addr) {
    use crate::iface::mcast::MembershipChange;
    if stack.ifaces.ipv6_mcast_leave(ifindex, group) == Ok(MembershipChange::Left) {
        let body = Message::body(group);
        send_icmpv6(stack, ifindex, LINK_LOCAL_ALL_ROUTERS, TYPE_DONE, &body);
    }
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

fn send_report(stack: &mut Stack, ifindex: u8, group: Ipv6Addr) {
    let body = Message::body(group);
    send_icmpv6(stack, ifindex, group, TYPE_REPORT, &body);
}

fn send_icmpv6(stack: &mut Stack, ifindex: u8, dst: Ipv6Addr, icmp_type: u8, body: &[u8]) {
    let src = link_local_src(stack, ifindex);
    crate::icmpv6::send_control(stack, ifindex, src, dst, icmp_type, body);
}

/// Process an incoming MLD message. Mirrors [`crate::igmp::on_recv`]: a
/// Query arms a randomized per-group report-delay timer, a Report from
/// another host suppresses ours.
pub fn on_recv(stack: &mut Stack, ifindex: u8, msg: &Message, now_ms: u64) {
    match msg.msg_type {
        TYPE_QUERY => {
            let groups: Vec<Ipv6Addr> = if msg.group.is_unspecified() {
                stack
                    .ifaces
                    .get(ifindex)
                    .map(|i| i.mcast_v6.groups().filter(|g| *g != LINK_LOCAL_ALL_NODES).collect())
                    .unwrap_or_default()
            } else {
                alloc::vec![msg.group]
            };
            for group in groups {
                let delay = random_delay(now_ms, ifindex, group, msg.max_resp_delay_ms.max(1));
                if let Some(timer) = stack.mld.timer_mut(ifindex, group) {
                    timer.state = ReportState::DelayingReport;
                    timer.delay_ms = timer.delay_ms.min(delay);
                } else {
                    let _ = stack.mld.timers.push(GroupTimer {
                        ifindex,
                        group,
                        state: ReportState::DelayingReport,
                        delay_ms: delay,
                    });
                }
            }
        }
        TYPE_REPORT | TYPE_V2_REPORT => {
            if let Some(timer) = stack.mld.timer_mut(ifindex, msg.group) {
                timer.state = ReportState::Idle;
            }
        }
        _ => {}
    }
}

fn random_delay(now_ms: u64, ifindex: u8, group: Ipv6Addr, max_ms: u64) -> u64 {
    use rand::{Rng, SeedableRng};
    let o = group.octets();
    let tail = u64::from_be_bytes([o[8], o[9], o[10], o[11], o[12], o[13], o[14], o[15]]);
    let seed = now_ms ^ ((ifindex as u64) << 40) ^ tail;
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    rng.gen_range(0..=max_ms)
}

/// Periodic MLD daemon tick (100 ms cadence), mirroring [`crate::igmp::tick`].
pub fn tick(stack: &mut Stack, dt_ms: u64) {
    let due: Vec<(u8, Ipv6Addr)> = stack
        .mld
        .timers
        .iter_mut()
        .filter_map(|t| {
            if t.state != ReportState::DelayingReport {
                return None;
            }
            t.delay_ms = t.delay_ms.saturating_sub(dt_ms);
            (t.delay_ms == 0).then_some((t.ifindex, t.group))
        })
        .collect();
    for (ifindex, group) in &due {
        send_report(stack, *ifindex, *group);
    }
    stack.mld.timers.retain(|t| !(due.contains(&(t.ifindex, t.group)) && t.state == ReportState::DelayingReport));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips() {
        let group = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 5);
        let body = Message::body(group);
        let msg = Message::decode(TYPE_REPORT, &body).unwrap();
        assert_eq!(msg.msg_type, TYPE_REPORT);
        assert_eq!(msg.group, group);
    }
}
