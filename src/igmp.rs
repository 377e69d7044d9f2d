//! IGMPv2 host-side membership reporting: send an unsolicited report when a
//! group is joined, answer General/Group-Specific Queries after a random
//! delay, and suppress reports when another host on the link already
//! reported first.

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::checksum;
use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

pub const TYPE_MEMBERSHIP_QUERY: u8 = 0x11;
pub const TYPE_V1_MEMBERSHIP_REPORT: u8 = 0x12;
pub const TYPE_V2_MEMBERSHIP_REPORT: u8 = 0x16;
pub const TYPE_LEAVE_GROUP: u8 = 0x17;

const ALL_SYSTEMS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
const ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);

#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub msg_type: u8,
    pub max_resp_time_ms: u64,
    pub group: Ipv4Addr,
}

impl Message {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut b = BytesIn::new(bytes);
        let msg_type = b.u8()?;
        let max_resp_time = b.u8()?;
        let _checksum = b.u16()?;
        let group = Ipv4Addr::from(b.u32()?);
        Ok(Self {
            msg_type,
            max_resp_time_ms: max_resp_time as u64 * 100,
            group,
        })
    }

    pub fn encode(msg_type: u8, group: Ipv4Addr) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; 8];
        {
            let mut b = BytesOut::new(&mut buf);
            let _ = b
                .u8(msg_type)
                .and_then(|b| b.u8(0))
                .and_then(|b| b.u16(0))
                .and_then(|b| b.push(&group.octets()));
        }
        let sum = checksum::header_checksum(&buf, None);
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
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
    group: Ipv4Addr,
    state: ReportState,
    delay_ms: u64,
}

/// Pending report timers, one per (ifindex, group) currently delaying a
/// response to a query.
pub struct IgmpState {
    timers: heapless::Vec<GroupTimer, { crate::config::MAX_MCAST_GROUPS_PER_L2 * crate::config::MAX_L2_INTERFACES }>,
}

impl IgmpState {
    pub fn new() -> Self {
        Self {
            timers: heapless::Vec::new(),
        }
    }

    fn timer_mut(&mut self, ifindex: u8, group: Ipv4Addr) -> Option<&mut GroupTimer> {
        self.timers.iter_mut().find(|t| t.ifindex == ifindex && t.group == group)
    }
}

impl Default for IgmpState {
    fn default() -> Self {
        Self::new()
    }
}

/// Join a multicast group on `ifindex`: update the interface manager and,
/// if this is a new membership, send an unsolicited v2 Membership Report.
pub fn join(stack: &mut Stack, ifindex: u8, group: Ipv4Addr) {
    use crate::iface::mcast::MembershipChange;
    if stack.ifaces.ipv4_mcast_join(ifindex, group) == Ok(MembershipChange::Joined) {
        send_report(stack, ifindex, group);
    }
}

pub fn leave(stack: &mut Stack, ifindex: u8, group: Ipv4Addr) {
    use crate::iface::mcast::MembershipChange;
    if stack.ifaces.ipv4_mcast_leave(ifindex, group) == Ok(MembershipChange::Left) {
        let body = Message::encode(TYPE_LEAVE_GROUP, group);
        crate::ipv4::send_raw(stack, ifindex, source_ip(stack, ifindex), ALL_ROUTERS, crate::ipv4::PROTO_IGMP, &body);
    }
}

fn source_ip(stack: &Stack, ifindex: u8) -> Ipv4Addr {
    stack
        .ifaces
        .get(ifindex)
        .and_then(|i| i.v4.first())
        .map(|a| a.ip)
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

fn send_report(stack: &mut Stack, ifindex: u8, group: Ipv4Addr) {
    let body = Message::encode(TYPE_V2_MEMBERSHIP_REPORT, group);
    crate::ipv4::send_raw(stack, ifindex, source_ip(stack, ifindex), group, crate::ipv4::PROTO_IGMP, &body);
}

/// Uniform delay in `[0, max_ms]`, seeded from the query arrival time and
/// the responding (ifindex, group) pair rather than an OS entropy source
/// this `no_std` stack doesn't have access to.
fn random_delay(now_ms: u64, ifindex: u8, group: Ipv4Addr, max_ms: u64) -> u64 {
    use rand::{Rng, SeedableRng};
    let seed = now_ms ^ ((ifindex as u64) << 40) ^ (u32::from(group) as u64);
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    rng.gen_range(0..=max_ms)
}

/// Process an incoming IGMP message. Queries arm a randomized report-delay
/// timer per matching group; a report from another host cancels our own
/// pending timer for that group.
pub fn on_recv(stack: &mut Stack, ifindex: u8, msg: &Message, now_ms: u64) {
    match msg.msg_type {
        TYPE_MEMBERSHIP_QUERY => {
            let groups: Vec<Ipv4Addr> = if msg.group.is_unspecified() {
                stack
                    .ifaces
                    .get(ifindex)
                    .map(|i| i.mcast_v4.groups().filter(|g| *g != ALL_SYSTEMS).collect())
                    .unwrap_or_default()
            } else {
                alloc::vec![msg.group]
            };
            for group in groups {
                let delay = random_delay(now_ms, ifindex, group, msg.max_resp_time_ms.max(1));
                if let Some(timer) = stack.igmp.timer_mut(ifindex, group) {
                    timer.state = ReportState::DelayingReport;
                    timer.delay_ms = timer.delay_ms.min(delay);
                } else {
                    let _ = stack.igmp.timers.push(GroupTimer {
                        ifindex,
                        group,
                        state: ReportState::DelayingReport,
                        delay_ms: delay,
                    });
                }
            }
        }
        TYPE_V1_MEMBERSHIP_REPORT | TYPE_V2_MEMBERSHIP_REPORT => {
            if let Some(timer) = stack.igmp.timer_mut(ifindex, msg.group) {
                timer.state = ReportState::Idle;
            }
        }
        _ => {}
    }
}

/// Periodic IGMP daemon tick (100 ms cadence). Fires any report timer whose
/// delay has elapsed.
pub fn tick(stack: &mut Stack, dt_ms: u64) {
    let due: Vec<(u8, Ipv4Addr)> = stack
        .igmp
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
    stack.igmp.timers.retain(|t| !(due.contains(&(t.ifindex, t.group)) && t.state == ReportState::DelayingReport));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips() {
        let body = Message::encode(TYPE_V2_MEMBERSHIP_REPORT, Ipv4Addr::new(224, 0, 0, 5));
        let msg = Message::decode(&body).unwrap();
        assert_eq!(msg.msg_type, TYPE_V2_MEMBERSHIP_REPORT);
        assert_eq!(msg.group, Ipv4Addr::new(224, 0, 0, 5));
    }
}
