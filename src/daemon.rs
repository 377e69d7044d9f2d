//! Central daemon driver: the fixed-cadence timers (NDP 1000 ms, IGMP/MLD
//! 100 ms, DHCPv6 250 ms, DNS 250 ms) plus the event-driven TCP timer wheel,
//! behind one [`run`] entry point a single-reactor embedding kernel calls at
//! each `msleep` suspension point described by [`crate::time::Scheduler`].
//!
//! IGMP/MLD and TCP are "lazily started... when timers become pending" per
//! their cadence: [`Daemons::kick_mcast`]/[`Daemons::kick_tcp`] let a socket
//! operation (join/leave, connect/send/close) arm an immediate run instead
//! of waiting for the next fixed tick, and [`run`]'s return value is always
//! the next absolute timestamp at which *some* daemon has work, computed
//! from [`tcp::next_deadline`] and the other daemons' fixed periods, so a
//! kernel that only kicks on state changes still wakes exactly when a timer
//! (e.g. a retransmit timeout) expires with nothing new having happened.

use crate::config::{DAEMON_DHCPV6_TICK_MS, DAEMON_DNS_TICK_MS, DAEMON_IGMP_MLD_TICK_MS, DAEMON_NDP_TICK_MS};
use crate::{dhcpv6, dns, igmp, ipv6, mld, ndp, tcp};
use crate::Stack;

/// Per-daemon last-fired timestamps and kick flags. The embedding kernel
/// owns one of these alongside its `Stack` and drives it with repeated
/// [`run`] calls.
pub struct Daemons {
    last_ndp_ms: u64,
    last_igmp_mld_ms: u64,
    last_dhcpv6_ms: u64,
    last_dns_ms: u64,
    mcast_kick: bool,
    tcp_kick: bool,
}

impl Daemons {
    pub fn new(now_ms: u64) -> Self {
        Self {
            last_ndp_ms: now_ms,
            last_igmp_mld_ms: now_ms,
            last_dhcpv6_ms: now_ms,
            last_dns_ms: now_ms,
            mcast_kick: true,
            tcp_kick: true,
        }
    }

    /// Arm an immediate IGMP/MLD pass: a group was just joined, or a Query
    /// / Report just arrived and report-suppression needs to be re-evaluated.
    pub fn kick_mcast(&mut self) {
        self.mcast_kick = true;
    }

    /// Arm an immediate TCP timer walk: a flow was just created, or a
    /// segment was just sent or received.
    pub fn kick_tcp(&mut self) {
        self.tcp_kick = true;
    }
}

/// Run every daemon whose tick is due or has been kicked, then report the
/// absolute timestamp of the next one due -- the duration the caller's
/// `msleep` should request before calling `run` again.
pub fn run(stack: &mut Stack, daemons: &mut Daemons, now_ms: u64) -> u64 {
    if now_ms.saturating_sub(daemons.last_ndp_ms) >= DAEMON_NDP_TICK_MS {
        let dt_ms = now_ms.saturating_sub(daemons.last_ndp_ms);
        ndp::tick(stack, dt_ms, now_ms);
        ipv6::age_reassembly(stack, dt_ms);
        daemons.last_ndp_ms = now_ms;
    }

    if daemons.mcast_kick || now_ms.saturating_sub(daemons.last_igmp_mld_ms) >= DAEMON_IGMP_MLD_TICK_MS {
        let dt_ms = now_ms.saturating_sub(daemons.last_igmp_mld_ms);
        igmp::tick(stack, dt_ms);
        mld::tick(stack, dt_ms);
        daemons.last_igmp_mld_ms = now_ms;
        daemons.mcast_kick = false;
    }

    if now_ms.saturating_sub(daemons.last_dhcpv6_ms) >= DAEMON_DHCPV6_TICK_MS {
        let dt_ms = now_ms.saturating_sub(daemons.last_dhcpv6_ms);
        dhcpv6::tick(stack, dt_ms, now_ms);
        daemons.last_dhcpv6_ms = now_ms;
    }

    if now_ms.saturating_sub(daemons.last_dns_ms) >= DAEMON_DNS_TICK_MS {
        dns::tick(stack, now_ms);
        daemons.last_dns_ms = now_ms;
    }

    let tcp_due = matches!(tcp::next_deadline(stack, now_ms), Some(t) if now_ms >= t);
    if daemons.tcp_kick || tcp_due {
        tcp::tick(stack, 0, now_ms);
        daemons.tcp_kick = false;
    }

    next_deadline(stack, daemons, now_ms)
}

fn next_deadline(stack: &Stack, daemons: &Daemons, now_ms: u64) -> u64 {
    let mut next = (daemons.last_ndp_ms + DAEMON_NDP_TICK_MS)
        .min(daemons.last_igmp_mld_ms + DAEMON_IGMP_MLD_TICK_MS)
        .min(daemons.last_dhcpv6_ms + DAEMON_DHCPV6_TICK_MS)
        .min(daemons.last_dns_ms + DAEMON_DNS_TICK_MS);
    if let Some(tcp_deadline) = tcp::next_deadline(stack, now_ms) {
        next = next.min(tcp_deadline);
    }
    next.max(now_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_daemons_run_everything_once() {
        let mut stack = Stack::new(crate::config::StackConfig::default());
        let mut daemons = Daemons::new(0);
        run(&mut stack, &mut daemons, 0);
        assert!(!daemons.mcast_kick);
        assert!(!daemons.tcp_kick);
    }

    #[test]
    fn next_deadline_advances_with_fixed_cadences() {
        let mut stack = Stack::new(crate::config::StackConfig::default());
        let mut daemons = Daemons::new(0);
        run(&mut stack, &mut daemons, 0);
        let next = next_deadline(&stack, &daemons, 0);
        assert_eq!(next, DAEMON_IGMP_MLD_TICK_MS);
    }
}
