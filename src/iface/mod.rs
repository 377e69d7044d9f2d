//! Interface manager: owns all L2/L3 state and gatekeeps every
//! address/route/multicast change.

pub mod l2;
pub mod l3v4;
pub mod l3v6;
pub mod mcast;
pub mod route;

use alloc::sync::Arc;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::config::{MAX_L2_INTERFACES, MAX_L3V4_PER_L2, MAX_L3V6_PER_L2};
use crate::error::{Error, Result};
use crate::ethernet::MacAddr;
use crate::iface::l2::{DriverCtx, L2Interface, L2Kind};
use crate::iface::l3v4::{
    compute_broadcast, contiguous_mask, is_network_or_broadcast_addr, L3V4Address, V4Mode,
    V4RuntimeOptions,
};
use crate::iface::l3v6::{
    is_unique_local, link_local_from_iid, modified_eui64, DadState, Dhcpv6AddrState, L3V6Address,
    RaCache, V6Config, V6Kind,
};
use crate::iface::mcast::MembershipChange;
use crate::iface::route::RoutingTable;
use crate::types::L3Id;

/// Driver hook: synchronize the NIC's hardware multicast filter with the
/// union of all joined groups on an interface. The
/// interface manager calls this on every membership change; the embedding
/// kernel supplies the implementation (driver-specific, out of scope here).
pub trait MulticastFilter {
    fn sync(&self, ifindex: u8, macs: &[MacAddr]);
}

pub struct InterfaceManager {
    interfaces: heapless::Vec<L2Interface, MAX_L2_INTERFACES>,
    next_ifindex: u8,
    filter: Option<Arc<dyn MulticastFilter + Send + Sync>>,
}

impl InterfaceManager {
    pub fn new() -> Self {
        Self {
            interfaces: heapless::Vec::new(),
            next_ifindex: 1,
            filter: None,
        }
    }

    pub fn set_multicast_filter(&mut self, filter: Arc<dyn MulticastFilter + Send + Sync>) {
        self.filter = Some(filter);
    }

    pub fn count(&self) -> usize {
        self.interfaces.len()
    }

    pub fn at(&self, idx: usize) -> Option<&L2Interface> {
        self.interfaces.get(idx)
    }

    pub fn at_mut(&mut self, idx: usize) -> Option<&mut L2Interface> {
        self.interfaces.get_mut(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &L2Interface> {
        self.interfaces.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut L2Interface> {
        self.interfaces.iter_mut()
    }

    pub fn get(&self, ifindex: u8) -> Option<&L2Interface> {
        self.interfaces.iter().find(|i| i.ifindex == ifindex)
    }

    pub fn get_mut(&mut self, ifindex: u8) -> Option<&mut L2Interface> {
        self.interfaces.iter_mut().find(|i| i.ifindex == ifindex)
    }

    // ---- L2 lifecycle ----------------------------------------------------

    pub fn create_l2(
        &mut self,
        name: &str,
        driver_ctx: Option<DriverCtx>,
        base_metric: u32,
        kind: L2Kind,
        mac: MacAddr,
    ) -> Result<u8> {
        let ifindex = self.next_ifindex;
        if ifindex == 0 || self.interfaces.len() >= MAX_L2_INTERFACES {
            return Err(Error::Sys);
        }
        let name: heapless::String<15> = name.parse().map_err(|_| Error::Inval)?;
        let iface = L2Interface {
            ifindex,
            name,
            up: false,
            kind,
            base_metric,
            driver_ctx,
            mac,
            has_arp: kind != L2Kind::Localhost,
            has_ndp: kind != L2Kind::Localhost,
            v4: heapless::Vec::new(),
            v6: heapless::Vec::new(),
            mcast_v4: Default::default(),
            mcast_v6: Default::default(),
        };
        self.interfaces.push(iface).map_err(|_| Error::Sys)?;
        self.next_ifindex = self.next_ifindex.wrapping_add(1);
        debug!("iface: created l2 ifindex={ifindex}");
        Ok(ifindex)
    }

    pub fn destroy_l2(&mut self, ifindex: u8) -> Result<()> {
        let iface = self.get(ifindex).ok_or(Error::Inval)?;
        if !iface.v4.is_empty() || !iface.v6.is_empty() {
            return Err(Error::State);
        }
        let idx = self
            .interfaces
            .iter()
            .position(|i| i.ifindex == ifindex)
            .ok_or(Error::Inval)?;
        self.interfaces.swap_remove(idx);
        Ok(())
    }

    pub fn set_up(&mut self, ifindex: u8, up: bool) -> Result<()> {
        let iface = self.get_mut(ifindex).ok_or(Error::Inval)?;
        iface.up = up;
        Ok(())
    }

    // ---- v4 address management -------------------------------------------

    fn ip_in_use_system_wide(&self, ip: Ipv4Addr) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.v4.iter().any(|a| a.ip == ip))
    }

    fn subnet_overlaps_on_l2(&self, iface: &L2Interface, ip: Ipv4Addr, mask: Ipv4Addr) -> bool {
        let new_net = u32::from(ip) & u32::from(mask);
        iface.v4.iter().any(|a| {
            let existing_net = u32::from(a.network());
            let m = u32::from(mask).min(u32::from(a.mask));
            (new_net & m) == (existing_net & m)
        })
    }

    fn alloc_v4_slot(iface: &L2Interface) -> Option<u8> {
        (0..MAX_L3V4_PER_L2 as u8).find(|s| iface.v4.iter().all(|a| a.id.slot() != *s))
    }

    pub fn add_v4(
        &mut self,
        ifindex: u8,
        ip: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        mode: V4Mode,
        options: V4RuntimeOptions,
    ) -> Result<L3Id> {
        let is_loopback = ip.is_loopback();
        {
            let iface = self.get(ifindex).ok_or(Error::Inval)?;
            if mode == V4Mode::Static {
                if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
                    return Err(Error::Inval);
                }
                if is_loopback && iface.kind != L2Kind::Localhost {
                    return Err(Error::Inval);
                }
                if !contiguous_mask(mask) {
                    return Err(Error::Inval);
                }
                if is_network_or_broadcast_addr(ip, mask) {
                    return Err(Error::Inval);
                }
                if self.subnet_overlaps_on_l2(iface, ip, mask) {
                    return Err(Error::Inval);
                }
            }
            if mode == V4Mode::Dhcp && iface.has_dhcp_v4() {
                return Err(Error::State);
            }
            if self.ip_in_use_system_wide(ip) {
                return Err(Error::Inval);
            }
        }

        let iface = self.get_mut(ifindex).ok_or(Error::Inval)?;
        let slot = Self::alloc_v4_slot(iface).ok_or(Error::Sys)?;
        let id = L3Id::new(ifindex, slot, false);
        let addr = L3V4Address {
            id,
            ifindex,
            ip,
            mask,
            gateway,
            broadcast: compute_broadcast(ip, mask),
            mode,
            localhost: is_loopback,
            options,
            routes: RoutingTable::new(),
        };
        iface.v4.push(addr).map_err(|_| Error::Sys)?;
        debug!("iface: add_v4 ifindex={ifindex} ip={ip} id={id:?}");
        Ok(id)
    }

    pub fn update_v4(&mut self, id: L3Id, f: impl FnOnce(&mut L3V4Address)) -> Result<()> {
        let iface = self.get_mut(id.ifindex()).ok_or(Error::Inval)?;
        let addr = iface.v4_slot_mut(id).ok_or(Error::Inval)?;
        f(addr);
        Ok(())
    }

    pub fn remove_v4(&mut self, id: L3Id) -> Result<()> {
        let iface = self.get_mut(id.ifindex()).ok_or(Error::Inval)?;
        let idx = iface
            .v4
            .iter()
            .position(|a| a.id == id)
            .ok_or(Error::Inval)?;
        iface.v4.swap_remove(idx);
        Ok(())
    }

    // ---- v6 address management -------------------------------------------

    fn alloc_v6_slot(iface: &L2Interface) -> Option<u8> {
        (0..MAX_L3V6_PER_L2 as u8).find(|s| iface.v6.iter().all(|a| a.id.slot() != *s))
    }

    pub fn add_v6(
        &mut self,
        ifindex: u8,
        addr: Ipv6Addr,
        prefix_len: u8,
        gateway: Option<Ipv6Addr>,
        config: V6Config,
        kind: V6Kind,
    ) -> Result<L3Id> {
        {
            let iface = self.get(ifindex).ok_or(Error::Inval)?;
            if prefix_len > 128 {
                return Err(Error::Inval);
            }
            if addr.is_multicast() {
                return Err(Error::Inval);
            }
            if addr.is_loopback() && iface.kind != L2Kind::Localhost {
                return Err(Error::Inval);
            }
            if is_unique_local(addr) {
                return Err(Error::Inval);
            }
            if kind.contains(V6Kind::LINK_LOCAL) && iface.enabled_link_local().is_some() {
                return Err(Error::State);
            }
            if kind.contains(V6Kind::GLOBAL)
                && !addr.is_loopback()
                && iface.enabled_link_local().is_none()
            {
                return Err(Error::State);
            }
            if iface
                .v6
                .iter()
                .any(|a| a.addr == addr && a.prefix_len == prefix_len)
            {
                return Err(Error::Inval);
            }
        }

        let iface = self.get_mut(ifindex).ok_or(Error::Inval)?;
        let slot = Self::alloc_v6_slot(iface).ok_or(Error::Sys)?;
        let id = L3Id::new(ifindex, slot, true);
        let entry = L3V6Address {
            id,
            ifindex,
            addr,
            prefix_len,
            gateway,
            kind,
            config,
            localhost: addr.is_loopback(),
            preferred_lifetime_secs: 0,
            valid_lifetime_secs: 0,
            mtu: L3V6Address::DEFAULT_MTU,
            iid: [0; 8],
            dad_state: if addr.is_loopback() {
                DadState::Ok
            } else {
                DadState::None
            },
            dad_requested: !addr.is_loopback() && config != V6Config::Disable,
            dad_timer_ms: 0,
            dad_probes_sent: 0,
            rs_timer_ms: 0,
            rs_sent: 0,
            dhcpv6_state: Dhcpv6AddrState::None,
            dhcpv6_stateless: false,
            ra: RaCache::default(),
            routes: RoutingTable::new(),
        };
        iface.v6.push(entry).map_err(|_| Error::Sys)?;
        debug!("iface: add_v6 ifindex={ifindex} addr={addr} id={id:?}");
        Ok(id)
    }

    pub fn update_v6(&mut self, id: L3Id, f: impl FnOnce(&mut L3V6Address)) -> Result<()> {
        let iface = self.get_mut(id.ifindex()).ok_or(Error::Inval)?;
        let addr = iface.v6_slot_mut(id).ok_or(Error::Inval)?;
        f(addr);
        Ok(())
    }

    pub fn remove_v6(&mut self, id: L3Id) -> Result<()> {
        let iface = self.get_mut(id.ifindex()).ok_or(Error::Inval)?;
        let idx = iface
            .v6
            .iter()
            .position(|a| a.id == id)
            .ok_or(Error::Inval)?;
        iface.v6.swap_remove(idx);
        Ok(())
    }

    /// A link-local may not be disabled while any enabled GLOBAL still
    /// references it.
    pub fn set_enabled_v6(&mut self, id: L3Id, enabled: bool) -> Result<()> {
        let iface = self.get(id.ifindex()).ok_or(Error::Inval)?;
        let addr = iface.v6_slot(id).ok_or(Error::Inval)?;
        if !enabled && addr.kind.contains(V6Kind::LINK_LOCAL) {
            let any_global_enabled = iface
                .v6
                .iter()
                .any(|a| a.kind.contains(V6Kind::GLOBAL) && a.is_enabled());
            if any_global_enabled {
                return Err(Error::State);
            }
        }
        let iface = self.get_mut(id.ifindex()).unwrap();
        let addr = iface.v6_slot_mut(id).unwrap();
        addr.config = if enabled { addr.config } else { V6Config::Disable };
        Ok(())
    }

    // ---- lookups -----------------------------------------------------------

    pub fn find_by_id_v4(&self, id: L3Id) -> Option<&L3V4Address> {
        self.get(id.ifindex())?.v4_slot(id)
    }

    pub fn find_by_id_v6(&self, id: L3Id) -> Option<&L3V6Address> {
        self.get(id.ifindex())?.v6_slot(id)
    }

    pub fn find_by_ip(&self, ip: IpAddr) -> Option<L3Id> {
        match ip {
            IpAddr::V4(ip) => self.interfaces.iter().find_map(|i| {
                i.v4.iter().find(|a| a.ip == ip).map(|a| a.id)
            }),
            IpAddr::V6(ip) => self.interfaces.iter().find_map(|i| {
                i.v6.iter().find(|a| a.addr == ip).map(|a| a.id)
            }),
        }
    }

    /// Best L3 address on `ifindex` whose unicast prefix contains `dst`;
    /// longest prefix first, ties broken by the interface's base metric.
    /// Off-link destinations fall back to a routing-table hit on any local
    /// address, then to any address with a configured gateway.
    pub fn resolve_ipv4_to_interface(&self, dst: Ipv4Addr) -> Option<L3Id> {
        let mut best: Option<(L3Id, u8)> = None;
        for iface in self.interfaces.iter() {
            for a in iface.v4.iter() {
                if a.mode == V4Mode::Disabled {
                    continue;
                }
                if a.ip == dst || a.contains(dst) {
                    let plen = a.prefix_len();
                    let better = match best {
                        None => true,
                        Some((_, bp)) => a.ip == dst || plen > bp,
                    };
                    if better {
                        best = Some((a.id, if a.ip == dst { 32 } else { plen }));
                    }
                }
            }
        }
        if let Some((id, _)) = best {
            return Some(id);
        }
        for iface in self.interfaces.iter() {
            for a in iface.v4.iter() {
                if a.mode != V4Mode::Disabled && a.routes.lookup(IpAddr::V4(dst)).is_some() {
                    return Some(a.id);
                }
            }
        }
        for iface in self.interfaces.iter() {
            for a in iface.v4.iter() {
                if a.mode != V4Mode::Disabled && a.gateway.is_some() {
                    return Some(a.id);
                }
            }
        }
        None
    }

    /// Same fallback chain as [`Self::resolve_ipv4_to_interface`], for IPv6.
    pub fn resolve_ipv6_to_interface(&self, dst: Ipv6Addr) -> Option<L3Id> {
        let mut best: Option<(L3Id, u8)> = None;
        for iface in self.interfaces.iter() {
            for a in iface.v6.iter() {
                if !a.is_enabled() {
                    continue;
                }
                if a.addr == dst || a.contains(dst) {
                    let plen = a.prefix_len;
                    let better = match best {
                        None => true,
                        Some((_, bp)) => a.addr == dst || plen > bp,
                    };
                    if better {
                        best = Some((a.id, if a.addr == dst { 128 } else { plen }));
                    }
                }
            }
        }
        if let Some((id, _)) = best {
            return Some(id);
        }
        for iface in self.interfaces.iter() {
            for a in iface.v6.iter() {
                if a.is_enabled() && a.routes.lookup(IpAddr::V6(dst)).is_some() {
                    return Some(a.id);
                }
            }
        }
        for iface in self.interfaces.iter() {
            for a in iface.v6.iter() {
                if a.is_enabled() && a.gateway.is_some() {
                    return Some(a.id);
                }
            }
        }
        None
    }

    /// The gateway/route-derived next hop for `dst` egressing `ifindex`,
    /// or `dst` itself when it's directly on-link -- this is the address
    /// ARP/NDP should resolve to an L2 next hop, distinct from the IPv4
    /// header's destination field which always carries the real `dst`.
    pub fn next_hop_v4(&self, ifindex: u8, dst: Ipv4Addr) -> Ipv4Addr {
        let Some(iface) = self.get(ifindex) else { return dst };
        for a in iface.v4.iter() {
            if a.mode != V4Mode::Disabled && (a.ip == dst || a.contains(dst)) {
                return dst;
            }
        }
        for a in iface.v4.iter() {
            if a.mode == V4Mode::Disabled {
                continue;
            }
            if let Some(hit) = a.routes.lookup(IpAddr::V4(dst)) {
                return match hit.gateway {
                    Some(IpAddr::V4(gw)) => gw,
                    _ => dst,
                };
            }
        }
        for a in iface.v4.iter() {
            if a.mode != V4Mode::Disabled {
                if let Some(gw) = a.gateway {
                    return gw;
                }
            }
        }
        dst
    }

    /// IPv6 counterpart of [`Self::next_hop_v4`].
    pub fn next_hop_v6(&self, ifindex: u8, dst: Ipv6Addr) -> Ipv6Addr {
        let Some(iface) = self.get(ifindex) else { return dst };
        for a in iface.v6.iter() {
            if a.is_enabled() && (a.addr == dst || a.contains(dst)) {
                return dst;
            }
        }
        for a in iface.v6.iter() {
            if !a.is_enabled() {
                continue;
            }
            if let Some(hit) = a.routes.lookup(IpAddr::V6(dst)) {
                return match hit.gateway {
                    Some(IpAddr::V6(gw)) => gw,
                    _ => dst,
                };
            }
        }
        for a in iface.v6.iter() {
            if a.is_enabled() {
                if let Some(gw) = a.gateway {
                    return gw;
                }
            }
        }
        dst
    }

    // ---- multicast ----------------------------------------------------------

    fn sync_filter(&self, ifindex: u8) {
        let Some(filter) = &self.filter else { return };
        let Some(iface) = self.get(ifindex) else {
            return;
        };
        let mut macs: heapless::Vec<MacAddr, { 2 * crate::config::MAX_MCAST_GROUPS_PER_L2 }> =
            heapless::Vec::new();
        for g in iface.mcast_v4.groups() {
            let _ = macs.push(MacAddr::ipv4_multicast(g));
        }
        for g in iface.mcast_v6.groups() {
            let _ = macs.push(MacAddr::ipv6_multicast(g));
        }
        filter.sync(ifindex, &macs);
    }

    pub fn ipv4_mcast_join(&mut self, ifindex: u8, group: Ipv4Addr) -> Result<MembershipChange> {
        let iface = self.get_mut(ifindex).ok_or(Error::Inval)?;
        let change = iface.mcast_v4.join(group).map_err(|_| Error::Sys)?;
        if change == MembershipChange::Joined {
            self.sync_filter(ifindex);
        }
        Ok(change)
    }

    pub fn ipv4_mcast_leave(&mut self, ifindex: u8, group: Ipv4Addr) -> Result<MembershipChange> {
        let iface = self.get_mut(ifindex).ok_or(Error::Inval)?;
        let change = iface.mcast_v4.leave(group);
        if change == MembershipChange::Left {
            self.sync_filter(ifindex);
        }
        Ok(change)
    }

    pub fn ipv6_mcast_join(&mut self, ifindex: u8, group: Ipv6Addr) -> Result<MembershipChange> {
        let iface = self.get_mut(ifindex).ok_or(Error::Inval)?;
        let change = iface.mcast_v6.join(group).map_err(|_| Error::Sys)?;
        if change == MembershipChange::Joined {
            self.sync_filter(ifindex);
        }
        Ok(change)
    }

    pub fn ipv6_mcast_leave(&mut self, ifindex: u8, group: Ipv6Addr) -> Result<MembershipChange> {
        let iface = self.get_mut(ifindex).ok_or(Error::Inval)?;
        let change = iface.mcast_v6.leave(group);
        if change == MembershipChange::Left {
            self.sync_filter(ifindex);
        }
        Ok(change)
    }

    // ---- bootstrap & autoconfig ---------------------------------------------

    /// Install 127.0.0.1/8 and ::1/128 plus required multicast memberships
    /// on a fresh LOCALHOST L2.
    pub fn bootstrap_localhost(&mut self) {
        let ifindex = self
            .create_l2("lo", None, 0, L2Kind::Localhost, MacAddr::ZERO)
            .expect("iface: failed to create localhost");
        self.add_v4(
            ifindex,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::new(255, 0, 0, 0),
            None,
            V4Mode::Static,
            V4RuntimeOptions::default(),
        )
        .expect("iface: failed to add 127.0.0.1/8");
        self.add_v6(
            ifindex,
            Ipv6Addr::LOCALHOST,
            128,
            None,
            V6Config::Static,
            V6Kind::LINK_LOCAL,
        )
        .expect("iface: failed to add ::1/128");
        let _ = self.set_up(ifindex, true);
    }

    /// Autoconfigure a freshly-created non-localhost L2: a DHCP v4 slot if none exists, a SLAAC link-local
    /// derived from the MAC if none exists, and a placeholder GUA SLAAC
    /// slot to receive router advertisements if none exists.
    pub fn autoconfig_l2(&mut self, ifindex: u8) -> Result<()> {
        let iface = self.get(ifindex).ok_or(Error::Inval)?;
        if iface.kind == L2Kind::Localhost {
            return Ok(());
        }

        if iface.v4.is_empty() {
            self.add_v4(
                ifindex,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                None,
                V4Mode::Dhcp,
                V4RuntimeOptions::default(),
            )?;
        }

        let iface = self.get(ifindex).ok_or(Error::Inval)?;
        if iface.enabled_link_local().is_none() {
            let iid = modified_eui64(&iface.mac);
            let lla = link_local_from_iid(iid);
            let id = self.add_v6(
                ifindex,
                lla,
                64,
                None,
                V6Config::Slaac,
                V6Kind::LINK_LOCAL,
            )?;
            self.update_v6(id, |a| a.iid = iid)?;
        }

        let iface = self.get(ifindex).ok_or(Error::Inval)?;
        if !iface.has_gua() {
            self.add_v6(
                ifindex,
                Ipv6Addr::new(0x2000, 0, 0, 0, 0, 0, 0, 0),
                128,
                None,
                V6Config::Slaac,
                V6Kind::GLOBAL,
            )?;
        }
        Ok(())
    }
}

impl Default for InterfaceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_manager() -> InterfaceManager {
        InterfaceManager::new()
    }

    #[test]
    fn localhost_bootstrap_installs_addresses() {
        let mut m = new_manager();
        m.bootstrap_localhost();
        assert_eq!(m.count(), 1);
        assert!(m.find_by_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)).is_some());
        assert!(m.find_by_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)).is_some());
    }

    #[test]
    fn static_v4_rejects_network_and_broadcast_addrs() {
        let mut m = new_manager();
        let idx = m
            .create_l2("eth0", None, 10, L2Kind::Eth, MacAddr([1, 2, 3, 4, 5, 6]))
            .unwrap();
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        assert!(m
            .add_v4(
                idx,
                Ipv4Addr::new(192, 168, 1, 0),
                mask,
                None,
                V4Mode::Static,
                Default::default()
            )
            .is_err());
        assert!(m
            .add_v4(
                idx,
                Ipv4Addr::new(192, 168, 1, 255),
                mask,
                None,
                V4Mode::Static,
                Default::default()
            )
            .is_err());
        assert!(m
            .add_v4(
                idx,
                Ipv4Addr::new(192, 168, 1, 10),
                mask,
                Some(Ipv4Addr::new(192, 168, 1, 1)),
                V4Mode::Static,
                Default::default()
            )
            .is_ok());
    }

    #[test]
    fn dhcp_limited_to_one_per_l2() {
        let mut m = new_manager();
        let idx = m
            .create_l2("eth0", None, 10, L2Kind::Eth, MacAddr([1, 2, 3, 4, 5, 6]))
            .unwrap();
        assert!(m
            .add_v4(
                idx,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                None,
                V4Mode::Dhcp,
                Default::default()
            )
            .is_ok());
        assert!(m
            .add_v4(
                idx,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                None,
                V4Mode::Dhcp,
                Default::default()
            )
            .is_err());
    }

    #[test]
    fn global_requires_link_local_first() {
        let mut m = new_manager();
        let idx = m
            .create_l2("eth0", None, 10, L2Kind::Eth, MacAddr([1, 2, 3, 4, 5, 6]))
            .unwrap();
        let gua: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert!(m
            .add_v6(idx, gua, 64, None, V6Config::Static, V6Kind::GLOBAL)
            .is_err());
        let lla: Ipv6Addr = "fe80::1".parse().unwrap();
        m.add_v6(idx, lla, 64, None, V6Config::Static, V6Kind::LINK_LOCAL)
            .unwrap();
        assert!(m
            .add_v6(idx, gua, 64, None, V6Config::Static, V6Kind::GLOBAL)
            .is_ok());
    }

    #[test]
    fn autoconfig_installs_dhcp_lla_and_placeholder_gua() {
        let mut m = new_manager();
        let idx = m
            .create_l2("eth0", None, 10, L2Kind::Eth, MacAddr([1, 2, 3, 4, 5, 6]))
            .unwrap();
        m.autoconfig_l2(idx).unwrap();
        let iface = m.get(idx).unwrap();
        assert!(iface.has_dhcp_v4());
        assert!(iface.enabled_link_local().is_some());
        assert!(iface.has_gua());
    }
}
