//! One L2 interface: a logical NIC.

use alloc::sync::Arc;
use core::any::Any;

use crate::config::{MAX_L3V4_PER_L2, MAX_L3V6_PER_L2};
use crate::iface::l3v4::L3V4Address;
use crate::iface::l3v6::L3V6Address;
use crate::iface::mcast::{McastGroupsV4, McastGroupsV6};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Kind {
    Eth,
    Wifi,
    Other,
    Localhost,
    Unknown,
}

/// Opaque, driver-owned context (NIC DMA is the driver's
/// concern, not this crate's). We just hold a type-erased handle the
/// embedder downcasts back to its own driver type.
pub type DriverCtx = Arc<dyn Any + Send + Sync>;

pub struct L2Interface {
    pub ifindex: u8,
    pub name: heapless::String<15>,
    pub up: bool,
    pub kind: L2Kind,
    pub base_metric: u32,
    pub driver_ctx: Option<DriverCtx>,
    pub mac: crate::ethernet::MacAddr,
    /// `false` for loopback: it has no ARP/NDP neighbor table.
    pub has_arp: bool,
    pub has_ndp: bool,
    pub v4: heapless::Vec<L3V4Address, MAX_L3V4_PER_L2>,
    pub v6: heapless::Vec<L3V6Address, MAX_L3V6_PER_L2>,
    pub mcast_v4: McastGroupsV4,
    pub mcast_v6: McastGroupsV6,
}

impl L2Interface {
    pub fn is_localhost(&self) -> bool {
        self.kind == L2Kind::Localhost
    }

    pub fn v4_slot(&self, id: crate::types::L3Id) -> Option<&L3V4Address> {
        self.v4.iter().find(|a| a.id == id)
    }

    pub fn v4_slot_mut(&mut self, id: crate::types::L3Id) -> Option<&mut L3V4Address> {
        self.v4.iter_mut().find(|a| a.id == id)
    }

    pub fn v6_slot(&self, id: crate::types::L3Id) -> Option<&L3V6Address> {
        self.v6.iter().find(|a| a.id == id)
    }

    pub fn v6_slot_mut(&mut self, id: crate::types::L3Id) -> Option<&mut L3V6Address> {
        self.v6.iter_mut().find(|a| a.id == id)
    }

    pub fn has_dhcp_v4(&self) -> bool {
        self.v4
            .iter()
            .any(|a| a.mode == crate::iface::l3v4::V4Mode::Dhcp)
    }

    pub fn enabled_link_local(&self) -> Option<&L3V6Address> {
        self.v6.iter().find(|a| {
            a.kind.contains(crate::iface::l3v6::V6Kind::LINK_LOCAL) && a.is_enabled()
        })
    }

    pub fn has_gua(&self) -> bool {
        self.v6
            .iter()
            .any(|a| a.kind.contains(crate::iface::l3v6::V6Kind::GLOBAL))
    }
}
