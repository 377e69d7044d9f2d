/*
 * Copyright (C) 2021-2023 The Aero Project Developers.
 *
 * This file is part of The Aero Project.
 *
 * Aero is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Aero is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Aero. If not, see <https://www.gnu.org/licenses/>.
 */

//! Kernel-resident TCP/IP networking stack.
//!
//! This crate is the packet-processing spine: interface manager, IPv4/IPv6
//! datapath, ARP/NDP/DHCPv6, and the UDP/TCP transport layer. It is
//! `no_std` + `alloc` and never touches a wall clock or spawns a thread on
//! its own; the embedding kernel supplies both through [`time::Clock`] and
//! [`time::Scheduler`] and drives the daemons in [`daemon`].

#![no_std]
#![allow(clippy::too_many_arguments)]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod arp;
pub mod checksum;
pub mod config;
pub mod daemon;
pub mod dhcpv6;
pub mod dns;
pub mod error;
pub mod ethernet;
pub mod icmpv4;
pub mod icmpv6;
pub mod iface;
pub mod igmp;
pub mod ipv4;
pub mod ipv6;
pub mod mld;
pub mod ndp;
pub mod pktbuf;
pub mod port;
pub mod socket;
pub mod tcp;
pub mod time;
pub mod types;
pub mod udp;
pub mod wire;

pub use error::Error;
pub use iface::InterfaceManager;

/// Every piece of mutable, process-wide state the stack owns, grouped so an
/// embedding kernel holds exactly one of these: global mutable state is
/// acceptable when guarded by a well-defined lifecycle.
pub struct Stack {
    pub driver: Option<alloc::sync::Arc<dyn ethernet::NetDriver>>,
    pub ifaces: iface::InterfaceManager,
    pub arp: arp::ArpTables,
    pub ndp: ndp::NdpTables,
    pub igmp: igmp::IgmpState,
    pub mld: mld::MldState,
    pub ports: port::PortManagers,
    pub udp: udp::UdpState,
    pub tcp: tcp::TcpState,
    pub dhcpv6: dhcpv6::Dhcpv6State,
    pub dns: dns::DnsState,
    pub pmtu: ipv6::PmtuCache,
    pub reassembly: ipv6::ReassemblyTable,
    pub reassembly_v4: ipv4::ReassemblyTable,
    pub icmpv4: icmpv4::IcmpV4State,
    pub icmpv6: icmpv6::IcmpV6State,
    pub config: config::StackConfig,
    ipv4_ident: u16,
    ipv6_ident: u32,
}

impl Stack {
    /// Initialize the stack and install the localhost interface, mirroring
    /// `net::init()`'s bootstrap but generalized to both address families.
    pub fn new(config: config::StackConfig) -> Self {
        let mut ifaces = iface::InterfaceManager::new();
        ifaces.bootstrap_localhost();

        Self {
            driver: None,
            ifaces,
            arp: arp::ArpTables::new(),
            ndp: ndp::NdpTables::new(),
            igmp: igmp::IgmpState::new(),
            mld: mld::MldState::new(),
            ports: port::PortManagers::new(),
            udp: udp::UdpState::new(),
            tcp: tcp::TcpState::new(&config),
            dhcpv6: dhcpv6::Dhcpv6State::new(),
            dns: dns::DnsState::new(),
            pmtu: ipv6::PmtuCache::new(),
            reassembly: ipv6::ReassemblyTable::new(),
            reassembly_v4: ipv4::ReassemblyTable::new(),
            icmpv4: icmpv4::IcmpV4State::new(),
            icmpv6: icmpv6::IcmpV6State::new(),
            config,
            ipv4_ident: 0,
            ipv6_ident: 0,
        }
    }

    pub fn set_driver(&mut self, driver: alloc::sync::Arc<dyn ethernet::NetDriver>) {
        self.driver = Some(driver);
    }

    pub(crate) fn send_frame(&self, ifindex: u8, frame: &[u8]) {
        if let Some(driver) = &self.driver {
            driver.send_frame(ifindex, frame);
        } else {
            warn!("stack: dropped outgoing frame on ifindex={ifindex}, no driver attached");
        }
    }
}
