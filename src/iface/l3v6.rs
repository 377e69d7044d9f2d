//! IPv6 address slot on an L2 interface.

use core::net::Ipv6Addr;

use crate::iface::route::RoutingTable;
use crate::types::L3Id;

bitflags::bitflags! {
    /// `GLOBAL` and `LINK_LOCAL` are disjoint per #[derive(Default)]
    pub struct V6Kind: u8 {
        const GLOBAL = 0b01;
        const LINK_LOCAL = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V6Config {
    Disable,
    Static,
    Slaac,
    Dhcpv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DadState {
    None,
    InProgress,
    Ok,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dhcpv6AddrState {
    /// No DHCPv6 interaction for this address.
    None,
    Stateful,
    /// RA carried the O bit only; information-request issued, no lease.
    StatelessDone,
}

/// RA-derived bookkeeping, separate from the static configuration fields so
/// SLAAC/DHCPv6-driven lifetimes don't get confused with operator-set ones.
#[derive(Debug, Clone, Default)]
pub struct RaCache {
    pub has_ra: bool,
    pub autonomous: bool,
    pub is_default: bool,
    pub flags: u8,
    pub last_update_ms: u64,
}

#[derive(Debug, Clone)]
pub struct L3V6Address {
    pub id: L3Id,
    pub ifindex: u8,
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv6Addr>,
    pub kind: V6Kind,
    pub config: V6Config,
    pub localhost: bool,
    pub preferred_lifetime_secs: u32,
    pub valid_lifetime_secs: u32,
    pub mtu: u16,
    pub iid: [u8; 8],
    pub dad_state: DadState,
    pub dad_requested: bool,
    pub dad_timer_ms: u64,
    pub dad_probes_sent: u8,
    pub rs_timer_ms: u64,
    pub rs_sent: u8,
    pub dhcpv6_state: Dhcpv6AddrState,
    pub dhcpv6_stateless: bool,
    pub ra: RaCache,
    pub routes: RoutingTable,
}

impl L3V6Address {
    pub const DEFAULT_MTU: u16 = 1500;

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        if self.prefix_len > 128 {
            return false;
        }
        let mask: u128 = if self.prefix_len == 0 {
            0
        } else {
            u128::MAX << (128 - self.prefix_len)
        };
        (u128::from(addr) & mask) == (u128::from(self.addr) & mask)
    }

    pub fn is_enabled(&self) -> bool {
        self.config != V6Config::Disable
    }

    /// The "placeholder GUA" `2000::/128` used to reserve a SLAAC slot
    /// before a prefix is known.
    pub fn is_placeholder_gua(&self) -> bool {
        self.addr == Ipv6Addr::new(0x2000, 0, 0, 0, 0, 0, 0, 0) && self.prefix_len == 128
    }
}

/// Modified EUI-64 interface identifier derived from a MAC address
/// (RFC 4291 Appendix A), used to build the default link-local and the
/// DUID-LL for DHCPv6.
pub fn modified_eui64(mac: &crate::ethernet::MacAddr) -> [u8; 8] {
    let m = mac.0;
    [
        m[0] ^ 0x02,
        m[1],
        m[2],
        0xff,
        0xfe,
        m[3],
        m[4],
        m[5],
    ]
}

pub fn link_local_from_iid(iid: [u8; 8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = 0xfe;
    octets[1] = 0x80;
    octets[8..16].copy_from_slice(&iid);
    Ipv6Addr::from(octets)
}

pub fn solicited_node_multicast(addr: Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | (o[13] as u16),
        u16::from_be_bytes([o[14], o[15]]),
    )
}

pub fn is_unique_local(addr: Ipv6Addr) -> bool {
    (addr.octets()[0] & 0xfe) == 0xfc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eui64_flips_universal_local_bit() {
        let mac = crate::ethernet::MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let iid = modified_eui64(&mac);
        assert_eq!(iid, [0x02, 0x11, 0x22, 0xff, 0xfe, 0x33, 0x44, 0x55]);
        let lla = link_local_from_iid(iid);
        assert!(lla.octets().starts_with(&[0xfe, 0x80]));
    }

    #[test]
    fn solicited_node_derivation() {
        let addr: Ipv6Addr = "2001:db8::1:2:ff0e:ad1".parse().unwrap();
        let sn = solicited_node_multicast(addr);
        assert_eq!(sn, "ff02::1:ff0e:ad1".parse::<Ipv6Addr>().unwrap());
    }
}
