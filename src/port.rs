//! Port manager: one bind table per transport protocol, generalizing a
//! single global `udp::HANDLERS: RwLock<BTreeMap<u16, ...>>` into a
//! per-`Stack` table that also tracks which local address (or "any") a port
//! is bound to, since this stack is multi-interface rather than single-NIC.

use core::net::IpAddr;

use crate::config::{EPHEMERAL_PORT_END, EPHEMERAL_PORT_START, MAX_TCP_FLOWS};
use crate::error::{Error, Result};
use crate::types::{BindSpec, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    port: u16,
    addr: Option<IpAddr>,
    owner: u32,
}

/// Bound ports for one protocol (TCP or UDP). Sized at `MAX_TCP_FLOWS`
/// since a bound port always backs at most one flow/socket and the flow
/// table is already bounded to that count.
struct PortTable {
    binds: heapless::Vec<Binding, MAX_TCP_FLOWS>,
    next_ephemeral: u16,
}

impl PortTable {
    fn new() -> Self {
        Self {
            binds: heapless::Vec::new(),
            next_ephemeral: EPHEMERAL_PORT_START,
        }
    }

    fn conflicts(&self, port: u16, addr: Option<IpAddr>) -> bool {
        self.binds.iter().any(|b| {
            b.port == port
                && match (b.addr, addr) {
                    (None, _) | (_, None) => true,
                    (Some(a), Some(c)) => a == c,
                }
        })
    }

    fn bind(&mut self, port: u16, addr: Option<IpAddr>, owner: u32) -> Result<()> {
        if self.conflicts(port, addr) {
            return Err(Error::Bound);
        }
        self.binds.push(Binding { port, addr, owner }).map_err(|_| Error::Sys)
    }

    fn alloc_ephemeral(&mut self, addr: Option<IpAddr>, owner: u32) -> Result<u16> {
        let start = self.next_ephemeral;
        let mut port = start;
        loop {
            if !self.conflicts(port, addr) {
                let _ = self.bind(port, addr, owner);
                self.next_ephemeral = if port == EPHEMERAL_PORT_END {
                    EPHEMERAL_PORT_START
                } else {
                    port + 1
                };
                return Ok(port);
            }
            port = if port == EPHEMERAL_PORT_END {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            if port == start {
                return Err(Error::NoPort);
            }
        }
    }

    /// Removes every binding owned by `owner` on `port`: a multi-address
    /// bind (`L2`) registers one [`Binding`] per address, and they must all
    /// go together.
    fn unbind(&mut self, port: u16, owner: u32) -> Result<()> {
        let before = self.binds.len();
        self.binds.retain(|b| !(b.port == port && b.owner == owner));
        if self.binds.len() == before {
            return Err(Error::Perm);
        }
        Ok(())
    }

    fn owner_of(&self, port: u16, addr: IpAddr) -> Option<u32> {
        self.binds
            .iter()
            .find(|b| b.port == port && (b.addr.is_none() || b.addr == Some(addr)))
            .map(|b| b.owner)
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PortManagers {
    tcp: PortTable,
    udp: PortTable,
}

impl PortManagers {
    pub fn new() -> Self {
        Self {
            tcp: PortTable::new(),
            udp: PortTable::new(),
        }
    }

    fn table_mut(&mut self, protocol: Protocol) -> &mut PortTable {
        match protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
        }
    }

    fn table(&self, protocol: Protocol) -> &PortTable {
        match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    /// Bind `owner` (an opaque socket id) to `port` on a single address (or
    /// the wildcard) for `protocol`, or allocate an ephemeral port if `port`
    /// is 0. Use [`Self::bind_addrs`] for a multi-address bind.
    pub fn bind(&mut self, protocol: Protocol, spec: BindSpec, port: u16, owner: u32) -> Result<u16> {
        let addr = match spec {
            BindSpec::Any | BindSpec::L3(_) | BindSpec::L2(_) => None,
            BindSpec::Ip(ip) => Some(ip),
        };
        let table = self.table_mut(protocol);
        if port == 0 {
            table.alloc_ephemeral(addr, owner)
        } else {
            table.bind(port, addr, owner).map(|_| port)
        }
    }

    /// Bind `owner` to `port` on every address in `addrs`: used for
    /// `BindSpec::L2` binds that expand to the concrete set of a
    /// interface's L3 addresses. If `port` is 0 an ephemeral port is
    /// allocated against the first address and reused for the rest. Any
    /// failure (typically a conflicting bind on one address) rolls back
    /// every binding already made for `owner` on the chosen port.
    pub fn bind_addrs(&mut self, protocol: Protocol, addrs: &[IpAddr], port: u16, owner: u32) -> Result<u16> {
        if addrs.is_empty() {
            return Err(Error::Proto);
        }
        let table = self.table_mut(protocol);
        let bound_port = if port == 0 {
            table.alloc_ephemeral(Some(addrs[0]), owner)?
        } else {
            table.bind(port, Some(addrs[0]), owner)?;
            port
        };
        for addr in &addrs[1..] {
            if let Err(e) = table.bind(bound_port, Some(*addr), owner) {
                table.binds.retain(|b| !(b.port == bound_port && b.owner == owner));
                return Err(e);
            }
        }
        Ok(bound_port)
    }

    pub fn unbind(&mut self, protocol: Protocol, port: u16, owner: u32) -> Result<()> {
        self.table_mut(protocol).unbind(port, owner)
    }

    pub fn owner_of(&self, protocol: Protocol, port: u16, addr: IpAddr) -> Option<u32> {
        self.table(protocol).owner_of(port, addr)
    }

    pub fn is_bound(&self, protocol: Protocol, port: u16) -> bool {
        self.table(protocol).binds.iter().any(|b| b.port == port)
    }
}

impl Default for PortManagers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_allocation_avoids_collisions() {
        let mut p = PortManagers::new();
        let a = p.bind(Protocol::Udp, BindSpec::Any, 0, 1).unwrap();
        let b = p.bind(Protocol::Udp, BindSpec::Any, 0, 2).unwrap();
        assert_ne!(a, b);
        assert!(a >= EPHEMERAL_PORT_START);
    }

    #[test]
    fn explicit_bind_rejects_conflict_but_allows_different_addr() {
        let mut p = PortManagers::new();
        assert!(p.bind(Protocol::Tcp, BindSpec::Any, 8080, 1).is_ok());
        assert!(p.bind(Protocol::Tcp, BindSpec::Any, 8080, 2).is_err());
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(p.bind(Protocol::Udp, BindSpec::Ip(a), 53, 1).is_ok());
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(p.bind(Protocol::Udp, BindSpec::Ip(b), 53, 2).is_ok());
    }

    #[test]
    fn unbind_frees_port_for_reuse() {
        let mut p = PortManagers::new();
        p.bind(Protocol::Tcp, BindSpec::Any, 443, 1).unwrap();
        p.unbind(Protocol::Tcp, 443, 1).unwrap();
        assert!(p.bind(Protocol::Tcp, BindSpec::Any, 443, 2).is_ok());
    }
}
