//! Per-address routing table and longest-prefix-match lookup.

use core::net::IpAddr;

use crate::config::MAX_ROUTES_PER_L3;

#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    pub network: IpAddr,
    pub prefix_len: u8,
    /// `None` means "connected" (directly on-link, no next hop).
    pub gateway: Option<IpAddr>,
    pub metric: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    entries: heapless::Vec<RouteEntry, MAX_ROUTES_PER_L3>,
}

fn prefix_matches(addr: IpAddr, network: IpAddr, prefix_len: u8) -> bool {
    match (addr, network) {
        (IpAddr::V4(a), IpAddr::V4(n)) => {
            if prefix_len > 32 {
                return false;
            }
            let mask = if prefix_len == 0 {
                0u32
            } else {
                u32::MAX << (32 - prefix_len)
            };
            (u32::from(a) & mask) == (u32::from(n) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            if prefix_len > 128 {
                return false;
            }
            let mask = if prefix_len == 0 {
                0u128
            } else {
                u128::MAX << (128 - prefix_len)
            };
            (u128::from(a) & mask) == (u128::from(n) & mask)
        }
        _ => false,
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: RouteEntry) -> Result<(), RouteEntry> {
        self.entries.push(entry)
    }

    pub fn remove_matching(&mut self, network: IpAddr, prefix_len: u8) {
        let kept: heapless::Vec<RouteEntry, MAX_ROUTES_PER_L3> = self
            .entries
            .iter()
            .filter(|e| !(e.network == network && e.prefix_len == prefix_len))
            .copied()
            .collect();
        self.entries = kept;
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Longest-prefix match, tie-broken by lowest metric.
    pub fn lookup(&self, dst: IpAddr) -> Option<RouteEntry> {
        let mut best: Option<RouteEntry> = None;
        for e in self.entries.iter() {
            if !prefix_matches(dst, e.network, e.prefix_len) {
                continue;
            }
            best = Some(match best {
                None => *e,
                Some(b) => {
                    if e.prefix_len > b.prefix_len
                        || (e.prefix_len == b.prefix_len && e.metric < b.metric)
                    {
                        *e
                    } else {
                        b
                    }
                }
            });
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv4Addr;

    #[test]
    fn longest_prefix_wins_tie_broken_by_metric() {
        let mut t = RoutingTable::new();
        t.insert(RouteEntry {
            network: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
            prefix_len: 8,
            gateway: None,
            metric: 1,
        })
        .unwrap();
        t.insert(RouteEntry {
            network: IpAddr::V4(Ipv4Addr::new(10, 0, 1, 0)),
            prefix_len: 24,
            gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            metric: 5,
        })
        .unwrap();
        t.insert(RouteEntry {
            network: IpAddr::V4(Ipv4Addr::new(10, 0, 1, 0)),
            prefix_len: 24,
            gateway: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
            metric: 2,
        })
        .unwrap();

        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 42));
        let hit = t.lookup(dst).unwrap();
        assert_eq!(hit.prefix_len, 24);
        assert_eq!(hit.metric, 2);
    }
}
