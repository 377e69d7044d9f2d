//! Numeric defaults for timers, table sizes, and retry limits, collected so
//! an embedder can retune them in one place.

pub const MAX_L2_INTERFACES: usize = 16;
pub const MAX_L3V4_PER_L2: usize = 4;
pub const MAX_L3V6_PER_L2: usize = 6;
pub const MAX_ROUTES_PER_L3: usize = 8;
pub const MAX_MCAST_GROUPS_PER_L2: usize = 16;

pub const MAX_ARP_ENTRIES: usize = 64;
pub const MAX_NDP_ENTRIES: usize = 64;
pub const ARP_MAX_PROBES: u8 = 3;
pub const NDP_MAX_PROBES: u8 = 3;
pub const ARP_REACHABLE_MS: u64 = 30_000;
pub const NDP_REACHABLE_MS: u64 = 30_000;
pub const NDP_RETRANS_MS: u64 = 1_000;
pub const ARP_RETRANS_MS: u64 = 1_000;
pub const NEIGHBOR_STALE_MS: u64 = 60_000;

pub const DAD_PROBE_INTERVAL_MS: u64 = 1_000;
pub const DAD_MAX_PROBES: u8 = 3;
pub const RS_INTERVAL_MS: u64 = 4_000;
pub const RS_MAX_COUNT: u8 = 3;

pub const PMTU_CACHE_SIZE: usize = 16;
pub const PMTU_AGE_MS: u64 = 10 * 60 * 1000;
pub const IPV6_MIN_MTU: u16 = 1280;
pub const IPV4_DEFAULT_MTU: u16 = 1500;
pub const IPV6_DEFAULT_MTU: u16 = 1500;

pub const REASSEMBLY_TABLE_SIZE: usize = 16;
pub const REASSEMBLY_TIMEOUT_MS: u64 = 60_000;
pub const REASSEMBLY_MAX_FRAGMENTS: usize = 32;

pub const MAX_TCP_FLOWS: usize = 128;
pub const MAX_TX_SEGMENTS: usize = 32;
pub const MAX_REASSEMBLY_SEGMENTS: usize = 16;
pub const TCP_SYN_RETRIES: u8 = 5;
pub const TCP_MAX_SYN_RECEIVED: usize = MAX_TCP_FLOWS / 4;
pub const TCP_MAX_SYN_RECEIVED_PER_PORT: usize = 32;
pub const TCP_MIN_RTO_MS: u64 = 200;
pub const TCP_MAX_RTO_MS: u64 = 60_000;
pub const TCP_INITIAL_RTO_MS: u64 = 1_000;
pub const TCP_DELAYED_ACK_MS: u64 = 200;
pub const TCP_TIME_WAIT_MS: u64 = 2 * 60_000; // 2*MSL, MSL approximated at 60s.
pub const TCP_PERSIST_MIN_MS: u64 = 500;
pub const TCP_PERSIST_MAX_MS: u64 = 60_000;
pub const TCP_MSS_V4_MIN: u16 = 536;
pub const TCP_MSS_V6_MIN: u16 = 1220;
pub const TCP_DEFAULT_RCV_BUF: u32 = 256 * 1024;
pub const MAX_BACKLOG: usize = 32;

pub const EPHEMERAL_PORT_START: u16 = 49152;
pub const EPHEMERAL_PORT_END: u16 = 65535;

pub const DHCPV6_CLIENT_PORT: u16 = 546;
pub const DHCPV6_SERVER_PORT: u16 = 547;
pub const DHCPV6_RETRIES_SHORT: u8 = 3;
pub const DHCPV6_RETRIES_LONG: u8 = 5;
pub const DHCPV6_INITIAL_BACKOFF_MS: u64 = 4_000;
pub const DHCPV6_MAX_BACKOFF_MS: u64 = 64_000;
pub const DHCPV6_JITTER_MS: i64 = 1_000;

pub const DAEMON_NDP_TICK_MS: u64 = 1_000;
pub const DAEMON_IGMP_MLD_TICK_MS: u64 = 100;
pub const DAEMON_DHCPV6_TICK_MS: u64 = 250;
pub const DAEMON_DNS_TICK_MS: u64 = 250;

pub const DNS_CACHE_SIZE: usize = 32;
pub const DNS_QUERY_MAX_BYTES: usize = 512;

/// Grouping of the above so code reads `cfg.max_tcp_flows` where a value is
/// plausibly retuned by an embedder, while the plain `pub const`s above stay
/// available for array sizing (`heapless` containers need `const` generics).
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub max_tcp_flows: usize,
    pub tcp_syn_retries: u8,
    pub ndp_reachable_ms: u64,
    pub arp_reachable_ms: u64,
    pub dad_max_probes: u8,
    pub rs_max_count: u8,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_tcp_flows: MAX_TCP_FLOWS,
            tcp_syn_retries: TCP_SYN_RETRIES,
            ndp_reachable_ms: NDP_REACHABLE_MS,
            arp_reachable_ms: ARP_REACHABLE_MS,
            dad_max_probes: DAD_MAX_PROBES,
            rs_max_count: RS_MAX_COUNT,
        }
    }
}
