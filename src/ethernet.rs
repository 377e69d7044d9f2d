//! Ethernet framing. Grounded on `net::ethernet::{MacAddr, Type, Header}`.

use crate::wire::{BytesIn, BytesOut, WireError};
use crate::Stack;

/// The single boundary between this crate and a real NIC (hardware
/// driver DMA paths are out of scope). Generalizes the `net::NetworkDevice`
/// trait (`fn send(&self, packet)`) to a stack that manages many interfaces
/// instead of one default device.
pub trait NetDriver: Send + Sync {
    fn send_frame(&self, ifindex: u8, frame: &[u8]);
}

pub const HEADER_LEN: usize = 14;

#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; 6]);
    pub const ZERO: Self = Self([0; 6]);

    /// Map an IPv4 multicast group's low 23 bits into the reserved
    /// 01:00:5E:xx:xx:xx range.
    pub fn ipv4_multicast(group: core::net::Ipv4Addr) -> Self {
        let o = group.octets();
        Self([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
    }

    /// Map an IPv6 multicast group's low 32 bits into 33:33:xx:xx:xx:xx
    ///.
    pub fn ipv6_multicast(group: core::net::Ipv6Addr) -> Self {
        let o = group.octets();
        Self([0x33, 0x33, o[12], o[13], o[14], o[15]])
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
    Ipv6 = 0x86DD,
}

impl EtherType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0800 => Some(Self::Ipv4),
            0x0806 => Some(Self::Arp),
            0x86DD => Some(Self::Ipv6),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub dest_mac: MacAddr,
    pub src_mac: MacAddr,
    pub ethertype: EtherType,
}

impl Header {
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let mut bytes = BytesIn::new(data);
        let dest_mac = MacAddr(bytes.arr()?);
        let src_mac = MacAddr(bytes.arr()?);
        let ethertype =
            EtherType::from_u16(bytes.u16()?).ok_or(WireError::Underflow /* unknown type */)?;
        Ok((
            Header {
                dest_mac,
                src_mac,
                ethertype,
            },
            bytes.remaining(),
        ))
    }

    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], WireError> {
        let mut bytes = BytesOut::new(buf);
        bytes
            .push(&self.dest_mac.0)?
            .push(&self.src_mac.0)?
            .u16(self.ethertype as u16)?;
        let len = bytes.len();
        Ok(&buf[..len])
    }
}

/// Entry point for a raw frame handed up by [`NetDriver`]: demux by ethertype into ARP / IPv4 / IPv6 input.
pub fn on_recv(stack: &mut Stack, ifindex: u8, frame: &[u8], now_ms: u64) {
    let Ok((header, payload)) = Header::decode(frame) else {
        return;
    };
    if !stack.ifaces.get(ifindex).map(|i| i.up).unwrap_or(false) {
        return;
    }
    match header.ethertype {
        EtherType::Arp => {
            if let Ok(pkt) = crate::arp::ArpPacket::decode(payload) {
                crate::arp::on_recv(stack, ifindex, &pkt);
            }
        }
        EtherType::Ipv4 => crate::ipv4::on_recv(stack, ifindex, header.src_mac, payload, now_ms),
        EtherType::Ipv6 => crate::ipv6::on_recv(stack, ifindex, header.src_mac, payload, now_ms),
    }
}
