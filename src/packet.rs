//! Parsed packets handed from input plugins to the flow cache.
//!
//! A [`Packet`] carries header fields up to the transport layer plus the
//! captured payload. Input plugins fill batches of packets into a
//! [`PacketBlock`]; the cache consumes them one by one and marks the
//! direction of each packet relative to its flow via `source_pkt`.

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default capture buffer size per packet.
pub const MAX_PACKET_SIZE: usize = 1600;

/// IP protocol numbers the cache keys on.
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

/// TCP control bits as carried in [`Packet::tcp_flags`].
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}

/// A packet parsed up to the transport layer.
///
/// Scalar fields are host order exactly as delivered by the parser; byte
/// order conversion happens once, in the exporter.
#[derive(Debug, Clone, Serialize)]
pub struct Packet {
    /// Capture timestamp as duration since the unix epoch.
    pub ts: Duration,

    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub ethertype: u16,

    /// Length of the IP header plus its payload.
    pub ip_len: u16,
    /// Length of the IP payload.
    pub ip_payload_len: u16,
    pub ip_ttl: u8,
    pub ip_proto: u8,
    pub ip_tos: u8,
    pub ip_flags: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,

    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    pub tcp_window: u16,
    pub tcp_options: u64,
    pub tcp_mss: u32,
    pub tcp_seq: u32,
    pub tcp_ack: u32,

    /// Captured payload bytes. `payload.len() <= payload_len_orig`.
    #[serde(skip)]
    pub payload: Vec<u8>,
    /// Original payload length computed from headers.
    pub payload_len_orig: u16,

    /// True when this packet travels in the flow's source direction.
    /// Set by the cache during lookup.
    pub source_pkt: bool,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            ts: Duration::ZERO,
            src_mac: [0; 6],
            dst_mac: [0; 6],
            ethertype: 0,
            ip_len: 0,
            ip_payload_len: 0,
            ip_ttl: 0,
            ip_proto: 0,
            ip_tos: 0,
            ip_flags: 0,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            tcp_flags: 0,
            tcp_window: 0,
            tcp_options: 0,
            tcp_mss: 0,
            tcp_seq: 0,
            tcp_ack: 0,
            payload: Vec::new(),
            payload_len_orig: 0,
            source_pkt: true,
        }
    }
}

impl Packet {
    /// IP version of this packet (4 or 6).
    #[inline]
    pub fn ip_version(&self) -> u8 {
        match self.src_ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }
}

/// A batch of packets filled by one input plugin call.
#[derive(Debug)]
pub struct PacketBlock {
    pub pkts: Vec<Packet>,
    /// Number of valid packets in `pkts`.
    pub cnt: usize,
    /// Sum of wire bytes of the valid packets.
    pub bytes: u64,
    /// Capacity of the block.
    pub size: usize,
}

impl PacketBlock {
    pub fn new(size: usize) -> Self {
        Self {
            pkts: vec![Packet::default(); size],
            cnt: 0,
            bytes: 0,
            size,
        }
    }

    /// Reset the block for the next fill without releasing buffers.
    #[inline]
    pub fn clear(&mut self) {
        self.cnt = 0;
        self.bytes = 0;
    }
}
