//! Flow records exchanged between the cache and the exporter.
//!
//! A [`Flow`] aggregates the packets of one biflow: timestamps, per
//! direction byte/packet counters and OR-accumulated TCP flags, plus an
//! extension list with at most one [`FlowExt`] per registered extension
//! id. Extensions are owned by their flow and are dropped with it.

use crate::packet::Packet;
use serde::Serialize;
use std::any::Any;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use xxhash_rust::xxh64::xxh64;

/// Identifier of a process plugin extension, assigned at registry build.
pub type ExtId = usize;

/// Why a flow left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum FlowEndReason {
    /// No packet seen for longer than the inactive timeout.
    Inactive = 1,
    /// The flow exceeded its maximum lifetime.
    Active = 2,
    /// TCP FIN/RST observed and a new SYN arrived for the same key.
    Eof = 3,
    /// Export forced by shutdown or a plugin flush request.
    Forced = 4,
    /// Evicted because its cache line was full.
    NoResources = 5,
}

/// Packed canonical flow key, hashed to locate the cache line.
///
/// Layout mirrors the fixed on-wire tuple: ports, protocol, ip version,
/// then both addresses. Forward and reversed forms of one conversation
/// differ only by swapped endpoints.
#[derive(Debug, Clone, Copy)]
pub struct FlowKey {
    buf: [u8; Self::MAX_LEN],
    len: usize,
}

impl FlowKey {
    /// v6 key: 2 + 2 + 1 + 1 + 16 + 16 bytes.
    pub const MAX_LEN: usize = 38;

    fn build(
        proto: u8,
        src_ip: &IpAddr,
        dst_ip: &IpAddr,
        src_port: u16,
        dst_port: u16,
    ) -> Self {
        let mut buf = [0u8; Self::MAX_LEN];
        buf[0..2].copy_from_slice(&src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
        buf[4] = proto;
        let len = match (src_ip, dst_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                buf[5] = 4;
                buf[6..10].copy_from_slice(&src.octets());
                buf[10..14].copy_from_slice(&dst.octets());
                14
            }
            _ => {
                buf[5] = 6;
                match src_ip {
                    IpAddr::V4(v4) => buf[6..22].copy_from_slice(&v4.to_ipv6_mapped().octets()),
                    IpAddr::V6(v6) => buf[6..22].copy_from_slice(&v6.octets()),
                }
                match dst_ip {
                    IpAddr::V4(v4) => buf[22..38].copy_from_slice(&v4.to_ipv6_mapped().octets()),
                    IpAddr::V6(v6) => buf[22..38].copy_from_slice(&v6.octets()),
                }
                38
            }
        };
        Self { buf, len }
    }

    /// Key in the packet's own direction.
    pub fn forward(pkt: &Packet) -> Self {
        Self::build(
            pkt.ip_proto,
            &pkt.src_ip,
            &pkt.dst_ip,
            pkt.src_port,
            pkt.dst_port,
        )
    }

    /// Key with endpoints swapped.
    pub fn reversed(pkt: &Packet) -> Self {
        Self::build(
            pkt.ip_proto,
            &pkt.dst_ip,
            &pkt.src_ip,
            pkt.dst_port,
            pkt.src_port,
        )
    }

    /// 64-bit fingerprint of this key. Zero is reserved for empty slots,
    /// so a zero hash is nudged to one.
    #[inline]
    pub fn hash(&self) -> u64 {
        let h = xxh64(&self.buf[..self.len], 0);
        if h == 0 { 1 } else { h }
    }
}

/// Per-plugin state attached to one flow.
///
/// Extensions serialise themselves into IPFIX data records and contribute
/// field names to the flow's template. `fill_ipfix` returns `None` when
/// the remaining buffer space is insufficient; the encoder then flushes
/// the current message and retries once.
pub trait FlowExt: Send {
    fn ext_id(&self) -> ExtId;

    /// Write this extension's fields into `buf`, returning bytes written.
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize>;

    /// Names of the template fields this extension appends, in the order
    /// `fill_ipfix` writes them.
    fn ipfix_template(&self) -> &'static [&'static str];

    /// Human readable rendering of the extension fields.
    fn text(&self) -> String {
        String::new()
    }

    fn clone_ext(&self) -> Box<dyn FlowExt>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// One biflow record.
#[derive(Serialize)]
pub struct Flow {
    pub time_first: Duration,
    pub time_last: Duration,
    pub src_bytes: u64,
    pub dst_bytes: u64,
    pub src_packets: u32,
    pub dst_packets: u32,
    pub src_tcp_flags: u8,
    pub dst_tcp_flags: u8,

    pub ip_proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub end_reason: FlowEndReason,

    #[serde(skip)]
    pub exts: Vec<Box<dyn FlowExt>>,
}

impl Default for Flow {
    fn default() -> Self {
        Self {
            time_first: Duration::ZERO,
            time_last: Duration::ZERO,
            src_bytes: 0,
            dst_bytes: 0,
            src_packets: 0,
            dst_packets: 0,
            src_tcp_flags: 0,
            dst_tcp_flags: 0,
            ip_proto: 0,
            src_port: 0,
            dst_port: 0,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_mac: [0; 6],
            dst_mac: [0; 6],
            end_reason: FlowEndReason::Forced,
            exts: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("src", &(self.src_ip, self.src_port))
            .field("dst", &(self.dst_ip, self.dst_port))
            .field("proto", &self.ip_proto)
            .field("src_packets", &self.src_packets)
            .field("dst_packets", &self.dst_packets)
            .field("src_bytes", &self.src_bytes)
            .field("dst_bytes", &self.dst_bytes)
            .field("end_reason", &self.end_reason)
            .field("ext_cnt", &self.exts.len())
            .finish()
    }
}

impl Flow {
    /// IP version of the flow key (4 or 6).
    #[inline]
    pub fn ip_version(&self) -> u8 {
        match self.src_ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    /// Attach an extension. At most one extension per id lives on a flow;
    /// attaching an id that is already present is a no-op.
    pub fn add_extension(&mut self, ext: Box<dyn FlowExt>) {
        if self.extension(ext.ext_id()).is_none() {
            self.exts.push(ext);
        }
    }

    pub fn extension(&self, id: ExtId) -> Option<&dyn FlowExt> {
        self.exts.iter().find(|e| e.ext_id() == id).map(|e| &**e)
    }

    pub fn extension_mut<'a>(&'a mut self, id: ExtId) -> Option<&'a mut (dyn FlowExt + 'a)> {
        let found: Option<&'a mut Box<dyn FlowExt>> =
            self.exts.iter_mut().find(|e| e.ext_id() == id);
        match found {
            Some(e) => Some(&mut **e),
            None => None,
        }
    }

    /// Remove the extension with the given id, if present.
    pub fn remove_extension(&mut self, id: ExtId) -> bool {
        let before = self.exts.len();
        self.exts.retain(|e| e.ext_id() != id);
        self.exts.len() != before
    }

    pub fn remove_extensions(&mut self) {
        self.exts.clear();
    }

    pub fn has_extensions(&self) -> bool {
        !self.exts.is_empty()
    }

    /// Extensions ordered by id, the order templates and data records use.
    pub fn extensions_ordered(&self) -> Vec<&dyn FlowExt> {
        let mut exts: Vec<&dyn FlowExt> = self.exts.iter().map(|e| &**e).collect();
        exts.sort_by_key(|e| e.ext_id());
        exts
    }

    /// Bitset of extension ids present on this flow, used as template key.
    pub fn extension_bitset(&self) -> u64 {
        self.exts.iter().fold(0u64, |set, e| set | (1 << e.ext_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyExt(ExtId);

    impl FlowExt for DummyExt {
        fn ext_id(&self) -> ExtId {
            self.0
        }
        fn fill_ipfix(&self, _buf: &mut [u8]) -> Option<usize> {
            Some(0)
        }
        fn ipfix_template(&self) -> &'static [&'static str] {
            &[]
        }
        fn clone_ext(&self) -> Box<dyn FlowExt> {
            Box::new(DummyExt(self.0))
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn packet(src: &str, dst: &str, sport: u16, dport: u16) -> Packet {
        Packet {
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: sport,
            dst_port: dport,
            ip_proto: 17,
            ..Packet::default()
        }
    }

    #[test]
    fn forward_and_reversed_keys_mirror() {
        let pkt = packet("10.0.0.1", "10.0.0.2", 1000, 53);
        let back = packet("10.0.0.2", "10.0.0.1", 53, 1000);
        assert_eq!(FlowKey::forward(&pkt).hash(), FlowKey::reversed(&back).hash());
        assert_ne!(FlowKey::forward(&pkt).hash(), FlowKey::reversed(&pkt).hash());
    }

    #[test]
    fn v4_and_v6_keys_never_collide_by_construction() {
        let v4 = packet("10.0.0.1", "10.0.0.2", 1000, 53);
        let v6 = packet("2001:db8::1", "2001:db8::2", 1000, 53);
        assert_ne!(FlowKey::forward(&v4).hash(), FlowKey::forward(&v6).hash());
    }

    #[test]
    fn extension_attachment_is_idempotent_per_id() {
        let mut flow = Flow::default();
        flow.add_extension(Box::new(DummyExt(3)));
        flow.add_extension(Box::new(DummyExt(3)));
        flow.add_extension(Box::new(DummyExt(1)));
        assert_eq!(flow.extensions_ordered().len(), 2);
        assert_eq!(flow.extension_bitset(), 0b1010);
        assert!(flow.remove_extension(3));
        assert!(!flow.remove_extension(3));
        assert_eq!(flow.extension_bitset(), 0b0010);
    }
}
