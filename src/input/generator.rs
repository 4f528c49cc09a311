//! Synthetic packet source for benchmarking and tests.
//!
//! Two modes: `1f` replays one long flow (every packet shares the same
//! tuple, endpoints swapping each packet to exercise the biflow probe),
//! `nf` emits a fresh single-packet flow per packet by advancing the
//! source address and port. Packet payload buffers are allocated per
//! packet at init; the generator is deterministic for a given seed.
//!
//! Parameters: `m=<1f|nf>` mode, `p=<count>` packet limit, `s=<size>`
//! packet size, `S=<seed>` seed string, `d=<secs>` duration limit.

use super::{InputCounters, InputPlugin, InputStatus};
use crate::config::PluginParams;
use crate::error::ProbeError;
use crate::packet::{IPPROTO_TCP, Packet, PacketBlock, tcp_flags};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use xxhash_rust::xxh64::xxh64;

const L2_SIZE: u16 = 14;
const L3_SIZE: u16 = 20;
const L4_SIZE_TCP: u16 = 20;
const MIN_PACKET_SIZE: u16 = 64;
const DEFAULT_PACKET_SIZE: u16 = 512;

/// Packet inter-arrival gap of the synthetic clock.
const PACKET_GAP: Duration = Duration::from_micros(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// One flow, many packets.
    SingleFlow,
    /// Many single-packet flows.
    FlowPerPacket,
}

/// Deterministic generator state (splitmix64).
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }
}

pub struct GeneratorInput {
    mode: Mode,
    max_packets: u64,
    max_duration: Duration,
    packet_size: u16,
    rng: Rng,

    clock: Duration,
    emitted: u64,
    counters: InputCounters,
}

impl Default for GeneratorInput {
    fn default() -> Self {
        Self::new()
    }
}

impl GeneratorInput {
    pub fn new() -> Self {
        Self {
            mode: Mode::SingleFlow,
            max_packets: 0,
            max_duration: Duration::ZERO,
            packet_size: DEFAULT_PACKET_SIZE,
            rng: Rng(0),
            clock: Duration::ZERO,
            emitted: 0,
            counters: InputCounters::default(),
        }
    }

    fn fill_packet(&mut self, pkt: &mut Packet) {
        let payload_len = self.packet_size - L2_SIZE - L3_SIZE - L4_SIZE_TCP;

        pkt.ts = self.clock;
        pkt.src_mac = [0x02, 0, 0, 0, 0, 1];
        pkt.dst_mac = [0x02, 0, 0, 0, 0, 2];
        pkt.ethertype = 0x0800;
        pkt.ip_len = self.packet_size - L2_SIZE;
        pkt.ip_payload_len = payload_len;
        pkt.ip_ttl = 64;
        pkt.ip_proto = IPPROTO_TCP;
        pkt.ip_tos = 0;
        pkt.ip_flags = 0;
        pkt.tcp_flags = tcp_flags::ACK;
        pkt.tcp_window = 8192;
        pkt.tcp_seq = self.emitted as u32;
        pkt.tcp_ack = 0;
        pkt.payload.clear();
        pkt.payload.resize(usize::from(payload_len), 0);
        pkt.payload_len_orig = payload_len;

        match self.mode {
            Mode::SingleFlow => {
                // Swap endpoints every other packet so the reverse probe
                // and direction marking get exercised.
                let forward = self.emitted % 2 == 0;
                let (a, b) = (
                    IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
                    IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2)),
                );
                if forward {
                    (pkt.src_ip, pkt.dst_ip) = (a, b);
                    (pkt.src_port, pkt.dst_port) = (40000, 443);
                } else {
                    (pkt.src_ip, pkt.dst_ip) = (b, a);
                    (pkt.src_port, pkt.dst_port) = (443, 40000);
                }
            }
            Mode::FlowPerPacket => {
                let value = self.rng.next();
                pkt.src_ip = IpAddr::V4(Ipv4Addr::from((value >> 32) as u32));
                pkt.dst_ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
                pkt.src_port = 1024 + (value as u16 % 60000);
                pkt.dst_port = 443;
            }
        }

        self.clock += PACKET_GAP;
        self.emitted += 1;
    }

    fn exhausted(&self) -> bool {
        (self.max_packets != 0 && self.emitted >= self.max_packets)
            || (!self.max_duration.is_zero() && self.clock >= self.max_duration)
    }
}

impl InputPlugin for GeneratorInput {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn init(&mut self, params: &PluginParams) -> Result<(), ProbeError> {
        self.mode = match params.get("m") {
            None | Some("1f") => Mode::SingleFlow,
            Some("nf") => Mode::FlowPerPacket,
            Some(other) => {
                return Err(ProbeError::plugin(
                    "generator",
                    format!("unknown mode `{other}`, expected `1f` or `nf`"),
                ));
            }
        };
        self.max_packets = params.get_parsed::<u64>("p")?.unwrap_or(0);
        self.max_duration =
            Duration::from_secs(params.get_parsed::<u64>("d")?.unwrap_or(0));
        self.packet_size = params
            .get_parsed::<u16>("s")?
            .unwrap_or(DEFAULT_PACKET_SIZE);
        if self.packet_size < MIN_PACKET_SIZE {
            return Err(ProbeError::plugin(
                "generator",
                format!("packet size must be at least {MIN_PACKET_SIZE}"),
            ));
        }
        if let Some(seed) = params.get("S") {
            self.rng = Rng(xxh64(seed.as_bytes(), 0));
        }
        Ok(())
    }

    fn get(&mut self, block: &mut PacketBlock) -> Result<InputStatus, ProbeError> {
        block.clear();
        while block.cnt < block.size {
            if self.exhausted() {
                break;
            }
            let idx = block.cnt;
            self.fill_packet(&mut block.pkts[idx]);
            block.bytes += u64::from(block.pkts[idx].ip_len);
            block.cnt += 1;
        }
        self.counters.seen += block.cnt as u64;
        self.counters.parsed += block.cnt as u64;
        if block.cnt == 0 {
            Ok(InputStatus::Eof)
        } else {
            Ok(InputStatus::Parsed)
        }
    }

    fn counters(&self) -> InputCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(spec: &str) -> GeneratorInput {
        let mut input = GeneratorInput::new();
        input.init(&PluginParams::parse(spec).unwrap()).unwrap();
        input
    }

    #[test]
    fn packet_limit_ends_the_stream() {
        let mut input = generator("generator;m=nf;p=10");
        let mut block = PacketBlock::new(8);
        assert_eq!(input.get(&mut block).unwrap(), InputStatus::Parsed);
        assert_eq!(block.cnt, 8);
        assert_eq!(input.get(&mut block).unwrap(), InputStatus::Parsed);
        assert_eq!(block.cnt, 2);
        assert_eq!(input.get(&mut block).unwrap(), InputStatus::Eof);
        assert_eq!(input.counters().parsed, 10);
    }

    #[test]
    fn single_flow_mode_alternates_directions() {
        let mut input = generator("generator;m=1f;p=4");
        let mut block = PacketBlock::new(4);
        input.get(&mut block).unwrap();
        assert_eq!(block.pkts[0].src_port, 40000);
        assert_eq!(block.pkts[1].src_port, 443);
        assert_eq!(block.pkts[0].src_ip, block.pkts[1].dst_ip);
    }

    #[test]
    fn flow_per_packet_mode_is_seed_deterministic() {
        let mut a = generator("generator;m=nf;p=4;S=abc");
        let mut b = generator("generator;m=nf;p=4;S=abc");
        let mut block_a = PacketBlock::new(4);
        let mut block_b = PacketBlock::new(4);
        a.get(&mut block_a).unwrap();
        b.get(&mut block_b).unwrap();
        for (x, y) in block_a.pkts.iter().zip(block_b.pkts.iter()) {
            assert_eq!(x.src_ip, y.src_ip);
            assert_eq!(x.src_port, y.src_port);
        }
    }

    #[test]
    fn undersized_packets_are_rejected() {
        let mut input = GeneratorInput::new();
        let params = PluginParams::parse("generator;s=10").unwrap();
        assert!(input.init(&params).is_err());
    }
}
