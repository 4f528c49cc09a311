//! Flow cache lifecycle scenarios driven through the public API.

use flowprobe::cache::{CacheConfig, FlowCache};
use flowprobe::flow::{Flow, FlowEndReason};
use flowprobe::packet::{IPPROTO_TCP, IPPROTO_UDP, Packet, tcp_flags};
use flowprobe::plugins::{HookFlags, ProcessPlugin};
use flowprobe::ring::Ring;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

fn cache_with(
    config: CacheConfig,
    plugins: Vec<Box<dyn ProcessPlugin>>,
) -> (FlowCache, Arc<Ring<Box<Flow>>>) {
    let ring = Arc::new(Ring::with_capacity(4096, false));
    let cache = FlowCache::new(config, Arc::clone(&ring), plugins).unwrap();
    (cache, ring)
}

fn drain(ring: &Ring<Box<Flow>>) -> Vec<Box<Flow>> {
    let mut flows = Vec::new();
    while ring.cnt() > 0 {
        if let Some(flow) = ring.pop() {
            flows.push(flow);
        }
    }
    flows
}

fn udp(ts: Duration, src: &str, sport: u16, dst: &str, dport: u16, len: u16) -> Packet {
    Packet {
        ts,
        src_ip: src.parse::<IpAddr>().unwrap(),
        dst_ip: dst.parse::<IpAddr>().unwrap(),
        src_port: sport,
        dst_port: dport,
        ip_proto: IPPROTO_UDP,
        ip_len: len,
        ..Packet::default()
    }
}

fn tcp(ts: Duration, src: &str, sport: u16, dst: &str, dport: u16, len: u16, flags: u8) -> Packet {
    Packet {
        ts,
        src_ip: src.parse::<IpAddr>().unwrap(),
        dst_ip: dst.parse::<IpAddr>().unwrap(),
        src_port: sport,
        dst_port: dport,
        ip_proto: IPPROTO_TCP,
        ip_len: len,
        tcp_flags: flags,
        ..Packet::default()
    }
}

/// Scenario: a single UDP request/response pair becomes one biflow.
#[test]
fn single_udp_exchange() {
    let config = CacheConfig {
        active: 300,
        inactive: 30,
        ..CacheConfig::default()
    };
    let (mut cache, ring) = cache_with(config, Vec::new());

    let mut query = udp(Duration::ZERO, "10.0.0.1", 1000, "10.0.0.2", 53, 80);
    let mut reply = udp(Duration::from_millis(10), "10.0.0.2", 53, "10.0.0.1", 1000, 120);
    cache.put_packet(&mut query);
    cache.put_packet(&mut reply);
    cache.finish();

    let flows = drain(&ring);
    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.src_bytes, 80);
    assert_eq!(flow.dst_bytes, 120);
    assert_eq!(flow.src_packets, 1);
    assert_eq!(flow.dst_packets, 1);
    assert_eq!(flow.end_reason, FlowEndReason::Forced);
    assert_eq!(flow.src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
}

/// Scenario: a closed TCP connection is cut by the next SYN on the same
/// tuple.
#[test]
fn tcp_close_then_new_syn() {
    let (mut cache, ring) = cache_with(CacheConfig::default(), Vec::new());
    let t = |ms| Duration::from_millis(ms);

    let mut p1 = tcp(t(0), "10.0.0.1", 2000, "10.0.0.2", 80, 60, tcp_flags::SYN);
    let mut p2 = tcp(t(1), "10.0.0.2", 80, "10.0.0.1", 2000, 60, tcp_flags::SYN | tcp_flags::ACK);
    let mut p3 = tcp(t(2), "10.0.0.1", 2000, "10.0.0.2", 80, 500, tcp_flags::PSH | tcp_flags::ACK);
    let mut p4 = tcp(t(3), "10.0.0.2", 80, "10.0.0.1", 2000, 60, tcp_flags::FIN | tcp_flags::ACK);
    let mut p5 = tcp(t(4), "10.0.0.1", 2000, "10.0.0.2", 80, 60, tcp_flags::SYN);

    for pkt in [&mut p1, &mut p2, &mut p3, &mut p4] {
        cache.put_packet(pkt);
    }
    assert_eq!(ring.cnt(), 0, "no export before the new SYN");

    cache.put_packet(&mut p5);
    let flows = drain(&ring);
    assert_eq!(flows.len(), 1);
    let first = &flows[0];
    assert_eq!(first.end_reason, FlowEndReason::Eof);
    assert_eq!(first.src_packets + first.dst_packets, 4);
    assert_eq!(
        first.src_tcp_flags,
        tcp_flags::SYN | tcp_flags::PSH | tcp_flags::ACK
    );
    assert_eq!(
        first.dst_tcp_flags,
        tcp_flags::SYN | tcp_flags::ACK | tcp_flags::FIN
    );

    // The SYN started a second flow which is still resident.
    assert_eq!(cache.resident(), 1);
    cache.finish();
    let second = drain(&ring).pop().unwrap();
    assert_eq!(second.src_packets, 1);
    assert_eq!(second.src_tcp_flags, tcp_flags::SYN);
}

/// Scenario: a 31 s gap with a 30 s inactive timeout splits the flow.
#[test]
fn inactive_timeout_splits_flows() {
    let config = CacheConfig {
        inactive: 30,
        ..CacheConfig::default()
    };
    let (mut cache, ring) = cache_with(config, Vec::new());

    let mut p1 = udp(Duration::from_secs(0), "10.0.0.1", 1000, "10.0.0.2", 53, 80);
    let mut p2 = udp(Duration::from_secs(31), "10.0.0.1", 1000, "10.0.0.2", 53, 80);
    cache.put_packet(&mut p1);
    cache.put_packet(&mut p2);

    let flows = drain(&ring);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].end_reason, FlowEndReason::Inactive);
    assert_eq!(cache.resident(), 1);

    cache.finish();
    assert_eq!(drain(&ring)[0].end_reason, FlowEndReason::Forced);
}

/// Scenario: one packet per second for 301 s with a 300 s active
/// timeout exports the first flow as active.
#[test]
fn active_timeout_splits_long_flows() {
    let config = CacheConfig {
        active: 300,
        inactive: 3600,
        ..CacheConfig::default()
    };
    let (mut cache, ring) = cache_with(config, Vec::new());

    for secs in 0..=300u64 {
        let mut pkt = udp(Duration::from_secs(secs), "10.0.0.1", 1000, "10.0.0.2", 53, 80);
        cache.put_packet(&mut pkt);
    }

    let flows = drain(&ring);
    assert_eq!(flows.len(), 1);
    let first = &flows[0];
    assert_eq!(first.end_reason, FlowEndReason::Active);
    assert_eq!(first.src_packets, 300);
    assert_eq!(cache.resident(), 1, "second flow still accumulating");
}

/// Scenario: three keys into a two-slot line evict the least recently
/// touched one; the survivors keep LRU order.
#[test]
fn cache_pressure_evicts_lru_tail() {
    let config = CacheConfig {
        cache_size: 2,
        line_size: 2,
        ..CacheConfig::default()
    };
    let (mut cache, ring) = cache_with(config, Vec::new());

    let mut k1 = udp(Duration::ZERO, "10.0.0.1", 1001, "10.0.0.2", 53, 10);
    let mut k2 = udp(Duration::ZERO, "10.0.0.1", 1002, "10.0.0.2", 53, 20);
    let mut k3 = udp(Duration::ZERO, "10.0.0.1", 1003, "10.0.0.2", 53, 30);
    cache.put_packet(&mut k1);
    cache.put_packet(&mut k2);
    cache.put_packet(&mut k3);

    let evicted = drain(&ring);
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].end_reason, FlowEndReason::NoResources);
    assert_eq!(evicted[0].src_port, 1001);

    // finish() walks the line head to tail: k3 first, then k2.
    cache.finish();
    let rest = drain(&ring);
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].src_port, 1003);
    assert_eq!(rest[1].src_port, 1002);
}

/// A plugin whose post_update asks for flush-with-reinsert on demand.
struct ReinsertPlugin {
    trigger_len: u16,
}

impl ProcessPlugin for ReinsertPlugin {
    fn name(&self) -> &'static str {
        "reinsert-test"
    }
    fn ext_id(&self) -> usize {
        0
    }
    fn clone_plugin(&self) -> Box<dyn ProcessPlugin> {
        Box::new(ReinsertPlugin {
            trigger_len: self.trigger_len,
        })
    }
    fn post_update(&mut self, _flow: &mut Flow, pkt: &Packet) -> HookFlags {
        if pkt.ip_len == self.trigger_len {
            HookFlags::FLUSH_WITH_REINSERT
        } else {
            HookFlags::NONE
        }
    }
}

/// Flush-with-reinsert exports the record and restarts it from the
/// same packet: key kept, counters reset, timestamps at the trigger.
#[test]
fn flush_with_reinsert_restarts_the_record() {
    let (mut cache, ring) = cache_with(
        CacheConfig::default(),
        vec![Box::new(ReinsertPlugin { trigger_len: 999 })],
    );

    let mut p1 = udp(Duration::from_secs(1), "10.0.0.1", 1000, "10.0.0.2", 53, 100);
    let mut p2 = udp(Duration::from_secs(2), "10.0.0.1", 1000, "10.0.0.2", 53, 999);
    let mut p3 = udp(Duration::from_secs(3), "10.0.0.1", 1000, "10.0.0.2", 53, 50);
    cache.put_packet(&mut p1);
    cache.put_packet(&mut p2);
    cache.put_packet(&mut p3);
    assert_eq!(cache.resident(), 1);

    let flows = drain(&ring);
    assert_eq!(flows.len(), 1);
    let exported = &flows[0];
    assert_eq!(exported.end_reason, FlowEndReason::Forced);
    // The trigger packet was merged before post_update fired.
    assert_eq!(exported.src_packets, 2);
    assert_eq!(exported.src_bytes, 100 + 999);

    cache.finish();
    let restarted = drain(&ring).pop().unwrap();
    assert_eq!(restarted.src_ip, exported.src_ip);
    assert_eq!(restarted.src_port, exported.src_port);
    // Counters restarted from the trigger packet, then p3 was merged.
    assert_eq!(restarted.src_packets, 2);
    assert_eq!(restarted.src_bytes, 999 + 50);
    assert_eq!(restarted.time_first, Duration::from_secs(2));
    assert_eq!(restarted.time_last, Duration::from_secs(3));
}

/// Plugin-requested plain flush exports immediately without reinsert.
struct FlushOncePlugin {
    fired: bool,
}

impl ProcessPlugin for FlushOncePlugin {
    fn name(&self) -> &'static str {
        "flush-test"
    }
    fn ext_id(&self) -> usize {
        0
    }
    fn clone_plugin(&self) -> Box<dyn ProcessPlugin> {
        Box::new(FlushOncePlugin { fired: self.fired })
    }
    fn pre_update(&mut self, _flow: &mut Flow, _pkt: &Packet) -> HookFlags {
        if self.fired {
            HookFlags::NONE
        } else {
            self.fired = true;
            HookFlags::FLUSH
        }
    }
}

#[test]
fn plugin_flush_exports_before_merging_the_packet() {
    let (mut cache, ring) = cache_with(
        CacheConfig::default(),
        vec![Box::new(FlushOncePlugin { fired: false })],
    );

    let mut p1 = udp(Duration::from_secs(1), "10.0.0.1", 1000, "10.0.0.2", 53, 100);
    let mut p2 = udp(Duration::from_secs(2), "10.0.0.1", 1000, "10.0.0.2", 53, 200);
    cache.put_packet(&mut p1);
    cache.put_packet(&mut p2);

    let flows = drain(&ring);
    assert_eq!(flows.len(), 1);
    // pre_update flushed before the second packet was merged.
    assert_eq!(flows[0].src_packets, 1);
    assert_eq!(flows[0].src_bytes, 100);
    assert_eq!(flows[0].end_reason, FlowEndReason::Forced);
    assert_eq!(cache.resident(), 0);
}

/// The stats snapshot serialises with stable field names, the surface
/// monitoring tooling scrapes.
#[test]
fn cache_stats_serialise_for_monitoring() {
    let (mut cache, _ring) = cache_with(CacheConfig::default(), Vec::new());
    let mut pkt = udp(Duration::ZERO, "10.0.0.1", 1000, "10.0.0.2", 53, 80);
    cache.put_packet(&mut pkt);

    let value = serde_json::to_value(cache.stats()).unwrap();
    assert_eq!(value["created"], 1);
    assert_eq!(value["hits"], 0);
    assert_eq!(value["empty"], 1);
}

/// Conservation: every created flow is either emitted or still resident.
#[test]
fn created_flows_are_conserved() {
    let config = CacheConfig {
        cache_size: 64,
        line_size: 8,
        inactive: 10,
        active: 100,
        ..CacheConfig::default()
    };
    let (mut cache, ring) = cache_with(config, Vec::new());

    for i in 0u64..1000 {
        let mut pkt = udp(
            Duration::from_secs(i / 7),
            "10.0.0.1",
            (i % 97) as u16 + 1,
            "10.0.0.2",
            53,
            64,
        );
        cache.put_packet(&mut pkt);
    }

    let stats = cache.stats();
    assert_eq!(
        stats.created,
        u64::from(ring.cnt()) + cache.resident() as u64
    );

    let per_flow: u32 = drain(&ring)
        .iter()
        .map(|f| f.src_packets + f.dst_packets)
        .sum();
    cache.finish();
    let rest: u32 = drain(&ring)
        .iter()
        .map(|f| f.src_packets + f.dst_packets)
        .sum();
    assert_eq!(per_flow + rest, 1000, "every packet counted exactly once");
}
