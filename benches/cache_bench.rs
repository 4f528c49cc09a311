use criterion::{Criterion, criterion_group, criterion_main};
use flowprobe::cache::{CacheConfig, FlowCache};
use flowprobe::flow::Flow;
use flowprobe::packet::{IPPROTO_UDP, Packet};
use flowprobe::ring::Ring;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("cache hot flow update", |b| {
        let ring = Arc::new(Ring::<Box<Flow>>::with_capacity(1 << 16, false));
        let config = CacheConfig {
            active: u64::MAX / 2,
            inactive: u64::MAX / 2,
            ..CacheConfig::default()
        };
        let mut cache = FlowCache::new(config, ring, Vec::new()).unwrap();
        let mut pkt = Packet {
            ts: Duration::from_secs(1),
            src_ip: "192.0.2.1".parse().unwrap(),
            dst_ip: "192.0.2.2".parse().unwrap(),
            src_port: 40000,
            dst_port: 443,
            ip_proto: IPPROTO_UDP,
            ip_len: 512,
            ..Packet::default()
        };
        b.iter(|| {
            cache.put_packet(black_box(&mut pkt));
        });
    });

    c.bench_function("cache flow churn", |b| {
        let ring = Arc::new(Ring::<Box<Flow>>::with_capacity(1 << 20, false));
        let config = CacheConfig {
            cache_size: 1 << 16,
            line_size: 1 << 4,
            active: u64::MAX / 2,
            inactive: u64::MAX / 2,
            ..CacheConfig::default()
        };
        let mut cache = FlowCache::new(config, Arc::clone(&ring), Vec::new()).unwrap();
        let mut port = 0u16;
        b.iter(|| {
            let mut pkt = Packet {
                ts: Duration::from_secs(1),
                src_ip: "192.0.2.1".parse().unwrap(),
                dst_ip: "192.0.2.2".parse().unwrap(),
                src_port: port,
                dst_port: 443,
                ip_proto: IPPROTO_UDP,
                ip_len: 512,
                ..Packet::default()
            };
            port = port.wrapping_add(1);
            cache.put_packet(black_box(&mut pkt));
            // Keep the export ring from filling up under churn.
            while ring.cnt() > (1 << 19) {
                let _ = ring.pop();
            }
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
