//! End-to-end pipeline runs: generator input through cache, ring and
//! exporter to a loopback collector.

use flowprobe::config::ProbeConfig;
use flowprobe::decode::{FieldKey, IpfixReader};
use flowprobe::probe;
use std::io::Read;
use std::net::TcpListener;
use std::thread;

/// Spawn a TCP collector returning every byte of the first connection.
fn spawn_collector() -> (u16, thread::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).unwrap();
        bytes
    });
    (port, handle)
}

#[test]
fn generator_flows_arrive_at_the_collector() {
    let (port, collector) = spawn_collector();

    let config = ProbeConfig {
        inputs: vec!["generator;m=nf;p=300;S=pipeline".to_string()],
        output: format!("ipfix;h=127.0.0.1;p={port}"),
        storage: "cache;s=10;l=2".to_string(),
        stats_socket: false,
        ..ProbeConfig::default()
    };
    probe::run_with_flags(config, Default::default()).unwrap();

    let bytes = collector.join().unwrap();
    let mut reader = IpfixReader::default();
    let result = reader.parse_bytes(&bytes);
    assert!(result.is_ok(), "decode error: {:?}", result.error);

    let records: Vec<_> = result
        .messages
        .iter()
        .flat_map(|m| m.data_records())
        .collect();
    assert_eq!(records.len(), 300, "every generated flow was exported once");

    let total_packets: u64 = records
        .iter()
        .map(|r| {
            r.get(&FieldKey::iana(2)).and_then(|v| v.as_u64()).unwrap()
                + r.get(&FieldKey::enterprise(29305, 2))
                    .and_then(|v| v.as_u64())
                    .unwrap()
        })
        .sum();
    assert_eq!(total_packets, 300, "single-packet flows stay single-packet");
}

#[test]
fn pstats_series_travels_with_the_flow() {
    let (port, collector) = spawn_collector();

    let config = ProbeConfig {
        inputs: vec!["generator;m=1f;p=10".to_string()],
        process: vec!["pstats;i".to_string()],
        output: format!("ipfix;h=127.0.0.1;p={port}"),
        stats_socket: false,
        ..ProbeConfig::default()
    };
    probe::run_with_flags(config, Default::default()).unwrap();

    let bytes = collector.join().unwrap();
    let mut reader = IpfixReader::default();
    let result = reader.parse_bytes(&bytes);
    assert!(result.is_ok(), "decode error: {:?}", result.error);

    let records: Vec<_> = result
        .messages
        .iter()
        .flat_map(|m| m.data_records())
        .collect();
    assert_eq!(records.len(), 1, "one biflow for the whole stream");

    let record = records[0];
    let packets = record
        .get(&FieldKey::iana(2))
        .and_then(|v| v.as_u64())
        .unwrap()
        + record
            .get(&FieldKey::enterprise(29305, 2))
            .and_then(|v| v.as_u64())
            .unwrap();
    assert_eq!(packets, 10);

    // The per-packet series: basicList of 10 u16 lengths.
    let sizes = record
        .get(&FieldKey::enterprise(8057, 1013))
        .expect("pstats lengths present");
    match sizes {
        flowprobe::decode::FieldValue::Bytes(raw) => assert_eq!(raw.len(), 9 + 10 * 2),
        other => panic!("unexpected value {other:?}"),
    }
}

#[test]
fn bad_configuration_fails_before_starting() {
    let config = ProbeConfig {
        inputs: vec!["nosuch".to_string()],
        stats_socket: false,
        ..ProbeConfig::default()
    };
    assert!(probe::run_with_flags(config, Default::default()).is_err());

    let config = ProbeConfig {
        inputs: vec!["generator;p=1".to_string()],
        storage: "cache;s=99".to_string(),
        stats_socket: false,
        ..ProbeConfig::default()
    };
    assert!(probe::run_with_flags(config, Default::default()).is_err());
}
