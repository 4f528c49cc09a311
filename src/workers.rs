//! Pipeline worker threads.
//!
//! One input worker per input plugin drives its own flow cache; one
//! output worker per exporter drains the export ring. The only state
//! crossing thread boundaries is the ring itself, the two terminate
//! flags, and the atomic statistics snapshots below.

use crate::cache::FlowCache;
use crate::error::ProbeError;
use crate::flow::Flow;
use crate::input::{InputPlugin, InputStatus};
use crate::output::OutputPlugin;
use crate::packet::PacketBlock;
use crate::ring::Ring;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Live counters of one input worker, written by the worker and read by
/// the stats service.
#[derive(Debug, Default)]
pub struct InputStats {
    pub packets: AtomicU64,
    pub parsed: AtomicU64,
    pub bytes: AtomicU64,
    pub dropped: AtomicU64,
    /// Nanoseconds spent pushing packets through the cache.
    pub qtime: AtomicU64,
}

/// Point-in-time copy of [`InputStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InputStatsSnapshot {
    pub packets: u64,
    pub parsed: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub qtime: u64,
}

impl InputStats {
    pub fn snapshot(&self) -> InputStatsSnapshot {
        InputStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            parsed: self.parsed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            qtime: self.qtime.load(Ordering::Relaxed),
        }
    }
}

/// Live counters of one output worker.
#[derive(Debug, Default)]
pub struct OutputStats {
    pub flows: AtomicU64,
    pub bytes: AtomicU64,
    pub packets: AtomicU64,
    pub dropped: AtomicU64,
}

/// Point-in-time copy of [`OutputStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutputStatsSnapshot {
    pub flows: u64,
    pub bytes: u64,
    pub packets: u64,
    pub dropped: u64,
}

impl OutputStats {
    pub fn snapshot(&self) -> OutputStatsSnapshot {
        OutputStatsSnapshot {
            flows: self.flows.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Input worker: batches from the input plugin into the cache.
///
/// On timeout the cache's aging is driven forward so idle flows still
/// expire; on end-of-file or the terminate flag the cache is finished and
/// the worker waits for the export ring to drain before returning.
#[allow(clippy::too_many_arguments)]
pub fn input_worker(
    mut input: Box<dyn InputPlugin>,
    mut cache: FlowCache,
    ring: Arc<Ring<Box<Flow>>>,
    block_size: usize,
    packet_limit: u64,
    terminate: Arc<AtomicBool>,
    stats: Arc<InputStats>,
) -> Result<(), ProbeError> {
    let mut block = PacketBlock::new(block_size);
    let mut last_ts_secs = 0u64;
    let mut timeout_since: Option<Instant> = None;
    let mut result = Ok(());

    while !terminate.load(Ordering::Relaxed) {
        if packet_limit != 0 {
            let parsed = input.counters().parsed;
            if parsed >= packet_limit {
                break;
            }
            block.size = block_size.min((packet_limit - parsed) as usize);
        }

        match input.get(&mut block) {
            Ok(InputStatus::Parsed) => {
                timeout_since = None;
                let started = Instant::now();
                for i in 0..block.cnt {
                    cache.put_packet(&mut block.pkts[i]);
                }
                if block.cnt > 0 {
                    last_ts_secs = block.pkts[block.cnt - 1].ts.as_secs();
                }

                let counters = input.counters();
                stats.packets.store(counters.seen, Ordering::Relaxed);
                stats.parsed.store(counters.parsed, Ordering::Relaxed);
                stats.dropped.store(counters.dropped, Ordering::Relaxed);
                stats.bytes.fetch_add(block.bytes, Ordering::Relaxed);
                stats
                    .qtime
                    .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
            }
            Ok(InputStatus::Timeout) => {
                // Keep aging flows while the source is quiet.
                let idle = timeout_since.get_or_insert_with(Instant::now);
                cache.export_expired(last_ts_secs + idle.elapsed().as_secs());
                std::thread::sleep(Duration::from_micros(1));
            }
            Ok(InputStatus::Eof) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    let counters = input.counters();
    stats.packets.store(counters.seen, Ordering::Relaxed);
    stats.parsed.store(counters.parsed, Ordering::Relaxed);
    stats.dropped.store(counters.dropped, Ordering::Relaxed);

    cache.finish();
    while ring.cnt() > 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    result
}

/// Output worker: drains the export ring into the output plugin.
///
/// A flows-per-second cap is enforced by computing the expected send time
/// of each flow and sleeping the residual. When no record arrives for a
/// second the plugin is flushed so partially filled messages leave.
pub fn output_worker(
    mut output: Box<dyn OutputPlugin>,
    ring: Arc<Ring<Box<Flow>>>,
    terminate: Arc<AtomicBool>,
    stats: Arc<OutputStats>,
    fps: u32,
) -> Result<(), ProbeError> {
    let time_per_flow = if fps != 0 {
        Duration::from_secs(1) / fps
    } else {
        Duration::ZERO
    };
    let mut window_start = Instant::now();
    let mut last_flush = window_start;
    let mut flows_in_window = 0u32;
    let mut result = Ok(());

    loop {
        let Some(flow) = ring.pop() else {
            if last_flush.elapsed() > Duration::from_secs(1) {
                last_flush = Instant::now();
                output.flush();
            }
            if terminate.load(Ordering::Relaxed) && ring.cnt() == 0 {
                break;
            }
            continue;
        };

        stats.flows.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes
            .fetch_add(flow.src_bytes + flow.dst_bytes, Ordering::Relaxed);
        stats.packets.fetch_add(
            u64::from(flow.src_packets) + u64::from(flow.dst_packets),
            Ordering::Relaxed,
        );

        if let Err(e) = output.export_flow(&flow) {
            result = Err(e);
            break;
        }
        stats
            .dropped
            .store(output.counters().dropped, Ordering::Relaxed);

        if fps == 0 {
            continue;
        }

        flows_in_window += 1;
        let expected = time_per_flow * flows_in_window;
        let elapsed = window_start.elapsed();
        if expected > elapsed {
            std::thread::sleep((expected - elapsed).min(Duration::from_secs(1)));
        }
        if flows_in_window >= fps {
            window_start = Instant::now();
            flows_in_window = 0;
        }
    }

    output.close();
    stats
        .dropped
        .store(output.counters().dropped, Ordering::Relaxed);
    result
}
