//! Pipeline assembly and the process main loop.
//!
//! `run` builds one pipeline per input (input plugin, a flow cache with
//! its own clones of the process plugins) and a single exporter, wires
//! them through the export ring, spawns the worker threads and then
//! polls: serving the stats socket, watching for finished or failed
//! workers, and translating SIGINT/SIGTERM into the two terminate flags.
//! Inputs stop first and force-flush their caches; the exporter drains
//! the ring and exits.

use crate::cache::{CacheConfig, FlowCache};
use crate::config::{PluginParams, ProbeConfig};
use crate::error::ProbeError;
use crate::flow::Flow;
use crate::input::create_input;
use crate::output::create_output;
use crate::plugins::{PluginRegistry, ProcessPlugin};
use crate::ring::Ring;
use crate::stats::StatsService;
use crate::workers::{InputStats, OutputStats, input_worker, output_worker};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Interval of the supervision poll; bounds shutdown latency.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Cooperative shutdown flags shared with the workers.
#[derive(Clone, Default)]
pub struct TerminateFlags {
    pub input: Arc<AtomicBool>,
    pub export: Arc<AtomicBool>,
}

impl TerminateFlags {
    /// Raise the input flag from SIGINT/SIGTERM; exporters follow once
    /// the inputs have drained.
    pub fn install_signal_handler(&self) -> Result<(), ProbeError> {
        let input = Arc::clone(&self.input);
        ctrlc::set_handler(move || {
            log::info!("terminate signal received");
            input.store(true, Ordering::Relaxed);
        })
        .map_err(|e| ProbeError::Config(format!("cannot install signal handler: {e}")))
    }
}

/// Run the probe to completion. Returns the first worker or setup error.
pub fn run(config: ProbeConfig) -> Result<(), ProbeError> {
    let flags = TerminateFlags::default();
    flags.install_signal_handler()?;
    run_with_flags(config, flags)
}

/// Like [`run`] but with caller-provided terminate flags and no signal
/// handler, so tests and embedders can drive shutdown themselves.
pub fn run_with_flags(config: ProbeConfig, flags: TerminateFlags) -> Result<(), ProbeError> {
    config.validate()?;

    if config.daemon {
        log::warn!("daemon mode is not supported by this build, running in the foreground");
    }
    if let Some(path) = &config.pid_file {
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
    }

    // Process plugin prototypes, cloned per pipeline below.
    let registry = PluginRegistry::with_builtins();
    let mut prototypes: Vec<Box<dyn ProcessPlugin>> = Vec::new();
    for spec in &config.process {
        prototypes.push(registry.create(&PluginParams::parse(spec)?)?);
    }

    let storage_params = PluginParams::parse(&config.storage)?;
    if storage_params.name() != "cache" {
        return Err(ProbeError::Config(format!(
            "unknown storage plugin `{}`",
            storage_params.name()
        )));
    }
    let cache_config = CacheConfig::from_params(&storage_params)?;

    let output = create_output(&PluginParams::parse(&config.output)?)?;

    // All caches share the exporter's ring; more than one input makes it
    // multi-producer.
    let ring = Arc::new(Ring::<Box<Flow>>::with_capacity(
        config.output_queue_size,
        config.inputs.len() > 1,
    ));

    let mut input_stats = Vec::new();
    let mut input_handles: Vec<JoinHandle<Result<(), ProbeError>>> = Vec::new();
    for spec in &config.inputs {
        let input = create_input(&PluginParams::parse(spec)?)?;
        let plugins: Vec<Box<dyn ProcessPlugin>> =
            prototypes.iter().map(|p| p.clone_plugin()).collect();
        let cache = FlowCache::new(cache_config.clone(), Arc::clone(&ring), plugins)?;

        let stats = Arc::new(InputStats::default());
        input_stats.push(Arc::clone(&stats));

        let ring = Arc::clone(&ring);
        let terminate = Arc::clone(&flags.input);
        let block_size = config.input_queue_size as usize;
        let packet_limit = config.max_packets;
        input_handles.push(std::thread::spawn(move || {
            input_worker(
                input,
                cache,
                ring,
                block_size,
                packet_limit,
                terminate,
                stats,
            )
        }));
    }

    let output_stats = Arc::new(OutputStats::default());
    let output_handle = {
        let ring = Arc::clone(&ring);
        let terminate = Arc::clone(&flags.export);
        let stats = Arc::clone(&output_stats);
        let fps = config.fps;
        std::thread::spawn(move || output_worker(output, ring, terminate, stats, fps))
    };

    let stats_service = if config.stats_socket {
        match StatsService::bind(input_stats.clone(), vec![Arc::clone(&output_stats)]) {
            Ok(service) => Some(service),
            Err(e) => {
                log::warn!("stats socket unavailable: {e}");
                None
            }
        }
    } else {
        None
    };

    // Supervision loop: wait for the inputs, propagating the first
    // failure to every worker.
    let mut first_error: Option<ProbeError> = None;
    while !input_handles.is_empty() {
        if let Some(service) = &stats_service {
            service.poll();
        }
        if output_handle.is_finished() {
            // Exporter gone; stop feeding the ring.
            flags.input.store(true, Ordering::Relaxed);
        }
        let mut finished = Vec::new();
        for (i, handle) in input_handles.iter().enumerate() {
            if handle.is_finished() {
                finished.push(i);
            }
        }
        for i in finished.into_iter().rev() {
            let handle = input_handles.remove(i);
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("input worker failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    flags.input.store(true, Ordering::Relaxed);
                }
                Err(_) => {
                    let e = ProbeError::Config("input worker panicked".to_string());
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    flags.input.store(true, Ordering::Relaxed);
                }
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    // Inputs have force-exported their caches; let the exporter drain.
    flags.export.store(true, Ordering::Relaxed);
    match output_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::error!("output worker failed: {e}");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
        Err(_) => {
            if first_error.is_none() {
                first_error = Some(ProbeError::Config("output worker panicked".to_string()));
            }
        }
    }

    let input_totals: Vec<_> = input_stats.iter().map(|s| s.snapshot()).collect();
    let output_total = output_stats.snapshot();
    log::info!(
        "finished: {} packets in, {} flows out, {} dropped",
        input_totals.iter().map(|s| s.parsed).sum::<u64>(),
        output_total.flows,
        output_total.dropped
    );

    if let Some(path) = &config.pid_file {
        let _ = std::fs::remove_file(path);
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
