//! Probe configuration and the plugin parameter grammar.
//!
//! Plugin specs follow the form `name;key=value;flag`, e.g.
//! `cache;s=17;l=4;a=300;i=30` or `ipfix;h=collector;p=4739;u`. The
//! leading segment names the plugin; the rest are `key=value` pairs or
//! bare flags.

use crate::error::ProbeError;
use std::path::PathBuf;
use std::str::FromStr;

/// Default packet-block size between an input and its cache.
pub const DEFAULT_INPUT_QUEUE_SIZE: u32 = 64;
/// Default export ring capacity between a cache and the exporter.
pub const DEFAULT_OUTPUT_QUEUE_SIZE: u32 = 16536;
/// Default flows-per-second cap (0 = unlimited).
pub const DEFAULT_FPS: u32 = 0;
/// Default per-packet capture buffer size.
pub const DEFAULT_PACKET_BUFFER_SIZE: u32 = 1600;

/// Parsed `name;key=value;flag` plugin specification.
#[derive(Debug, Clone, Default)]
pub struct PluginParams {
    name: String,
    entries: Vec<(String, Option<String>)>,
}

impl PluginParams {
    /// Parse a plugin spec string. The name segment must be non-empty.
    pub fn parse(spec: &str) -> Result<Self, ProbeError> {
        let mut segments = spec.split(';');
        let name = segments
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProbeError::Config(format!("empty plugin spec: `{spec}`")))?
            .to_string();

        let mut entries = Vec::new();
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((key, value)) => {
                    entries.push((key.trim().to_string(), Some(value.trim().to_string())))
                }
                None => entries.push((segment.to_string(), None)),
            }
        }
        Ok(Self { name, entries })
    }

    /// Params with only a name, for programmatic construction.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of `key`, if present with a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// True when `key` appears, with or without a value.
    pub fn has(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Parse the value of `key` into `T`, erroring on malformed input.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ProbeError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                ProbeError::Config(format!(
                    "plugin `{}`: invalid value `{raw}` for parameter `{key}`",
                    self.name
                ))
            }),
        }
    }

    /// Builder-style addition used by tests and programmatic setup.
    pub fn with(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.entries
            .push((key.into(), value.map(|v| v.to_string())));
        self
    }
}

/// Fully resolved probe configuration, normally built from the CLI.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Input plugin specs, one pipeline each.
    pub inputs: Vec<String>,
    /// Storage plugin spec shared by all pipelines.
    pub storage: String,
    /// Output plugin spec.
    pub output: String,
    /// Process plugin specs applied to every storage, in order.
    pub process: Vec<String>,
    /// Packet-block size between input and storage.
    pub input_queue_size: u32,
    /// Export ring capacity between storage and output.
    pub output_queue_size: u32,
    /// Per-packet capture buffer size in bytes.
    pub packet_buffer_size: u32,
    /// Flows-per-second export cap, 0 for unlimited.
    pub fps: u32,
    /// Stop each input after this many packets, 0 for unlimited.
    pub max_packets: u64,
    /// Optional pid file written at startup.
    pub pid_file: Option<PathBuf>,
    /// Daemonisation request; accepted but not implemented.
    pub daemon: bool,
    /// Serve the stats socket from the main loop.
    pub stats_socket: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            storage: "cache".to_string(),
            output: "ipfix".to_string(),
            process: Vec::new(),
            input_queue_size: DEFAULT_INPUT_QUEUE_SIZE,
            output_queue_size: DEFAULT_OUTPUT_QUEUE_SIZE,
            packet_buffer_size: DEFAULT_PACKET_BUFFER_SIZE,
            fps: DEFAULT_FPS,
            max_packets: 0,
            pid_file: None,
            daemon: false,
            stats_socket: true,
        }
    }
}

impl ProbeConfig {
    /// Validate cross-field constraints before the pipeline starts.
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.inputs.is_empty() {
            return Err(ProbeError::Config(
                "at least one input plugin is required (-i)".to_string(),
            ));
        }
        if self.input_queue_size == 0 {
            return Err(ProbeError::Config(
                "input queue size must be non-zero".to_string(),
            ));
        }
        if self.output_queue_size < 2 {
            return Err(ProbeError::Config(
                "output queue size must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
