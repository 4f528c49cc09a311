//! Input plugins: sources of parsed packet batches.
//!
//! Capture backends live outside this crate; the core only consumes the
//! batch contract below. An input fills a [`PacketBlock`] and reports
//! whether packets were parsed, the source timed out, or the stream
//! ended. Partial batches are normal.

pub mod generator;

use crate::config::PluginParams;
use crate::error::ProbeError;
use crate::packet::PacketBlock;

/// Outcome of one batch fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    /// The block contains at least one parsed packet.
    Parsed,
    /// No packet arrived within the plugin's wait interval.
    Timeout,
    /// The source is exhausted.
    Eof,
}

/// Counters every input maintains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputCounters {
    /// Packets seen by the source.
    pub seen: u64,
    /// Packets parsed into blocks.
    pub parsed: u64,
    /// Packets dropped as malformed or truncated.
    pub dropped: u64,
}

/// A source of parsed packets driving one pipeline.
pub trait InputPlugin: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self, params: &PluginParams) -> Result<(), ProbeError>;

    /// Fill `block` with up to `block.size` packets.
    fn get(&mut self, block: &mut PacketBlock) -> Result<InputStatus, ProbeError>;

    fn counters(&self) -> InputCounters;
}

/// Instantiate a built-in input plugin by parsed spec.
pub fn create_input(params: &PluginParams) -> Result<Box<dyn InputPlugin>, ProbeError> {
    match params.name() {
        "generator" => {
            let mut input = Box::new(generator::GeneratorInput::new());
            input.init(params)?;
            Ok(input)
        }
        other => Err(ProbeError::Config(format!(
            "unknown input plugin `{other}`"
        ))),
    }
}
