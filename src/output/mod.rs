//! Output plugins: sinks for completed flow records.

pub mod ipfix;

use crate::config::PluginParams;
use crate::error::ProbeError;
use crate::flow::Flow;

/// Counters every exporter maintains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportCounters {
    /// Flows handed to the exporter.
    pub seen: u64,
    /// Flows that could not be delivered.
    pub dropped: u64,
}

/// A sink consuming flow records popped from the export ring.
///
/// `export_flow` errors are fatal for the worker; recoverable transport
/// problems are handled inside the plugin and become `dropped` counts.
pub trait OutputPlugin: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self, params: &PluginParams) -> Result<(), ProbeError>;

    fn export_flow(&mut self, flow: &Flow) -> Result<(), ProbeError>;

    /// Push out any partially accumulated output.
    fn flush(&mut self);

    fn counters(&self) -> ExportCounters;

    /// Final flush and teardown.
    fn close(&mut self) {
        self.flush();
    }
}

/// Instantiate a built-in output plugin by parsed spec.
pub fn create_output(params: &PluginParams) -> Result<Box<dyn OutputPlugin>, ProbeError> {
    match params.name() {
        "ipfix" => {
            let mut output = Box::new(ipfix::IpfixExporter::default());
            output.init(params)?;
            Ok(output)
        }
        other => Err(ProbeError::Config(format!(
            "unknown output plugin `{other}`"
        ))),
    }
}
