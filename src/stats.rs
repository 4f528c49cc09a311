//! Per-process statistics socket.
//!
//! A unix domain socket named `flowprobe_<pid>.sock` under the system
//! temp directory serves worker counters on demand: a client connects,
//! sends anything (or nothing), and receives a fixed header followed by
//! one little-endian counter struct per input and output worker. The
//! probe stays fully functional if no client ever connects.
//!
//! Wire layout: header = magic `u32`, input count `u32`, output count
//! `u32`; then per input (packets, parsed, bytes, dropped, qtime) as
//! five `u64`, per output (flows, bytes, packets, dropped) as four
//! `u64`.

use crate::workers::{InputStats, OutputStats};
use std::io::{self, Write};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;

/// Identifies a flowprobe stats response.
pub const STATS_MAGIC: u32 = 0x70726266;

/// Non-blocking stats socket served from the main loop.
pub struct StatsService {
    listener: UnixListener,
    path: PathBuf,
    inputs: Vec<Arc<InputStats>>,
    outputs: Vec<Arc<OutputStats>>,
}

impl StatsService {
    /// Bind the per-PID socket in the system temp directory.
    pub fn bind(
        inputs: Vec<Arc<InputStats>>,
        outputs: Vec<Arc<OutputStats>>,
    ) -> io::Result<Self> {
        let path = Self::socket_path(std::process::id());
        Self::bind_at(path, inputs, outputs)
    }

    /// Bind at an explicit path; used by tests.
    pub fn bind_at(
        path: PathBuf,
        inputs: Vec<Arc<InputStats>>,
        outputs: Vec<Arc<OutputStats>>,
    ) -> io::Result<Self> {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        log::info!("stats socket listening at {}", path.display());
        Ok(Self {
            listener,
            path,
            inputs,
            outputs,
        })
    }

    /// Conventional socket path for a given pid.
    pub fn socket_path(pid: u32) -> PathBuf {
        std::env::temp_dir().join(format!("flowprobe_{pid}.sock"))
    }

    /// Serve at most one pending client; returns immediately when none
    /// is waiting.
    pub fn poll(&self) {
        match self.listener.accept() {
            Ok((mut stream, _)) => {
                if let Err(e) = self.write_report(&mut stream) {
                    log::debug!("stats client dropped: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => log::debug!("stats socket accept failed: {e}"),
        }
    }

    fn write_report(&self, stream: &mut impl Write) -> io::Result<()> {
        let mut data = Vec::with_capacity(
            12 + self.inputs.len() * 40 + self.outputs.len() * 32,
        );
        data.extend_from_slice(&STATS_MAGIC.to_le_bytes());
        data.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        data.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());

        for stats in &self.inputs {
            let snapshot = stats.snapshot();
            data.extend_from_slice(&snapshot.packets.to_le_bytes());
            data.extend_from_slice(&snapshot.parsed.to_le_bytes());
            data.extend_from_slice(&snapshot.bytes.to_le_bytes());
            data.extend_from_slice(&snapshot.dropped.to_le_bytes());
            data.extend_from_slice(&snapshot.qtime.to_le_bytes());
        }
        for stats in &self.outputs {
            let snapshot = stats.snapshot();
            data.extend_from_slice(&snapshot.flows.to_le_bytes());
            data.extend_from_slice(&snapshot.bytes.to_le_bytes());
            data.extend_from_slice(&snapshot.packets.to_le_bytes());
            data.extend_from_slice(&snapshot.dropped.to_le_bytes());
        }
        stream.write_all(&data)
    }
}

impl Drop for StatsService {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
