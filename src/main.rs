use clap::Parser;
use flowprobe::config::ProbeConfig;
use std::path::PathBuf;
use std::process::ExitCode;

/// Flow exporter: aggregates packets into biflows and exports them as
/// IPFIX records over TCP or UDP.
#[derive(Debug, Parser)]
#[command(
    name = "flowprobe",
    version,
    about,
    after_help = "\
PLUGIN SPECS take the form name;key=value;flag, for example:
  -i generator;m=nf;p=10000;S=seed
  -s cache;s=17;l=4;a=300;i=30;S
  -o ipfix;h=collector.example.org;p=4739;u;m=1458;I=7;d=1
  -p pstats;i;s

Cache parameters: s/l cache and line size exponents (2^n), a/i active
and inactive timeouts in seconds, S split biflows into uniflows.
IPFIX parameters: h/p collector host and port, u force UDP, m MTU,
I observation domain id, d direction bit field.
Generator parameters: m mode (1f or nf), p packet count, s packet size,
S seed, d duration in seconds."
)]
struct Cli {
    /// Activate an input plugin (repeatable).
    #[arg(short = 'i', long = "input", value_name = "SPEC")]
    input: Vec<String>,

    /// Storage plugin specification.
    #[arg(short = 's', long = "storage", value_name = "SPEC", default_value = "cache")]
    storage: String,

    /// Output plugin specification.
    #[arg(short = 'o', long = "output", value_name = "SPEC", default_value = "ipfix")]
    output: String,

    /// Activate a process plugin (repeatable).
    #[arg(short = 'p', long = "process", value_name = "SPEC")]
    process: Vec<String>,

    /// Size of the packet block between input and storage.
    #[arg(short = 'q', long = "iqueue", value_name = "SIZE")]
    iqueue: Option<u32>,

    /// Size of the export ring between storage and output.
    #[arg(short = 'Q', long = "oqueue", value_name = "SIZE")]
    oqueue: Option<u32>,

    /// Packet buffer size in bytes.
    #[arg(short = 'B', long = "pbuf", value_name = "BYTES")]
    packet_buffer: Option<u32>,

    /// Export at most this many flows per second (0 = unlimited).
    #[arg(short = 'f', long = "fps", value_name = "NUM")]
    fps: Option<u32>,

    /// Quit after this many packets per input (0 = unlimited).
    #[arg(short = 'c', long = "count", value_name = "NUM")]
    count: Option<u64>,

    /// Create a pid file.
    #[arg(short = 'P', long = "pid", value_name = "FILE")]
    pid_file: Option<PathBuf>,

    /// Run as a standalone daemon process.
    #[arg(short = 'd', long = "daemon")]
    daemon: bool,

    /// Disable the per-process stats socket.
    #[arg(long = "no-stats-socket")]
    no_stats_socket: bool,
}

impl From<Cli> for ProbeConfig {
    fn from(cli: Cli) -> Self {
        let defaults = ProbeConfig::default();
        ProbeConfig {
            inputs: cli.input,
            storage: cli.storage,
            output: cli.output,
            process: cli.process,
            input_queue_size: cli.iqueue.unwrap_or(defaults.input_queue_size),
            output_queue_size: cli.oqueue.unwrap_or(defaults.output_queue_size),
            packet_buffer_size: cli.packet_buffer.unwrap_or(defaults.packet_buffer_size),
            fps: cli.fps.unwrap_or(defaults.fps),
            max_packets: cli.count.unwrap_or(0),
            pid_file: cli.pid_file,
            daemon: cli.daemon,
            stats_socket: !cli.no_stats_socket,
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ProbeConfig::from(Cli::parse());
    match flowprobe::probe::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
