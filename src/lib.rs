#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod flow;
pub mod input;
pub mod output;
pub mod packet;
pub mod plugins;
pub mod probe;
pub mod ring;
pub mod stats;
pub mod workers;

pub use cache::{CacheConfig, FlowCache};
pub use config::{PluginParams, ProbeConfig};
pub use decode::IpfixReader;
pub use error::ProbeError;
pub use flow::{Flow, FlowEndReason, FlowExt};
pub use output::ipfix::{IpfixConfig, IpfixExporter};
pub use packet::{Packet, PacketBlock};
pub use plugins::{HookFlags, PluginRegistry, ProcessPlugin};
pub use ring::Ring;
