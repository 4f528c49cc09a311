//! Per-packet statistics plugin.
//!
//! Records the size, timestamp, TCP flags and direction of the first
//! [`PSTATS_MAX_ELEMENTS`] packets of every flow and exports them as
//! IPFIX basicList fields under the CESNET enterprise number. With the
//! `s` parameter, duplicated TCP segments (retransmits with identical
//! seq/ack/length/flags) are skipped; this is the only deduplication in
//! the pipeline, the flow cache itself counts every passing packet.
//! Single-packet flows carrying a SYN drop their series before export,
//! so port scans do not inflate the output.
//!
//! Parameters: `i` include zero-payload packets, `s` skip duplicated TCP
//! packets.

use super::{HookFlags, ProcessPlugin};
use crate::config::PluginParams;
use crate::error::ProbeError;
use crate::flow::{ExtId, Flow, FlowExt};
use crate::output::ipfix::basiclist;
use crate::output::ipfix::elements::{
    CESNET_PEN, PSTATS_PKT_DIRECTIONS, PSTATS_PKT_FLAGS, PSTATS_PKT_LENGTHS, PSTATS_PKT_TIMES,
};
use crate::packet::{IPPROTO_TCP, Packet, tcp_flags};
use std::any::Any;
use std::fmt::Write as _;
use std::time::Duration;

/// Packets recorded per flow.
pub const PSTATS_MAX_ELEMENTS: usize = 30;

/// Flows at or below this packet count lose their series on export when
/// they carry a SYN.
pub const PSTATS_MIN_PACKETS: u32 = 1;

const TEMPLATE: &[&str] = &["pktLengths", "pktTimes", "pktFlags", "pktDirections"];

/// Extension carrying the per-packet series of one flow.
#[derive(Debug, Clone, Default)]
pub struct PstatsExt {
    ext_id: ExtId,
    pub sizes: Vec<u16>,
    pub timestamps: Vec<Duration>,
    pub flags: Vec<u8>,
    pub directions: Vec<i8>,
    // Last seen TCP state per direction, for duplicate detection.
    tcp_seq: [u32; 2],
    tcp_ack: [u32; 2],
    tcp_len: [u16; 2],
    tcp_flags: [u8; 2],
}

impl PstatsExt {
    pub fn new(ext_id: ExtId) -> Self {
        Self {
            ext_id,
            ..Self::default()
        }
    }
}

impl FlowExt for PstatsExt {
    fn ext_id(&self) -> ExtId {
        self.ext_id
    }

    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize> {
        let mut written = basiclist::fill_u16(buf, CESNET_PEN, PSTATS_PKT_LENGTHS, &self.sizes)?;
        written += basiclist::fill_time(
            &mut buf[written..],
            CESNET_PEN,
            PSTATS_PKT_TIMES,
            &self.timestamps,
        )?;
        written += basiclist::fill_u8(
            &mut buf[written..],
            CESNET_PEN,
            PSTATS_PKT_FLAGS,
            &self.flags,
        )?;
        written += basiclist::fill_i8(
            &mut buf[written..],
            CESNET_PEN,
            PSTATS_PKT_DIRECTIONS,
            &self.directions,
        )?;
        Some(written)
    }

    fn ipfix_template(&self) -> &'static [&'static str] {
        TEMPLATE
    }

    fn text(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "pktsizes=(");
        for (i, size) in self.sizes.iter().enumerate() {
            if i != 0 {
                out.push(',');
            }
            let _ = write!(out, "{size}");
        }
        let _ = write!(out, "),pktdirs=(");
        for (i, dir) in self.directions.iter().enumerate() {
            if i != 0 {
                out.push(',');
            }
            let _ = write!(out, "{dir}");
        }
        out.push(')');
        out
    }

    fn clone_ext(&self) -> Box<dyn FlowExt> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Process plugin maintaining [`PstatsExt`] on each flow.
pub struct PstatsPlugin {
    ext_id: ExtId,
    include_zeroes: bool,
    skip_dup: bool,
}

impl PstatsPlugin {
    pub fn new(ext_id: ExtId) -> Self {
        Self {
            ext_id,
            include_zeroes: false,
            skip_dup: false,
        }
    }

    fn update_record(&self, ext: &mut PstatsExt, pkt: &Packet) {
        let dir = if pkt.source_pkt { 0 } else { 1 };
        if self.skip_dup
            && pkt.ip_proto == IPPROTO_TCP
            && !ext.sizes.is_empty()
            && pkt.tcp_seq == ext.tcp_seq[dir]
            && pkt.tcp_ack == ext.tcp_ack[dir]
            && pkt.ip_payload_len == ext.tcp_len[dir]
            && pkt.tcp_flags == ext.tcp_flags[dir]
        {
            return;
        }
        // The per-direction TCP state tracks every non-duplicate packet,
        // including the ones the checks below decline to record.
        ext.tcp_seq[dir] = pkt.tcp_seq;
        ext.tcp_ack[dir] = pkt.tcp_ack;
        ext.tcp_len[dir] = pkt.ip_payload_len;
        ext.tcp_flags[dir] = pkt.tcp_flags;

        if pkt.payload_len_orig == 0 && !self.include_zeroes {
            return;
        }

        if ext.sizes.len() < PSTATS_MAX_ELEMENTS {
            ext.sizes.push(pkt.ip_len);
            ext.timestamps.push(pkt.ts);
            ext.flags.push(pkt.tcp_flags);
            ext.directions.push(if pkt.source_pkt { 1 } else { -1 });
        }
    }

    fn with_ext(&self, flow: &mut Flow, pkt: &Packet) {
        if flow.extension(self.ext_id).is_none() {
            flow.add_extension(Box::new(PstatsExt::new(self.ext_id)));
        }
        if let Some(ext) = flow
            .extension_mut(self.ext_id)
            .and_then(|e| e.as_any_mut().downcast_mut::<PstatsExt>())
        {
            self.update_record(ext, pkt);
        }
    }
}

impl ProcessPlugin for PstatsPlugin {
    fn name(&self) -> &'static str {
        "pstats"
    }

    fn ext_id(&self) -> ExtId {
        self.ext_id
    }

    fn init(&mut self, params: &PluginParams) -> Result<(), ProbeError> {
        self.include_zeroes = params.has("i") || params.has("includezeroes");
        self.skip_dup = params.has("s") || params.has("skipdup");
        Ok(())
    }

    fn clone_plugin(&self) -> Box<dyn ProcessPlugin> {
        Box::new(Self {
            ext_id: self.ext_id,
            include_zeroes: self.include_zeroes,
            skip_dup: self.skip_dup,
        })
    }

    fn ext_template(&self) -> &'static [&'static str] {
        TEMPLATE
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> HookFlags {
        self.with_ext(flow, pkt);
        HookFlags::NONE
    }

    fn post_update(&mut self, flow: &mut Flow, pkt: &Packet) -> HookFlags {
        self.with_ext(flow, pkt);
        HookFlags::NONE
    }

    fn pre_export(&mut self, flow: &mut Flow) {
        // Do not export the series for single packet flows carrying a
        // SYN, usually port scans.
        let packets = flow.src_packets + flow.dst_packets;
        let flags = flow.src_tcp_flags | flow.dst_tcp_flags;
        if packets <= PSTATS_MIN_PACKETS && flags & tcp_flags::SYN != 0 {
            flow.remove_extension(self.ext_id);
        }
    }
}
