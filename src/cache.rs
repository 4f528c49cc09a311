//! Line-associative flow cache.
//!
//! The cache is a flat table of flow records partitioned into lines of
//! `line_size` contiguous slots; cache size and line size are both powers
//! of two. The low bits of the key hash select the line and the position
//! inside a line encodes recency: index 0 is the most recently touched
//! record, the last index is the eviction candidate. An incoming packet
//! is probed with its forward key first and, unless biflow splitting is
//! on, with the reversed key, so both directions of a conversation meet
//! in one record.
//!
//! Eviction, timeouts, plugin flush requests and shutdown all leave
//! through [`FlowCache::export_flow`], which moves the record onto the
//! export ring; the slot stays allocated and is reused for the next flow.
//! The cache does not deduplicate TCP retransmits, every passing packet
//! is counted (see the pstats plugin for optional duplicate skipping).
//!
//! Timeout enforcement is amortised: after every packet a rolling cursor
//! sweeps `line_size / 2` slots and exports the ones idle longer than the
//! inactive timeout.

use crate::config::PluginParams;
use crate::error::ProbeError;
use crate::flow::{Flow, FlowEndReason, FlowKey};
use crate::packet::{Packet, tcp_flags};
use crate::plugins::{HookFlags, ProcessPlugin};
use crate::ring::Ring;
use serde::Serialize;
use std::sync::Arc;

/// Default cache size exponent: 2^17 = 131072 records.
pub const DEFAULT_CACHE_SIZE_EXPONENT: u32 = 17;
/// Default line size exponent: 2^4 = 16 records per line.
pub const DEFAULT_LINE_SIZE_EXPONENT: u32 = 4;
pub const DEFAULT_ACTIVE_TIMEOUT: u64 = 300;
pub const DEFAULT_INACTIVE_TIMEOUT: u64 = 30;

/// Flow cache geometry and timeouts, parsed from the storage plugin spec
/// `cache;s=<exp>;l=<exp>;a=<secs>;i=<secs>;S`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of records, a power of two.
    pub cache_size: u32,
    /// Records per line, a power of two not larger than `cache_size`.
    pub line_size: u32,
    /// Active timeout in seconds.
    pub active: u64,
    /// Inactive timeout in seconds.
    pub inactive: u64,
    /// Disable the reverse-key probe so each direction gets its own flow.
    pub split_biflow: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 1 << DEFAULT_CACHE_SIZE_EXPONENT,
            line_size: 1 << DEFAULT_LINE_SIZE_EXPONENT,
            active: DEFAULT_ACTIVE_TIMEOUT,
            inactive: DEFAULT_INACTIVE_TIMEOUT,
            split_biflow: false,
        }
    }
}

impl CacheConfig {
    pub fn from_params(params: &PluginParams) -> Result<Self, ProbeError> {
        let mut config = Self::default();
        if let Some(exp) = params.get_parsed::<u32>("s")? {
            if !(4..=30).contains(&exp) {
                return Err(ProbeError::Config(
                    "flow cache size exponent must be between 4 and 30".to_string(),
                ));
            }
            config.cache_size = 1 << exp;
        }
        if let Some(exp) = params.get_parsed::<u32>("l")? {
            if exp > 16 {
                return Err(ProbeError::Config(
                    "flow cache line size exponent must be at most 16".to_string(),
                ));
            }
            config.line_size = 1 << exp;
        }
        if let Some(active) = params.get_parsed::<u64>("a")? {
            config.active = active;
        }
        if let Some(inactive) = params.get_parsed::<u64>("i")? {
            config.inactive = inactive;
        }
        config.split_biflow = params.has("S");
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.cache_size == 0 {
            return Err(ProbeError::Config(
                "flow cache cannot work with 0 records".to_string(),
            ));
        }
        if !self.cache_size.is_power_of_two() || !self.line_size.is_power_of_two() {
            return Err(ProbeError::Config(
                "flow cache and line sizes must be powers of two".to_string(),
            ));
        }
        if self.line_size == 0 || self.line_size > self.cache_size {
            return Err(ProbeError::Config(
                "flow cache line size must be between 1 and the cache size".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counters of one cache instance, published via [`FlowCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Packets matched to an existing record.
    pub hits: u64,
    /// New flows placed into an empty slot.
    pub empty: u64,
    /// New flows that evicted a record from a full line.
    pub not_empty: u64,
    /// Records exported by timeouts, eviction or shutdown.
    pub expired: u64,
    /// Records exported on plugin request.
    pub flushed: u64,
    /// Flows created.
    pub created: u64,
}

/// One table slot: the cached key hash plus the record itself.
/// A zero hash marks the slot empty.
struct FlowRecord {
    hash: u64,
    flow: Flow,
}

impl FlowRecord {
    fn empty() -> Self {
        Self {
            hash: 0,
            flow: Flow::default(),
        }
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.hash == 0
    }

    #[inline]
    fn belongs(&self, hash: u64) -> bool {
        self.hash == hash
    }

    fn create(&mut self, pkt: &Packet, hash: u64) {
        self.hash = hash;

        let flow = &mut self.flow;
        flow.time_first = pkt.ts;
        flow.time_last = pkt.ts;
        flow.src_mac = pkt.src_mac;
        flow.dst_mac = pkt.dst_mac;
        flow.src_ip = pkt.src_ip;
        flow.dst_ip = pkt.dst_ip;
        flow.ip_proto = pkt.ip_proto;
        flow.src_port = pkt.src_port;
        flow.dst_port = pkt.dst_port;
        flow.src_packets = 1;
        flow.src_bytes = u64::from(pkt.ip_len);
        if pkt.ip_proto == crate::packet::IPPROTO_TCP {
            flow.src_tcp_flags = pkt.tcp_flags;
        }
    }

    fn update(&mut self, pkt: &Packet, source: bool) {
        let flow = &mut self.flow;
        flow.time_last = pkt.ts;
        if source {
            flow.src_packets += 1;
            flow.src_bytes += u64::from(pkt.ip_len);
            if pkt.ip_proto == crate::packet::IPPROTO_TCP {
                flow.src_tcp_flags |= pkt.tcp_flags;
            }
        } else {
            flow.dst_packets += 1;
            flow.dst_bytes += u64::from(pkt.ip_len);
            if pkt.ip_proto == crate::packet::IPPROTO_TCP {
                flow.dst_tcp_flags |= pkt.tcp_flags;
            }
        }
    }

    /// Move the flow out for export and leave the slot empty.
    fn take_flow(&mut self, reason: FlowEndReason) -> Flow {
        self.hash = 0;
        let mut flow = std::mem::take(&mut self.flow);
        flow.end_reason = reason;
        flow
    }

    /// Prepare the slot for a reinserted flow: same key, fresh counters,
    /// no extensions, timestamps starting at the triggering packet.
    fn reinsert(&mut self, exported: &Flow, hash: u64, pkt: &Packet, source: bool) {
        self.hash = hash;
        let flow = &mut self.flow;
        flow.src_ip = exported.src_ip;
        flow.dst_ip = exported.dst_ip;
        flow.src_port = exported.src_port;
        flow.dst_port = exported.dst_port;
        flow.ip_proto = exported.ip_proto;
        flow.src_mac = exported.src_mac;
        flow.dst_mac = exported.dst_mac;
        flow.time_first = pkt.ts;
        flow.time_last = pkt.ts;
        flow.src_packets = 0;
        flow.dst_packets = 0;
        flow.src_bytes = 0;
        flow.dst_bytes = 0;
        flow.src_tcp_flags = 0;
        flow.dst_tcp_flags = 0;
        flow.remove_extensions();
        self.update(pkt, source);
    }
}

/// The line-associative flow cache driving one input pipeline.
pub struct FlowCache {
    cache_size: u32,
    line_size: u32,
    line_mask: u64,
    /// Position inside a line where an evicting flow is re-inserted,
    /// keeping the head for hot flows and the tail as the next victim.
    new_flow_offset: u32,
    active: u64,
    inactive: u64,
    split_biflow: bool,

    table: Vec<Box<FlowRecord>>,
    queue: Arc<Ring<Box<Flow>>>,
    plugins: Vec<Box<dyn ProcessPlugin>>,
    timeout_cursor: u32,
    stats: CacheStats,
}

impl FlowCache {
    pub fn new(
        config: CacheConfig,
        queue: Arc<Ring<Box<Flow>>>,
        plugins: Vec<Box<dyn ProcessPlugin>>,
    ) -> Result<Self, ProbeError> {
        config.validate()?;
        let mut table = Vec::with_capacity(config.cache_size as usize);
        table.resize_with(config.cache_size as usize, || Box::new(FlowRecord::empty()));
        Ok(Self {
            cache_size: config.cache_size,
            line_size: config.line_size,
            line_mask: u64::from((config.cache_size - 1) & !(config.line_size - 1)),
            new_flow_offset: config.line_size / 2,
            active: config.active,
            inactive: config.inactive,
            split_biflow: config.split_biflow,
            table,
            queue,
            plugins,
            timeout_cursor: 0,
            stats: CacheStats::default(),
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of occupied slots, used by tests and shutdown accounting.
    pub fn resident(&self) -> usize {
        self.table.iter().filter(|r| !r.is_empty()).count()
    }

    /// Feed one packet into the cache, creating, updating or exporting
    /// flow records as the lifecycle dictates.
    pub fn put_packet(&mut self, pkt: &mut Packet) {
        self.plugins_pre_create(pkt);

        let hash = FlowKey::forward(pkt).hash();
        self.put_hashed(pkt, hash);
    }

    fn put_hashed(&mut self, pkt: &mut Packet, fwd_hash: u64) {
        let mut hash = fwd_hash;
        let mut source_flow = true;
        debug_assert_eq!(fwd_hash, FlowKey::forward(pkt).hash());
        let mut line = (hash & self.line_mask) as usize;
        let mut found = self.probe_line(line, hash);

        if found.is_none() && !self.split_biflow {
            let rev_hash = FlowKey::reversed(pkt).hash();
            let rev_line = (rev_hash & self.line_mask) as usize;
            if let Some(idx) = self.probe_line(rev_line, rev_hash) {
                found = Some(idx);
                source_flow = false;
                hash = rev_hash;
                line = rev_line;
            }
        }

        // The line is kept ordered by recency of touch, head first; both
        // hits and creations promote their slot to the head.
        let index = match found {
            Some(idx) => {
                self.table[line..=idx].rotate_right(1);
                self.stats.hits += 1;
                line
            }
            None => match self.first_empty(line) {
                Some(idx) => {
                    self.stats.empty += 1;
                    self.table[line..=idx].rotate_right(1);
                    line
                }
                None => {
                    // Line full: evict the tail and reuse its slot.
                    let victim = line + self.line_size as usize - 1;
                    self.plugins_pre_export(victim);
                    self.export_flow(victim, FlowEndReason::NoResources);
                    self.stats.expired += 1;
                    self.stats.not_empty += 1;

                    let insert_at = line + self.new_flow_offset as usize;
                    self.table[insert_at..=victim].rotate_right(1);
                    self.table[line..=insert_at].rotate_right(1);
                    line
                }
            },
        };

        pkt.source_pkt = source_flow;

        // A new SYN on a connection that already saw FIN or RST closes
        // the old flow and starts over with the same packet.
        let record = &self.table[index];
        let seen_flags = record.flow.src_tcp_flags | record.flow.dst_tcp_flags;
        if pkt.tcp_flags & tcp_flags::SYN != 0
            && seen_flags & (tcp_flags::FIN | tcp_flags::RST) != 0
        {
            self.export_flow(index, FlowEndReason::Eof);
            self.stats.expired += 1;
            self.put_packet(pkt);
            return;
        }

        if self.table[index].is_empty() {
            self.table[index].create(pkt, hash);
            self.stats.created += 1;
            let flags = self.plugins_post_create(index, pkt);
            if flags.contains(HookFlags::FLUSH) {
                self.export_flow(index, FlowEndReason::Forced);
                self.stats.flushed += 1;
            }
        } else {
            let record = &self.table[index];

            if pkt.ts.as_secs().saturating_sub(record.flow.time_last.as_secs()) >= self.inactive {
                let reason = Self::timeout_reason(&record.flow);
                self.plugins_pre_export(index);
                self.export_flow(index, reason);
                self.stats.expired += 1;
                self.put_packet(pkt);
                return;
            }

            if pkt.ts.as_secs().saturating_sub(record.flow.time_first.as_secs()) >= self.active {
                self.plugins_pre_export(index);
                self.export_flow(index, FlowEndReason::Active);
                self.stats.expired += 1;
                self.put_packet(pkt);
                return;
            }

            let flags = self.plugins_pre_update(index, pkt);
            if flags.contains(HookFlags::FLUSH) {
                self.flush(pkt, index, hash, flags, source_flow);
                return;
            }

            self.table[index].update(pkt, source_flow);
            let flags = self.plugins_post_update(index, pkt);
            if flags.contains(HookFlags::FLUSH) {
                self.flush(pkt, index, hash, flags, source_flow);
                return;
            }
        }

        self.export_expired(pkt.ts.as_secs());
    }

    /// Export every flow whose last packet is older than the inactive
    /// timeout within the next sweep window; wraps around the table.
    pub fn export_expired(&mut self, now_secs: u64) {
        let window = self.new_flow_offset.max(1);
        for i in self.timeout_cursor..self.timeout_cursor + window {
            let idx = i as usize;
            if self.table[idx].is_empty() {
                continue;
            }
            if now_secs.saturating_sub(self.table[idx].flow.time_last.as_secs()) >= self.inactive {
                let reason = Self::timeout_reason(&self.table[idx].flow);
                self.plugins_pre_export(idx);
                self.export_flow(idx, reason);
                self.stats.expired += 1;
            }
        }
        self.timeout_cursor = (self.timeout_cursor + window) & (self.cache_size - 1);
    }

    /// Force-export every resident flow. Called on shutdown; calling it
    /// again on an empty cache exports nothing.
    pub fn finish(&mut self) {
        for idx in 0..self.cache_size as usize {
            if self.table[idx].is_empty() {
                continue;
            }
            self.plugins_pre_export(idx);
            self.export_flow(idx, FlowEndReason::Forced);
            self.stats.expired += 1;
        }
        for plugin in &mut self.plugins {
            plugin.finish(false);
        }
    }

    fn probe_line(&self, line: usize, hash: u64) -> Option<usize> {
        (line..line + self.line_size as usize).find(|&i| self.table[i].belongs(hash))
    }

    fn first_empty(&self, line: usize) -> Option<usize> {
        (line..line + self.line_size as usize).find(|&i| self.table[i].is_empty())
    }

    fn timeout_reason(flow: &Flow) -> FlowEndReason {
        if (flow.src_tcp_flags | flow.dst_tcp_flags) & (tcp_flags::FIN | tcp_flags::RST) != 0 {
            FlowEndReason::Eof
        } else {
            FlowEndReason::Inactive
        }
    }

    /// Move the record at `index` onto the export ring.
    fn export_flow(&mut self, index: usize, reason: FlowEndReason) {
        let flow = self.table[index].take_flow(reason);
        log::trace!(
            "exporting flow {}:{} -> {}:{} reason {:?}",
            flow.src_ip,
            flow.src_port,
            flow.dst_ip,
            flow.dst_port,
            flow.end_reason
        );
        self.queue.push(Box::new(flow));
    }

    /// Handle a plugin flush request on the update path.
    fn flush(
        &mut self,
        pkt: &Packet,
        index: usize,
        hash: u64,
        flags: HookFlags,
        source_flow: bool,
    ) {
        self.stats.flushed += 1;

        if flags.contains(HookFlags::FLUSH_WITH_REINSERT) {
            let exported = self.table[index].take_flow(FlowEndReason::Forced);
            self.table[index].reinsert(&exported, hash, pkt, source_flow);
            self.queue.push(Box::new(exported));

            let flags = self.plugins_post_create(index, pkt);
            if flags.contains(HookFlags::FLUSH) {
                self.flush(pkt, index, hash, flags, source_flow);
            }
        } else {
            self.export_flow(index, FlowEndReason::Forced);
        }
    }

    fn plugins_pre_create(&mut self, pkt: &mut Packet) -> HookFlags {
        let mut flags = HookFlags::NONE;
        for plugin in &mut self.plugins {
            flags |= plugin.pre_create(pkt);
        }
        flags
    }

    fn plugins_post_create(&mut self, index: usize, pkt: &Packet) -> HookFlags {
        let flow = &mut self.table[index].flow;
        let mut flags = HookFlags::NONE;
        for plugin in &mut self.plugins {
            flags |= plugin.post_create(flow, pkt);
        }
        flags
    }

    fn plugins_pre_update(&mut self, index: usize, pkt: &Packet) -> HookFlags {
        let flow = &mut self.table[index].flow;
        let mut flags = HookFlags::NONE;
        for plugin in &mut self.plugins {
            flags |= plugin.pre_update(flow, pkt);
        }
        flags
    }

    fn plugins_post_update(&mut self, index: usize, pkt: &Packet) -> HookFlags {
        let flow = &mut self.table[index].flow;
        let mut flags = HookFlags::NONE;
        for plugin in &mut self.plugins {
            flags |= plugin.post_update(flow, pkt);
        }
        flags
    }

    fn plugins_pre_export(&mut self, index: usize) {
        let flow = &mut self.table[index].flow;
        for plugin in &mut self.plugins {
            plugin.pre_export(flow);
        }
    }
}
