//! IPFIX flow export (RFC 7011).
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011>
//! - <https://datatracker.ietf.org/doc/html/rfc5103> (biflow reverse fields)
//! - <https://datatracker.ietf.org/doc/html/rfc6313> (basicList)
//!
//! Every distinct combination of (IP version, set of extension ids on a
//! flow) gets its own template, created on first use and kept for the
//! process lifetime. Template ids start at 258 and only grow. Each
//! template owns a data buffer sized to `mtu - 16` bytes; records are
//! appended until one no longer fits, at which point the message is
//! flushed and the record retried once.
//!
//! Messages are framed as a 16-byte header followed by a template set
//! (id 2) and data sets using the template id as set id. The sequence
//! number counts exported data records; template records do not advance
//! it. Over TCP a broken connection arms a reconnect backoff, resets the
//! sequence number and marks every template unexported so they ship
//! again before any data. Over UDP templates are periodically re-sent by
//! time and by exported-packet count.

pub mod basiclist;
pub mod elements;

use super::{ExportCounters, OutputPlugin};
use crate::config::PluginParams;
use crate::error::ProbeError;
use crate::flow::Flow;
use elements::{BASIC_TEMPLATE_V4, BASIC_TEMPLATE_V6, VAR_LEN};
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, TcpStream, UdpSocket};
use std::time::{SystemTime, UNIX_EPOCH};

pub const IPFIX_VERSION: u16 = 10;
pub const IPFIX_HEADER_SIZE: usize = 16;
pub const SET_HEADER_SIZE: usize = 4;
pub const TEMPLATE_SET_ID: u16 = 2;
pub const FIRST_TEMPLATE_ID: u16 = 258;

/// 1500 minus ethernet, IP and UDP headers.
pub const DEFAULT_MTU: u16 = 1458;
const DEFAULT_RECONNECT_TIMEOUT: u64 = 60;
const DEFAULT_TEMPLATE_REFRESH_TIME: u64 = 600;
const DEFAULT_TEMPLATE_REFRESH_PACKETS: u64 = 0;

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Exporter settings, normally parsed from the output plugin spec
/// `ipfix;h=<host>;p=<port>;u;m=<mtu>;I=<odid>;d=<dir>`.
#[derive(Debug, Clone)]
pub struct IpfixConfig {
    pub host: String,
    pub port: u16,
    pub udp: bool,
    pub mtu: u16,
    pub odid: u32,
    /// Exported verbatim in the flowDirection element.
    pub dir_bit_field: u8,
    pub reconnect_timeout: u64,
    /// UDP template refresh interval in seconds, 0 disables.
    pub template_refresh_time: u64,
    /// UDP template refresh threshold in exported packets, 0 disables.
    pub template_refresh_packets: u64,
}

impl Default for IpfixConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4739,
            udp: false,
            mtu: DEFAULT_MTU,
            odid: 0,
            dir_bit_field: 0,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            template_refresh_time: DEFAULT_TEMPLATE_REFRESH_TIME,
            template_refresh_packets: DEFAULT_TEMPLATE_REFRESH_PACKETS,
        }
    }
}

impl IpfixConfig {
    pub fn from_params(params: &PluginParams) -> Result<Self, ProbeError> {
        let mut config = Self::default();
        if let Some(host) = params.get("h") {
            config.host = host.to_string();
        }
        if let Some(port) = params.get_parsed::<u16>("p")? {
            config.port = port;
        }
        config.udp = params.has("u");
        if let Some(mtu) = params.get_parsed::<u16>("m")? {
            config.mtu = mtu;
        }
        if let Some(odid) = params.get_parsed::<u32>("I")? {
            config.odid = odid;
        }
        if let Some(dir) = params.get_parsed::<u8>("d")? {
            config.dir_bit_field = dir;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProbeError> {
        if usize::from(self.mtu) <= IPFIX_HEADER_SIZE + SET_HEADER_SIZE {
            return Err(ProbeError::Config(format!(
                "IPFIX message MTU must exceed {} bytes",
                IPFIX_HEADER_SIZE + SET_HEADER_SIZE
            )));
        }
        Ok(())
    }
}

/// One template and its accumulating data buffer.
struct Template {
    id: u16,
    /// Pre-rendered template record: id, field count, field specifiers.
    record: Vec<u8>,
    /// Data set under construction; starts with its 4-byte set header.
    buffer: Vec<u8>,
    record_count: u16,
    exported: bool,
    export_time: u64,
    export_packets: u64,
}

enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

enum SendOutcome {
    Sent,
    /// Connection re-established; resend the same message once.
    Retry,
    Dropped,
}

/// RFC 7011 exporter over TCP (default) or UDP.
pub struct IpfixExporter {
    config: IpfixConfig,
    /// Per-template data capacity: `mtu - 16`.
    max_buffer_size: usize,

    templates: Vec<Template>,
    /// (extension set -> template index), one map per IP version.
    template_map: [HashMap<u64, usize>; 2],
    next_template_id: u16,

    sequence: u32,
    exported_packets: u64,
    transport: Option<Transport>,
    /// Unix time of the last failed connection attempt; 0 allows an
    /// immediate attempt.
    last_attempt: u64,

    counters: ExportCounters,
}

impl Default for IpfixExporter {
    fn default() -> Self {
        Self::with_config(IpfixConfig::default())
    }
}

impl IpfixExporter {
    /// Build an exporter without connecting yet; the first send connects.
    pub fn with_config(config: IpfixConfig) -> Self {
        let max_buffer_size = usize::from(config.mtu) - IPFIX_HEADER_SIZE;
        Self {
            config,
            max_buffer_size,
            templates: Vec::new(),
            template_map: [HashMap::new(), HashMap::new()],
            next_template_id: FIRST_TEMPLATE_ID,
            sequence: 0,
            exported_packets: 0,
            transport: None,
            last_attempt: 0,
            counters: ExportCounters::default(),
        }
    }

    /// Build an exporter and attempt the initial connection. A refused
    /// connection is not fatal, it only arms the reconnect backoff.
    pub fn connected(config: IpfixConfig) -> Result<Self, ProbeError> {
        config.validate()?;
        let mut exporter = Self::with_config(config);
        if !exporter.try_connect() {
            exporter.last_attempt = now_unix_secs();
            log::warn!(
                "cannot reach collector {}:{}, will retry",
                exporter.config.host,
                exporter.config.port
            );
        }
        Ok(exporter)
    }

    fn try_connect(&mut self) -> bool {
        let addr = (self.config.host.as_str(), self.config.port);
        let transport = if self.config.udp {
            UdpSocket::bind(("0.0.0.0", 0))
                .and_then(|socket| socket.connect(addr).map(|_| Transport::Udp(socket)))
        } else {
            TcpStream::connect(addr).map(Transport::Tcp)
        };
        match transport {
            Ok(t) => {
                log::info!(
                    "connected to collector {}:{} ({})",
                    self.config.host,
                    self.config.port,
                    if self.config.udp { "udp" } else { "tcp" }
                );
                self.transport = Some(t);
                true
            }
            Err(e) => {
                log::debug!("collector connection failed: {e}");
                false
            }
        }
    }

    /// Check the connection, honouring the reconnect backoff. On a fresh
    /// reconnect all templates are re-sent before anything else.
    fn ensure_connected(&mut self) -> bool {
        if self.transport.is_some() {
            return true;
        }
        let now = now_unix_secs();
        if self.last_attempt != 0 && now < self.last_attempt + self.config.reconnect_timeout {
            return false;
        }
        if self.try_connect() {
            self.last_attempt = 0;
            self.expire_templates();
            self.send_templates();
            true
        } else {
            self.last_attempt = now;
            false
        }
    }

    fn disconnect_after_error(&mut self, error: &std::io::Error) {
        log::warn!("collector connection lost: {error}");
        self.transport = None;
        // Allow an immediate reconnect attempt and reset the
        // per-connection sequence number.
        self.last_attempt = 0;
        self.sequence = 0;
    }

    /// Mark every template unexported so the send path re-emits them.
    fn expire_templates(&mut self) {
        let now = now_unix_secs();
        for template in &mut self.templates {
            template.exported = false;
            if self.config.udp {
                template.export_time = now;
                template.export_packets = self.exported_packets;
            }
        }
    }

    fn check_template_lifetime(template: &mut Template, config: &IpfixConfig, now: u64, exported_packets: u64) {
        if config.template_refresh_time != 0
            && template.export_time + config.template_refresh_time <= now
        {
            log::debug!("template {} refresh time expired", template.id);
            template.exported = false;
        }
        if config.template_refresh_packets != 0
            && template.export_packets + config.template_refresh_packets <= exported_packets
        {
            log::debug!("template {} refresh packet count expired", template.id);
            template.exported = false;
        }
    }

    /// Index of the template for this flow's (IP version, extension set),
    /// creating the v4/v6 pair on first encounter.
    fn template_for(&mut self, flow: &Flow) -> Result<usize, ProbeError> {
        let version_idx = if flow.ip_version() == 6 { 1 } else { 0 };
        let ext_set = flow.extension_bitset();

        if !self.template_map[version_idx].contains_key(&ext_set) {
            let ext_fields: Vec<&'static str> = flow
                .extensions_ordered()
                .iter()
                .flat_map(|ext| ext.ipfix_template().iter().copied())
                .collect();
            let v4 = self.create_template(BASIC_TEMPLATE_V4, &ext_fields)?;
            self.template_map[0].insert(ext_set, v4);
            let v6 = self.create_template(BASIC_TEMPLATE_V6, &ext_fields)?;
            self.template_map[1].insert(ext_set, v6);
        }

        Ok(self.template_map[version_idx][&ext_set])
    }

    fn create_template(
        &mut self,
        basic: &[&str],
        ext_fields: &[&'static str],
    ) -> Result<usize, ProbeError> {
        let id = self.next_template_id;
        self.next_template_id = self.next_template_id.checked_add(1).ok_or_else(|| {
            ProbeError::Config("template id space exhausted".to_string())
        })?;

        let mut record = Vec::with_capacity(4 + 8 * (basic.len() + ext_fields.len()));
        record.extend_from_slice(&id.to_be_bytes());
        record.extend_from_slice(&0u16.to_be_bytes());

        let mut field_count = 0u16;
        for name in basic.iter().chain(ext_fields) {
            let def = elements::lookup(name).ok_or_else(|| {
                ProbeError::Config(format!("unknown template field `{name}`"))
            })?;
            let element_id = if def.enterprise != 0 {
                def.id | 0x8000
            } else {
                def.id
            };
            record.extend_from_slice(&element_id.to_be_bytes());
            let len: u16 = if def.len == VAR_LEN {
                0xFFFF
            } else {
                def.len as u16
            };
            record.extend_from_slice(&len.to_be_bytes());
            if def.enterprise != 0 {
                record.extend_from_slice(&def.enterprise.to_be_bytes());
            }
            field_count += 1;
        }
        record[2..4].copy_from_slice(&field_count.to_be_bytes());

        let mut buffer = Vec::with_capacity(self.max_buffer_size);
        buffer.extend_from_slice(&id.to_be_bytes());
        buffer.extend_from_slice(&0u16.to_be_bytes());

        log::debug!("created template {id} with {field_count} fields");
        self.templates.push(Template {
            id,
            record,
            buffer,
            record_count: 0,
            exported: false,
            export_time: now_unix_secs(),
            export_packets: self.exported_packets,
        });
        Ok(self.templates.len() - 1)
    }

    /// Append one flow record to its template buffer. Returns false when
    /// the remaining space is insufficient.
    fn fill_record(&mut self, flow: &Flow, template_idx: usize) -> bool {
        let max = self.max_buffer_size;
        let dir_bit_field = self.config.dir_bit_field;
        let template = &mut self.templates[template_idx];
        let start = template.buffer.len();
        if start >= max {
            return false;
        }
        template.buffer.resize(max, 0);

        let written = (|| {
            let mut offset = start;
            offset += fill_basic_flow(flow, &mut template.buffer[offset..], dir_bit_field)?;
            for ext in flow.extensions_ordered() {
                offset += ext.fill_ipfix(&mut template.buffer[offset..])?;
            }
            Some(offset - start)
        })();

        match written {
            Some(len) => {
                template.buffer.truncate(start + len);
                template.record_count += 1;
                true
            }
            None => {
                template.buffer.truncate(start);
                false
            }
        }
    }

    /// Build one message carrying every not-yet-exported template.
    fn create_template_packet(&mut self) -> Option<Vec<u8>> {
        let now = now_unix_secs();
        let mut total = 0usize;
        for template in &mut self.templates {
            if self.config.udp {
                Self::check_template_lifetime(template, &self.config, now, self.exported_packets);
            }
            if !template.exported {
                total += template.record.len();
            }
        }
        if total == 0 {
            return None;
        }
        total += IPFIX_HEADER_SIZE + SET_HEADER_SIZE;

        let mut data = Vec::with_capacity(total);
        fill_ipfix_header(&mut data, total as u16, self.sequence, self.config.odid);
        data.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        data.extend_from_slice(&((total - IPFIX_HEADER_SIZE) as u16).to_be_bytes());
        for template in &mut self.templates {
            if !template.exported {
                data.extend_from_slice(&template.record);
                template.exported = true;
                template.export_time = now;
                template.export_packets = self.exported_packets;
            }
        }
        Some(data)
    }

    /// Build one message from filled template buffers, draining them.
    /// Returns the message and the number of flow records it carries.
    fn create_data_packet(&mut self) -> Option<(Vec<u8>, u16)> {
        let mut data = Vec::with_capacity(usize::from(self.config.mtu));
        data.resize(IPFIX_HEADER_SIZE, 0);
        let mut flows = 0u16;

        for template in &mut self.templates {
            if template.record_count == 0 {
                continue;
            }
            if data.len() + template.buffer.len() > usize::from(self.config.mtu) {
                continue;
            }
            let set_len = template.buffer.len() as u16;
            template.buffer[2..4].copy_from_slice(&set_len.to_be_bytes());
            data.extend_from_slice(&template.buffer);
            flows += template.record_count;

            template.buffer.truncate(SET_HEADER_SIZE);
            template.record_count = 0;
        }

        if data.len() == IPFIX_HEADER_SIZE {
            return None;
        }
        let total = data.len() as u16;
        let mut header = Vec::with_capacity(IPFIX_HEADER_SIZE);
        fill_ipfix_header(&mut header, total, self.sequence, self.config.odid);
        data[..IPFIX_HEADER_SIZE].copy_from_slice(&header);
        Some((data, flows))
    }

    fn send_packet(&mut self, packet: &mut [u8], flows: u16) -> SendOutcome {
        if !self.ensure_connected() {
            return SendOutcome::Dropped;
        }

        let result = match self.transport.as_mut() {
            Some(Transport::Tcp(stream)) => stream.write_all(packet),
            Some(Transport::Udp(socket)) => socket.send(packet).map(|_| ()),
            None => return SendOutcome::Dropped,
        };

        match result {
            Ok(()) => {
                self.sequence = self.sequence.wrapping_add(u32::from(flows));
                self.exported_packets += 1;
                SendOutcome::Sent
            }
            Err(e) => {
                self.disconnect_after_error(&e);
                // The sequence number restarts with the connection.
                packet[8..12].copy_from_slice(&0u32.to_be_bytes());
                SendOutcome::Retry
            }
        }
    }

    fn send_templates(&mut self) {
        if let Some(mut packet) = self.create_template_packet() {
            if let SendOutcome::Retry = self.send_packet(&mut packet, 0) {
                let _ = self.send_packet(&mut packet, 0);
            }
        }
    }

    fn send_data(&mut self) {
        while let Some((mut packet, flows)) = self.create_data_packet() {
            let outcome = match self.send_packet(&mut packet, flows) {
                SendOutcome::Retry => self.send_packet(&mut packet, flows),
                other => other,
            };
            if !matches!(outcome, SendOutcome::Sent) {
                self.counters.dropped += u64::from(flows);
            }
        }
    }
}

impl OutputPlugin for IpfixExporter {
    fn name(&self) -> &'static str {
        "ipfix"
    }

    fn init(&mut self, params: &PluginParams) -> Result<(), ProbeError> {
        let config = IpfixConfig::from_params(params)?;
        *self = Self::connected(config)?;
        Ok(())
    }

    fn export_flow(&mut self, flow: &Flow) -> Result<(), ProbeError> {
        self.counters.seen += 1;
        let template_idx = self.template_for(flow)?;
        if !self.fill_record(flow, template_idx) {
            self.flush();
            if !self.fill_record(flow, template_idx) {
                log::warn!("flow record does not fit into an empty message, dropping");
                self.counters.dropped += 1;
            }
        }
        Ok(())
    }

    fn flush(&mut self) {
        self.send_templates();
        self.send_data();
    }

    fn counters(&self) -> ExportCounters {
        self.counters
    }

    fn close(&mut self) {
        self.flush();
        self.transport = None;
    }
}

fn fill_ipfix_header(data: &mut Vec<u8>, length: u16, sequence: u32, odid: u32) {
    data.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
    data.extend_from_slice(&length.to_be_bytes());
    data.extend_from_slice(&(now_unix_secs() as u32).to_be_bytes());
    data.extend_from_slice(&sequence.to_be_bytes());
    data.extend_from_slice(&odid.to_be_bytes());
}

/// Byte size of the fixed part of a basic record.
fn basic_record_len(flow: &Flow) -> usize {
    let addrs = match flow.src_ip {
        IpAddr::V4(_) => 8,
        IpAddr::V6(_) => 32,
    };
    // times 16, octets 16, packets 16, proto 1, tcp flags 2, ports 4,
    // macs 12, end reason 1, direction 1
    16 + 16 + 16 + 1 + 2 + 4 + addrs + 12 + 1 + 1
}

#[inline]
fn put(buf: &mut [u8], offset: &mut usize, bytes: &[u8]) {
    buf[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    *offset += bytes.len();
}

/// Serialise the fixed flow fields big-endian, in basic template order.
fn fill_basic_flow(flow: &Flow, buf: &mut [u8], dir_bit_field: u8) -> Option<usize> {
    let needed = basic_record_len(flow);
    if buf.len() < needed {
        return None;
    }

    let mut offset = 0usize;
    let first_ms = flow.time_first.as_secs() * 1000 + u64::from(flow.time_first.subsec_millis());
    let last_ms = flow.time_last.as_secs() * 1000 + u64::from(flow.time_last.subsec_millis());
    put(buf, &mut offset, &first_ms.to_be_bytes());
    put(buf, &mut offset, &last_ms.to_be_bytes());
    put(buf, &mut offset, &flow.src_bytes.to_be_bytes());
    put(buf, &mut offset, &flow.dst_bytes.to_be_bytes());
    put(buf, &mut offset, &u64::from(flow.src_packets).to_be_bytes());
    put(buf, &mut offset, &u64::from(flow.dst_packets).to_be_bytes());
    put(buf, &mut offset, &[flow.ip_proto]);
    put(buf, &mut offset, &[flow.src_tcp_flags]);
    put(buf, &mut offset, &[flow.dst_tcp_flags]);
    put(buf, &mut offset, &flow.src_port.to_be_bytes());
    put(buf, &mut offset, &flow.dst_port.to_be_bytes());
    match (flow.src_ip, flow.dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            put(buf, &mut offset, &src.octets());
            put(buf, &mut offset, &dst.octets());
        }
        (src, dst) => {
            let src = match src {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let dst = match dst {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            put(buf, &mut offset, &src.octets());
            put(buf, &mut offset, &dst.octets());
        }
    }
    put(buf, &mut offset, &flow.src_mac);
    put(buf, &mut offset, &flow.dst_mac);
    put(buf, &mut offset, &[flow.end_reason as u8]);
    put(buf, &mut offset, &[dir_bit_field]);

    debug_assert_eq!(offset, needed);
    Some(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowEndReason;
    use std::time::Duration;

    fn sample_flow() -> Flow {
        Flow {
            time_first: Duration::from_millis(1_700_000_000_000),
            time_last: Duration::from_millis(1_700_000_000_500),
            src_bytes: 300,
            dst_bytes: 150,
            src_packets: 3,
            dst_packets: 2,
            src_tcp_flags: 0x18,
            dst_tcp_flags: 0x10,
            ip_proto: 6,
            src_port: 1234,
            dst_port: 80,
            src_ip: "192.0.2.1".parse().unwrap(),
            dst_ip: "192.0.2.2".parse().unwrap(),
            end_reason: FlowEndReason::Eof,
            ..Flow::default()
        }
    }

    #[test]
    fn basic_v4_record_is_fixed_size() {
        let flow = sample_flow();
        let mut buf = [0u8; 128];
        let written = fill_basic_flow(&flow, &mut buf, 0).unwrap();
        assert_eq!(written, 77);
        // First field: flowStartMilliseconds.
        assert_eq!(
            u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            1_700_000_000_000
        );
    }

    #[test]
    fn basic_flow_reports_overflow() {
        let flow = sample_flow();
        let mut buf = [0u8; 10];
        assert!(fill_basic_flow(&flow, &mut buf, 0).is_none());
    }

    #[test]
    fn templates_are_shared_per_version_and_extension_set() {
        let mut exporter = IpfixExporter::with_config(IpfixConfig::default());
        let flow = sample_flow();
        let a = exporter.template_for(&flow).unwrap();
        let b = exporter.template_for(&flow).unwrap();
        assert_eq!(a, b);

        let mut v6 = sample_flow();
        v6.src_ip = "2001:db8::1".parse().unwrap();
        v6.dst_ip = "2001:db8::2".parse().unwrap();
        let c = exporter.template_for(&v6).unwrap();
        assert_ne!(a, c);

        // Both were created as one pair: ids 258 and 259.
        assert_eq!(exporter.templates[a].id, FIRST_TEMPLATE_ID);
        assert_eq!(exporter.templates[c].id, FIRST_TEMPLATE_ID + 1);
    }

    #[test]
    fn data_packet_respects_the_mtu() {
        let config = IpfixConfig {
            mtu: 200,
            ..IpfixConfig::default()
        };
        let mut exporter = IpfixExporter::with_config(config);
        let flow = sample_flow();
        let idx = exporter.template_for(&flow).unwrap();
        // 200 - 16 - 4 = 180 bytes of record space, two 77-byte records fit.
        assert!(exporter.fill_record(&flow, idx));
        assert!(exporter.fill_record(&flow, idx));
        assert!(!exporter.fill_record(&flow, idx));

        let (packet, flows) = exporter.create_data_packet().unwrap();
        assert_eq!(flows, 2);
        assert!(packet.len() <= 200);
        let advertised = u16::from_be_bytes(packet[2..4].try_into().unwrap());
        assert_eq!(usize::from(advertised), packet.len());
    }

    #[test]
    fn template_packet_marks_templates_exported() {
        let mut exporter = IpfixExporter::with_config(IpfixConfig::default());
        let flow = sample_flow();
        exporter.template_for(&flow).unwrap();
        let packet = exporter.create_template_packet().unwrap();
        assert_eq!(
            u16::from_be_bytes(packet[16..18].try_into().unwrap()),
            TEMPLATE_SET_ID
        );
        // Both the v4 and the v6 template of the pair went out.
        assert!(exporter.create_template_packet().is_none());
    }
}
