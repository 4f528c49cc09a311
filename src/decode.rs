//! IPFIX message decoding.
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011>
//! - <https://www.iana.org/assignments/ipfix/ipfix.xhtml>
//!
//! A small collector-side parser for the messages this crate's exporter
//! emits: it learns templates from template sets, keeps them in an LRU
//! cache, and decodes data sets against them into typed field maps. The
//! integration tests use it to round-trip exported flows; it is equally
//! usable as a minimal standalone collector library.

use lru::LruCache;
use nom::IResult;
use nom::bytes::complete::take;
use nom::number::complete::{be_u8, be_u16, be_u32};
use nom_derive::{Nom, Parse};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use thiserror::Error;

pub const TEMPLATE_SET_ID: u16 = 2;
pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
pub const DATA_SET_MIN_ID: u16 = 256;
/// Field length announcing a variable-length element.
pub const VARIABLE_LENGTH: u16 = 0xFFFF;

const DEFAULT_TEMPLATE_CACHE_SIZE: usize = 1024;

/// IPFIX message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Nom)]
pub struct MessageHeader {
    /// 0x000a for IPFIX.
    pub version: u16,
    /// Total message length in octets including this header.
    pub length: u16,
    /// Export time in unix seconds.
    pub export_time: u32,
    /// Cumulative count of exported data records, modulo 2^32.
    pub sequence_number: u32,
    pub observation_domain_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Nom)]
pub struct SetHeader {
    pub id: u16,
    pub length: u16,
}

/// One field specifier of a learned template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TemplateField {
    pub id: u16,
    pub length: u16,
    pub enterprise: Option<u32>,
}

/// A learned template record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateRecord {
    pub template_id: u16,
    pub fields: Vec<TemplateField>,
}

/// Identity of a decoded field: enterprise number (0 = IANA) and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FieldKey {
    pub enterprise: u32,
    pub id: u16,
}

impl FieldKey {
    pub fn iana(id: u16) -> Self {
        Self { enterprise: 0, id }
    }

    pub fn enterprise(enterprise: u32, id: u16) -> Self {
        Self { enterprise, id }
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FieldValue {
    /// Fixed-width 1/2/4/8 byte integer, big-endian.
    Unsigned(u64),
    Ip4Addr(Ipv4Addr),
    Ip6Addr(Ipv6Addr),
    Mac([u8; 6]),
    /// Raw bytes of variable-length or unrecognised fields.
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Unsigned(value) => Some(*value),
            _ => None,
        }
    }
}

/// One decoded data record: field identity to value.
pub type DataRecord = BTreeMap<FieldKey, FieldValue>;

#[derive(Debug, Clone, Serialize)]
pub enum DecodedSet {
    Templates(Vec<TemplateRecord>),
    Data {
        template_id: u16,
        records: Vec<DataRecord>,
    },
    /// Sets this reader does not interpret (options templates).
    Skipped { set_id: u16 },
}

#[derive(Debug, Clone, Serialize)]
pub struct DecodedMessage {
    pub header: MessageHeader,
    pub sets: Vec<DecodedSet>,
}

impl DecodedMessage {
    /// All data records of the message, template ids erased.
    pub fn data_records(&self) -> impl Iterator<Item = &DataRecord> {
        self.sets.iter().flat_map(|set| match set {
            DecodedSet::Data { records, .. } => records.as_slice(),
            _ => &[],
        })
    }

    /// All template records of the message.
    pub fn template_records(&self) -> impl Iterator<Item = &TemplateRecord> {
        self.sets.iter().flat_map(|set| match set {
            DecodedSet::Templates(templates) => templates.as_slice(),
            _ => &[],
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unsupported message version {0}")]
    BadVersion(u16),

    #[error("message length {0} is shorter than the header")]
    BadLength(u16),

    #[error("data set {template_id} arrived before its template")]
    MissingTemplate { template_id: u16 },
}

/// Result of draining a byte buffer: everything decoded before the first
/// error is kept.
#[derive(Debug)]
pub struct ReadResult {
    pub messages: Vec<DecodedMessage>,
    pub error: Option<DecodeError>,
}

impl ReadResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Stateful IPFIX reader with a learned-template cache.
pub struct IpfixReader {
    templates: LruCache<u16, TemplateRecord>,
}

impl Default for IpfixReader {
    fn default() -> Self {
        Self::with_cache_size(DEFAULT_TEMPLATE_CACHE_SIZE)
    }
}

impl IpfixReader {
    pub fn with_cache_size(size: usize) -> Self {
        let size = NonZeroUsize::new(size.max(1)).expect("max(1) is non-zero");
        Self {
            templates: LruCache::new(size),
        }
    }

    /// Ids of the templates learned so far.
    pub fn template_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.templates.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }

    /// Decode all complete messages in `buf`, stopping at the first
    /// error but keeping everything decoded before it.
    pub fn parse_bytes(&mut self, buf: &[u8]) -> ReadResult {
        let mut messages = Vec::new();
        let mut remaining = buf;
        let mut error = None;

        while !remaining.is_empty() {
            match self.parse_message(remaining) {
                Ok((message, rest)) => {
                    messages.push(message);
                    remaining = rest;
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        ReadResult { messages, error }
    }

    /// Decode one message, returning it and the unconsumed tail.
    pub fn parse_message<'a>(
        &mut self,
        buf: &'a [u8],
    ) -> Result<(DecodedMessage, &'a [u8]), DecodeError> {
        let (after_header, header) =
            MessageHeader::parse(buf).map_err(|_| DecodeError::Truncated("message header"))?;
        if header.version != 10 {
            return Err(DecodeError::BadVersion(header.version));
        }
        let total = usize::from(header.length);
        if total < 16 {
            return Err(DecodeError::BadLength(header.length));
        }
        if buf.len() < total {
            return Err(DecodeError::Truncated("message body"));
        }
        let mut body = &after_header[..total - 16];
        let rest = &buf[total..];

        let mut sets = Vec::new();
        while !body.is_empty() {
            let (content, set) = self.parse_set(body)?;
            sets.push(set);
            body = content;
        }

        Ok((DecodedMessage { header, sets }, rest))
    }

    fn parse_set<'a>(&mut self, buf: &'a [u8]) -> Result<(&'a [u8], DecodedSet), DecodeError> {
        let (after_header, set_header) =
            SetHeader::parse(buf).map_err(|_| DecodeError::Truncated("set header"))?;
        let set_len = usize::from(set_header.length);
        if set_len < 4 || buf.len() < set_len {
            return Err(DecodeError::Truncated("set body"));
        }
        let content = &after_header[..set_len - 4];
        let rest = &buf[set_len..];

        let set = match set_header.id {
            TEMPLATE_SET_ID => DecodedSet::Templates(self.parse_templates(content)?),
            id if id >= DATA_SET_MIN_ID => {
                let template = self
                    .templates
                    .get(&id)
                    .cloned()
                    .ok_or(DecodeError::MissingTemplate { template_id: id })?;
                DecodedSet::Data {
                    template_id: id,
                    records: parse_data_records(content, &template)?,
                }
            }
            id => DecodedSet::Skipped { set_id: id },
        };
        Ok((rest, set))
    }

    fn parse_templates(&mut self, mut buf: &[u8]) -> Result<Vec<TemplateRecord>, DecodeError> {
        let mut templates = Vec::new();
        // Anything shorter than a record header is set padding.
        while buf.len() >= 4 {
            let (rest, template) =
                parse_template_record(buf).map_err(|_| DecodeError::Truncated("template"))?;
            self.templates.put(template.template_id, template.clone());
            templates.push(template);
            buf = rest;
        }
        Ok(templates)
    }
}

fn parse_template_record(input: &[u8]) -> IResult<&[u8], TemplateRecord> {
    let (input, template_id) = be_u16(input)?;
    let (mut input, field_count) = be_u16(input)?;
    let mut fields = Vec::with_capacity(usize::from(field_count));
    for _ in 0..field_count {
        let (rest, raw_id) = be_u16(input)?;
        let (rest, length) = be_u16(rest)?;
        let (rest, enterprise) = if raw_id & 0x8000 != 0 {
            let (rest, pen) = be_u32(rest)?;
            (rest, Some(pen))
        } else {
            (rest, None)
        };
        fields.push(TemplateField {
            id: raw_id & 0x7FFF,
            length,
            enterprise,
        });
        input = rest;
    }
    Ok((input, TemplateRecord {
        template_id,
        fields,
    }))
}

fn parse_data_records(
    mut buf: &[u8],
    template: &TemplateRecord,
) -> Result<Vec<DataRecord>, DecodeError> {
    let mut records = Vec::new();
    while !buf.is_empty() {
        let (rest, record) =
            parse_data_record(buf, template).map_err(|_| DecodeError::Truncated("data record"))?;
        records.push(record);
        buf = rest;
    }
    Ok(records)
}

fn parse_data_record<'a>(
    mut input: &'a [u8],
    template: &TemplateRecord,
) -> IResult<&'a [u8], DataRecord> {
    let mut record = DataRecord::new();
    for field in &template.fields {
        let (rest, data) = if field.length == VARIABLE_LENGTH {
            let (rest, short_len) = be_u8(input)?;
            let (rest, len) = if short_len == 0xFF {
                let (rest, long_len) = be_u16(rest)?;
                (rest, long_len)
            } else {
                (rest, u16::from(short_len))
            };
            take(len)(rest)?
        } else {
            take(field.length)(input)?
        };
        record.insert(
            FieldKey {
                enterprise: field.enterprise.unwrap_or(0),
                id: field.id,
            },
            decode_value(field, data),
        );
        input = rest;
    }
    Ok((input, record))
}

/// Type a field by its well-known identity, falling back to integers for
/// machine-width fields and raw bytes otherwise.
fn decode_value(field: &TemplateField, data: &[u8]) -> FieldValue {
    match (field.enterprise.unwrap_or(0), field.id, data.len()) {
        (0, 8 | 12, 4) => {
            FieldValue::Ip4Addr(Ipv4Addr::from(u32::from_be_bytes(data.try_into().unwrap())))
        }
        (0, 27 | 28, 16) => {
            FieldValue::Ip6Addr(Ipv6Addr::from(u128::from_be_bytes(data.try_into().unwrap())))
        }
        (0, 56 | 80, 6) => FieldValue::Mac(data.try_into().unwrap()),
        (_, _, 1) => FieldValue::Unsigned(u64::from(data[0])),
        (_, _, 2) => FieldValue::Unsigned(u64::from(u16::from_be_bytes(data.try_into().unwrap()))),
        (_, _, 4) => FieldValue::Unsigned(u64::from(u32::from_be_bytes(data.try_into().unwrap()))),
        (_, _, 8) => FieldValue::Unsigned(u64::from_be_bytes(data.try_into().unwrap())),
        _ => FieldValue::Bytes(data.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Template set defining template 256 with ids 8, 12, 2, then one
    /// data set with a single record.
    fn sample_message() -> Vec<u8> {
        let mut msg = hex::decode(concat!(
            "000a0040", // version 10, length 64
            "01020304", // export time
            "00000000", // sequence
            "01020304", // odid
            // template set
            "00020014", // set id 2, length 20
            "01000003", // template 256, 3 fields
            "00080004", // sourceIPv4Address len 4
            "000c0004", // destinationIPv4Address len 4
            "00020004", // packetDeltaCount len 4
            // data set
            "0100001c", // set id 256, length 28
            "01020304", "01020303", "00020002", // record 1
            "01020305", "01020302", "00030003", // record 2
        ))
        .unwrap();
        assert_eq!(msg.len(), 64);
        msg.truncate(64);
        msg
    }

    #[test]
    fn learns_templates_then_decodes_data() {
        let mut reader = IpfixReader::default();
        let result = reader.parse_bytes(&sample_message());
        assert!(result.is_ok(), "unexpected error: {:?}", result.error);
        assert_eq!(result.messages.len(), 1);

        let message = &result.messages[0];
        assert_eq!(message.header.version, 10);
        assert_eq!(message.template_records().count(), 1);
        assert_eq!(reader.template_ids(), vec![256]);

        let records: Vec<&DataRecord> = message.data_records().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].get(&FieldKey::iana(8)),
            Some(&FieldValue::Ip4Addr(Ipv4Addr::new(1, 2, 3, 4)))
        );
        assert_eq!(
            records[1].get(&FieldKey::iana(2)).and_then(|v| v.as_u64()),
            Some(0x30003)
        );
    }

    #[test]
    fn data_before_template_is_reported() {
        let mut reader = IpfixReader::default();
        let msg = hex::decode(concat!(
            "000a001c",
            "01020304",
            "00000000",
            "01020304",
            "0100000c",
            "0102030401020303"
        ))
        .unwrap();
        let result = reader.parse_bytes(&msg);
        assert_eq!(
            result.error,
            Some(DecodeError::MissingTemplate { template_id: 256 })
        );
    }

    #[test]
    fn truncated_messages_keep_earlier_ones() {
        let mut reader = IpfixReader::default();
        let mut bytes = sample_message();
        bytes.extend_from_slice(&[0x00, 0x0a, 0x00]);
        let result = reader.parse_bytes(&bytes);
        assert_eq!(result.messages.len(), 1);
        assert!(matches!(result.error, Some(DecodeError::Truncated(_))));
    }

    #[test]
    fn rejects_foreign_versions() {
        let mut reader = IpfixReader::default();
        let result = reader.parse_bytes(&[0x00, 0x09, 0x00, 0x10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(result.error, Some(DecodeError::BadVersion(9)));
    }
}
