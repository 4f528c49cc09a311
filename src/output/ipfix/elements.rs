//! IPFIX information element registry.
//!
//! References:
//! - <https://www.iana.org/assignments/ipfix/ipfix.xhtml>
//! - <https://datatracker.ietf.org/doc/html/rfc5103> (reverse elements)

/// Reverse-direction private enterprise number (RFC 5103).
pub const IANA_REVERSE_PEN: u32 = 29305;
/// CESNET private enterprise number used by the per-packet series fields.
pub const CESNET_PEN: u32 = 8057;

/// Element ids of the per-packet series exported by the pstats plugin.
pub const PSTATS_PKT_LENGTHS: u16 = 1013;
pub const PSTATS_PKT_TIMES: u16 = 1014;
pub const PSTATS_PKT_FLAGS: u16 = 1015;
pub const PSTATS_PKT_DIRECTIONS: u16 = 1016;

/// Marker for variable-length elements in [`ElementDef::len`].
pub const VAR_LEN: i16 = -1;

/// One exportable information element: enterprise number, element id and
/// on-wire length (`VAR_LEN` for variable-length fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementDef {
    pub name: &'static str,
    pub enterprise: u32,
    pub id: u16,
    pub len: i16,
}

/// Every element the encoder can name in a template.
pub const ELEMENTS: &[ElementDef] = &[
    ElementDef { name: "flowStartMilliseconds", enterprise: 0, id: 152, len: 8 },
    ElementDef { name: "flowEndMilliseconds", enterprise: 0, id: 153, len: 8 },
    ElementDef { name: "octetDeltaCount", enterprise: 0, id: 1, len: 8 },
    ElementDef { name: "octetDeltaCountRev", enterprise: IANA_REVERSE_PEN, id: 1, len: 8 },
    ElementDef { name: "packetDeltaCount", enterprise: 0, id: 2, len: 8 },
    ElementDef { name: "packetDeltaCountRev", enterprise: IANA_REVERSE_PEN, id: 2, len: 8 },
    ElementDef { name: "protocolIdentifier", enterprise: 0, id: 4, len: 1 },
    ElementDef { name: "tcpControlBits", enterprise: 0, id: 6, len: 1 },
    ElementDef { name: "tcpControlBitsRev", enterprise: IANA_REVERSE_PEN, id: 6, len: 1 },
    ElementDef { name: "sourceTransportPort", enterprise: 0, id: 7, len: 2 },
    ElementDef { name: "destinationTransportPort", enterprise: 0, id: 11, len: 2 },
    ElementDef { name: "sourceIPv4Address", enterprise: 0, id: 8, len: 4 },
    ElementDef { name: "destinationIPv4Address", enterprise: 0, id: 12, len: 4 },
    ElementDef { name: "sourceIPv6Address", enterprise: 0, id: 27, len: 16 },
    ElementDef { name: "destinationIPv6Address", enterprise: 0, id: 28, len: 16 },
    ElementDef { name: "sourceMacAddress", enterprise: 0, id: 56, len: 6 },
    ElementDef { name: "destinationMacAddress", enterprise: 0, id: 80, len: 6 },
    ElementDef { name: "flowEndReason", enterprise: 0, id: 136, len: 1 },
    ElementDef { name: "flowDirection", enterprise: 0, id: 61, len: 1 },
    ElementDef { name: "pktLengths", enterprise: CESNET_PEN, id: PSTATS_PKT_LENGTHS, len: VAR_LEN },
    ElementDef { name: "pktTimes", enterprise: CESNET_PEN, id: PSTATS_PKT_TIMES, len: VAR_LEN },
    ElementDef { name: "pktFlags", enterprise: CESNET_PEN, id: PSTATS_PKT_FLAGS, len: VAR_LEN },
    ElementDef { name: "pktDirections", enterprise: CESNET_PEN, id: PSTATS_PKT_DIRECTIONS, len: VAR_LEN },
];

/// Field order of the basic IPv4 flow record.
pub const BASIC_TEMPLATE_V4: &[&str] = &[
    "flowStartMilliseconds",
    "flowEndMilliseconds",
    "octetDeltaCount",
    "octetDeltaCountRev",
    "packetDeltaCount",
    "packetDeltaCountRev",
    "protocolIdentifier",
    "tcpControlBits",
    "tcpControlBitsRev",
    "sourceTransportPort",
    "destinationTransportPort",
    "sourceIPv4Address",
    "destinationIPv4Address",
    "sourceMacAddress",
    "destinationMacAddress",
    "flowEndReason",
    "flowDirection",
];

/// Field order of the basic IPv6 flow record.
pub const BASIC_TEMPLATE_V6: &[&str] = &[
    "flowStartMilliseconds",
    "flowEndMilliseconds",
    "octetDeltaCount",
    "octetDeltaCountRev",
    "packetDeltaCount",
    "packetDeltaCountRev",
    "protocolIdentifier",
    "tcpControlBits",
    "tcpControlBitsRev",
    "sourceTransportPort",
    "destinationTransportPort",
    "sourceIPv6Address",
    "destinationIPv6Address",
    "sourceMacAddress",
    "destinationMacAddress",
    "flowEndReason",
    "flowDirection",
];

/// Look up an element definition by template field name.
pub fn lookup(name: &str) -> Option<&'static ElementDef> {
    ELEMENTS.iter().find(|e| e.name == name)
}
