//! IPFIX information element tables.
//!
//! Enterprise number 0 is IANA, 29305 carries the reverse-direction
//! variants (RFC 5103), 8057 and 16982 are CESNET-registered elements.

/// One template field: `(enterprise number, element id, length)`.
/// Length [`VAR_LEN`] marks a variable-length element encoded on the wire
/// with the IPFIX short/long length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub en: u32,
    pub id: u16,
    pub len: i16,
}

pub const VAR_LEN: i16 = -1;

const fn field(name: &'static str, en: u32, id: u16, len: i16) -> FieldDef {
    FieldDef { name, en, id, len }
}

/// Basic biflow fields, IPv4 variant. Order is the wire order of both the
/// template record and every data record.
pub const BASIC_TMPLT_V4: &[FieldDef] = &[
    field("BYTES", 0, 1, 8),
    field("BYTES_REV", 29305, 1, 8),
    field("PACKETS", 0, 2, 8),
    field("PACKETS_REV", 29305, 2, 8),
    field("FLOW_START_MSEC", 0, 152, 8),
    field("FLOW_END_MSEC", 0, 153, 8),
    field("L3_PROTO", 0, 60, 1),
    field("L4_PROTO", 0, 4, 1),
    field("L4_TCP_FLAGS", 0, 6, 1),
    field("L4_TCP_FLAGS_REV", 29305, 6, 1),
    field("L4_PORT_SRC", 0, 7, 2),
    field("L4_PORT_DST", 0, 11, 2),
    field("INPUT_INTERFACE", 0, 10, 2),
    field("L3_IPV4_ADDR_SRC", 0, 8, 4),
    field("L3_IPV4_ADDR_DST", 0, 12, 4),
    field("L2_SRC_MAC", 0, 56, 6),
    field("L2_DST_MAC", 0, 80, 6),
];

/// Basic biflow fields, IPv6 variant.
pub const BASIC_TMPLT_V6: &[FieldDef] = &[
    field("BYTES", 0, 1, 8),
    field("BYTES_REV", 29305, 1, 8),
    field("PACKETS", 0, 2, 8),
    field("PACKETS_REV", 29305, 2, 8),
    field("FLOW_START_MSEC", 0, 152, 8),
    field("FLOW_END_MSEC", 0, 153, 8),
    field("L3_PROTO", 0, 60, 1),
    field("L4_PROTO", 0, 4, 1),
    field("L4_TCP_FLAGS", 0, 6, 1),
    field("L4_TCP_FLAGS_REV", 29305, 6, 1),
    field("L4_PORT_SRC", 0, 7, 2),
    field("L4_PORT_DST", 0, 11, 2),
    field("INPUT_INTERFACE", 0, 10, 2),
    field("L3_IPV6_ADDR_SRC", 0, 27, 16),
    field("L3_IPV6_ADDR_DST", 0, 28, 16),
    field("L2_SRC_MAC", 0, 56, 6),
    field("L2_DST_MAC", 0, 80, 6),
];

/// Fields of the standalone packet record (the `EXPORT_PACKET` path).
pub const PACKET_TMPLT: &[FieldDef] = &[
    field("L2_SRC_MAC", 0, 56, 6),
    field("L2_DST_MAC", 0, 80, 6),
    field("ETHERTYPE", 0, 256, 2),
    field("OBSERVATION_MSEC", 0, 323, 8),
];

pub const IPFIX_HTTP_TEMPLATE: &[FieldDef] = &[
    field("HTTP_USERAGENT", 16982, 100, VAR_LEN),
    field("HTTP_METHOD", 16982, 101, VAR_LEN),
    field("HTTP_DOMAIN", 16982, 102, VAR_LEN),
    field("HTTP_REFERER", 16982, 103, VAR_LEN),
    field("HTTP_URI", 16982, 105, VAR_LEN),
    field("HTTP_CONTENT_TYPE", 16982, 104, VAR_LEN),
    field("HTTP_STATUS", 16982, 106, 2),
];

pub const IPFIX_NTP_TEMPLATE: &[FieldDef] = &[
    field("NTP_LEAP", 8057, 18, 1),
    field("NTP_VERSION", 8057, 19, 1),
    field("NTP_MODE", 8057, 20, 1),
    field("NTP_STRATUM", 8057, 21, 1),
    field("NTP_POLL", 8057, 22, 1),
    field("NTP_PRECISION", 8057, 23, 1),
    field("NTP_DELAY", 8057, 24, 4),
    field("NTP_DISPERSION", 8057, 25, 4),
    field("NTP_REF_ID", 8057, 26, VAR_LEN),
    field("NTP_REF", 8057, 27, VAR_LEN),
    field("NTP_ORIG", 8057, 28, VAR_LEN),
    field("NTP_RECV", 8057, 29, VAR_LEN),
    field("NTP_SENT", 8057, 30, VAR_LEN),
];

pub const IPFIX_SSDP_TEMPLATE: &[FieldDef] = &[
    field("SSDP_LOCATION_PORT", 8057, 821, 2),
    field("SSDP_NT", 8057, 824, VAR_LEN),
    field("SSDP_USER_AGENT", 8057, 823, VAR_LEN),
    field("SSDP_ST", 8057, 825, VAR_LEN),
    field("SSDP_SERVER", 8057, 822, VAR_LEN),
];

/// Field list contributed by an extension tag. The extension enumeration
/// is closed, so the mapping is static.
pub fn ext_template(tag: crate::plugins::ExtType) -> &'static [FieldDef] {
    use crate::plugins::ExtType;
    match tag {
        ExtType::Http => IPFIX_HTTP_TEMPLATE,
        ExtType::Ntp => IPFIX_NTP_TEMPLATE,
        ExtType::Ssdp => IPFIX_SSDP_TEMPLATE,
        ExtType::Arp => IPFIX_ARP_TEMPLATE,
    }
}

pub const IPFIX_ARP_TEMPLATE: &[FieldDef] = &[
    field("ARP_HA_FORMAT", 8057, 31, 2),
    field("ARP_PA_FORMAT", 8057, 32, 2),
    field("ARP_OPCODE", 8057, 33, 2),
    field("ARP_SRC_HA", 8057, 34, VAR_LEN),
    field("ARP_SRC_PA", 8057, 35, VAR_LEN),
    field("ARP_DST_HA", 8057, 36, VAR_LEN),
    field("ARP_DST_PA", 8057, 37, VAR_LEN),
];
