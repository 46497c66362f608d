//! Static protocol descriptors: header layout, named fields, defaults.
//!
//! Descriptors are process-wide constants. The packet assembler walks them to
//! size buffers, resolve field keys, and finalize checksums; nothing outside
//! this module hard-codes a header offset.

use super::field::{FieldKind, FieldSpec};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

/// ICMP echo request types
pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;

/// Which role a layer plays in the stack; used for compatibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    /// Bottom of the stack (IPv4 or IPv6)
    Ip,
    /// Sits directly above an IP layer; nothing stacks above it
    Transport,
}

/// Static description of one protocol layer.
pub struct ProtocolSpec {
    pub name: &'static str,
    pub role: LayerRole,
    pub header_len: usize,
    /// IP protocol / next-header number announced by the layer below
    pub protocol_number: u8,
    pub fields: &'static [FieldSpec],
    /// Offset of the 16-bit checksum field within the header, if any
    pub checksum_offset: Option<usize>,
    /// Write structural defaults into a zeroed header
    pub defaults: fn(&mut [u8]),
}

const IPV4_FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "version", kind: FieldKind::U4 { high: true }, offset: 0 },
    FieldSpec { key: "ihl", kind: FieldKind::U4 { high: false }, offset: 0 },
    FieldSpec { key: "tos", kind: FieldKind::U8, offset: 1 },
    FieldSpec { key: "length", kind: FieldKind::U16, offset: 2 },
    FieldSpec { key: "id", kind: FieldKind::U16, offset: 4 },
    FieldSpec { key: "frag_off", kind: FieldKind::U16, offset: 6 },
    FieldSpec { key: "ttl", kind: FieldKind::U8, offset: 8 },
    FieldSpec { key: "protocol", kind: FieldKind::U8, offset: 9 },
    FieldSpec { key: "checksum", kind: FieldKind::U16, offset: 10 },
    FieldSpec { key: "src_ip", kind: FieldKind::V4, offset: 12 },
    FieldSpec { key: "dst_ip", kind: FieldKind::V4, offset: 16 },
];

const IPV6_FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "version", kind: FieldKind::U4 { high: true }, offset: 0 },
    FieldSpec { key: "flow_label", kind: FieldKind::U32 { mask: 0x000F_FFFF }, offset: 0 },
    FieldSpec { key: "length", kind: FieldKind::U16, offset: 4 },
    FieldSpec { key: "next_header", kind: FieldKind::U8, offset: 6 },
    // Hop limit is the IPv6 TTL; exposed under the same key so callers
    // address both families uniformly.
    FieldSpec { key: "ttl", kind: FieldKind::U8, offset: 7 },
    FieldSpec { key: "src_ip", kind: FieldKind::V6, offset: 8 },
    FieldSpec { key: "dst_ip", kind: FieldKind::V6, offset: 24 },
];

const UDP_FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "src_port", kind: FieldKind::U16, offset: 0 },
    FieldSpec { key: "dst_port", kind: FieldKind::U16, offset: 2 },
    FieldSpec { key: "length", kind: FieldKind::U16, offset: 4 },
    FieldSpec { key: "checksum", kind: FieldKind::U16, offset: 6 },
];

const TCP_FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "src_port", kind: FieldKind::U16, offset: 0 },
    FieldSpec { key: "dst_port", kind: FieldKind::U16, offset: 2 },
    FieldSpec { key: "seq_num", kind: FieldKind::U32 { mask: 0xFFFF_FFFF }, offset: 4 },
    FieldSpec { key: "ack_num", kind: FieldKind::U32 { mask: 0xFFFF_FFFF }, offset: 8 },
    FieldSpec { key: "data_offset", kind: FieldKind::U4 { high: true }, offset: 12 },
    FieldSpec { key: "flags", kind: FieldKind::U8, offset: 13 },
    FieldSpec { key: "window", kind: FieldKind::U16, offset: 14 },
    FieldSpec { key: "checksum", kind: FieldKind::U16, offset: 16 },
    FieldSpec { key: "urgent", kind: FieldKind::U16, offset: 18 },
];

const ICMP_FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "type", kind: FieldKind::U8, offset: 0 },
    FieldSpec { key: "code", kind: FieldKind::U8, offset: 1 },
    FieldSpec { key: "checksum", kind: FieldKind::U16, offset: 2 },
    FieldSpec { key: "identifier", kind: FieldKind::U16, offset: 4 },
    FieldSpec { key: "sequence", kind: FieldKind::U16, offset: 6 },
];

fn ipv4_defaults(header: &mut [u8]) {
    header[0] = 0x45; // version 4, IHL 5
    header[8] = 64; // ttl
}

fn ipv6_defaults(header: &mut [u8]) {
    header[0] = 0x60; // version 6
    header[7] = 64; // hop limit
}

fn udp_defaults(_header: &mut [u8]) {}

fn tcp_defaults(header: &mut [u8]) {
    header[12] = 0x50; // data offset 5 words, no options
    header[13] = 0x02; // SYN
    header[14..16].copy_from_slice(&1024u16.to_be_bytes()); // window
}

fn icmpv4_defaults(header: &mut [u8]) {
    header[0] = ICMPV4_ECHO_REQUEST;
}

fn icmpv6_defaults(header: &mut [u8]) {
    header[0] = ICMPV6_ECHO_REQUEST;
}

pub static IPV4: ProtocolSpec = ProtocolSpec {
    name: "ipv4",
    role: LayerRole::Ip,
    header_len: 20,
    protocol_number: 0, // never stacked above anything
    fields: IPV4_FIELDS,
    checksum_offset: Some(10),
    defaults: ipv4_defaults,
};

pub static IPV6: ProtocolSpec = ProtocolSpec {
    name: "ipv6",
    role: LayerRole::Ip,
    header_len: 40,
    protocol_number: 0,
    fields: IPV6_FIELDS,
    checksum_offset: None,
    defaults: ipv6_defaults,
};

pub static UDP: ProtocolSpec = ProtocolSpec {
    name: "udp",
    role: LayerRole::Transport,
    header_len: 8,
    protocol_number: IPPROTO_UDP,
    fields: UDP_FIELDS,
    checksum_offset: Some(6),
    defaults: udp_defaults,
};

pub static TCP: ProtocolSpec = ProtocolSpec {
    name: "tcp",
    role: LayerRole::Transport,
    header_len: 20,
    protocol_number: IPPROTO_TCP,
    fields: TCP_FIELDS,
    checksum_offset: Some(16),
    defaults: tcp_defaults,
};

pub static ICMPV4: ProtocolSpec = ProtocolSpec {
    name: "icmpv4",
    role: LayerRole::Transport,
    header_len: 8,
    protocol_number: IPPROTO_ICMP,
    fields: ICMP_FIELDS,
    checksum_offset: Some(2),
    defaults: icmpv4_defaults,
};

pub static ICMPV6: ProtocolSpec = ProtocolSpec {
    name: "icmpv6",
    role: LayerRole::Transport,
    header_len: 8,
    protocol_number: IPPROTO_ICMPV6,
    fields: ICMP_FIELDS,
    checksum_offset: Some(2),
    defaults: icmpv6_defaults,
};

/// Resolve a layer name to its descriptor.
pub fn by_name(name: &str) -> Option<&'static ProtocolSpec> {
    match name {
        "ipv4" => Some(&IPV4),
        "ipv6" => Some(&IPV6),
        "udp" => Some(&UDP),
        "tcp" => Some(&TCP),
        "icmpv4" => Some(&ICMPV4),
        "icmpv6" => Some(&ICMPV6),
        _ => None,
    }
}

/// Whether `upper` may sit directly on top of `lower`.
pub fn compatible(lower: &ProtocolSpec, upper: &ProtocolSpec) -> bool {
    if lower.role != LayerRole::Ip || upper.role != LayerRole::Transport {
        return false;
    }
    match lower.name {
        "ipv4" => matches!(upper.name, "udp" | "tcp" | "icmpv4"),
        "ipv6" => matches!(upper.name, "udp" | "tcp" | "icmpv6"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_resolve() {
        for name in ["ipv4", "ipv6", "udp", "tcp", "icmpv4", "icmpv6"] {
            assert!(by_name(name).is_some(), "missing descriptor for {name}");
        }
        assert!(by_name("gre").is_none());
    }

    #[test]
    fn stacking_rules() {
        assert!(compatible(&IPV4, &UDP));
        assert!(compatible(&IPV4, &ICMPV4));
        assert!(compatible(&IPV6, &ICMPV6));
        assert!(!compatible(&IPV4, &ICMPV6));
        assert!(!compatible(&IPV6, &ICMPV4));
        assert!(!compatible(&UDP, &TCP));
        assert!(!compatible(&UDP, &UDP));
    }

    #[test]
    fn field_offsets_stay_inside_headers() {
        for spec in [&IPV4, &IPV6, &UDP, &TCP, &ICMPV4, &ICMPV6] {
            for field in spec.fields {
                let width = match field.kind {
                    FieldKind::U4 { .. } | FieldKind::U8 => 1,
                    FieldKind::U16 => 2,
                    FieldKind::U32 { .. } => 4,
                    FieldKind::V4 => 4,
                    FieldKind::V6 => 16,
                };
                assert!(
                    field.offset + width <= spec.header_len,
                    "{}.{} overruns header",
                    spec.name,
                    field.key
                );
            }
        }
    }
}
