//! Layered packet assembler.
//!
//! A [`Packet`] is one contiguous buffer plus an ordered list of layer
//! descriptors and their offsets. Callers name a protocol stack, assign
//! fields by key, and finalize; all offset math and checksum work stays in
//! here. The transport checksum doubles as the probe's flow identifier: the
//! two payload bytes are a compensator chosen so the checksum comes out as
//! the caller's flow value (see [`Packet::set_flow_id`]).

pub mod checksum;
pub mod field;
pub mod layers;

pub use field::{FieldKind, FieldSpec, FieldValue};
pub use layers::{LayerRole, ProtocolSpec};

use anyhow::{Result, anyhow, bail};
use std::net::IpAddr;

use checksum::{PseudoHeader, compensator_for, finish, sum_bytes};

struct Layer {
    spec: &'static ProtocolSpec,
    offset: usize,
}

/// Owned snapshot of a layer's geometry, safe to hold across buffer edits.
#[derive(Clone, Copy)]
struct LayerInfo {
    name: &'static str,
    offset: usize,
    header_len: usize,
    checksum_offset: Option<usize>,
    protocol_number: u8,
}

impl From<&Layer> for LayerInfo {
    fn from(layer: &Layer) -> Self {
        Self {
            name: layer.spec.name,
            offset: layer.offset,
            header_len: layer.spec.header_len,
            checksum_offset: layer.spec.checksum_offset,
            protocol_number: layer.spec.protocol_number,
        }
    }
}

/// A probe packet under construction or frozen for transmit.
pub struct Packet {
    buf: Vec<u8>,
    stack: Vec<Layer>,
    payload_offset: usize,
    finalized: bool,
    dirty: bool,
}

impl Packet {
    pub fn new() -> Self {
        Self { buf: Vec::new(), stack: Vec::new(), payload_offset: 0, finalized: false, dirty: false }
    }

    /// Define the layer stack, e.g. `["ipv4", "udp"]`.
    ///
    /// Allocates the buffer sized to the headers (payload starts empty),
    /// writes each layer's structural defaults, and records offsets. Fails
    /// on unknown names or incompatible adjacent layers.
    pub fn set_protocols(&mut self, names: &[&str]) -> Result<()> {
        if names.is_empty() {
            bail!("protocol stack cannot be empty");
        }
        let mut stack: Vec<Layer> = Vec::with_capacity(names.len());
        let mut offset = 0;
        for name in names {
            let spec = layers::by_name(name).ok_or_else(|| anyhow!("unknown protocol layer '{name}'"))?;
            match stack.last() {
                None => {
                    if spec.role != LayerRole::Ip {
                        bail!("'{name}' cannot be the bottom layer");
                    }
                }
                Some(below) => {
                    if !layers::compatible(below.spec, spec) {
                        bail!("'{}' cannot be stacked above '{}'", name, below.spec.name);
                    }
                }
            }
            stack.push(Layer { spec, offset });
            offset += spec.header_len;
        }

        self.buf = vec![0u8; offset];
        self.payload_offset = offset;
        for layer in &stack {
            (layer.spec.defaults)(&mut self.buf[layer.offset..layer.offset + layer.spec.header_len]);
        }
        // Announce each upper layer's protocol number in the layer below
        for pair in stack.windows(2) {
            let (below, above) = (&pair[0], &pair[1]);
            let key = match below.spec.name {
                "ipv4" => "protocol",
                "ipv6" => "next_header",
                _ => continue,
            };
            let field = below
                .spec
                .fields
                .iter()
                .find(|f| f.key == key)
                .expect("ip layers expose their protocol field");
            field.write(
                &mut self.buf[below.offset..below.offset + below.spec.header_len],
                &FieldValue::U8(above.spec.protocol_number),
            );
        }
        self.stack = stack;
        self.finalized = false;
        self.dirty = false;
        Ok(())
    }

    fn find_field(&self, key: &str) -> Option<(LayerInfo, &'static FieldSpec)> {
        for layer in &self.stack {
            if let Some(field) = layer.spec.fields.iter().find(|f| f.key == key) {
                return Some((layer.into(), field));
            }
        }
        None
    }

    /// Write `value` into the first layer exposing `key`.
    ///
    /// `"payload"` addresses the bytes above the top header. Writing after
    /// `finalize` marks the packet dirty until the next finalize.
    pub fn set_field(&mut self, key: &str, value: FieldValue) -> Result<()> {
        if key == "payload" {
            let bytes = match value {
                FieldValue::Bytes(b) => b,
                FieldValue::Str(s) => s.into_bytes(),
                other => bail!("payload expects bytes or string, got {other}"),
            };
            self.payload_resize(bytes.len());
            self.buf[self.payload_offset..].copy_from_slice(&bytes);
            return Ok(());
        }
        let (info, field) = self
            .find_field(key)
            .ok_or_else(|| anyhow!("no layer exposes field '{key}'"))?;
        if !value.matches(field.kind) {
            bail!("type mismatch for field '{key}'");
        }
        field.write(&mut self.buf[info.offset..info.offset + info.header_len], &value);
        if self.finalized {
            self.dirty = true;
        }
        Ok(())
    }

    /// Read the field back out; symmetric with [`Packet::set_field`].
    pub fn get_field(&self, key: &str) -> Result<FieldValue> {
        if key == "payload" {
            return Ok(FieldValue::Bytes(self.buf[self.payload_offset..].to_vec()));
        }
        let (info, field) = self
            .find_field(key)
            .ok_or_else(|| anyhow!("no layer exposes field '{key}'"))?;
        Ok(field.read(&self.buf[info.offset..info.offset + info.header_len]))
    }

    /// Resize the payload; checksums are invalid until the next finalize.
    pub fn payload_resize(&mut self, len: usize) {
        self.buf.resize(self.payload_offset + len, 0);
        self.finalized = false;
        self.dirty = false;
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_offset..]
    }

    fn ip_info(&self) -> Option<LayerInfo> {
        self.stack.first().filter(|l| l.spec.role == LayerRole::Ip).map(LayerInfo::from)
    }

    fn transport_info(&self) -> Option<LayerInfo> {
        self.stack.iter().find(|l| l.spec.role == LayerRole::Transport).map(LayerInfo::from)
    }

    fn pseudo_header_for(&self, transport: LayerInfo) -> Result<Option<PseudoHeader>> {
        let ip = self.ip_info().ok_or_else(|| anyhow!("no ip layer below transport"))?;
        let upper_len = self.buf.len() - transport.offset;
        match (ip.name, self.get_field("src_ip")?, self.get_field("dst_ip")?) {
            ("ipv4", FieldValue::V4(src), FieldValue::V4(dst)) => {
                // ICMPv4 checksums carry no pseudo-header
                if transport.name == "icmpv4" {
                    Ok(None)
                } else {
                    Ok(Some(PseudoHeader::V4 {
                        src,
                        dst,
                        protocol: transport.protocol_number,
                        len: upper_len as u16,
                    }))
                }
            }
            ("ipv6", FieldValue::V6(src), FieldValue::V6(dst)) => Ok(Some(PseudoHeader::V6 {
                src,
                dst,
                next_header: transport.protocol_number,
                len: upper_len as u32,
            })),
            _ => Err(anyhow!("address family does not match ip layer")),
        }
    }

    fn write_u16_raw(&mut self, info: LayerInfo, key: &str, value: u16) {
        let field = layers::by_name(info.name)
            .and_then(|spec| spec.fields.iter().find(|f| f.key == key));
        if let Some(field) = field {
            field.write(&mut self.buf[info.offset..info.offset + info.header_len], &FieldValue::U16(value));
        }
    }

    /// Recompute lengths and checksums for every layer: length fields first,
    /// then the transport checksum, then the IPv4 header checksum.
    pub fn finalize(&mut self) -> Result<()> {
        if self.stack.is_empty() {
            bail!("finalize called before set_protocols");
        }
        let total = self.buf.len();

        // Length fields
        if let Some(ip) = self.ip_info() {
            match ip.name {
                "ipv4" => self.write_u16_raw(ip, "length", total as u16),
                "ipv6" => self.write_u16_raw(ip, "length", (total - ip.header_len) as u16),
                _ => {}
            }
        }
        if let Some(udp) = self.stack.iter().find(|l| l.spec.name == "udp").map(LayerInfo::from) {
            self.write_u16_raw(udp, "length", (total - udp.offset) as u16);
        }

        // Transport checksum over pseudo-header + header + payload
        if let Some(transport) = self.transport_info() {
            let cksum_off = transport.offset
                + transport
                    .checksum_offset
                    .ok_or_else(|| anyhow!("transport layer lacks a checksum"))?;
            let pseudo = self.pseudo_header_for(transport)?;
            self.buf[cksum_off..cksum_off + 2].copy_from_slice(&[0, 0]);
            let mut sum = sum_bytes(&self.buf[transport.offset..]);
            if let Some(ph) = &pseudo {
                sum += ph.sum();
            }
            let mut cksum = finish(sum);
            // UDP reserves zero for "no checksum"
            if cksum == 0 && transport.name == "udp" {
                cksum = 0xFFFF;
            }
            self.buf[cksum_off..cksum_off + 2].copy_from_slice(&cksum.to_be_bytes());
        }

        // IPv4 header checksum last, after the length field settled
        if let Some(ip) = self.ip_info()
            && let Some(cksum_off) = ip.checksum_offset
        {
            self.buf[cksum_off..cksum_off + 2].copy_from_slice(&[0, 0]);
            let cksum = finish(sum_bytes(&self.buf[..ip.header_len]));
            self.buf[cksum_off..cksum_off + 2].copy_from_slice(&cksum.to_be_bytes());
        }

        self.finalized = true;
        self.dirty = false;
        Ok(())
    }

    /// Drive the transport checksum to exactly `flow` by solving for the
    /// two-byte payload compensator, then re-finalize the transport layer
    /// only. Requires a finalized packet with at least two payload bytes.
    pub fn set_flow_id(&mut self, flow: u16) -> Result<()> {
        if !self.finalized {
            bail!("set_flow_id requires a finalized packet");
        }
        let transport = self
            .transport_info()
            .ok_or_else(|| anyhow!("no transport layer to carry a flow identifier"))?;
        let cksum_off = transport.offset
            + transport
                .checksum_offset
                .ok_or_else(|| anyhow!("transport layer lacks a checksum"))?;
        if self.buf.len() < self.payload_offset + 2 {
            bail!("flow identifier needs at least 2 payload bytes");
        }
        let pseudo = self.pseudo_header_for(transport)?;
        let p_off = self.payload_offset;

        self.buf[p_off..p_off + 2].copy_from_slice(&[0, 0]);
        self.buf[cksum_off..cksum_off + 2].copy_from_slice(&[0, 0]);
        let mut sum = sum_bytes(&self.buf[transport.offset..]);
        if let Some(ph) = &pseudo {
            sum += ph.sum();
        }
        let comp = compensator_for(flow, sum);
        self.buf[p_off..p_off + 2].copy_from_slice(&comp.to_be_bytes());
        self.buf[cksum_off..cksum_off + 2].copy_from_slice(&flow.to_be_bytes());
        self.dirty = false;
        Ok(())
    }

    /// The flow identifier carried by this packet (= transport checksum).
    pub fn flow_id(&self) -> Result<u16> {
        match self.get_field("checksum")? {
            FieldValue::U16(v) => Ok(v),
            _ => unreachable!("checksum fields are u16"),
        }
    }

    /// Recompute the transport checksum and check the stored value verifies.
    pub fn transport_checksum_valid(&self) -> Result<bool> {
        let transport = self.transport_info().ok_or_else(|| anyhow!("no transport layer"))?;
        let pseudo = self.pseudo_header_for(transport)?;
        let mut sum = sum_bytes(&self.buf[transport.offset..]);
        if let Some(ph) = &pseudo {
            sum += ph.sum();
        }
        // Including the stored checksum, a valid packet folds to 0xFFFF
        Ok(checksum::fold(sum) == 0xFFFF)
    }

    /// Frozen wire bytes. Sending a dirty packet is a programming error.
    pub fn bytes(&self) -> &[u8] {
        assert!(self.finalized && !self.dirty, "packet bytes requested while dirty; call finalize");
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized && !self.dirty
    }

    /// Name of the transport layer, if the stack has one.
    pub fn transport_name(&self) -> Option<&'static str> {
        self.transport_info().map(|l| l.name)
    }

    /// First 8 bytes of the transport header, as quoted by ICMP errors.
    pub fn transport_head(&self) -> Result<[u8; 8]> {
        let transport = self.transport_info().ok_or_else(|| anyhow!("no transport layer"))?;
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.buf[transport.offset..transport.offset + 8]);
        Ok(head)
    }

    pub fn src_addr(&self) -> Result<IpAddr> {
        match self.get_field("src_ip")? {
            FieldValue::V4(a) => Ok(IpAddr::V4(a)),
            FieldValue::V6(a) => Ok(IpAddr::V6(a)),
            _ => unreachable!("src_ip is an address field"),
        }
    }

    pub fn dst_addr(&self) -> Result<IpAddr> {
        match self.get_field("dst_ip")? {
            FieldValue::V4(a) => Ok(IpAddr::V4(a)),
            FieldValue::V6(a) => Ok(IpAddr::V6(a)),
            _ => unreachable!("dst_ip is an address field"),
        }
    }

    pub fn ttl(&self) -> Result<u8> {
        match self.get_field("ttl")? {
            FieldValue::U8(v) => Ok(v),
            _ => unreachable!("ttl is a u8 field"),
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}
