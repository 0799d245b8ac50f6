//! Discovery packet codec
//!
//! Encodes and decodes the three discovery packet kinds by walking the field
//! table of a [`Schema`]. Dispatch code only ever sees [`DiscoveryPacket`];
//! byte offsets live in the schema.
//!
//! # Built-in Layout (schema v1)
//!
//! ```text
//! ┌────────────┬──────────┬───────────────┬──────────────┬─────────────────┐
//! │ Length 2B  │ Type 2B  │ Sender ID 8B  │ Reserved 8B  │ Body (per type) │
//! └────────────┴──────────┴───────────────┴──────────────┴─────────────────┘
//!
//! Request  (0): -
//! Response (1): data (u32le length + hex text)
//! Message  (2): recipient_id (u64le), data (u32le length + UTF-8)
//! ```
//!
//! All integers are little-endian.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::schema::{Field, FieldRole, FieldType, Schema};
use crate::NetworkId;

// ============================================================================
// Packet Types
// ============================================================================

/// The discovery packet kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Broadcast probe
    Request,
    /// Advertisement reply
    Response,
    /// Unicast signaling carrier
    Message,
}

impl PacketType {
    /// Name of the layout in the schema table
    pub fn schema_name(&self) -> &'static str {
        match self {
            PacketType::Request => "request",
            PacketType::Response => "response",
            PacketType::Message => "message",
        }
    }

    fn from_schema_name(name: &str) -> Option<Self> {
        match name {
            "request" => Some(PacketType::Request),
            "response" => Some(PacketType::Response),
            "message" => Some(PacketType::Message),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.schema_name())
    }
}

/// A decoded discovery packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryPacket {
    Request {
        sender_id: NetworkId,
    },
    Response {
        sender_id: NetworkId,
        /// Advertisement payload
        data: Vec<u8>,
    },
    Message {
        sender_id: NetworkId,
        recipient_id: NetworkId,
        /// Serialized signal
        data: String,
    },
}

impl DiscoveryPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            DiscoveryPacket::Request { .. } => PacketType::Request,
            DiscoveryPacket::Response { .. } => PacketType::Response,
            DiscoveryPacket::Message { .. } => PacketType::Message,
        }
    }

    pub fn sender_id(&self) -> NetworkId {
        match self {
            DiscoveryPacket::Request { sender_id }
            | DiscoveryPacket::Response { sender_id, .. }
            | DiscoveryPacket::Message { sender_id, .. } => *sender_id,
        }
    }

    fn field_values(&self) -> HashMap<&'static str, FieldValue> {
        let mut values = HashMap::new();
        values.insert("sender_id", FieldValue::Int(self.sender_id()));
        match self {
            DiscoveryPacket::Request { .. } => {}
            DiscoveryPacket::Response { data, .. } => {
                values.insert("data", FieldValue::Bytes(data.clone()));
            }
            DiscoveryPacket::Message {
                recipient_id, data, ..
            } => {
                values.insert("recipient_id", FieldValue::Int(*recipient_id));
                values.insert("data", FieldValue::Text(data.clone()));
            }
        }
        values
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldValue {
    Int(u64),
    Bytes(Vec<u8>),
    Text(String),
}

// ============================================================================
// Codec
// ============================================================================

/// Schema-driven encoder/decoder for discovery packets
#[derive(Debug, Clone)]
pub struct PacketCodec {
    schema: Schema,
}

impl PacketCodec {
    pub fn new(schema: Schema) -> Result<Self> {
        schema.validate()?;
        Ok(Self { schema })
    }

    /// Codec for the built-in schema table
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            schema: Schema::builtin()?,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Read only the type tag from a packet
    pub fn peek_type(&self, buf: &[u8]) -> Result<u16> {
        let offset = self.schema.type_tag_offset();
        if buf.len() < offset + 2 {
            return Err(Error::Format(format!(
                "packet too short for type tag: {} bytes",
                buf.len()
            )));
        }
        Ok(u16::from_le_bytes([buf[offset], buf[offset + 1]]))
    }

    /// Encode a packet to its plaintext wire form
    pub fn encode(&self, packet: &DiscoveryPacket) -> Result<Vec<u8>> {
        let kind = packet.packet_type();
        let layout = self
            .schema
            .layout(kind.schema_name())
            .ok_or_else(|| Error::Protocol(format!("schema has no layout for {}", kind)))?;
        let values = packet.field_values();

        let mut buf = Vec::with_capacity(self.schema.header_len() + 64);
        let mut length_offset = None;

        for field in &self.schema.header {
            match field.role {
                Some(FieldRole::PacketLength) => {
                    length_offset = Some(buf.len());
                    buf.extend_from_slice(&[0, 0]);
                }
                Some(FieldRole::TypeTag) => buf.extend_from_slice(&layout.id.to_le_bytes()),
                None => write_field(&mut buf, field, values.get(field.name.as_str()))?,
            }
        }

        for field in &layout.fields {
            write_field(&mut buf, field, values.get(field.name.as_str()))?;
        }

        if let Some(offset) = length_offset {
            let total = u16::try_from(buf.len()).map_err(|_| {
                Error::Format(format!("packet too large: {} bytes", buf.len()))
            })?;
            buf[offset..offset + 2].copy_from_slice(&total.to_le_bytes());
        }

        Ok(buf)
    }

    /// Decode a plaintext packet
    pub fn decode(&self, buf: &[u8]) -> Result<DiscoveryPacket> {
        let header_len = self.schema.header_len();
        if buf.len() < header_len {
            return Err(Error::Format(format!(
                "packet too short: {} bytes (header is {})",
                buf.len(),
                header_len
            )));
        }

        let mut reader = Reader::new(buf);
        let mut values: HashMap<String, FieldValue> = HashMap::new();
        let mut tag = None;
        let mut declared_len = None;

        for field in &self.schema.header {
            let value = read_field(&mut reader, field)?;
            match (field.role, &value) {
                (Some(FieldRole::TypeTag), Some(FieldValue::Int(v))) => tag = Some(*v as u16),
                (Some(FieldRole::PacketLength), Some(FieldValue::Int(v))) => {
                    declared_len = Some(*v as usize)
                }
                _ => {}
            }
            if let Some(value) = value {
                values.insert(field.name.clone(), value);
            }
        }

        let tag = tag.ok_or_else(|| Error::Format("missing type tag".to_string()))?;
        let (name, layout) = self
            .schema
            .layout_by_id(tag)
            .ok_or_else(|| Error::Protocol(format!("unknown packet type {}", tag)))?;
        let kind = PacketType::from_schema_name(name)
            .ok_or_else(|| Error::Protocol(format!("unsupported packet kind '{}'", name)))?;

        if let Some(len) = declared_len {
            if len > buf.len() || len < header_len {
                return Err(Error::Format(format!(
                    "declared length {} does not fit {} byte packet",
                    len,
                    buf.len()
                )));
            }
            reader.limit(len);
        }

        for field in &layout.fields {
            if let Some(value) = read_field(&mut reader, field)? {
                values.insert(field.name.clone(), value);
            }
        }

        if reader.remaining() > 0 {
            log::trace!("{} trailing bytes after {} packet", reader.remaining(), kind);
        }

        let sender_id = take_int(&values, "sender_id")?;
        let packet = match kind {
            PacketType::Request => DiscoveryPacket::Request { sender_id },
            PacketType::Response => DiscoveryPacket::Response {
                sender_id,
                data: take_bytes(&values, "data")?,
            },
            PacketType::Message => DiscoveryPacket::Message {
                sender_id,
                recipient_id: take_int(&values, "recipient_id")?,
                data: take_text(&values, "data")?,
            },
        };

        Ok(packet)
    }
}

// ============================================================================
// Field Encoding
// ============================================================================

fn write_field(buf: &mut Vec<u8>, field: &Field, value: Option<&FieldValue>) -> Result<()> {
    match field.ty {
        FieldType::U16Le => {
            let v = int_value(value);
            let v = u16::try_from(v).map_err(|_| {
                Error::Format(format!("value {} overflows u16 field '{}'", v, field.name))
            })?;
            buf.extend_from_slice(&v.to_le_bytes());
        }
        FieldType::U64Le => buf.extend_from_slice(&int_value(value).to_le_bytes()),
        FieldType::Padding(n) => buf.resize(buf.len() + n, 0),
        FieldType::BytesU32Le => write_prefixed(buf, &field.name, &bytes_value(value))?,
        FieldType::HexU32Le => {
            write_prefixed(buf, &field.name, hex::encode(bytes_value(value)).as_bytes())?
        }
        FieldType::StringU32Le => write_prefixed(buf, &field.name, &bytes_value(value))?,
    }
    Ok(())
}

fn write_prefixed(buf: &mut Vec<u8>, name: &str, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| Error::Format(format!("field '{}' too large", name)))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

fn int_value(value: Option<&FieldValue>) -> u64 {
    match value {
        Some(FieldValue::Int(v)) => *v,
        _ => 0,
    }
}

fn bytes_value(value: Option<&FieldValue>) -> Vec<u8> {
    match value {
        Some(FieldValue::Bytes(b)) => b.clone(),
        Some(FieldValue::Text(s)) => s.as_bytes().to_vec(),
        Some(FieldValue::Int(v)) => v.to_string().into_bytes(),
        None => Vec::new(),
    }
}

// ============================================================================
// Field Decoding
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            end: buf.len(),
        }
    }

    fn limit(&mut self, end: usize) {
        self.end = end.min(self.buf.len());
    }

    fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Format(format!(
                "truncated packet: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.u32_le()? as usize;
        self.take(len)
    }
}

fn read_field(reader: &mut Reader<'_>, field: &Field) -> Result<Option<FieldValue>> {
    let value = match field.ty {
        FieldType::U16Le => FieldValue::Int(u64::from(reader.u16_le()?)),
        FieldType::U64Le => FieldValue::Int(reader.u64_le()?),
        FieldType::Padding(n) => {
            reader.take(n)?;
            return Ok(None);
        }
        FieldType::BytesU32Le => FieldValue::Bytes(reader.prefixed()?.to_vec()),
        FieldType::HexU32Le => {
            let text = reader.prefixed()?;
            let bytes = hex::decode(text).map_err(|e| {
                Error::Format(format!("field '{}' is not valid hex: {}", field.name, e))
            })?;
            FieldValue::Bytes(bytes)
        }
        FieldType::StringU32Le => {
            let raw = reader.prefixed()?;
            let text = std::str::from_utf8(raw).map_err(|e| {
                Error::Format(format!("field '{}' is not valid UTF-8: {}", field.name, e))
            })?;
            FieldValue::Text(text.to_string())
        }
    };
    Ok(Some(value))
}

fn take_int(values: &HashMap<String, FieldValue>, name: &str) -> Result<u64> {
    match values.get(name) {
        Some(FieldValue::Int(v)) => Ok(*v),
        _ => Err(Error::Format(format!("missing integer field '{}'", name))),
    }
}

fn take_bytes(values: &HashMap<String, FieldValue>, name: &str) -> Result<Vec<u8>> {
    match values.get(name) {
        Some(FieldValue::Bytes(b)) => Ok(b.clone()),
        Some(FieldValue::Text(s)) => Ok(s.as_bytes().to_vec()),
        _ => Err(Error::Format(format!("missing bytes field '{}'", name))),
    }
}

fn take_text(values: &HashMap<String, FieldValue>, name: &str) -> Result<String> {
    match values.get(name) {
        Some(FieldValue::Text(s)) => Ok(s.clone()),
        _ => Err(Error::Format(format!("missing text field '{}'", name))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PacketCodec {
        PacketCodec::builtin().unwrap()
    }

    #[test]
    fn test_request_layout() {
        let buf = codec()
            .encode(&DiscoveryPacket::Request {
                sender_id: 0x0102030405060708,
            })
            .unwrap();

        assert_eq!(buf.len(), 20);
        assert_eq!(&buf[0..2], &20u16.to_le_bytes()); // length
        assert_eq!(&buf[2..4], &[0, 0]); // type tag
        assert_eq!(&buf[4..12], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(&buf[12..20], &[0u8; 8]);
    }

    #[test]
    fn test_response_carries_hex_advertisement() {
        let packet = DiscoveryPacket::Response {
            sender_id: 42,
            data: vec![0xde, 0xad],
        };
        let buf = codec().encode(&packet).unwrap();

        assert_eq!(&buf[2..4], &1u16.to_le_bytes());
        assert_eq!(&buf[20..24], &4u32.to_le_bytes());
        assert_eq!(&buf[24..28], b"dead");
        assert_eq!(codec().decode(&buf).unwrap(), packet);
    }

    #[test]
    fn test_all_kinds_decode_back() {
        let codec = codec();
        let packets = vec![
            DiscoveryPacket::Request { sender_id: 1 },
            DiscoveryPacket::Response {
                sender_id: u64::MAX,
                data: b"MOTD;Server;1;".to_vec(),
            },
            DiscoveryPacket::Response {
                sender_id: 7,
                data: Vec::new(),
            },
            DiscoveryPacket::Message {
                sender_id: 9,
                recipient_id: 10,
                data: "CONNECTREQUEST 55 v=0".to_string(),
            },
        ];

        for packet in packets {
            let buf = codec.encode(&packet).unwrap();
            assert_eq!(codec.peek_type(&buf).unwrap() as usize, match packet.packet_type() {
                PacketType::Request => 0,
                PacketType::Response => 1,
                PacketType::Message => 2,
            });
            assert_eq!(codec.decode(&buf).unwrap(), packet);
        }
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let mut buf = codec().encode(&DiscoveryPacket::Request { sender_id: 1 }).unwrap();
        buf[2] = 9;
        assert!(matches!(codec().decode(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_short_packet_is_format_error() {
        assert!(matches!(codec().decode(&[0u8; 5]), Err(Error::Format(_))));
        assert!(matches!(codec().peek_type(&[0u8; 3]), Err(Error::Format(_))));
    }

    #[test]
    fn test_truncated_body_is_format_error() {
        let buf = codec()
            .encode(&DiscoveryPacket::Message {
                sender_id: 1,
                recipient_id: 2,
                data: "CANDIDATEADD 1 candidate".to_string(),
            })
            .unwrap();
        let mut cut = buf[..buf.len() - 4].to_vec();
        let len = cut.len() as u16;
        cut[0..2].copy_from_slice(&len.to_le_bytes());
        assert!(matches!(codec().decode(&cut), Err(Error::Format(_))));
    }

    #[test]
    fn test_declared_length_beyond_buffer() {
        let mut buf = codec().encode(&DiscoveryPacket::Request { sender_id: 1 }).unwrap();
        buf[0..2].copy_from_slice(&500u16.to_le_bytes());
        assert!(matches!(codec().decode(&buf), Err(Error::Format(_))));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let packet = DiscoveryPacket::Request { sender_id: 3 };
        let mut buf = codec().encode(&packet).unwrap();
        buf.extend_from_slice(&[0xff; 6]);
        assert_eq!(codec().decode(&buf).unwrap(), packet);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        let mut buf = codec()
            .encode(&DiscoveryPacket::Response {
                sender_id: 1,
                data: vec![0xab],
            })
            .unwrap();
        buf[24] = b'z';
        assert!(matches!(codec().decode(&buf), Err(Error::Format(_))));
    }

    #[test]
    fn test_alternate_schema_table() {
        let text = r#"{
            "name": "v2", "version": 2,
            "header": [
                { "name": "sender_id", "type": "u64le" },
                { "name": "type", "type": "u16le", "role": "type_tag" }
            ],
            "packets": {
                "request":  { "id": 10 },
                "response": { "id": 11, "fields": [ { "name": "data", "type": "bytes_u32le" } ] },
                "message":  { "id": 12, "fields": [
                    { "name": "recipient_id", "type": "u64le" },
                    { "name": "data", "type": "string_u32le" } ] }
            }
        }"#;
        let codec = PacketCodec::new(Schema::from_json(text).unwrap()).unwrap();
        let packet = DiscoveryPacket::Response {
            sender_id: 5,
            data: vec![1, 2, 3],
        };
        let buf = codec.encode(&packet).unwrap();

        assert_eq!(codec.peek_type(&buf).unwrap(), 11);
        assert_eq!(&buf[14..17], &[1, 2, 3]);
        assert_eq!(codec.decode(&buf).unwrap(), packet);
    }
}
