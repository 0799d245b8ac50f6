//! Versioned packet schema for the discovery codec
//!
//! The byte layout of discovery packets lives in a JSON table rather than in
//! hardcoded offsets. The built-in table (`schema/discovery_v1.json`) is
//! embedded at compile time; a different table can be loaded with
//! [`Schema::from_json`] and handed to [`crate::packet::PacketCodec::new`].
//!
//! # Table Shape
//!
//! ```text
//! {
//!   "name": ..., "version": N,
//!   "header":  [ field, ... ],            // shared by every packet kind
//!   "packets": { "request":  { "id": 0, "fields": [...] },
//!                "response": { "id": 1, "fields": [...] },
//!                "message":  { "id": 2, "fields": [...] } }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Built-in schema table
const BUILTIN_SCHEMA: &str = include_str!("../schema/discovery_v1.json");

/// Packet kinds every schema must describe
pub const REQUIRED_PACKETS: [&str; 3] = ["request", "response", "message"];

// ============================================================================
// Table Types
// ============================================================================

/// Wire type of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    /// Unsigned 16-bit little-endian
    #[serde(rename = "u16le")]
    U16Le,
    /// Unsigned 64-bit little-endian
    #[serde(rename = "u64le")]
    U64Le,
    /// N zero bytes, ignored on decode
    #[serde(rename = "padding")]
    Padding(usize),
    /// Raw bytes with a u32le length prefix
    #[serde(rename = "bytes_u32le")]
    BytesU32Le,
    /// Bytes carried as lowercase hex text with a u32le length prefix
    #[serde(rename = "hex_u32le")]
    HexU32Le,
    /// UTF-8 text with a u32le length prefix
    #[serde(rename = "string_u32le")]
    StringU32Le,
}

impl FieldType {
    /// Width on the wire if the field is fixed-size
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            FieldType::U16Le => Some(2),
            FieldType::U64Le => Some(8),
            FieldType::Padding(n) => Some(*n),
            FieldType::BytesU32Le | FieldType::HexU32Le | FieldType::StringU32Le => None,
        }
    }

    fn is_integer(&self) -> bool {
        matches!(self, FieldType::U16Le | FieldType::U64Le)
    }

    fn is_blob(&self) -> bool {
        matches!(self, FieldType::BytesU32Le | FieldType::HexU32Le)
    }
}

/// Special meaning attached to a header field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldRole {
    /// Total packet length, computed on encode
    #[serde(rename = "packet_length")]
    PacketLength,
    /// Packet kind selector, read before the body
    #[serde(rename = "type_tag")]
    TypeTag,
}

/// One named field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<FieldRole>,
}

/// Body layout of one packet kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketLayout {
    pub id: u16,
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// A complete, validated packet schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub version: u32,
    pub header: Vec<Field>,
    pub packets: BTreeMap<String, PacketLayout>,
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Schema {
    /// The schema table shipped with the crate
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_SCHEMA)
    }

    /// Parse and validate a schema table
    pub fn from_json(text: &str) -> Result<Self> {
        let schema: Schema = serde_json::from_str(text)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Check the invariants the codec relies on
    pub fn validate(&self) -> Result<()> {
        let tag_fields: Vec<&Field> = self
            .header
            .iter()
            .filter(|f| f.role == Some(FieldRole::TypeTag))
            .collect();
        if tag_fields.len() != 1 || tag_fields[0].ty != FieldType::U16Le {
            return Err(Error::Config(
                "header must contain exactly one u16le type_tag field".to_string(),
            ));
        }

        if self.header.iter().filter(|f| f.role == Some(FieldRole::PacketLength)).count() > 1 {
            return Err(Error::Config("header has more than one packet_length field".to_string()));
        }
        if self
            .header
            .iter()
            .any(|f| f.role == Some(FieldRole::PacketLength) && f.ty != FieldType::U16Le)
        {
            return Err(Error::Config("packet_length field must be u16le".to_string()));
        }

        // The tag offset must be known before the body is interpreted
        for field in &self.header {
            if field.ty.fixed_width().is_none() {
                return Err(Error::Config(format!(
                    "header field '{}' is not fixed-width",
                    field.name
                )));
            }
        }

        if !self
            .header
            .iter()
            .any(|f| f.name == "sender_id" && f.ty == FieldType::U64Le)
        {
            return Err(Error::Config("header must contain u64le sender_id".to_string()));
        }

        for name in REQUIRED_PACKETS {
            if !self.packets.contains_key(name) {
                return Err(Error::Config(format!("missing packet layout '{}'", name)));
            }
        }

        let mut ids = HashSet::new();
        for (name, layout) in &self.packets {
            if !ids.insert(layout.id) {
                return Err(Error::Config(format!("duplicate packet id {}", layout.id)));
            }

            let mut names: HashSet<&str> = self.header.iter().map(|f| f.name.as_str()).collect();
            for field in &layout.fields {
                if field.role.is_some() {
                    return Err(Error::Config(format!(
                        "body field '{}' of '{}' may not carry a role",
                        field.name, name
                    )));
                }
                if !names.insert(field.name.as_str()) {
                    return Err(Error::Config(format!(
                        "duplicate field '{}' in '{}'",
                        field.name, name
                    )));
                }
            }
        }

        self.require_body_field("response", "data", |t| t.is_blob())?;
        self.require_body_field("message", "recipient_id", |t| t.is_integer())?;
        self.require_body_field("message", "data", |t| *t == FieldType::StringU32Le)?;

        Ok(())
    }

    fn require_body_field(
        &self,
        packet: &str,
        field: &str,
        accepts: impl Fn(&FieldType) -> bool,
    ) -> Result<()> {
        let ok = self
            .packets
            .get(packet)
            .map(|layout| layout.fields.iter().any(|f| f.name == field && accepts(&f.ty)))
            .unwrap_or(false);

        if ok {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "packet '{}' lacks a usable '{}' field",
                packet, field
            )))
        }
    }

    /// Byte offset of the type tag within the header
    pub fn type_tag_offset(&self) -> usize {
        self.header
            .iter()
            .take_while(|f| f.role != Some(FieldRole::TypeTag))
            .filter_map(|f| f.ty.fixed_width())
            .sum()
    }

    /// Total width of the fixed header
    pub fn header_len(&self) -> usize {
        self.header.iter().filter_map(|f| f.ty.fixed_width()).sum()
    }

    /// Find the packet kind for a type tag
    pub fn layout_by_id(&self, id: u16) -> Option<(&str, &PacketLayout)> {
        self.packets
            .iter()
            .find(|(_, layout)| layout.id == id)
            .map(|(name, layout)| (name.as_str(), layout))
    }

    pub fn layout(&self, name: &str) -> Option<&PacketLayout> {
        self.packets.get(name)
    }
}

// ============================================================================
// Tests
// ============================================================================
