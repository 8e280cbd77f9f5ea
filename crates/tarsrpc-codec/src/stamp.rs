use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::value::Value;

/// Wire type carried in the low nibble of every field header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    Int1 = 0,
    Int2 = 1,
    Int4 = 2,
    Int8 = 3,
    Float = 4,
    Double = 5,
    String1 = 6,
    String4 = 7,
    Map = 8,
    List = 9,
    StructBegin = 10,
    StructEnd = 11,
    ZeroTag = 12,
    SimpleList = 13,
}

impl WireType {
    /// Parse the low nibble of a field header.
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => Self::Int1,
            1 => Self::Int2,
            2 => Self::Int4,
            3 => Self::Int8,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::String1,
            7 => Self::String4,
            8 => Self::Map,
            9 => Self::List,
            10 => Self::StructBegin,
            11 => Self::StructEnd,
            12 => Self::ZeroTag,
            13 => Self::SimpleList,
            other => return Err(CodecError::UnknownWireType(other)),
        })
    }

    /// Width in bytes of an integer wire type, `None` for non-integers.
    ///
    /// `ZeroTag` is an integer of width zero.
    pub fn int_width(self) -> Option<usize> {
        match self {
            Self::ZeroTag => Some(0),
            Self::Int1 => Some(1),
            Self::Int2 => Some(2),
            Self::Int4 => Some(4),
            Self::Int8 => Some(8),
            _ => None,
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Descriptor-level type of a field: how its bytes are structured.
#[derive(Debug, Clone, PartialEq)]
pub enum Stamp {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
    List(Box<Stamp>),
    Map(Box<Stamp>, Box<Stamp>),
    Struct(Arc<StructDef>),
}

impl Stamp {
    pub fn list(element: Stamp) -> Self {
        Self::List(Box::new(element))
    }

    pub fn map(key: Stamp, value: Stamp) -> Self {
        Self::Map(Box::new(key), Box::new(value))
    }

    pub fn structure(def: StructDef) -> Self {
        Self::Struct(Arc::new(def))
    }

    /// Type name recorded next to each value in a version-2 attribute bag.
    pub fn type_name(&self) -> String {
        match self {
            Self::Bool => "bool".to_string(),
            Self::Byte => "char".to_string(),
            Self::Short => "short".to_string(),
            Self::Int => "int32".to_string(),
            Self::Long => "int64".to_string(),
            Self::Float => "float".to_string(),
            Self::Double => "double".to_string(),
            Self::String => "string".to_string(),
            Self::Bytes => "list<char>".to_string(),
            Self::List(element) => format!("list<{}>", element.type_name()),
            Self::Map(key, value) => format!("map<{},{}>", key.type_name(), value.type_name()),
            Self::Struct(def) => def.name.clone(),
        }
    }

    /// Value an absent optional field decodes to.
    pub fn default_value(&self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::Byte => Value::Byte(0),
            Self::Short => Value::Short(0),
            Self::Int => Value::Int(0),
            Self::Long => Value::Long(0),
            Self::Float => Value::Float(0.0),
            Self::Double => Value::Double(0.0),
            Self::String => Value::String(String::new()),
            Self::Bytes => Value::Bytes(Bytes::new()),
            Self::List(_) => Value::List(Vec::new()),
            Self::Map(_, _) => Value::Map(Vec::new()),
            Self::Struct(def) => Value::Struct(
                def.fields
                    .iter()
                    .map(|field| (field.tag, field.stamp.default_value()))
                    .collect::<BTreeMap<_, _>>(),
            ),
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name())
    }
}

/// Layout of a user-defined struct: its name and tagged fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl StructDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a required field.
    pub fn require(mut self, tag: u8, name: impl Into<String>, stamp: Stamp) -> Self {
        self.fields.push(FieldDef {
            tag,
            name: name.into(),
            stamp,
            required: true,
        });
        self
    }

    /// Add an optional field.
    pub fn optional(mut self, tag: u8, name: impl Into<String>, stamp: Stamp) -> Self {
        self.fields.push(FieldDef {
            tag,
            name: name.into(),
            stamp,
            required: false,
        });
        self
    }

    pub fn field(&self, tag: u8) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.tag == tag)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub tag: u8,
    pub name: String,
    pub stamp: Stamp,
    pub required: bool,
}
