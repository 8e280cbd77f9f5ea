use std::collections::BTreeMap;

use bytes::Bytes;

use crate::stamp::Stamp;

/// A decoded field value.
///
/// Structs are keyed by field tag; maps keep wire order as key/value pairs
/// since keys may be any value type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Struct(BTreeMap<u8, Value>),
}

impl Value {
    /// Any integer variant (or bool) widened to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(v) => Some(i64::from(*v)),
            Self::Byte(v) => Some(i64::from(*v)),
            Self::Short(v) => Some(i64::from(*v)),
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<u8, Value>> {
        match self {
            Self::Struct(v) => Some(v),
            _ => None,
        }
    }

    /// Short label of the variant, used in mismatch diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Byte(_) => "byte",
            Self::Short(_) => "short",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Struct(_) => "struct",
        }
    }

    /// Whether this value can be written under `stamp`.
    ///
    /// Integers conform to any integer stamp wide enough for the value.
    pub fn conforms_to(&self, stamp: &Stamp) -> bool {
        match (stamp, self) {
            (Stamp::Bool, Self::Bool(_)) => true,
            (Stamp::Byte, v) => v.int_in(i64::from(i8::MIN), i64::from(i8::MAX)),
            (Stamp::Short, v) => v.int_in(i64::from(i16::MIN), i64::from(i16::MAX)),
            (Stamp::Int, v) => v.int_in(i64::from(i32::MIN), i64::from(i32::MAX)),
            (Stamp::Long, v) => v.int_in(i64::MIN, i64::MAX),
            (Stamp::Float, Self::Float(_)) => true,
            (Stamp::Double, Self::Float(_) | Self::Double(_)) => true,
            (Stamp::String, Self::String(_)) => true,
            (Stamp::Bytes, Self::Bytes(_)) => true,
            (Stamp::List(element), Self::List(items)) => {
                items.iter().all(|item| item.conforms_to(element))
            }
            (Stamp::Map(key, value), Self::Map(entries)) => entries
                .iter()
                .all(|(k, v)| k.conforms_to(key) && v.conforms_to(value)),
            (Stamp::Struct(def), Self::Struct(fields)) => {
                def.fields.iter().all(|field| match fields.get(&field.tag) {
                    Some(v) => v.conforms_to(&field.stamp),
                    None => !field.required,
                }) && fields.keys().all(|tag| def.field(*tag).is_some())
            }
            _ => false,
        }
    }

    fn int_in(&self, min: i64, max: i64) -> bool {
        if matches!(self, Self::Bool(_)) {
            return false;
        }
        self.as_i64().is_some_and(|v| v >= min && v <= max)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Self::Byte(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Short(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, String>> for Value {
    fn from(v: BTreeMap<String, String>) -> Self {
        Self::Map(
            v.into_iter()
                .map(|(k, v)| (Self::String(k), Self::String(v)))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stamp::StructDef;

    #[test]
    fn integers_conform_by_range() {
        assert!(Value::Int(100).conforms_to(&Stamp::Byte));
        assert!(!Value::Int(300).conforms_to(&Stamp::Byte));
        assert!(Value::Byte(-3).conforms_to(&Stamp::Long));
        assert!(!Value::Bool(true).conforms_to(&Stamp::Int));
        assert!(!Value::String("1".into()).conforms_to(&Stamp::Int));
    }

    #[test]
    fn collections_conform_elementwise() {
        let list = Value::List(vec![Value::Long(1), Value::Int(2)]);
        assert!(list.conforms_to(&Stamp::list(Stamp::Long)));
        assert!(!list.conforms_to(&Stamp::list(Stamp::String)));

        let map = Value::from(BTreeMap::from([("k".to_string(), "v".to_string())]));
        assert!(map.conforms_to(&Stamp::map(Stamp::String, Stamp::String)));
    }

    #[test]
    fn struct_conformance_checks_required_and_unknown_tags() {
        let stamp = Stamp::structure(
            StructDef::new("Demo.Pair")
                .require(0, "a", Stamp::Int)
                .optional(1, "b", Stamp::String),
        );
        let ok = Value::Struct(BTreeMap::from([(0, Value::Int(1))]));
        let missing = Value::Struct(BTreeMap::from([(1, Value::from("x"))]));
        let unknown = Value::Struct(BTreeMap::from([(0, Value::Int(1)), (5, Value::Int(2))]));
        assert!(ok.conforms_to(&stamp));
        assert!(!missing.conforms_to(&stamp));
        assert!(!unknown.conforms_to(&stamp));
    }

    #[test]
    fn accessors_widen_integers() {
        assert_eq!(Value::Short(-7).as_i64(), Some(-7));
        assert_eq!(Value::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
        assert!(Value::from("hi").as_i64().is_none());
    }
}
