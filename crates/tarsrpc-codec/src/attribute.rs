use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::input::{decode_value, TarsInput};
use crate::output::{encode_value, TarsOutput};
use crate::stamp::Stamp;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
struct Attribute {
    type_name: String,
    data: Bytes,
}

/// Name-keyed argument bag used by envelope versions 2 and 3.
///
/// Each value is encoded on its own at tag 0. Version 2 records the type
/// name next to every value (`map<string, map<string, bytes>>`); version 3
/// drops it (`map<string, bytes>`).
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeBag {
    compact: bool,
    entries: BTreeMap<String, Attribute>,
}

impl AttributeBag {
    /// Empty version-2 bag.
    pub fn new() -> Self {
        Self {
            compact: false,
            entries: BTreeMap::new(),
        }
    }

    /// Empty version-3 bag.
    pub fn compact() -> Self {
        Self {
            compact: true,
            entries: BTreeMap::new(),
        }
    }

    pub fn is_compact(&self) -> bool {
        self.compact
    }

    pub fn put(&mut self, name: impl Into<String>, stamp: &Stamp, value: &Value) {
        self.entries.insert(
            name.into(),
            Attribute {
                type_name: stamp.type_name(),
                data: encode_value(value),
            },
        );
    }

    /// Decode the attribute `name` as `stamp`, `None` if it is absent.
    ///
    /// A version-2 entry recorded under a different type name is still
    /// decoded; the stamp decides how its bytes are read.
    pub fn get(&self, name: &str, stamp: &Stamp) -> Result<Option<Value>> {
        match self.entries.get(name) {
            Some(attr) => decode_value(&attr.data, stamp).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`AttributeBag::get`] but absence is an error.
    pub fn require(&self, name: &str, stamp: &Stamp) -> Result<Value> {
        self.get(name, stamp)?
            .ok_or_else(|| CodecError::MissingAttribute(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the bag at tag 0.
    pub fn encode(&self) -> Bytes {
        let entries = self
            .entries
            .iter()
            .map(|(name, attr)| {
                let value = if self.compact {
                    Value::Bytes(attr.data.clone())
                } else {
                    Value::Map(vec![(
                        Value::String(attr.type_name.clone()),
                        Value::Bytes(attr.data.clone()),
                    )])
                };
                (Value::String(name.clone()), value)
            })
            .collect();

        let mut out = TarsOutput::new();
        out.write_value(&Value::Map(entries), 0);
        out.into_bytes()
    }

    /// Parse a bag written by [`AttributeBag::encode`].
    pub fn decode(data: &[u8], compact: bool) -> Result<Self> {
        let stamp = if compact {
            Stamp::map(Stamp::String, Stamp::Bytes)
        } else {
            Stamp::map(Stamp::String, Stamp::map(Stamp::String, Stamp::Bytes))
        };

        let mut entries = BTreeMap::new();
        if data.is_empty() {
            return Ok(Self { compact, entries });
        }

        let Value::Map(raw) = TarsInput::new(data).read(0, &stamp, false)? else {
            return Ok(Self { compact, entries });
        };
        for (name, value) in raw {
            let Value::String(name) = name else { continue };
            let attr = match value {
                Value::Bytes(data) => Attribute {
                    type_name: String::new(),
                    data,
                },
                Value::Map(mut typed) => match typed.pop() {
                    Some((Value::String(type_name), Value::Bytes(data))) => {
                        Attribute { type_name, data }
                    }
                    _ => continue,
                },
                _ => continue,
            };
            entries.insert(name, attr);
        }
        Ok(Self { compact, entries })
    }
}

impl Default for AttributeBag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mut bag: AttributeBag) -> AttributeBag {
        bag.put("msg", &Stamp::String, &Value::from("hi"));
        bag.put("n", &Stamp::Long, &Value::Long(-5));
        bag.put(
            "tags",
            &Stamp::list(Stamp::String),
            &Value::List(vec![Value::from("a")]),
        );
        bag
    }

    #[test]
    fn version2_roundtrip_keeps_type_names() {
        let bag = sample(AttributeBag::new());
        let decoded = AttributeBag::decode(&bag.encode(), false).unwrap();
        assert_eq!(decoded, bag);
        assert_eq!(
            decoded.get("msg", &Stamp::String).unwrap(),
            Some(Value::from("hi"))
        );
    }

    #[test]
    fn version3_roundtrip() {
        let bag = sample(AttributeBag::compact());
        let decoded = AttributeBag::decode(&bag.encode(), true).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.get("n", &Stamp::Long).unwrap(), Some(Value::Long(-5)));
    }

    #[test]
    fn compact_encoding_is_smaller() {
        let full = sample(AttributeBag::new()).encode();
        let compact = sample(AttributeBag::compact()).encode();
        assert!(compact.len() < full.len());
    }

    #[test]
    fn missing_attribute() {
        let bag = AttributeBag::compact();
        assert_eq!(bag.get("x", &Stamp::Int).unwrap(), None);
        assert!(matches!(
            bag.require("x", &Stamp::Int),
            Err(CodecError::MissingAttribute(name)) if name == "x"
        ));
    }

    #[test]
    fn empty_body_is_an_empty_bag() {
        assert!(AttributeBag::decode(&[], false).unwrap().is_empty());
    }
}
