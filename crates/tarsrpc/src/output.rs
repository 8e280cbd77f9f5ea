use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::json;
use tarsrpc_codec::{CallReply, Value};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    servant: &'a str,
    method: &'a str,
    version: i16,
    elapsed_ms: u128,
    ret: serde_json::Value,
    outputs: BTreeMap<&'a str, serde_json::Value>,
    status: &'a BTreeMap<String, String>,
}

/// Call metadata printed next to a reply.
pub struct CallSummary<'a> {
    pub servant: &'a str,
    pub method: &'a str,
    pub version: i16,
    pub elapsed_ms: u128,
}

pub fn print_reply(summary: &CallSummary<'_>, reply: &CallReply, format: OutputFormat) {
    let ret = reply.ret.as_ref().map_or(serde_json::Value::Null, to_json);
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                servant: summary.servant,
                method: summary.method,
                version: summary.version,
                elapsed_ms: summary.elapsed_ms,
                ret,
                outputs: reply
                    .outputs
                    .iter()
                    .map(|(name, value)| (name.as_str(), to_json(value)))
                    .collect(),
                status: &reply.status,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NAME", "VALUE"])
                .add_row(vec!["<return>".to_string(), ret.to_string()]);
            for (name, value) in &reply.outputs {
                table.add_row(vec![name.clone(), to_json(value).to_string()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let outputs: Vec<String> = reply
                .outputs
                .iter()
                .map(|(name, value)| format!("{name}={}", to_json(value)))
                .collect();
            println!(
                "{}.{} v{} ({} ms) -> {}{}{}",
                summary.servant,
                summary.method,
                summary.version,
                summary.elapsed_ms,
                ret,
                if outputs.is_empty() { "" } else { " " },
                outputs.join(" ")
            );
        }
        OutputFormat::Raw => match &reply.ret {
            Some(Value::String(text)) => print_raw(text.as_bytes()),
            Some(Value::Bytes(data)) => print_raw(data),
            _ => println!("{ret}"),
        },
    }
}

pub fn print_event(event: &str, fields: serde_json::Value, format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            let mut out = json!({ "event": event });
            if let (Some(out), serde_json::Value::Object(fields)) = (out.as_object_mut(), fields) {
                out.extend(fields);
            }
            println!("{out}");
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            let rendered: Vec<String> = fields
                .as_object()
                .map(|fields| {
                    fields
                        .iter()
                        .map(|(key, value)| match value {
                            serde_json::Value::String(text) => format!("{key}={text}"),
                            other => format!("{key}={other}"),
                        })
                        .collect()
                })
                .unwrap_or_default();
            println!("{event} {}", rendered.join(" "));
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// JSON view of a decoded value. Maps with string keys become objects;
/// struct fields are keyed by tag.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(v) => json!(v),
        Value::Byte(v) => json!(v),
        Value::Short(v) => json!(v),
        Value::Int(v) => json!(v),
        Value::Long(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::String(v) => json!(v),
        Value::Bytes(v) => json!(v.as_ref()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => {
            if entries.iter().all(|(k, _)| matches!(k, Value::String(_))) {
                let object = entries
                    .iter()
                    .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), to_json(v))))
                    .collect();
                serde_json::Value::Object(object)
            } else {
                serde_json::Value::Array(
                    entries
                        .iter()
                        .map(|(k, v)| json!([to_json(k), to_json(v)]))
                        .collect(),
                )
            }
        }
        Value::Struct(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(tag, v)| (tag.to_string(), to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_keyed_maps_become_objects() {
        let value = Value::Map(vec![
            (Value::from("a"), Value::Int(1)),
            (Value::from("b"), Value::List(vec![Value::Bool(true)])),
        ]);
        assert_eq!(to_json(&value), json!({"a": 1, "b": [true]}));
    }

    #[test]
    fn other_maps_become_pairs() {
        let value = Value::Map(vec![(Value::Int(7), Value::from("seven"))]);
        assert_eq!(to_json(&value), json!([[7, "seven"]]));
    }

    #[test]
    fn structs_are_keyed_by_tag() {
        let value = Value::Struct(BTreeMap::from([(0, Value::Long(5)), (3, Value::from("x"))]));
        assert_eq!(to_json(&value), json!({"0": 5, "3": "x"}));
    }
}
