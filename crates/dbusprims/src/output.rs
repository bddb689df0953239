use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use dbusprims_wire::{Message, Value};
use serde::Serialize;
use serde_json::json;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
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
struct MessageOutput<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    serial: u32,
    flags: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interface: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    member: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_serial: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender: Option<&'a str>,
    signature: &'a str,
    body: Vec<serde_json::Value>,
}

impl<'a> MessageOutput<'a> {
    fn new(message: &'a Message) -> Self {
        Self {
            message_type: message.message_type.name(),
            serial: message.serial,
            flags: message.flags,
            path: message.path.as_ref().map(|path| path.as_str()),
            interface: message.interface.as_deref(),
            member: message.member.as_deref(),
            error_name: message.error_name.as_deref(),
            reply_serial: message.reply_serial,
            destination: message.destination.as_deref(),
            sender: message.sender.as_deref(),
            signature: message.signature().as_str(),
            body: message.body().iter().map(value_to_json).collect(),
        }
    }
}

pub fn print_message(message: &Message, format: OutputFormat) {
    let out = MessageOutput::new(message);
    match format {
        OutputFormat::Json => {
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
                .set_header(vec!["FIELD", "VALUE"]);
            table.add_row(vec!["type".to_string(), out.message_type.to_string()]);
            table.add_row(vec!["serial".to_string(), out.serial.to_string()]);
            let optional = [
                ("path", out.path),
                ("interface", out.interface),
                ("member", out.member),
                ("error_name", out.error_name),
                ("destination", out.destination),
                ("sender", out.sender),
            ];
            for (field, value) in optional {
                if let Some(value) = value {
                    table.add_row(vec![field.to_string(), value.to_string()]);
                }
            }
            if let Some(reply_serial) = out.reply_serial {
                table.add_row(vec!["reply_serial".to_string(), reply_serial.to_string()]);
            }
            table.add_row(vec!["signature".to_string(), out.signature.to_string()]);
            for (index, value) in message.body().iter().enumerate() {
                table.add_row(vec![format!("body[{index}]"), value.to_string()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("{message}");
            for value in message.body() {
                println!("  {value}");
            }
        }
    }
}

/// JSON rendering of a value. Dicts become objects when every key is a
/// string, otherwise arrays of `[key, value]` pairs; variants carry their
/// signature.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Byte(v) => json!(v),
        Value::Boolean(v) => json!(v),
        Value::Int16(v) => json!(v),
        Value::UInt16(v) => json!(v),
        Value::Int32(v) => json!(v),
        Value::UInt32(v) | Value::UnixFd(v) => json!(v),
        Value::Int64(v) => json!(v),
        Value::UInt64(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::String(_) | Value::ObjectPath(_) | Value::Signature(_) => {
            json!(value.as_str().unwrap_or_default())
        }
        Value::Array(items) | Value::Struct(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Dict(dict) => {
            if dict.iter().all(|(key, _)| matches!(key, Value::String(_))) {
                let map = dict
                    .iter()
                    .map(|(key, value)| {
                        (
                            key.as_str().unwrap_or_default().to_string(),
                            value_to_json(value),
                        )
                    })
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(map)
            } else {
                serde_json::Value::Array(
                    dict.iter()
                        .map(|(key, value)| json!([value_to_json(key), value_to_json(value)]))
                        .collect(),
                )
            }
        }
        Value::Variant(variant) => json!({
            "signature": variant.signature().as_str(),
            "value": value_to_json(variant.value()),
        }),
    }
}
