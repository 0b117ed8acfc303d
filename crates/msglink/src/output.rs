use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use msglink_schema::Value;
use serde::Serialize;

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
struct MessageOutput<'a> {
    schema_id: &'a str,
    channel: &'a str,
    sequence: usize,
    slots: usize,
    values: Vec<serde_json::Value>,
    timestamp: String,
}

pub fn print_values(channel: &str, sequence: usize, values: &[Value], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                schema_id: "https://msglink.dev/schemas/cli/v1/message.schema.json",
                channel,
                sequence,
                slots: values.len(),
                values: values.iter().map(value_to_json).collect(),
                timestamp: now_unix_seconds(),
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
                .set_header(vec!["SLOT", "KIND", "VALUE"]);
            for (slot, value) in values.iter().enumerate() {
                table.add_row(vec![
                    slot.to_string(),
                    value.kind_name().to_string(),
                    value_preview(value),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let rendered: Vec<String> = values.iter().map(value_preview).collect();
            println!(
                "channel={} seq={} slots={} values=[{}]",
                channel,
                sequence,
                values.len(),
                rendered.join(", ")
            );
        }
        OutputFormat::Raw => {
            for value in values {
                match value {
                    Value::Bytes(raw) => print_raw(raw),
                    other => print_raw(value_preview(other).as_bytes()),
                }
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn value_preview(value: &Value) -> String {
    match value {
        Value::Int(v) => v.to_string(),
        Value::Uint(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Text(v) => v.clone(),
        Value::Bytes(raw) => match std::str::from_utf8(raw) {
            Ok(text) => text.to_string(),
            Err(_) => format!("<binary {} bytes>", raw.len()),
        },
        Value::IntArray(v) => format!("{v:?}"),
        Value::UintArray(v) => format!("{v:?}"),
        Value::FloatArray(v) => format!("{v:?}"),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(v) => serde_json::json!(v),
        Value::Uint(v) => serde_json::json!(v),
        Value::Float(v) => serde_json::json!(v),
        Value::Text(v) => serde_json::json!(v),
        Value::Bytes(raw) => serde_json::json!(value_preview(&Value::Bytes(raw.clone()))),
        Value::IntArray(v) => serde_json::json!(v),
        Value::UintArray(v) => serde_json::json!(v),
        Value::FloatArray(v) => serde_json::json!(v),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
