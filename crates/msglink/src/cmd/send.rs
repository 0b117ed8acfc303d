use std::fs;

use msglink_comm::{CommConfig, Communicator, Direction};
use msglink_schema::{TypeDescriptor, Value};
use msglink_transport::TransportKind;

use crate::cmd::SendArgs;
use crate::exit::{comm_error, schema_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::OutputFormat;

pub fn run(args: SendArgs, _format: OutputFormat) -> CliResult<i32> {
    let values = resolve_values(&args)?;
    let config = build_config(&args)?;

    let mut comm = match &args.address {
        Some(address) => Communicator::open_at(&args.name, Direction::Send, address, config),
        None => Communicator::from_env_with(&args.name, Direction::Send, config),
    }
    .map_err(|err| comm_error("open failed", err))?;

    if !values.is_empty() {
        comm.send(&values)
            .map_err(|err| comm_error("send failed", err))?;
    }
    if args.eof {
        comm.send_eof()
            .map_err(|err| comm_error("end-of-channel failed", err))?;
    }
    comm.close().map_err(|err| comm_error("close failed", err))?;
    Ok(SUCCESS)
}

fn build_config(args: &SendArgs) -> CliResult<CommConfig> {
    let mut config = CommConfig::default();
    if let Some(kind) = &args.transport {
        let kind: TransportKind = kind
            .parse()
            .map_err(|_| CliError::new(USAGE, format!("unknown transport: {kind}")))?;
        config = config.with_kind(kind);
    }
    if let Some(max_frame) = args.max_frame {
        config = config.with_max_frame(max_frame);
    }
    let descriptor = match &args.datatype {
        Some(json) => TypeDescriptor::from_json(json)
            .map_err(|err| schema_error("--datatype is not a valid descriptor", err))?,
        None => infer_descriptor(&resolve_values(args)?),
    };
    Ok(config.with_datatype(descriptor))
}

fn resolve_values(args: &SendArgs) -> CliResult<Vec<Value>> {
    if let Some(json) = &args.json {
        let parsed: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        let serde_json::Value::Array(items) = parsed else {
            return Err(CliError::new(USAGE, "--json must be a JSON array of values"));
        };
        return items.iter().map(json_to_value).collect();
    }
    if let Some(data) = &args.data {
        return Ok(vec![Value::Text(data.clone())]);
    }
    if let Some(path) = &args.file {
        let raw = fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        })?;
        return Ok(vec![Value::Bytes(raw)]);
    }
    Ok(Vec::new())
}

fn json_to_value(item: &serde_json::Value) -> CliResult<Value> {
    match item {
        serde_json::Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Ok(Value::Int(v))
            } else if let Some(v) = n.as_f64() {
                Ok(Value::Float(v))
            } else {
                Err(CliError::new(USAGE, format!("unrepresentable number: {n}")))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
        serde_json::Value::Array(items) => {
            if items.iter().all(|i| i.as_i64().is_some()) {
                Ok(Value::IntArray(
                    items.iter().filter_map(|i| i.as_i64()).collect(),
                ))
            } else if items.iter().all(|i| i.as_f64().is_some()) {
                Ok(Value::FloatArray(
                    items.iter().filter_map(|i| i.as_f64()).collect(),
                ))
            } else {
                Err(CliError::new(
                    USAGE,
                    "arrays must contain only numbers".to_string(),
                ))
            }
        }
        other => Err(CliError::new(
            USAGE,
            format!("unsupported value in --json: {other}"),
        )),
    }
}

/// Map values to a descriptor when none was given explicitly.
fn infer_descriptor(values: &[Value]) -> TypeDescriptor {
    use msglink_schema::ScalarKind;

    let scalar = |kind, precision| TypeDescriptor::Scalar {
        kind,
        precision,
        units: None,
    };
    let items: Vec<TypeDescriptor> = values
        .iter()
        .map(|value| match value {
            Value::Int(_) => scalar(ScalarKind::Int, 64),
            Value::Uint(_) => scalar(ScalarKind::Uint, 64),
            Value::Float(_) => scalar(ScalarKind::Float, 64),
            Value::Text(_) => scalar(ScalarKind::Utf8, 0),
            Value::Bytes(_) => scalar(ScalarKind::Bytes, 0),
            Value::IntArray(v) => TypeDescriptor::Array1d {
                kind: ScalarKind::Int,
                precision: 64,
                len: v.len(),
            },
            Value::UintArray(v) => TypeDescriptor::Array1d {
                kind: ScalarKind::Uint,
                precision: 64,
                len: v.len(),
            },
            Value::FloatArray(v) => TypeDescriptor::Array1d {
                kind: ScalarKind::Float,
                precision: 64,
                len: v.len(),
            },
        })
        .collect();

    match items.len() {
        0 => TypeDescriptor::Direct,
        1 => items.into_iter().next().unwrap_or(TypeDescriptor::Direct),
        _ => TypeDescriptor::Tuple { items },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with_json(json: &str) -> SendArgs {
        SendArgs {
            name: "t".to_string(),
            address: None,
            transport: None,
            json: Some(json.to_string()),
            data: None,
            file: None,
            datatype: None,
            max_frame: None,
            eof: false,
        }
    }

    #[test]
    fn json_values_map_to_slots() {
        let values = resolve_values(&args_with_json(r#"[1, 2.5, "ok", [1.0, 2.0]]"#)).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Text("ok".to_string()),
                Value::FloatArray(vec![1.0, 2.0]),
            ]
        );
    }

    #[test]
    fn non_array_json_is_rejected() {
        let err = resolve_values(&args_with_json(r#"{"x": 1}"#)).unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn inferred_descriptor_matches_arity() {
        let descriptor = infer_descriptor(&[
            Value::Int(1),
            Value::Text("x".to_string()),
            Value::FloatArray(vec![0.5; 3]),
        ]);
        assert_eq!(descriptor.arity(), 3);
    }

    #[test]
    fn array_values_infer_fixed_length_descriptors() {
        use msglink_schema::ScalarKind;

        let descriptor = infer_descriptor(&[Value::IntArray(vec![1, 2, 3])]);
        assert_eq!(
            descriptor,
            TypeDescriptor::Array1d {
                kind: ScalarKind::Int,
                precision: 64,
                len: 3,
            }
        );
    }

    #[test]
    fn empty_payload_infers_passthrough() {
        assert_eq!(infer_descriptor(&[]), TypeDescriptor::Direct);
    }
}
