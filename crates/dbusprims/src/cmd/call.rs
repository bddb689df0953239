use dbusprims_peer::{
    connect_unauthenticated, connect_with_config, Connection, ConnectionConfig, HandshakeConfig,
};
use dbusprims_wire::{
    parse_single_type, Dict, Message, ObjectPath, Signature, TypeNode, Value, Variant,
};
use tracing::debug;

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{peer_error, wire_error, CliError, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let message = build_call(&args)?;

    let mut conn = open(&args, timeout)?;
    if !args.no_hello {
        let name = conn
            .hello()
            .map_err(|err| peer_error("Hello failed", err))?;
        debug!(unique_name = %name, "connected");
    }

    let reply = conn
        .call(message)
        .map_err(|err| peer_error("call failed", err))?;
    print_message(&reply, format);
    Ok(SUCCESS)
}

fn open(args: &CallArgs, timeout: std::time::Duration) -> CliResult<Connection> {
    let connection_config = ConnectionConfig {
        reply_timeout: timeout,
        ..ConnectionConfig::default()
    };
    let result = if args.no_auth {
        connect_unauthenticated(&args.address, connection_config)
    } else {
        let handshake_config = HandshakeConfig {
            timeout,
            ..HandshakeConfig::default()
        };
        connect_with_config(&args.address, &handshake_config, connection_config)
    };
    result.map_err(|err| peer_error("connect failed", err))
}

fn build_call(args: &CallArgs) -> CliResult<Message> {
    let signature = Signature::new(args.signature.as_str())
        .map_err(|err| CliError::usage(format!("invalid --signature: {err}")))?;
    if signature.types().len() != args.args.len() {
        return Err(CliError::usage(format!(
            "signature '{}' needs {} --arg values, got {}",
            signature.as_str(),
            signature.types().len(),
            args.args.len()
        )));
    }

    let body = signature
        .types()
        .iter()
        .zip(&args.args)
        .map(|(ty, text)| arg_to_value(ty, text))
        .collect::<Result<Vec<_>, _>>()
        .map_err(CliError::usage)?;

    let mut message = Message::method_call(&args.path, args.member.clone())
        .map_err(|err| CliError::usage(format!("invalid --path: {err}")))?;
    if let Some(interface) = &args.interface {
        message = message.with_interface(interface.clone());
    }
    if let Some(dest) = &args.dest {
        message = message.with_destination(dest.clone());
    }
    message
        .with_body(signature.as_str(), body)
        .map_err(|err| wire_error("invalid arguments", err))
}

/// Parse one command-line argument as a value of type `ty`.
///
/// String-like types take the text verbatim; everything else is JSON.
pub fn arg_to_value(ty: &TypeNode, text: &str) -> Result<Value, String> {
    match ty {
        TypeNode::String | TypeNode::ObjectPath | TypeNode::Signature => {
            json_to_value(ty, &serde_json::Value::String(text.to_string()))
        }
        _ => {
            let json: serde_json::Value = serde_json::from_str(text)
                .map_err(|err| format!("'{text}' is not valid JSON for type '{ty}': {err}"))?;
            json_to_value(ty, &json)
        }
    }
}

fn json_to_value(ty: &TypeNode, json: &serde_json::Value) -> Result<Value, String> {
    let mismatch = || format!("{json} is not a valid '{ty}'");

    let value = match ty {
        TypeNode::Byte => Value::Byte(int_in_range(json).ok_or_else(mismatch)?),
        TypeNode::Boolean => Value::Boolean(json.as_bool().ok_or_else(mismatch)?),
        TypeNode::Int16 => Value::Int16(int_in_range(json).ok_or_else(mismatch)?),
        TypeNode::UInt16 => Value::UInt16(int_in_range(json).ok_or_else(mismatch)?),
        TypeNode::Int32 => Value::Int32(int_in_range(json).ok_or_else(mismatch)?),
        TypeNode::UInt32 => Value::UInt32(int_in_range(json).ok_or_else(mismatch)?),
        TypeNode::UnixFd => Value::UnixFd(int_in_range(json).ok_or_else(mismatch)?),
        TypeNode::Int64 => Value::Int64(json.as_i64().ok_or_else(mismatch)?),
        TypeNode::UInt64 => Value::UInt64(json.as_u64().ok_or_else(mismatch)?),
        TypeNode::Double => Value::Double(json.as_f64().ok_or_else(mismatch)?),
        TypeNode::String => Value::String(json.as_str().ok_or_else(mismatch)?.to_string()),
        TypeNode::ObjectPath => {
            let text = json.as_str().ok_or_else(mismatch)?;
            Value::ObjectPath(ObjectPath::new(text).map_err(|err| err.to_string())?)
        }
        TypeNode::Signature => {
            let text = json.as_str().ok_or_else(mismatch)?;
            Value::Signature(Signature::new(text).map_err(|err| err.to_string())?)
        }
        TypeNode::Array(elem) => match elem.as_ref() {
            TypeNode::DictEntry(key_ty, value_ty) => {
                let object = json.as_object().ok_or_else(mismatch)?;
                let mut dict = Dict::new();
                for (key, value) in object {
                    dict.insert(arg_to_value(key_ty, key)?, json_to_value(value_ty, value)?);
                }
                Value::Dict(dict)
            }
            elem => Value::Array(
                json.as_array()
                    .ok_or_else(mismatch)?
                    .iter()
                    .map(|item| json_to_value(elem, item))
                    .collect::<Result<_, _>>()?,
            ),
        },
        TypeNode::Struct(fields) => {
            let items = json.as_array().ok_or_else(mismatch)?;
            if items.len() != fields.len() {
                return Err(mismatch());
            }
            Value::Struct(
                fields
                    .iter()
                    .zip(items)
                    .map(|(field, item)| json_to_value(field, item))
                    .collect::<Result<_, _>>()?,
            )
        }
        TypeNode::DictEntry(_, _) => return Err(mismatch()),
        TypeNode::Variant => Value::from(json_to_variant(json)?),
    };
    Ok(value)
}

// `{"signature": "..", "value": ..}` is explicit; scalars get an inferred type.
fn json_to_variant(json: &serde_json::Value) -> Result<Variant, String> {
    if let (Some(signature), Some(inner)) = (
        json.get("signature").and_then(|sig| sig.as_str()),
        json.get("value"),
    ) {
        let ty = parse_single_type(signature).map_err(|err| err.to_string())?;
        let value = json_to_value(&ty, inner)?;
        return Variant::new(signature, value).map_err(|err| err.to_string());
    }

    let value = match json {
        serde_json::Value::String(text) => Value::from(text.as_str()),
        serde_json::Value::Bool(flag) => Value::Boolean(*flag),
        serde_json::Value::Number(number) => match number.as_i64() {
            Some(int) => match i32::try_from(int) {
                Ok(small) => Value::Int32(small),
                Err(_) => Value::Int64(int),
            },
            None => Value::Double(number.as_f64().unwrap_or_default()),
        },
        other => {
            return Err(format!(
                "cannot infer a variant type for {other}; use {{\"signature\": .., \"value\": ..}}"
            ))
        }
    };
    Variant::from_value(value).map_err(|err| err.to_string())
}

fn int_in_range<T: TryFrom<i64>>(json: &serde_json::Value) -> Option<T> {
    json.as_i64().and_then(|int| T::try_from(int).ok())
}

#[cfg(test)]
mod tests {
    use dbusprims_wire::parse_signature;

    use super::*;

    fn parse_args(signature: &str, args: &[&str]) -> Result<Vec<Value>, String> {
        parse_signature(signature)
            .unwrap()
            .iter()
            .zip(args)
            .map(|(ty, text)| arg_to_value(ty, text))
            .collect()
    }

    #[test]
    fn basic_arguments() {
        let values = parse_args("sibd", &["hello world", "-7", "true", "2.5"]).unwrap();
        assert_eq!(
            values,
            vec![
                Value::from("hello world"),
                Value::Int32(-7),
                Value::Boolean(true),
                Value::Double(2.5),
            ]
        );
    }

    #[test]
    fn out_of_range_integer_is_rejected() {
        assert!(parse_args("y", &["256"]).is_err());
        assert!(parse_args("q", &["-1"]).is_err());
    }

    #[test]
    fn containers_from_json() {
        let values = parse_args("aia{su}(sb)", &["[1,2,3]", r#"{"a":1}"#, r#"["x",false]"#]).unwrap();
        assert_eq!(values[0], Value::array([1i32, 2, 3]));
        let dict: Dict = [("a", 1u32)].into_iter().collect();
        assert_eq!(values[1], Value::Dict(dict));
        assert_eq!(
            values[2],
            Value::structure([Value::from("x"), Value::Boolean(false)])
        );
    }

    #[test]
    fn integer_dict_keys_are_parsed() {
        let values = parse_args("a{us}", &[r#"{"7":"seven"}"#]).unwrap();
        let dict: Dict = [(7u32, "seven")].into_iter().collect();
        assert_eq!(values[0], Value::Dict(dict));
    }

    #[test]
    fn variants_explicit_and_inferred() {
        let values = parse_args("vv", &[r#"{"signature":"u","value":5}"#, r#""text""#]).unwrap();
        assert_eq!(
            values[0],
            Value::from(Variant::new("u", Value::UInt32(5)).unwrap())
        );
        assert_eq!(
            values[1],
            Value::from(Variant::new("s", Value::from("text")).unwrap())
        );
        assert!(parse_args("v", &["[1]"]).is_err());
    }

    #[test]
    fn struct_arity_must_match() {
        assert!(parse_args("(ii)", &["[1]"]).is_err());
    }
}
