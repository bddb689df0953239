//! Type-directed value encoding.
//!
//! Every value is written at an offset aligned to its type, measured from the
//! start of the message. Arrays carry a `u32` byte length that excludes the
//! padding between the length and the first element. Variants carry their own
//! signature, so the total nesting depth is checked in both directions.

use crate::cursor::{ReadCursor, WriteCursor};
use crate::error::{Result, WireError};
use crate::signature::{parse_single_type, Signature, TypeNode, MAX_TOTAL_DEPTH};
use crate::value::{Dict, ObjectPath, Value};
use crate::variant::Variant;

/// Largest array payload the protocol allows (64 MiB).
pub const MAX_ARRAY_LEN: usize = 64 * 1024 * 1024;

/// Encode `value` as `ty` at the cursor's current position.
pub fn encode_value(w: &mut WriteCursor, ty: &TypeNode, value: &Value) -> Result<()> {
    encode_nested(w, ty, value, 0)
}

fn encode_nested(w: &mut WriteCursor, ty: &TypeNode, value: &Value, depth: u32) -> Result<()> {
    match (ty, value) {
        (TypeNode::Byte, Value::Byte(v)) => w.write_u8(*v),
        (TypeNode::Boolean, Value::Boolean(v)) => w.write_u32(u32::from(*v)),
        (TypeNode::Int16, Value::Int16(v)) => w.write_i16(*v),
        (TypeNode::UInt16, Value::UInt16(v)) => w.write_u16(*v),
        (TypeNode::Int32, Value::Int32(v)) => w.write_i32(*v),
        (TypeNode::UInt32, Value::UInt32(v)) => w.write_u32(*v),
        (TypeNode::Int64, Value::Int64(v)) => w.write_i64(*v),
        (TypeNode::UInt64, Value::UInt64(v)) => w.write_u64(*v),
        (TypeNode::Double, Value::Double(v)) => w.write_f64(*v),
        (TypeNode::UnixFd, Value::UnixFd(v)) => w.write_u32(*v),
        (TypeNode::String, Value::String(v)) => write_string(w, v)?,
        (TypeNode::ObjectPath, Value::ObjectPath(v)) => write_string(w, v.as_str())?,
        (TypeNode::Signature, Value::Signature(v)) => write_signature(w, v),
        (TypeNode::Array(elem), Value::Array(items)) if !ty.is_dict() => {
            let depth = enter(depth)?;
            write_array(w, elem, items.iter(), |w, item| {
                encode_nested(w, elem, item, depth)
            })?;
        }
        (TypeNode::Array(elem), Value::Dict(dict)) => {
            let TypeNode::DictEntry(key_ty, value_ty) = elem.as_ref() else {
                return Err(mismatch(ty, value));
            };
            // The array and its entries each count as a level.
            let depth = enter(enter(depth)?)?;
            write_array(w, elem, dict.iter(), |w, (key, value)| {
                w.align(8);
                encode_nested(w, key_ty, key, depth)?;
                encode_nested(w, value_ty, value, depth)
            })?;
        }
        (TypeNode::Struct(types), Value::Struct(fields)) if types.len() == fields.len() => {
            let depth = enter(depth)?;
            w.align(8);
            for (field_ty, field) in types.iter().zip(fields) {
                encode_nested(w, field_ty, field, depth)?;
            }
        }
        (TypeNode::Variant, Value::Variant(variant)) => {
            let depth = enter(depth)?;
            write_signature(w, variant.signature());
            encode_nested(w, variant.type_node(), variant.value(), depth)?;
        }
        _ => return Err(mismatch(ty, value)),
    }
    Ok(())
}

/// Encode a sequence of values against a sequence of types.
pub fn encode_values(w: &mut WriteCursor, types: &[TypeNode], values: &[Value]) -> Result<()> {
    if types.len() != values.len() {
        return Err(WireError::BodySignatureMismatch {
            signature: crate::signature::signature_string(types),
            types: types.len(),
            values: values.len(),
        });
    }
    for (ty, value) in types.iter().zip(values) {
        encode_value(w, ty, value)?;
    }
    Ok(())
}

/// Decode one value of type `ty` at the cursor's current position.
pub fn decode_value(r: &mut ReadCursor<'_>, ty: &TypeNode) -> Result<Value> {
    decode_nested(r, ty, 0)
}

/// Decode one value per type, in order.
pub fn decode_values(r: &mut ReadCursor<'_>, types: &[TypeNode]) -> Result<Vec<Value>> {
    types.iter().map(|ty| decode_value(r, ty)).collect()
}

fn decode_nested(r: &mut ReadCursor<'_>, ty: &TypeNode, depth: u32) -> Result<Value> {
    let value = match ty {
        TypeNode::Byte => Value::Byte(r.read_u8()?),
        // Any nonzero word reads as true.
        TypeNode::Boolean => Value::Boolean(r.read_u32()? != 0),
        TypeNode::Int16 => Value::Int16(r.read_i16()?),
        TypeNode::UInt16 => Value::UInt16(r.read_u16()?),
        TypeNode::Int32 => Value::Int32(r.read_i32()?),
        TypeNode::UInt32 => Value::UInt32(r.read_u32()?),
        TypeNode::Int64 => Value::Int64(r.read_i64()?),
        TypeNode::UInt64 => Value::UInt64(r.read_u64()?),
        TypeNode::Double => Value::Double(r.read_f64()?),
        TypeNode::UnixFd => Value::UnixFd(r.read_u32()?),
        TypeNode::String => Value::String(read_string(r)?),
        TypeNode::ObjectPath => Value::ObjectPath(ObjectPath::new(read_string(r)?)?),
        TypeNode::Signature => Value::Signature(read_signature(r)?),
        TypeNode::Array(elem) => {
            let depth = enter(depth)?;
            let mut items = read_array(r, elem)?;
            match elem.as_ref() {
                TypeNode::DictEntry(key_ty, value_ty) => {
                    let depth = enter(depth)?;
                    let mut dict = Dict::new();
                    while items.remaining() > 0 {
                        items.align(8).map_err(overrun)?;
                        let key = decode_nested(&mut items, key_ty, depth).map_err(overrun)?;
                        let value = decode_nested(&mut items, value_ty, depth).map_err(overrun)?;
                        dict.insert(key, value);
                    }
                    Value::Dict(dict)
                }
                _ => {
                    let mut values = Vec::new();
                    while items.remaining() > 0 {
                        values.push(decode_nested(&mut items, elem, depth).map_err(overrun)?);
                    }
                    Value::Array(values)
                }
            }
        }
        TypeNode::Struct(types) => {
            let depth = enter(depth)?;
            r.align(8)?;
            let fields = types
                .iter()
                .map(|field_ty| decode_nested(r, field_ty, depth))
                .collect::<Result<Vec<_>>>()?;
            Value::Struct(fields)
        }
        TypeNode::DictEntry(_, _) => {
            return Err(WireError::malformed("dict entry outside an array"));
        }
        TypeNode::Variant => {
            let depth = enter(depth)?;
            let signature = read_signature(r)?;
            let inner_ty = parse_single_type(signature.as_str())?;
            let inner = decode_nested(r, &inner_ty, depth)?;
            Value::Variant(Box::new(Variant::from_parts(signature, inner)))
        }
    };
    Ok(value)
}

fn enter(depth: u32) -> Result<u32> {
    let next = depth + 1;
    if next > MAX_TOTAL_DEPTH {
        return Err(WireError::malformed(format!(
            "value nesting exceeds {MAX_TOTAL_DEPTH} levels"
        )));
    }
    Ok(next)
}

// Inside an array the element bytes are bounded by the declared length, so
// running short means the length and the elements disagree.
fn overrun(err: WireError) -> WireError {
    if err.is_underrun() {
        WireError::malformed("array elements overrun the declared length")
    } else {
        err
    }
}

fn mismatch(ty: &TypeNode, value: &Value) -> WireError {
    WireError::TypeMismatch {
        expected: ty.to_string(),
        found: value.kind_name().to_string(),
    }
}

fn write_string(w: &mut WriteCursor, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(WireError::malformed("string contains an embedded NUL"));
    }
    let len = u32::try_from(s.len())
        .map_err(|_| WireError::malformed(format!("string of {} bytes is too long", s.len())))?;
    w.write_u32(len);
    w.put_slice(s.as_bytes());
    w.write_u8(0);
    Ok(())
}

fn write_signature(w: &mut WriteCursor, signature: &Signature) {
    // Signature validation caps the length at 255.
    w.write_u8(signature.as_str().len() as u8);
    w.put_slice(signature.as_str().as_bytes());
    w.write_u8(0);
}

fn write_array<I, F>(w: &mut WriteCursor, elem: &TypeNode, items: I, mut encode: F) -> Result<()>
where
    I: Iterator,
    F: FnMut(&mut WriteCursor, I::Item) -> Result<()>,
{
    let length_at = w.reserve_u32();
    w.align(elem.alignment());
    let start = w.position();
    for item in items {
        encode(w, item)?;
    }
    let len = w.position() - start;
    if len > MAX_ARRAY_LEN {
        return Err(WireError::malformed(format!(
            "array of {len} bytes exceeds {MAX_ARRAY_LEN}"
        )));
    }
    w.backpatch_u32(length_at, len as u32);
    Ok(())
}

fn read_array<'a>(r: &mut ReadCursor<'a>, elem: &TypeNode) -> Result<ReadCursor<'a>> {
    let len = r.read_u32()? as usize;
    if len > MAX_ARRAY_LEN {
        return Err(WireError::malformed(format!(
            "array length {len} exceeds {MAX_ARRAY_LEN}"
        )));
    }
    r.align(elem.alignment())?;
    r.split_bounded(len)
}

fn read_string(r: &mut ReadCursor<'_>) -> Result<String> {
    let len = r.read_u32()? as usize;
    let bytes = r.take(len)?;
    expect_nul(r)?;
    if bytes.contains(&0) {
        return Err(WireError::malformed("string contains an embedded NUL"));
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|_| WireError::malformed("string is not valid UTF-8"))
}

fn read_signature(r: &mut ReadCursor<'_>) -> Result<Signature> {
    let len = r.read_u8()? as usize;
    let bytes = r.take(len)?;
    expect_nul(r)?;
    let text = std::str::from_utf8(bytes)
        .map_err(|_| WireError::malformed("signature is not valid ASCII"))?;
    Signature::new(text)
}

fn expect_nul(r: &mut ReadCursor<'_>) -> Result<()> {
    match r.read_u8()? {
        0 => Ok(()),
        other => Err(WireError::malformed(format!(
            "expected NUL terminator, found 0x{other:02x}"
        ))),
    }
}
