//! Message marshalling and unmarshalling.
//!
//! Wire layout:
//! ```text
//! ┌────────┬──────┬───────┬─────────┬──────────┬────────┬───────────┐
//! │ endian │ type │ flags │ version │ body len │ serial │ fields len│
//! │ 'l'/'B'│ (1B) │ (1B)  │ 1 (1B)  │ (u32)    │ (u32)  │ (u32)     │
//! └────────┴──────┴───────┴─────────┴──────────┴────────┴───────────┘
//!   header fields a(yv) │ pad to 8 │ body (body len bytes)
//! ```

use bytes::{BufMut, BytesMut};

use crate::codec::{decode_value, decode_values, encode_value, encode_values, MAX_ARRAY_LEN};
use crate::config::MAX_MESSAGE_SIZE;
use crate::cursor::{padding_for, Endianness, ReadCursor, WriteCursor};
use crate::error::{Result, WireError};
use crate::message::{HeaderField, Message, MessageType, PROTOCOL_VERSION};
use crate::signature::{Signature, TypeNode};
use crate::value::Value;
use crate::variant::Variant;

/// Fixed header size preceding the header-field array.
pub const HEADER_LEN: usize = 16;

const BODY_LEN_OFFSET: usize = 4;
const FIELDS_LEN_OFFSET: usize = 12;

fn header_fields_type() -> TypeNode {
    TypeNode::Array(Box::new(TypeNode::Struct(vec![
        TypeNode::Byte,
        TypeNode::Variant,
    ])))
}

/// Serialize `message` in the given byte order.
///
/// The message is validated first, so a zero serial or a missing required
/// header field is reported here rather than by the receiving peer.
pub fn marshal(message: &Message, endian: Endianness) -> Result<BytesMut> {
    message.validate()?;

    let mut w = WriteCursor::new(endian);
    w.write_u8(endian.marker());
    w.write_u8(message.message_type.as_u8());
    w.write_u8(message.flags);
    w.write_u8(PROTOCOL_VERSION);
    let body_len_at = w.reserve_u32();
    w.write_u32(message.serial);

    let fields = Value::Array(header_fields(message)?);
    encode_value(&mut w, &header_fields_type(), &fields)?;
    w.align(8);

    let body_start = w.position();
    encode_values(&mut w, message.signature().types(), message.body())?;
    let body_len = w.position() - body_start;

    if w.position() > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: w.position(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    w.backpatch_u32(body_len_at, body_len as u32);
    Ok(w.into_inner())
}

/// Marshal `message` and append the bytes to `dst`.
pub fn encode_message(message: &Message, endian: Endianness, dst: &mut BytesMut) -> Result<()> {
    let bytes = marshal(message, endian)?;
    dst.reserve(bytes.len());
    dst.put_slice(&bytes);
    Ok(())
}

fn header_fields(message: &Message) -> Result<Vec<Value>> {
    let mut fields = Vec::new();
    let mut push = |field: HeaderField, value: Value| -> Result<()> {
        let variant = Variant::new(field.value_signature(), value)?;
        fields.push(Value::structure([Value::Byte(field.code()), Value::from(variant)]));
        Ok(())
    };

    if let Some(path) = &message.path {
        push(HeaderField::Path, Value::ObjectPath(path.clone()))?;
    }
    if let Some(interface) = &message.interface {
        push(HeaderField::Interface, Value::from(interface.as_str()))?;
    }
    if let Some(member) = &message.member {
        push(HeaderField::Member, Value::from(member.as_str()))?;
    }
    if let Some(error_name) = &message.error_name {
        push(HeaderField::ErrorName, Value::from(error_name.as_str()))?;
    }
    if let Some(reply_serial) = message.reply_serial {
        push(HeaderField::ReplySerial, Value::UInt32(reply_serial))?;
    }
    if let Some(destination) = &message.destination {
        push(HeaderField::Destination, Value::from(destination.as_str()))?;
    }
    if let Some(sender) = &message.sender {
        push(HeaderField::Sender, Value::from(sender.as_str()))?;
    }
    if !message.signature().is_empty() {
        push(
            HeaderField::Signature,
            Value::Signature(message.signature().clone()),
        )?;
    }
    if let Some(unix_fds) = message.unix_fds {
        push(HeaderField::UnixFds, Value::UInt32(unix_fds))?;
    }
    for (code, variant) in &message.unknown_fields {
        fields.push(Value::structure([
            Value::Byte(*code),
            Value::from(variant.clone()),
        ]));
    }
    Ok(fields)
}

/// Total frame length announced by a message's fixed header.
///
/// Needs only the first [`HEADER_LEN`] bytes. Returns
/// [`WireError::BufferUnderrun`] when fewer are available.
pub fn message_frame_length(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < HEADER_LEN {
        return Err(WireError::BufferUnderrun {
            needed: HEADER_LEN,
            available: prefix.len(),
        });
    }
    let endian = Endianness::from_marker(prefix[0])?;
    let mut r = ReadCursor::at(prefix, BODY_LEN_OFFSET, endian);
    let body_len = r.read_u32()? as usize;
    let mut r = ReadCursor::at(prefix, FIELDS_LEN_OFFSET, endian);
    let fields_len = r.read_u32()? as usize;
    if fields_len > MAX_ARRAY_LEN {
        return Err(WireError::malformed(format!(
            "header field array length {fields_len} exceeds {MAX_ARRAY_LEN}"
        )));
    }
    let fields_end = HEADER_LEN + fields_len;
    Ok(fields_end + padding_for(fields_end, 8) + body_len)
}

/// Parse the message at the start of `bytes`.
///
/// Returns [`WireError::BufferUnderrun`] if `bytes` holds less than one full
/// frame. Once the frame is complete, any shortfall inside it is reported as
/// [`WireError::MalformedValue`]. Bytes after the frame are ignored.
pub fn unmarshal(bytes: &[u8]) -> Result<Message> {
    let frame_len = message_frame_length(bytes)?;
    if bytes.len() < frame_len {
        return Err(WireError::BufferUnderrun {
            needed: frame_len,
            available: bytes.len(),
        });
    }
    unmarshal_frame(&bytes[..frame_len]).map_err(|err| {
        if err.is_underrun() {
            WireError::malformed(format!("message truncated inside its frame: {err}"))
        } else {
            err
        }
    })
}

fn unmarshal_frame(frame: &[u8]) -> Result<Message> {
    let endian = Endianness::from_marker(frame[0])?;
    let version = frame[3];
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedProtocolVersion(version));
    }
    let message_type = MessageType::from_u8(frame[1])?;

    let mut r = ReadCursor::at(frame, BODY_LEN_OFFSET, endian);
    let body_len = r.read_u32()? as usize;
    let serial = r.read_u32()?;
    if serial == 0 {
        return Err(WireError::malformed("message serial must be non-zero"));
    }

    let mut message = Message::new(message_type);
    message.flags = frame[2];
    message.serial = serial;

    let fields = decode_value(&mut r, &header_fields_type())?;
    let mut signature = None;
    for entry in fields.as_slice().unwrap_or_default() {
        let (code, variant) = match entry.as_slice() {
            Some([Value::Byte(code), Value::Variant(variant)]) => (*code, variant),
            _ => return Err(WireError::malformed("header field is not a (yv) pair")),
        };
        match HeaderField::from_code(code) {
            Some(field) => apply_field(&mut message, &mut signature, field, variant)?,
            None => message.unknown_fields.push((code, (**variant).clone())),
        }
    }

    r.align(8)?;
    let mut body = r.split_bounded(body_len)?;
    match signature {
        Some(signature) => {
            let values = decode_values(&mut body, signature.types()).map_err(|err| {
                if err.is_underrun() {
                    WireError::malformed(format!(
                        "body of {body_len} bytes is too short for signature '{signature}'"
                    ))
                } else {
                    err
                }
            })?;
            if body.remaining() != 0 {
                return Err(WireError::malformed(format!(
                    "body length {body_len} leaves {} bytes unused by signature '{signature}'",
                    body.remaining()
                )));
            }
            message.set_body_unchecked(signature, values);
        }
        None if body_len > 0 => {
            return Err(WireError::malformed(format!(
                "body of {body_len} bytes without a signature header field"
            )));
        }
        None => {}
    }

    message.validate()?;
    Ok(message)
}

fn apply_field(
    message: &mut Message,
    signature: &mut Option<Signature>,
    field: HeaderField,
    variant: &Variant,
) -> Result<()> {
    let expected = field.value_signature();
    if variant.signature().as_str() != expected {
        return Err(WireError::malformed(format!(
            "header field {} carries '{}', expected '{expected}'",
            field.name(),
            variant.signature()
        )));
    }
    let value = variant.value().clone();
    match (field, value) {
        (HeaderField::Path, Value::ObjectPath(path)) => message.path = Some(path),
        (HeaderField::Interface, Value::String(s)) => message.interface = Some(s),
        (HeaderField::Member, Value::String(s)) => message.member = Some(s),
        (HeaderField::ErrorName, Value::String(s)) => message.error_name = Some(s),
        (HeaderField::ReplySerial, Value::UInt32(n)) => message.reply_serial = Some(n),
        (HeaderField::Destination, Value::String(s)) => message.destination = Some(s),
        (HeaderField::Sender, Value::String(s)) => message.sender = Some(s),
        (HeaderField::Signature, Value::Signature(sig)) => *signature = Some(sig),
        (HeaderField::UnixFds, Value::UInt32(n)) => message.unix_fds = Some(n),
        (field, _) => {
            return Err(WireError::malformed(format!(
                "header field {} has the wrong value type",
                field.name()
            )));
        }
    }
    Ok(())
}

/// Try to decode one message from the front of a stream buffer.
///
/// Returns `Ok(None)` until a whole frame is buffered. On success the frame
/// is removed from `src`. A frame that is complete but rejected is also
/// removed, so the buffer stays aligned on the next message.
pub fn try_decode_message(src: &mut BytesMut, max_message_size: usize) -> Result<Option<Message>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let frame_len = message_frame_length(&src[..HEADER_LEN])?;
    if frame_len > max_message_size {
        return Err(WireError::MessageTooLarge {
            size: frame_len,
            max: max_message_size,
        });
    }
    if src.len() < frame_len {
        return Ok(None);
    }
    let frame = src.split_to(frame_len);
    unmarshal(&frame).map(Some)
}
