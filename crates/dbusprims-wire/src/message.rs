//! The message envelope: type, flags, serial, header fields and a typed body.

use std::fmt;

use crate::error::{Result, WireError};
use crate::signature::Signature;
use crate::value::{ObjectPath, Value};
use crate::variant::Variant;

/// The only protocol version this crate speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// The sender does not want a reply to this method call.
pub const FLAG_NO_REPLY_EXPECTED: u8 = 0x1;
/// The bus must not launch an owner for the destination name.
pub const FLAG_NO_AUTO_START: u8 = 0x2;
/// The caller is prepared to wait for interactive authorization.
pub const FLAG_ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(WireError::UnsupportedMessageType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Header field codes and the single type each one carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderField {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

impl HeaderField {
    pub fn from_code(code: u8) -> Option<Self> {
        let field = match code {
            1 => HeaderField::Path,
            2 => HeaderField::Interface,
            3 => HeaderField::Member,
            4 => HeaderField::ErrorName,
            5 => HeaderField::ReplySerial,
            6 => HeaderField::Destination,
            7 => HeaderField::Sender,
            8 => HeaderField::Signature,
            9 => HeaderField::UnixFds,
            _ => return None,
        };
        Some(field)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Signature of the variant payload this field must carry.
    pub fn value_signature(self) -> &'static str {
        match self {
            HeaderField::Path => "o",
            HeaderField::Interface
            | HeaderField::Member
            | HeaderField::ErrorName
            | HeaderField::Destination
            | HeaderField::Sender => "s",
            HeaderField::ReplySerial | HeaderField::UnixFds => "u",
            HeaderField::Signature => "g",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HeaderField::Path => "path",
            HeaderField::Interface => "interface",
            HeaderField::Member => "member",
            HeaderField::ErrorName => "error_name",
            HeaderField::ReplySerial => "reply_serial",
            HeaderField::Destination => "destination",
            HeaderField::Sender => "sender",
            HeaderField::Signature => "signature",
            HeaderField::UnixFds => "unix_fds",
        }
    }
}

/// A D-Bus message.
///
/// Header fields are public and can be set directly. The body and its
/// signature are kept together behind [`Message::set_body`] so they can
/// never disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: u8,
    /// Zero until assigned by the sending connection.
    pub serial: u32,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub unix_fds: Option<u32>,
    /// Header fields with codes this crate does not know, in wire order.
    pub unknown_fields: Vec<(u8, Variant)>,
    signature: Signature,
    body: Vec<Value>,
}

impl Message {
    /// An empty message of the given type. Most callers want one of the
    /// typed constructors instead.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: 0,
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            unix_fds: None,
            unknown_fields: Vec::new(),
            signature: Signature::empty(),
            body: Vec::new(),
        }
    }

    pub fn method_call(path: &str, member: impl Into<String>) -> Result<Self> {
        let mut message = Self::new(MessageType::MethodCall);
        message.path = Some(ObjectPath::new(path)?);
        message.member = Some(member.into());
        Ok(message)
    }

    pub fn signal(path: &str, interface: impl Into<String>, member: impl Into<String>) -> Result<Self> {
        let mut message = Self::new(MessageType::Signal);
        message.path = Some(ObjectPath::new(path)?);
        message.interface = Some(interface.into());
        message.member = Some(member.into());
        Ok(message)
    }

    /// A successful reply addressed back to the caller.
    pub fn method_return(call: &Message) -> Self {
        let mut message = Self::new(MessageType::MethodReturn);
        message.reply_serial = Some(call.serial);
        message.destination = call.sender.clone();
        message
    }

    /// An error reply. A non-empty `text` becomes the single string body.
    pub fn error(call: &Message, name: impl Into<String>, text: &str) -> Result<Self> {
        let mut message = Self::new(MessageType::Error);
        message.error_name = Some(name.into());
        message.reply_serial = Some(call.serial);
        message.destination = call.sender.clone();
        if !text.is_empty() {
            message.set_body(Signature::new("s")?, vec![Value::from(text)])?;
        }
        Ok(message)
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    /// Attach a body described by `signature`.
    pub fn with_body(mut self, signature: &str, body: Vec<Value>) -> Result<Self> {
        self.set_body(Signature::new(signature)?, body)?;
        Ok(self)
    }

    /// Replace the body. Fails if the values do not match the signature
    /// one-for-one.
    pub fn set_body(&mut self, signature: Signature, body: Vec<Value>) -> Result<()> {
        let types = signature.types();
        if types.len() != body.len() {
            return Err(WireError::BodySignatureMismatch {
                signature: signature.as_str().to_string(),
                types: types.len(),
                values: body.len(),
            });
        }
        for (ty, value) in types.iter().zip(&body) {
            if !value.conforms_to(ty) {
                return Err(WireError::TypeMismatch {
                    expected: ty.to_string(),
                    found: value.kind_name().to_string(),
                });
            }
        }
        self.signature = signature;
        self.body = body;
        Ok(())
    }

    /// Decoder-side constructor for a body already decoded from `signature`.
    pub(crate) fn set_body_unchecked(&mut self, signature: Signature, body: Vec<Value>) {
        self.signature = signature;
        self.body = body;
    }

    /// The body signature. Empty when there is no body.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn body(&self) -> &[Value] {
        &self.body
    }

    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    pub fn no_reply_expected(&self) -> bool {
        self.flags & FLAG_NO_REPLY_EXPECTED != 0
    }

    /// Whether `self` answers the call that was sent with `serial`.
    pub fn is_reply_to(&self, serial: u32) -> bool {
        matches!(
            self.message_type,
            MessageType::MethodReturn | MessageType::Error
        ) && self.reply_serial == Some(serial)
    }

    /// Text of an error reply, taken from a leading string body value.
    pub fn error_text(&self) -> Option<&str> {
        match self.message_type {
            MessageType::Error => self.body.first().and_then(Value::as_str),
            _ => None,
        }
    }

    /// Check the serial and the header fields required by the message type.
    pub fn validate(&self) -> Result<()> {
        if self.serial == 0 {
            return Err(WireError::malformed("message serial must be non-zero"));
        }
        let missing = |field: HeaderField| WireError::MissingRequiredField {
            message_type: self.message_type.name(),
            field: field.name(),
        };
        match self.message_type {
            MessageType::MethodCall => {
                self.path.as_ref().ok_or_else(|| missing(HeaderField::Path))?;
                self.member.as_ref().ok_or_else(|| missing(HeaderField::Member))?;
            }
            MessageType::MethodReturn => {
                self.reply_serial
                    .ok_or_else(|| missing(HeaderField::ReplySerial))?;
            }
            MessageType::Error => {
                self.error_name
                    .as_ref()
                    .ok_or_else(|| missing(HeaderField::ErrorName))?;
                self.reply_serial
                    .ok_or_else(|| missing(HeaderField::ReplySerial))?;
            }
            MessageType::Signal => {
                self.path.as_ref().ok_or_else(|| missing(HeaderField::Path))?;
                self.interface
                    .as_ref()
                    .ok_or_else(|| missing(HeaderField::Interface))?;
                self.member.as_ref().ok_or_else(|| missing(HeaderField::Member))?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} serial={}", self.message_type, self.serial)?;
        if let Some(reply_serial) = self.reply_serial {
            write!(f, " reply_serial={reply_serial}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " path={path}")?;
        }
        if let Some(interface) = &self.interface {
            write!(f, " interface={interface}")?;
        }
        if let Some(member) = &self.member {
            write!(f, " member={member}")?;
        }
        if let Some(error_name) = &self.error_name {
            write!(f, " error_name={error_name}")?;
        }
        if !self.signature.is_empty() {
            write!(f, " signature={}", self.signature)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_codes() {
        for code in 1..=4u8 {
            assert_eq!(MessageType::from_u8(code).unwrap().as_u8(), code);
        }
        assert!(matches!(
            MessageType::from_u8(0),
            Err(WireError::UnsupportedMessageType(0))
        ));
        assert!(matches!(
            MessageType::from_u8(5),
            Err(WireError::UnsupportedMessageType(5))
        ));
    }

    #[test]
    fn header_field_codes() {
        for code in 1..=9u8 {
            assert_eq!(HeaderField::from_code(code).unwrap().code(), code);
        }
        assert!(HeaderField::from_code(0).is_none());
        assert!(HeaderField::from_code(10).is_none());
        assert_eq!(HeaderField::Path.value_signature(), "o");
        assert_eq!(HeaderField::Signature.value_signature(), "g");
    }

    #[test]
    fn body_must_match_signature() {
        let call = Message::method_call("/a", "M").unwrap();
        let err = call
            .clone()
            .with_body("su", vec![Value::from("x")])
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::BodySignatureMismatch {
                types: 2,
                values: 1,
                ..
            }
        ));

        let err = call.with_body("u", vec![Value::from("x")]).unwrap_err();
        assert!(matches!(err, WireError::TypeMismatch { .. }));
    }

    #[test]
    fn required_fields_per_type() {
        let mut call = Message::new(MessageType::MethodCall).with_serial(1);
        assert!(matches!(
            call.validate(),
            Err(WireError::MissingRequiredField { field: "path", .. })
        ));
        call.path = Some(ObjectPath::new("/").unwrap());
        assert!(matches!(
            call.validate(),
            Err(WireError::MissingRequiredField { field: "member", .. })
        ));
        call.member = Some("Ping".into());
        call.validate().unwrap();

        let signal = Message::signal("/s", "org.x.Y", "Changed")
            .unwrap()
            .with_serial(2);
        signal.validate().unwrap();
        let mut signal = signal;
        signal.interface = None;
        assert!(matches!(
            signal.validate(),
            Err(WireError::MissingRequiredField {
                message_type: "signal",
                field: "interface"
            })
        ));

        let err = Message::new(MessageType::Error).with_serial(3).validate();
        assert!(matches!(
            err,
            Err(WireError::MissingRequiredField {
                field: "error_name",
                ..
            })
        ));
    }

    #[test]
    fn zero_serial_is_rejected() {
        let call = Message::method_call("/a", "M").unwrap();
        assert!(matches!(call.validate(), Err(WireError::MalformedValue(_))));
    }

    #[test]
    fn replies_track_the_call() {
        let call = Message::method_call("/a", "M")
            .unwrap()
            .with_serial(7)
            .with_sender(":1.4");
        let reply = Message::method_return(&call).with_serial(1);
        assert!(reply.is_reply_to(7));
        assert_eq!(reply.destination.as_deref(), Some(":1.4"));

        let error = Message::error(&call, "org.x.Failed", "boom").unwrap();
        assert!(error.is_reply_to(7));
        assert_eq!(error.error_text(), Some("boom"));
        assert_eq!(error.signature().as_str(), "s");
        assert!(!call.is_reply_to(7));
    }

    #[test]
    fn flags() {
        let call = Message::method_call("/a", "M")
            .unwrap()
            .with_flags(FLAG_NO_REPLY_EXPECTED | FLAG_NO_AUTO_START);
        assert!(call.no_reply_expected());
        assert!(!Message::method_call("/a", "M").unwrap().no_reply_expected());
    }
}
