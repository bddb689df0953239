//! Dynamically typed values.
//!
//! [`Value`] mirrors [`TypeNode`] one case per type, so the codec can match
//! exhaustively on `(type, value)` pairs.

use std::fmt;

use crate::error::{Result, WireError};
use crate::signature::{Signature, TypeNode};
use crate::variant::Variant;

/// A value of any D-Bus type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    /// Index into the out-of-band file descriptor list.
    UnixFd(u32),
    Array(Vec<Value>),
    Struct(Vec<Value>),
    Dict(Dict),
    Variant(Box<Variant>),
}

impl Value {
    /// Build an array value from anything convertible to values.
    pub fn array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Array(items.into_iter().map(Into::into).collect())
    }

    /// Build a struct value from its fields in order.
    pub fn structure<I, T>(fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Struct(fields.into_iter().map(Into::into).collect())
    }

    /// Wrap a value in a variant, inferring its signature.
    pub fn variant(value: impl Into<Value>) -> Result<Self> {
        Ok(Value::Variant(Box::new(Variant::from_value(value.into())?)))
    }

    /// Short description of the value's kind, used in mismatch errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Boolean(_) => "boolean",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::UnixFd(_) => "unix fd",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Dict(_) => "dict",
            Value::Variant(_) => "variant",
        }
    }

    /// Whether this value can be encoded as `ty`.
    pub fn conforms_to(&self, ty: &TypeNode) -> bool {
        match (ty, self) {
            (TypeNode::Byte, Value::Byte(_))
            | (TypeNode::Boolean, Value::Boolean(_))
            | (TypeNode::Int16, Value::Int16(_))
            | (TypeNode::UInt16, Value::UInt16(_))
            | (TypeNode::Int32, Value::Int32(_))
            | (TypeNode::UInt32, Value::UInt32(_))
            | (TypeNode::Int64, Value::Int64(_))
            | (TypeNode::UInt64, Value::UInt64(_))
            | (TypeNode::Double, Value::Double(_))
            | (TypeNode::String, Value::String(_))
            | (TypeNode::ObjectPath, Value::ObjectPath(_))
            | (TypeNode::Signature, Value::Signature(_))
            | (TypeNode::UnixFd, Value::UnixFd(_))
            | (TypeNode::Variant, Value::Variant(_)) => true,
            (TypeNode::Array(elem), Value::Dict(dict)) => match elem.as_ref() {
                TypeNode::DictEntry(key, value) => dict
                    .iter()
                    .all(|(k, v)| k.conforms_to(key) && v.conforms_to(value)),
                _ => false,
            },
            (TypeNode::Array(elem), Value::Array(items)) => {
                !matches!(elem.as_ref(), TypeNode::DictEntry(_, _))
                    && items.iter().all(|item| item.conforms_to(elem))
            }
            (TypeNode::Struct(types), Value::Struct(fields)) => {
                types.len() == fields.len()
                    && types.iter().zip(fields).all(|(ty, field)| field.conforms_to(ty))
            }
            _ => false,
        }
    }

    /// Infer the type of this value.
    ///
    /// Returns `None` for empty arrays and dicts, whose element type cannot
    /// be recovered from the value alone.
    pub fn type_node(&self) -> Option<TypeNode> {
        let node = match self {
            Value::Byte(_) => TypeNode::Byte,
            Value::Boolean(_) => TypeNode::Boolean,
            Value::Int16(_) => TypeNode::Int16,
            Value::UInt16(_) => TypeNode::UInt16,
            Value::Int32(_) => TypeNode::Int32,
            Value::UInt32(_) => TypeNode::UInt32,
            Value::Int64(_) => TypeNode::Int64,
            Value::UInt64(_) => TypeNode::UInt64,
            Value::Double(_) => TypeNode::Double,
            Value::String(_) => TypeNode::String,
            Value::ObjectPath(_) => TypeNode::ObjectPath,
            Value::Signature(_) => TypeNode::Signature,
            Value::UnixFd(_) => TypeNode::UnixFd,
            Value::Variant(_) => TypeNode::Variant,
            Value::Array(items) => TypeNode::Array(Box::new(items.first()?.type_node()?)),
            Value::Struct(fields) => TypeNode::Struct(
                fields
                    .iter()
                    .map(Value::type_node)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Value::Dict(dict) => {
                let (key, value) = dict.iter().next()?;
                TypeNode::Array(Box::new(TypeNode::DictEntry(
                    Box::new(key.type_node()?),
                    Box::new(value.type_node()?),
                )))
            }
        };
        Some(node)
    }

    /// Inferred single-type signature, when [`Value::type_node`] succeeds.
    pub fn signature(&self) -> Option<Signature> {
        Signature::from_types(vec![self.type_node()?]).ok()
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Value::Int16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::UInt16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) | Value::UnixFd(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Text of a string, object path or signature value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            Value::ObjectPath(v) => Some(v.as_str()),
            Value::Signature(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Elements of an array or fields of a struct.
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) | Value::Struct(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(variant) => Some(variant),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::ObjectPath(v) => write!(f, "{v}"),
            Value::Signature(v) => write!(f, "<{v}>"),
            Value::UnixFd(v) => write!(f, "fd#{v}"),
            Value::Array(items) => write_seq(f, "[", items, "]"),
            Value::Struct(fields) => write_seq(f, "(", fields, ")"),
            Value::Dict(dict) => {
                f.write_str("{")?;
                for (i, (key, value)) in dict.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str("}")
            }
            Value::Variant(variant) => write!(f, "{variant}"),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[Value], close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str(close)
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

value_from! {
    u8 => Byte,
    bool => Boolean,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String,
    ObjectPath => ObjectPath,
    Signature => Signature,
    Dict => Dict,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Variant> for Value {
    fn from(value: Variant) -> Self {
        Value::Variant(Box::new(value))
    }
}

/// A validated object path: `/` or `/`-separated non-empty `[A-Za-z0-9_]` segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_object_path(&path)?;
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl std::str::FromStr for ObjectPath {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

fn validate_object_path(path: &str) -> Result<()> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| WireError::malformed(format!("object path '{path}' must start with '/'")))?;
    if rest.is_empty() {
        return Ok(());
    }
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(WireError::malformed(format!(
                "object path '{path}' has an empty segment"
            )));
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(WireError::malformed(format!(
                "object path '{path}' has invalid characters"
            )));
        }
    }
    Ok(())
}

/// Mapping of basic-typed keys to values.
///
/// Entries keep insertion order for display, but equality ignores order.
/// Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns the previous value for `key`, if any.
    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    /// Look up a string key.
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.as_str() == Some(key))
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(key, value)| other.get(key) == Some(value))
    }
}

impl<K: Into<Value>, V: Into<Value>> FromIterator<(K, V)> for Dict {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dict = Dict::new();
        for (key, value) in iter {
            dict.insert(key, value);
        }
        dict
    }
}
