//! Type signatures.
//!
//! A signature is a string over `ybnqiuxtdsoghva(){}` describing zero or more
//! complete types. Parsing is a single left-to-right recursive descent with
//! the protocol's nesting limits enforced as it goes, so hostile input cannot
//! drive unbounded recursion.

use std::fmt;

use crate::error::{Result, WireError};

/// Longest signature the wire format can carry (1-byte length prefix).
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Maximum nesting of arrays.
pub const MAX_ARRAY_DEPTH: u32 = 32;

/// Maximum nesting of structs and dict entries.
pub const MAX_STRUCT_DEPTH: u32 = 32;

/// Maximum total container nesting, including variants met while decoding.
pub const MAX_TOTAL_DEPTH: u32 = MAX_ARRAY_DEPTH + MAX_STRUCT_DEPTH;

/// One complete type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeNode {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Array(Box<TypeNode>),
    Struct(Vec<TypeNode>),
    /// Only legal as the element of an [`TypeNode::Array`]; key is basic.
    DictEntry(Box<TypeNode>, Box<TypeNode>),
    Variant,
}

impl TypeNode {
    /// Natural alignment of the type on the wire.
    pub fn alignment(&self) -> usize {
        match self {
            TypeNode::Byte | TypeNode::Signature | TypeNode::Variant => 1,
            TypeNode::Int16 | TypeNode::UInt16 => 2,
            TypeNode::Boolean
            | TypeNode::Int32
            | TypeNode::UInt32
            | TypeNode::UnixFd
            | TypeNode::String
            | TypeNode::ObjectPath
            | TypeNode::Array(_) => 4,
            TypeNode::Int64
            | TypeNode::UInt64
            | TypeNode::Double
            | TypeNode::Struct(_)
            | TypeNode::DictEntry(_, _) => 8,
        }
    }

    /// Basic types are the only ones allowed as dict keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            TypeNode::Array(_) | TypeNode::Struct(_) | TypeNode::DictEntry(_, _) | TypeNode::Variant
        )
    }

    /// Whether this is an array of dict entries, i.e. a dictionary.
    pub fn is_dict(&self) -> bool {
        matches!(self, TypeNode::Array(elem) if matches!(**elem, TypeNode::DictEntry(_, _)))
    }

    /// Single-character type code for leaf types.
    fn leaf_code(&self) -> Option<char> {
        let code = match self {
            TypeNode::Byte => 'y',
            TypeNode::Boolean => 'b',
            TypeNode::Int16 => 'n',
            TypeNode::UInt16 => 'q',
            TypeNode::Int32 => 'i',
            TypeNode::UInt32 => 'u',
            TypeNode::Int64 => 'x',
            TypeNode::UInt64 => 't',
            TypeNode::Double => 'd',
            TypeNode::String => 's',
            TypeNode::ObjectPath => 'o',
            TypeNode::Signature => 'g',
            TypeNode::UnixFd => 'h',
            TypeNode::Variant => 'v',
            _ => return None,
        };
        Some(code)
    }

    fn from_leaf_code(code: u8) -> Option<Self> {
        let node = match code {
            b'y' => TypeNode::Byte,
            b'b' => TypeNode::Boolean,
            b'n' => TypeNode::Int16,
            b'q' => TypeNode::UInt16,
            b'i' => TypeNode::Int32,
            b'u' => TypeNode::UInt32,
            b'x' => TypeNode::Int64,
            b't' => TypeNode::UInt64,
            b'd' => TypeNode::Double,
            b's' => TypeNode::String,
            b'o' => TypeNode::ObjectPath,
            b'g' => TypeNode::Signature,
            b'h' => TypeNode::UnixFd,
            b'v' => TypeNode::Variant,
            _ => return None,
        };
        Some(node)
    }
}

impl fmt::Display for TypeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.leaf_code() {
            return write!(f, "{code}");
        }
        match self {
            TypeNode::Array(elem) => write!(f, "a{elem}"),
            TypeNode::Struct(fields) => {
                f.write_str("(")?;
                for field in fields {
                    write!(f, "{field}")?;
                }
                f.write_str(")")
            }
            TypeNode::DictEntry(key, value) => write!(f, "{{{key}{value}}}"),
            _ => Ok(()),
        }
    }
}

/// Render a sequence of types back to signature text.
pub fn signature_string(types: &[TypeNode]) -> String {
    types.iter().map(ToString::to_string).collect()
}

/// Parse a signature into its top-level types. The empty string is valid
/// and yields no types.
pub fn parse_signature(signature: &str) -> Result<Vec<TypeNode>> {
    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(syntax(
            signature,
            format!("longer than {MAX_SIGNATURE_LEN} bytes"),
        ));
    }

    let mut parser = Parser::new(signature);
    let mut types = Vec::new();
    while !parser.at_end() {
        types.push(parser.parse_complete()?);
    }
    Ok(types)
}

/// Parse a signature that must hold exactly one complete type, as variant
/// payload signatures do.
pub fn parse_single_type(signature: &str) -> Result<TypeNode> {
    let mut types = parse_signature(signature)?;
    match types.len() {
        1 => Ok(types.remove(0)),
        0 => Err(syntax(signature, "expected one complete type, found none")),
        n => Err(syntax(
            signature,
            format!("expected one complete type, found {n}"),
        )),
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    array_depth: u32,
    struct_depth: u32,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            array_depth: 0,
            struct_depth: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn error(&self, reason: impl Into<String>) -> WireError {
        syntax(self.text, format!("{} at offset {}", reason.into(), self.pos))
    }

    fn parse_complete(&mut self) -> Result<TypeNode> {
        let code = self
            .bump()
            .ok_or_else(|| self.error("unexpected end of signature"))?;

        if let Some(leaf) = TypeNode::from_leaf_code(code) {
            return Ok(leaf);
        }

        match code {
            b'a' => {
                self.array_depth += 1;
                if self.array_depth > MAX_ARRAY_DEPTH {
                    return Err(self.error(format!("arrays nested deeper than {MAX_ARRAY_DEPTH}")));
                }
                let elem = if self.peek() == Some(b'{') {
                    self.pos += 1;
                    self.parse_dict_entry()?
                } else {
                    self.parse_complete()?
                };
                self.array_depth -= 1;
                Ok(TypeNode::Array(Box::new(elem)))
            }
            b'(' => {
                self.enter_struct()?;
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.parse_complete()?),
                        None => return Err(self.error("unterminated struct")),
                    }
                }
                if fields.is_empty() {
                    return Err(self.error("empty struct"));
                }
                self.struct_depth -= 1;
                Ok(TypeNode::Struct(fields))
            }
            b')' => Err(self.error("unexpected ')'")),
            b'{' => Err(self.error("dict entry outside of an array")),
            b'}' => Err(self.error("unexpected '}'")),
            other => Err(self.error(format!("unknown type code '{}'", other as char))),
        }
    }

    fn parse_dict_entry(&mut self) -> Result<TypeNode> {
        self.enter_struct()?;
        if self.peek() == Some(b'}') {
            return Err(self.error("dict entry needs a key and a value"));
        }
        let key = self.parse_complete()?;
        if !key.is_basic() {
            return Err(self.error(format!("dict key '{key}' is not a basic type")));
        }
        if self.peek() == Some(b'}') {
            return Err(self.error("dict entry needs a key and a value"));
        }
        let value = self.parse_complete()?;
        match self.bump() {
            Some(b'}') => {}
            Some(_) => return Err(self.error("dict entry must hold exactly two types")),
            None => return Err(self.error("unterminated dict entry")),
        }
        self.struct_depth -= 1;
        Ok(TypeNode::DictEntry(Box::new(key), Box::new(value)))
    }

    fn enter_struct(&mut self) -> Result<()> {
        self.struct_depth += 1;
        if self.struct_depth > MAX_STRUCT_DEPTH {
            return Err(self.error(format!(
                "structs nested deeper than {MAX_STRUCT_DEPTH}"
            )));
        }
        Ok(())
    }
}

fn syntax(signature: &str, reason: impl Into<String>) -> WireError {
    WireError::SignatureSyntax {
        signature: signature.to_string(),
        reason: reason.into(),
    }
}

/// A validated signature string together with its parsed types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    text: String,
    types: Vec<TypeNode>,
}

impl Signature {
    /// Validate and parse `text`.
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let types = parse_signature(&text)?;
        Ok(Self { text, types })
    }

    /// Build a signature from already-parsed types.
    pub fn from_types(types: Vec<TypeNode>) -> Result<Self> {
        // Re-parse so hand-built trees obey the same limits as parsed ones.
        Self::new(signature_string(&types))
    }

    /// The empty signature.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn types(&self) -> &[TypeNode] {
        &self.types
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl std::str::FromStr for Signature {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<&str> for Signature {
    type Error = WireError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}
