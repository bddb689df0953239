use std::fmt;

use crate::error::{Result, WireError};
use crate::signature::{parse_single_type, Signature, TypeNode};
use crate::value::Value;

/// A value carried together with its own single-type signature.
///
/// Construction checks that the signature describes exactly one complete
/// type and that the value conforms to it, so a `Variant` can always be
/// encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    signature: Signature,
    value: Value,
}

impl Variant {
    /// Pair `value` with an explicit signature such as `"s"` or `"a{sv}"`.
    pub fn new(signature: &str, value: Value) -> Result<Self> {
        let ty = parse_single_type(signature)?;
        if !value.conforms_to(&ty) {
            return Err(WireError::TypeMismatch {
                expected: signature.to_string(),
                found: value.kind_name().to_string(),
            });
        }
        Ok(Self {
            signature: Signature::from_types(vec![ty])?,
            value,
        })
    }

    /// Pair `value` with its inferred signature.
    ///
    /// Empty arrays and dicts carry no element type, so they need
    /// [`Variant::new`] instead. Containers are typed from their first
    /// element and every other element must match it.
    pub fn from_value(value: Value) -> Result<Self> {
        let ty = value.type_node().ok_or_else(|| {
            WireError::malformed(format!(
                "cannot infer a signature for an empty {}",
                value.kind_name()
            ))
        })?;
        if !value.conforms_to(&ty) {
            return Err(WireError::TypeMismatch {
                expected: ty.to_string(),
                found: value.kind_name().to_string(),
            });
        }
        Ok(Self {
            signature: Signature::from_types(vec![ty])?,
            value,
        })
    }

    /// Decoder-side constructor. The caller has already checked conformance.
    pub(crate) fn from_parts(signature: Signature, value: Value) -> Self {
        Self { signature, value }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The single type named by the signature.
    pub fn type_node(&self) -> &TypeNode {
        // Both constructors guarantee exactly one type.
        &self.signature.types()[0]
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}: {}>", self.signature, self.value)
    }
}
