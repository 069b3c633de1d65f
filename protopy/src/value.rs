//! Value: anything an operand stack slot, local or container element can hold.
//!
//! Immediates (None, bools, small ints, floats) live inline. Strings, bytes,
//! big ints and code objects are immutable and shared through `Arc`, they
//! can never take part in a reference cycle so the collector ignores them.
//! Everything mutable (or able to reach something mutable) is a heap object
//! behind an [`ObjRef`].
use std::{fmt, sync::Arc};

use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive};

use crate::{CodeObject, ExcType, ObjRef, ObjectData, RunError, RunResult};

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    BigInt(Arc<BigInt>),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Code(Arc<CodeObject>),
    Object(ObjRef),
}

/// Hashable projection of a value, used as the key of dicts and sets.
///
/// Numbers that compare equal hash equal: `1`, `True` and `1.0` all map to
/// `Int(1)`. Objects without value semantics hash by identity; the owning
/// container keeps the original value alive next to the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    BigInt(Arc<BigInt>),
    Float(u64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Tuple(Box<[HashKey]>),
    Identity(usize),
}

impl Value {
    #[must_use]
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    /// Normalizes a big integer back to the i64 fast path when it fits.
    #[must_use]
    pub fn from_bigint(n: BigInt) -> Self {
        match n.to_i64() {
            Some(small) => Value::Int(small),
            None => Value::BigInt(Arc::new(n)),
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    #[inline]
    pub fn as_object(&self) -> Option<&ObjRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Small int view, bools included.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Bool(_) | Value::BigInt(_))
    }

    pub fn is_number(&self) -> bool {
        self.is_int() || matches!(self, Value::Float(_))
    }

    pub fn to_bigint(&self) -> Option<BigInt> {
        match self {
            Value::Int(i) => Some(BigInt::from(*i)),
            Value::Bool(b) => Some(BigInt::from(i64::from(*b))),
            Value::BigInt(b) => Some((**b).clone()),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::BigInt(b) => b.to_f64(),
            _ => None,
        }
    }

    /// Identity comparison (`is`).
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::BigInt(a), Value::BigInt(b)) => Arc::ptr_eq(a, b),
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b),
            (Value::Bytes(a), Value::Bytes(b)) => Arc::ptr_eq(a, b),
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) | Value::BigInt(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::Bytes(_) => "bytes".into(),
            Value::Code(_) => "code".into(),
            Value::Object(obj) => obj.type_name(),
        }
    }

    pub fn hash_key(&self) -> RunResult<HashKey> {
        Ok(match self {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(i64::from(*b)),
            Value::Int(i) => HashKey::Int(*i),
            Value::BigInt(b) => HashKey::BigInt(b.clone()),
            Value::Float(f) => float_key(*f),
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Bytes(b) => HashKey::Bytes(b.clone()),
            Value::Code(c) => HashKey::Identity(Arc::as_ptr(c) as usize),
            Value::Object(obj) => match &obj.data {
                ObjectData::Tuple(items) => HashKey::Tuple(
                    items
                        .iter()
                        .map(Value::hash_key)
                        .collect::<RunResult<Box<[HashKey]>>>()?,
                ),
                ObjectData::List(_)
                | ObjectData::Dict(_)
                | ObjectData::Set(_)
                | ObjectData::Slice(_) => {
                    return Err(RunError::new(
                        ExcType::TypeError,
                        format!("unhashable type: '{}'", obj.type_name()),
                    ));
                }
                _ => HashKey::Identity(obj.addr()),
            },
        })
    }
}

fn float_key(f: f64) -> HashKey {
    if f.is_finite() && f.fract() == 0.0 {
        if f >= i64::MIN as f64 && f < i64::MAX as f64 {
            return HashKey::Int(f as i64);
        }
        if let Some(big) = BigInt::from_f64(f) {
            return HashKey::BigInt(Arc::new(big));
        }
    }
    HashKey::Float(f.to_bits())
}

/// Float formatting close to the host language's `repr(float)`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Host-side equality: structural for immediates and immutable payloads,
/// identity for heap objects. Interpreted `==` goes through
/// `Interpreter::eq_values` instead.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(b) => write!(f, "{b}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Value::Code(c) => write!(f, "<code {}>", c.name),
            Value::Object(obj) => write!(f, "{obj:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<BigInt> for Value {
    fn from(value: BigInt) -> Self {
        Value::from_bigint(value)
    }
}

impl From<ObjRef> for Value {
    fn from(value: ObjRef) -> Self {
        Value::Object(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_numbers_share_a_hash_key() {
        let one = Value::Int(1).hash_key().unwrap();
        assert_eq!(one, Value::Bool(true).hash_key().unwrap());
        assert_eq!(one, Value::Float(1.0).hash_key().unwrap());
        assert_ne!(one, Value::Float(1.5).hash_key().unwrap());
    }

    #[test]
    fn big_ints_normalize_when_they_fit() {
        let small = Value::from_bigint(BigInt::from(42));
        assert!(matches!(small, Value::Int(42)));

        let big = BigInt::from(i64::MAX) * 4;
        assert!(matches!(Value::from_bigint(big), Value::BigInt(_)));
    }

    #[test]
    fn float_formatting() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(f64::NAN), "nan");
    }

    #[test]
    fn identity_of_strings_is_pointer_identity() {
        let a = Value::str("abc");
        let b = a.clone();
        let c = Value::str("abc");
        assert!(a.is(&b));
        assert!(!a.is(&c));
        assert_eq!(a, c);
    }
}
