use crate::DataType;
use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::{fmt, sync::Arc};

/// Error returned when converting a `RegisterValue` into a concrete Rust primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueCastError {
    /// Value is not a number (int/float/bool).
    #[error("expected numeric value, got {actual}")]
    NotNumeric { actual: DataType },
    /// Float value is NaN/Inf and cannot be represented in an integer type.
    #[error("numeric value is not finite")]
    NotFinite,
    #[error("numeric value out of range for {target}")]
    OutOfRange { target: &'static str },
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: DataType,
        actual: DataType,
    },
    #[error("failed to parse {target} from string: {value}")]
    ParseError { target: &'static str, value: String },
}

/// A decoded register value.
///
/// Strings share storage through `Arc<str>` and byte blocks through `Bytes`, so
/// cloning a value out of a snapshot never copies payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum RegisterValue {
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bytes(Bytes),
    String(Arc<str>),
}

impl RegisterValue {
    /// Data type this value naturally encodes as.
    ///
    /// Strings report `StringUtf8`; the target charset is chosen by the caller.
    #[inline]
    pub fn data_type(&self) -> DataType {
        match self {
            RegisterValue::Boolean(_) => DataType::Boolean,
            RegisterValue::Int16(_) => DataType::Int16,
            RegisterValue::UInt16(_) => DataType::UInt16,
            RegisterValue::Int32(_) => DataType::Int32,
            RegisterValue::UInt32(_) => DataType::UInt32,
            RegisterValue::Int64(_) => DataType::Int64,
            RegisterValue::UInt64(_) => DataType::UInt64,
            RegisterValue::Float32(_) => DataType::Float32,
            RegisterValue::Float64(_) => DataType::Float64,
            RegisterValue::Bytes(_) => DataType::Bytes,
            RegisterValue::String(_) => DataType::StringUtf8,
        }
    }

    #[inline]
    pub fn is_numeric(&self) -> bool {
        !matches!(self, RegisterValue::Bytes(_) | RegisterValue::String(_))
    }

    /// Numeric view of the value, booleans mapping to 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        f64::try_from(self).ok()
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RegisterValue::String(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        match self {
            RegisterValue::Boolean(v) => serde_json::Value::Bool(*v),
            RegisterValue::Int16(v) => serde_json::Value::Number((*v as i64).into()),
            RegisterValue::UInt16(v) => serde_json::Value::Number((*v as u64).into()),
            RegisterValue::Int32(v) => serde_json::Value::Number((*v as i64).into()),
            RegisterValue::UInt32(v) => serde_json::Value::Number((*v as u64).into()),
            RegisterValue::Int64(v) => serde_json::Value::Number((*v).into()),
            RegisterValue::UInt64(v) => serde_json::Value::Number((*v).into()),
            RegisterValue::Float32(v) => {
                serde_json::Number::from_f64(*v as f64).map_or(serde_json::Value::Null, Into::into)
            }
            RegisterValue::Float64(v) => {
                serde_json::Number::from_f64(*v).map_or(serde_json::Value::Null, Into::into)
            }
            RegisterValue::Bytes(b) => serde_json::Value::String(format!("0x{}", hex::encode(b))),
            RegisterValue::String(s) => serde_json::Value::String(s.to_string()),
        }
    }

    /// Convert a JSON scalar from configuration into a value of the expected type.
    ///
    /// Strings are parsed with [`RegisterValue::parse`]; arrays and objects are rejected.
    pub fn try_from_json_scalar(
        expected: DataType,
        v: &serde_json::Value,
    ) -> Result<Self, ValueCastError> {
        match v {
            serde_json::Value::String(s) => Self::parse(expected, s),
            serde_json::Value::Bool(b) => RegisterValue::Boolean(*b).cast(expected),
            serde_json::Value::Number(n) => {
                let raw = if let Some(i) = n.as_i64() {
                    RegisterValue::Int64(i)
                } else if let Some(u) = n.as_u64() {
                    RegisterValue::UInt64(u)
                } else {
                    RegisterValue::Float64(n.as_f64().unwrap_or(f64::NAN))
                };
                raw.cast(expected)
            }
            _ => Err(ValueCastError::ParseError {
                target: "scalar",
                value: v.to_string(),
            }),
        }
    }

    /// Parse a textual configuration value as the given data type.
    ///
    /// Integers accept decimal or `0x` hex; `Bytes` accepts hex with an optional `0x` prefix.
    pub fn parse(data_type: DataType, s: &str) -> Result<Self, ValueCastError> {
        let st = s.trim();
        match data_type {
            DataType::Boolean => parse_bool_from_str(st)
                .map(RegisterValue::Boolean)
                .ok_or_else(|| parse_err("bool", st)),
            DataType::Float32 | DataType::Float64 => {
                let f = st.parse::<f64>().map_err(|_| parse_err("float", st))?;
                RegisterValue::Float64(f).cast(data_type)
            }
            DataType::Int16 | DataType::Int32 | DataType::Int64 => {
                RegisterValue::Int64(parse_i64_from_str(st)?).cast(data_type)
            }
            DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
                RegisterValue::UInt64(parse_u64_from_str(st)?).cast(data_type)
            }
            DataType::Bytes => {
                let hex = st
                    .strip_prefix("0x")
                    .or_else(|| st.strip_prefix("0X"))
                    .unwrap_or(st);
                hex::decode(hex)
                    .map(|b| RegisterValue::Bytes(Bytes::from(b)))
                    .map_err(|_| parse_err("bytes", st))
            }
            DataType::StringAscii | DataType::StringUtf8 | DataType::StringLatin1 => {
                // keep surrounding whitespace, it is part of the payload
                Ok(RegisterValue::String(Arc::<str>::from(s)))
            }
        }
    }

    /// Cast this value into the variant matching `target`, with range checks.
    pub fn cast(&self, target: DataType) -> Result<Self, ValueCastError> {
        Ok(match target {
            DataType::Boolean => RegisterValue::Boolean(bool::try_from(self)?),
            DataType::Int16 => RegisterValue::Int16(i16::try_from(self)?),
            DataType::UInt16 => RegisterValue::UInt16(u16::try_from(self)?),
            DataType::Int32 => RegisterValue::Int32(i32::try_from(self)?),
            DataType::UInt32 => RegisterValue::UInt32(u32::try_from(self)?),
            DataType::Int64 => RegisterValue::Int64(i64::try_from(self)?),
            DataType::UInt64 => RegisterValue::UInt64(u64::try_from(self)?),
            DataType::Float32 => RegisterValue::Float32(f32::try_from(self)?),
            DataType::Float64 => RegisterValue::Float64(f64::try_from(self)?),
            DataType::Bytes => match self {
                RegisterValue::Bytes(b) => RegisterValue::Bytes(b.clone()),
                RegisterValue::String(s) => {
                    RegisterValue::Bytes(Bytes::copy_from_slice(s.as_bytes()))
                }
                other => {
                    return Err(ValueCastError::TypeMismatch {
                        expected: DataType::Bytes,
                        actual: other.data_type(),
                    })
                }
            },
            DataType::StringAscii | DataType::StringUtf8 | DataType::StringLatin1 => match self {
                RegisterValue::String(s) => RegisterValue::String(s.clone()),
                other => RegisterValue::String(Arc::<str>::from(other.to_string())),
            },
        })
    }

    /// Integer view used by the integer casts; floats are rounded.
    fn as_i128(&self) -> Result<i128, ValueCastError> {
        match self {
            RegisterValue::Boolean(b) => Ok(i128::from(*b)),
            RegisterValue::Int16(x) => Ok(i128::from(*x)),
            RegisterValue::UInt16(x) => Ok(i128::from(*x)),
            RegisterValue::Int32(x) => Ok(i128::from(*x)),
            RegisterValue::UInt32(x) => Ok(i128::from(*x)),
            RegisterValue::Int64(x) => Ok(i128::from(*x)),
            RegisterValue::UInt64(x) => Ok(i128::from(*x)),
            RegisterValue::Float32(x) => float_to_i128(*x as f64),
            RegisterValue::Float64(x) => float_to_i128(*x),
            RegisterValue::String(s) => {
                let st = s.trim();
                match parse_i64_from_str(st) {
                    Ok(n) => Ok(i128::from(n)),
                    Err(_) => parse_u64_from_str(st).map(i128::from),
                }
            }
            RegisterValue::Bytes(_) => Err(ValueCastError::NotNumeric {
                actual: DataType::Bytes,
            }),
        }
    }
}

#[inline]
fn float_to_i128(f: f64) -> Result<i128, ValueCastError> {
    let r = f.round();
    if !r.is_finite() {
        return Err(ValueCastError::NotFinite);
    }
    if r < i128::MIN as f64 || r > i128::MAX as f64 {
        return Err(ValueCastError::OutOfRange { target: "i128" });
    }
    Ok(r as i128)
}

#[inline]
fn parse_err(target: &'static str, value: &str) -> ValueCastError {
    ValueCastError::ParseError {
        target,
        value: value.to_string(),
    }
}

#[inline]
fn parse_bool_from_str(s: &str) -> Option<bool> {
    let st = s.to_ascii_lowercase();
    match st.as_str() {
        "true" | "1" | "on" | "yes" | "y" | "t" => Some(true),
        "false" | "0" | "off" | "no" | "n" | "f" => Some(false),
        _ => None,
    }
}

fn parse_i64_from_str(st: &str) -> Result<i64, ValueCastError> {
    if let Ok(n) = st.parse::<i64>() {
        return Ok(n);
    }
    let (negative, rest) = match st.as_bytes().first() {
        Some(b'-') => (true, &st[1..]),
        Some(b'+') => (false, &st[1..]),
        _ => (false, st),
    };
    let hex = rest
        .strip_prefix("0x")
        .or_else(|| rest.strip_prefix("0X"))
        .ok_or_else(|| parse_err("i64", st))?;
    let u = u64::from_str_radix(hex, 16).map_err(|_| parse_err("i64", st))? as i128;
    let signed = if negative { -u } else { u };
    i64::try_from(signed).map_err(|_| ValueCastError::OutOfRange { target: "i64" })
}

fn parse_u64_from_str(st: &str) -> Result<u64, ValueCastError> {
    if let Ok(n) = st.parse::<u64>() {
        return Ok(n);
    }
    match st.strip_prefix("0x").or_else(|| st.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).map_err(|_| parse_err("u64", st)),
        None => Err(parse_err("u64", st)),
    }
}

macro_rules! impl_int_cast {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl TryFrom<&RegisterValue> for $ty {
                type Error = ValueCastError;

                #[inline]
                fn try_from(v: &RegisterValue) -> Result<Self, Self::Error> {
                    let n = v.as_i128()?;
                    <$ty>::try_from(n).map_err(|_| ValueCastError::OutOfRange { target: $name })
                }
            }
        )*
    };
}

impl_int_cast!(
    i16 => "i16",
    u16 => "u16",
    i32 => "i32",
    u32 => "u32",
    i64 => "i64",
    u64 => "u64",
);

impl TryFrom<&RegisterValue> for bool {
    type Error = ValueCastError;

    fn try_from(v: &RegisterValue) -> Result<Self, Self::Error> {
        match v {
            RegisterValue::Boolean(b) => Ok(*b),
            RegisterValue::String(s) => {
                parse_bool_from_str(s.trim()).ok_or_else(|| parse_err("bool", s))
            }
            RegisterValue::Bytes(_) => Err(ValueCastError::NotNumeric {
                actual: DataType::Bytes,
            }),
            other => Ok(other.as_i128()? != 0),
        }
    }
}

impl TryFrom<&RegisterValue> for f64 {
    type Error = ValueCastError;

    /// Float casts keep NaN and infinities so bit patterns survive encoding.
    fn try_from(v: &RegisterValue) -> Result<Self, Self::Error> {
        match v {
            RegisterValue::Boolean(x) => Ok(if *x { 1.0 } else { 0.0 }),
            RegisterValue::Int16(x) => Ok(*x as f64),
            RegisterValue::UInt16(x) => Ok(*x as f64),
            RegisterValue::Int32(x) => Ok(*x as f64),
            RegisterValue::UInt32(x) => Ok(*x as f64),
            RegisterValue::Int64(x) => Ok(*x as f64),
            RegisterValue::UInt64(x) => Ok(*x as f64),
            RegisterValue::Float32(x) => Ok(*x as f64),
            RegisterValue::Float64(x) => Ok(*x),
            RegisterValue::String(s) => s.trim().parse::<f64>().map_err(|_| parse_err("f64", s)),
            RegisterValue::Bytes(_) => Err(ValueCastError::NotNumeric {
                actual: DataType::Bytes,
            }),
        }
    }
}

impl TryFrom<&RegisterValue> for f32 {
    type Error = ValueCastError;

    fn try_from(v: &RegisterValue) -> Result<Self, Self::Error> {
        if let RegisterValue::Float32(x) = v {
            return Ok(*x);
        }
        let f = f64::try_from(v)?;
        if f.is_finite() && (f < f32::MIN as f64 || f > f32::MAX as f64) {
            return Err(ValueCastError::OutOfRange { target: "f32" });
        }
        Ok(f as f32)
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Boolean(v) => write!(f, "{v}"),
            RegisterValue::Int16(v) => write!(f, "{v}"),
            RegisterValue::UInt16(v) => write!(f, "{v}"),
            RegisterValue::Int32(v) => write!(f, "{v}"),
            RegisterValue::UInt32(v) => write!(f, "{v}"),
            RegisterValue::Int64(v) => write!(f, "{v}"),
            RegisterValue::UInt64(v) => write!(f, "{v}"),
            RegisterValue::Float32(v) => write!(f, "{v}"),
            RegisterValue::Float64(v) => write!(f, "{v}"),
            RegisterValue::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            RegisterValue::String(s) => f.write_str(s),
        }
    }
}

impl Serialize for RegisterValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json_value().serialize(serializer)
    }
}
