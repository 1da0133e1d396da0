use serde::{Deserialize, Serialize};
use std::fmt;

/// Register level data types understood by the codec.
///
/// Fixed-width types occupy a canonical number of 16-bit words; `Bytes` and the
/// string types take their word count from configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Bytes,
    StringAscii,
    StringUtf8,
    StringLatin1,
}

impl DataType {
    /// Canonical word length, or `None` for variable-length types.
    #[inline]
    pub const fn word_length(&self) -> Option<u16> {
        match self {
            DataType::Boolean | DataType::Int16 | DataType::UInt16 => Some(1),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(2),
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => Some(4),
            DataType::Bytes
            | DataType::StringAscii
            | DataType::StringUtf8
            | DataType::StringLatin1 => None,
        }
    }

    #[inline]
    pub const fn is_variable_length(&self) -> bool {
        self.word_length().is_none()
    }

    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Int16
                | DataType::UInt16
                | DataType::Int32
                | DataType::UInt32
                | DataType::Int64
                | DataType::UInt64
                | DataType::Float32
                | DataType::Float64
        )
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Character set for string types.
    #[inline]
    pub fn charset(&self) -> Option<Charset> {
        match self {
            DataType::StringAscii => Some(Charset::Ascii),
            DataType::StringUtf8 => Some(Charset::Utf8),
            DataType::StringLatin1 => Some(Charset::Latin1),
            _ => None,
        }
    }

    /// Resolve the number of words a value of this type spans.
    ///
    /// Fixed-width types ignore `configured` and always report their canonical length.
    #[inline]
    pub fn span(&self, configured: u16) -> u16 {
        self.word_length().unwrap_or(configured)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Bytes => "bytes",
            DataType::StringAscii => "stringascii",
            DataType::StringUtf8 => "stringutf8",
            DataType::StringLatin1 => "stringlatin1",
        };
        f.write_str(name)
    }
}

/// Character sets supported by string register values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Charset {
    Ascii,
    Utf8,
    Latin1,
}

impl Charset {
    /// Decode raw bytes. Invalid sequences are replaced rather than rejected.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Charset::Ascii => bytes
                .iter()
                .map(|b| {
                    if b.is_ascii() {
                        *b as char
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::Latin1 => bytes.iter().map(|b| *b as char).collect(),
        }
    }

    /// Encode a string, substituting `?` for characters the charset cannot hold.
    pub fn encode(&self, s: &str) -> Vec<u8> {
        match self {
            Charset::Ascii => s
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Charset::Utf8 => s.as_bytes().to_vec(),
            Charset::Latin1 => s
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}
