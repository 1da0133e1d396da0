use super::{bits::BitSet, types::WordOrder};
use bytes::Bytes;
use der_gateway_sdk::{Charset, DataType, DriverError, DriverResult, RegisterValue};
use std::sync::Arc;

/// Word-order aware conversions between typed values and 16-bit register words.
///
/// Bytes inside a word are always big-endian. `WordOrder` only decides whether the first
/// register carries the most or the least significant word of a multi-word value. Every
/// `encode_*` function is the exact inverse of the matching `parse_*`/`decode` path.
pub struct ModbusCodec;

impl ModbusCodec {
    /// Copy the first `N` words into most-significant-first order.
    #[inline(always)]
    fn ordered<const N: usize>(words: &[u16], word_order: WordOrder) -> [u16; N] {
        let mut out = [0u16; N];
        out.copy_from_slice(&words[..N]);
        if matches!(word_order, WordOrder::LeastToMostSignificant) {
            out.reverse();
        }
        out
    }

    /// Lay out most-significant-first words in register order.
    #[inline(always)]
    fn arrange<const N: usize>(mut words: [u16; N], word_order: WordOrder) -> [u16; N] {
        if matches!(word_order, WordOrder::LeastToMostSignificant) {
            words.reverse();
        }
        words
    }

    #[inline(always)]
    fn fold_words(words: &[u16]) -> u64 {
        words.iter().fold(0u64, |acc, w| (acc << 16) | u64::from(*w))
    }

    #[inline(always)]
    fn split_u32(n: u32) -> [u16; 2] {
        [(n >> 16) as u16, n as u16]
    }

    #[inline(always)]
    fn split_u64(n: u64) -> [u16; 4] {
        [(n >> 48) as u16, (n >> 32) as u16, (n >> 16) as u16, n as u16]
    }

    /// Flatten words into big-endian byte pairs, honouring word order.
    pub fn words_to_bytes(words: &[u16], word_order: WordOrder) -> Vec<u8> {
        let mut out = Vec::with_capacity(words.len() * 2);
        match word_order {
            WordOrder::MostToLeastSignificant => {
                words.iter().for_each(|w| out.extend_from_slice(&w.to_be_bytes()))
            }
            WordOrder::LeastToMostSignificant => words
                .iter()
                .rev()
                .for_each(|w| out.extend_from_slice(&w.to_be_bytes())),
        }
        out
    }

    /// Pack bytes into words; an odd trailing byte is padded with zero.
    pub fn bytes_to_words(bytes: &[u8], word_order: WordOrder) -> Vec<u16> {
        let mut words: Vec<u16> = bytes
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
            .collect();
        if matches!(word_order, WordOrder::LeastToMostSignificant) {
            words.reverse();
        }
        words
    }

    /// Alias of [`ModbusCodec::bytes_to_words`] for call sites encoding raw payloads.
    #[inline]
    pub fn encode_bytes(bytes: &[u8], word_order: WordOrder) -> Vec<u16> {
        Self::bytes_to_words(bytes, word_order)
    }

    /// Reverse the order of all words in place.
    #[inline]
    pub fn swap_word_order(words: &mut [u16]) {
        words.reverse();
    }

    #[inline]
    pub fn parse_int16(word: u16) -> i16 {
        word as i16
    }

    #[inline]
    pub fn parse_int32(hi: u16, lo: u16) -> i32 {
        Self::parse_uint32(hi, lo) as i32
    }

    #[inline]
    pub fn parse_uint32(hi: u16, lo: u16) -> u32 {
        (u32::from(hi) << 16) | u32::from(lo)
    }

    /// Parse four most-significant-first words.
    #[inline]
    pub fn parse_int64(words: [u16; 4]) -> i64 {
        Self::parse_uint64(words) as i64
    }

    #[inline]
    pub fn parse_uint64(words: [u16; 4]) -> u64 {
        Self::fold_words(&words)
    }

    /// Parse an IEEE-754 single; NaN decodes to `None`.
    #[inline]
    pub fn parse_float32(hi: u16, lo: u16) -> Option<f32> {
        let f = f32::from_bits(Self::parse_uint32(hi, lo));
        (!f.is_nan()).then_some(f)
    }

    /// Parse an IEEE-754 double from most-significant-first words; NaN decodes to `None`.
    #[inline]
    pub fn parse_float64(words: [u16; 4]) -> Option<f64> {
        let f = f64::from_bits(Self::parse_uint64(words));
        (!f.is_nan()).then_some(f)
    }

    #[inline]
    pub fn encode_int16(value: i16) -> u16 {
        value as u16
    }

    #[inline]
    pub fn encode_int32(value: i32, word_order: WordOrder) -> [u16; 2] {
        Self::encode_uint32(value as u32, word_order)
    }

    #[inline]
    pub fn encode_uint32(value: u32, word_order: WordOrder) -> [u16; 2] {
        Self::arrange(Self::split_u32(value), word_order)
    }

    #[inline]
    pub fn encode_int64(value: i64, word_order: WordOrder) -> [u16; 4] {
        Self::encode_uint64(value as u64, word_order)
    }

    #[inline]
    pub fn encode_uint64(value: u64, word_order: WordOrder) -> [u16; 4] {
        Self::arrange(Self::split_u64(value), word_order)
    }

    #[inline]
    pub fn encode_float32(value: f32, word_order: WordOrder) -> [u16; 2] {
        Self::encode_uint32(value.to_bits(), word_order)
    }

    #[inline]
    pub fn encode_float64(value: f64, word_order: WordOrder) -> [u16; 4] {
        Self::encode_uint64(value.to_bits(), word_order)
    }

    /// Decode a string from a word span, stopping at the first NUL byte.
    pub fn decode_string(words: &[u16], charset: Charset, word_order: WordOrder) -> String {
        let bytes = Self::words_to_bytes(words, word_order);
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        charset.decode(&bytes[..end])
    }

    /// Interpret the span as one integer and expose its bits.
    #[inline]
    pub fn decode_flags(words: &[u16], word_order: WordOrder) -> BitSet {
        BitSet::from_words(words, word_order)
    }

    /// Decode a typed value from register words.
    ///
    /// Returns `Ok(None)` for NaN float payloads. A span shorter than the type's canonical
    /// length (or an empty span for variable-length types) is a structural error.
    pub fn decode(
        data_type: DataType,
        words: &[u16],
        word_order: WordOrder,
    ) -> DriverResult<Option<RegisterValue>> {
        let needed = data_type.word_length().unwrap_or(1) as usize;
        if words.len() < needed {
            return Err(Self::cold_err(format!(
                "Insufficient words for {data_type}: need {needed}, got {}",
                words.len()
            )));
        }
        let value = match data_type {
            DataType::Boolean => Some(RegisterValue::Boolean(words[0] != 0)),
            DataType::Int16 => Some(RegisterValue::Int16(Self::parse_int16(words[0]))),
            DataType::UInt16 => Some(RegisterValue::UInt16(words[0])),
            DataType::Int32 => {
                let [hi, lo] = Self::ordered::<2>(words, word_order);
                Some(RegisterValue::Int32(Self::parse_int32(hi, lo)))
            }
            DataType::UInt32 => {
                let [hi, lo] = Self::ordered::<2>(words, word_order);
                Some(RegisterValue::UInt32(Self::parse_uint32(hi, lo)))
            }
            DataType::Int64 => Some(RegisterValue::Int64(Self::parse_int64(Self::ordered(
                words, word_order,
            )))),
            DataType::UInt64 => Some(RegisterValue::UInt64(Self::parse_uint64(Self::ordered(
                words, word_order,
            )))),
            DataType::Float32 => {
                let [hi, lo] = Self::ordered::<2>(words, word_order);
                Self::parse_float32(hi, lo).map(RegisterValue::Float32)
            }
            DataType::Float64 => {
                Self::parse_float64(Self::ordered(words, word_order)).map(RegisterValue::Float64)
            }
            DataType::Bytes => Some(RegisterValue::Bytes(Bytes::from(Self::words_to_bytes(
                words, word_order,
            )))),
            DataType::StringAscii | DataType::StringUtf8 | DataType::StringLatin1 => {
                let charset = data_type.charset().unwrap_or(Charset::Utf8);
                Some(RegisterValue::String(Arc::<str>::from(Self::decode_string(
                    words, charset, word_order,
                ))))
            }
        };
        Ok(value)
    }

    /// Encode a value as `data_type`, casting numeric variants as needed.
    ///
    /// Fixed-width types produce their canonical word count; variable-length types produce
    /// as many words as the payload needs (odd byte counts padded with zero).
    pub fn encode(
        value: &RegisterValue,
        data_type: DataType,
        word_order: WordOrder,
    ) -> DriverResult<Vec<u16>> {
        let words = match data_type {
            DataType::Boolean => vec![u16::from(bool::try_from(value)?)],
            DataType::Int16 => vec![Self::encode_int16(i16::try_from(value)?)],
            DataType::UInt16 => vec![u16::try_from(value)?],
            DataType::Int32 => Self::encode_int32(i32::try_from(value)?, word_order).to_vec(),
            DataType::UInt32 => Self::encode_uint32(u32::try_from(value)?, word_order).to_vec(),
            DataType::Int64 => Self::encode_int64(i64::try_from(value)?, word_order).to_vec(),
            DataType::UInt64 => Self::encode_uint64(u64::try_from(value)?, word_order).to_vec(),
            DataType::Float32 => Self::encode_float32(f32::try_from(value)?, word_order).to_vec(),
            DataType::Float64 => Self::encode_float64(f64::try_from(value)?, word_order).to_vec(),
            DataType::Bytes
            | DataType::StringAscii
            | DataType::StringUtf8
            | DataType::StringLatin1 => {
                Self::bytes_to_words(&Self::payload_bytes(value, data_type)?, word_order)
            }
        };
        Ok(words)
    }

    /// Encode a value into exactly `word_count` words for variable-length types.
    ///
    /// Longer payloads are truncated and shorter ones zero-padded before word order is
    /// applied. Fixed-width types ignore `word_count` and keep their canonical length.
    pub fn encode_with_length(
        value: &RegisterValue,
        data_type: DataType,
        word_order: WordOrder,
        word_count: u16,
    ) -> DriverResult<Vec<u16>> {
        if !data_type.is_variable_length() {
            return Self::encode(value, data_type, word_order);
        }
        let mut bytes = Self::payload_bytes(value, data_type)?;
        bytes.resize(word_count as usize * 2, 0);
        Ok(Self::bytes_to_words(&bytes, word_order))
    }

    fn payload_bytes(value: &RegisterValue, data_type: DataType) -> DriverResult<Vec<u8>> {
        match (data_type.charset(), value) {
            (Some(charset), RegisterValue::String(s)) => Ok(charset.encode(s)),
            (Some(charset), other) => Ok(charset.encode(&other.to_string())),
            (None, RegisterValue::Bytes(b)) => Ok(b.to_vec()),
            (None, RegisterValue::String(s)) => Ok(s.as_bytes().to_vec()),
            (None, other) => Err(Self::codec_err(format!(
                "Expected bytes for {data_type}, got {}",
                other.data_type()
            ))),
        }
    }

    #[inline(never)]
    #[cold]
    fn cold_err(msg: String) -> DriverError {
        DriverError::StructuralDecodeError(msg)
    }

    #[inline(never)]
    #[cold]
    fn codec_err(msg: String) -> DriverError {
        DriverError::CodecError(msg)
    }
}
