use super::{bits::BitSet, codec::ModbusCodec, types::WordOrder};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use der_gateway_sdk::{Charset, DataType, DriverError, DriverResult, RegisterValue};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    ops::Deref,
    sync::{PoisonError, RwLock},
};

/// Number of addressable registers.
const ADDRESS_SPACE: u32 = 1 << 16;

/// Immutable register contents: a sparse map of 16-bit words plus the last update time.
///
/// Obtained from [`RegisterStore::copy`]; decoding from it never takes a lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterData {
    words: BTreeMap<u16, u16>,
    timestamp: Option<DateTime<Utc>>,
    word_order: WordOrder,
}

impl RegisterData {
    pub fn new(word_order: WordOrder) -> Self {
        Self {
            words: BTreeMap::new(),
            timestamp: None,
            word_order,
        }
    }

    #[inline]
    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    /// Time of the last update that reported a change.
    #[inline]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[inline]
    pub fn word(&self, address: u16) -> Option<u16> {
        self.words.get(&address).copied()
    }

    /// The sparse register map, in ascending address order.
    pub fn unsigned_words(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.words.iter().map(|(a, w)| (*a, *w))
    }

    /// Words `address..address + count`, or `None` if any of them has never been set.
    ///
    /// A span running past the last register address is a structural error.
    pub fn words(&self, address: u16, count: u16) -> DriverResult<Option<Vec<u16>>> {
        if u32::from(address) + u32::from(count) > ADDRESS_SPACE {
            return Err(DriverError::StructuralDecodeError(format!(
                "Span of {count} words at {address} exceeds register address space"
            )));
        }
        Ok((0..count)
            .map(|i| self.word(address + i))
            .collect::<Option<Vec<u16>>>())
    }

    /// Like [`RegisterData::words`] for fixed-width reads; spans off the end read as absent.
    #[inline]
    fn fixed<const N: usize>(&self, address: u16) -> Option<Vec<u16>> {
        self.words(address, N as u16).ok().flatten()
    }

    /// Decode `data_type` at `address`.
    ///
    /// `word_count` is required for variable-length types; for fixed-width types a value of
    /// 0 means the canonical length, and a smaller non-zero value is a structural error.
    pub fn get_value(
        &self,
        data_type: DataType,
        address: u16,
        word_count: u16,
    ) -> DriverResult<Option<RegisterValue>> {
        let count = match data_type.word_length() {
            Some(canonical) if word_count != 0 && word_count < canonical => {
                return Err(DriverError::StructuralDecodeError(format!(
                    "{data_type} needs {canonical} words, span configured with {word_count}"
                )))
            }
            Some(canonical) => canonical,
            None if word_count == 0 => {
                return Err(DriverError::StructuralDecodeError(format!(
                    "{data_type} at {address} requires a word count"
                )))
            }
            None => word_count,
        };
        match self.words(address, count)? {
            Some(words) => ModbusCodec::decode(data_type, &words, self.word_order),
            None => Ok(None),
        }
    }

    pub fn get_boolean(&self, address: u16) -> Option<bool> {
        self.word(address).map(|w| w != 0)
    }

    pub fn get_int16(&self, address: u16) -> Option<i16> {
        self.word(address).map(ModbusCodec::parse_int16)
    }

    pub fn get_uint16(&self, address: u16) -> Option<u16> {
        self.word(address)
    }

    pub fn get_int32(&self, address: u16) -> Option<i32> {
        self.get_uint32(address).map(|n| n as i32)
    }

    pub fn get_uint32(&self, address: u16) -> Option<u32> {
        let w = self.fixed::<2>(address)?;
        let [hi, lo] = self.msw_first::<2>(&w);
        Some(ModbusCodec::parse_uint32(hi, lo))
    }

    pub fn get_int64(&self, address: u16) -> Option<i64> {
        self.get_uint64(address).map(|n| n as i64)
    }

    pub fn get_uint64(&self, address: u16) -> Option<u64> {
        let w = self.fixed::<4>(address)?;
        Some(ModbusCodec::parse_uint64(self.msw_first::<4>(&w)))
    }

    /// Single precision float; NaN reads as `None`.
    pub fn get_float32(&self, address: u16) -> Option<f32> {
        let w = self.fixed::<2>(address)?;
        let [hi, lo] = self.msw_first::<2>(&w);
        ModbusCodec::parse_float32(hi, lo)
    }

    /// Double precision float; NaN reads as `None`.
    pub fn get_float64(&self, address: u16) -> Option<f64> {
        let w = self.fixed::<4>(address)?;
        ModbusCodec::parse_float64(self.msw_first::<4>(&w))
    }

    pub fn get_bytes(&self, address: u16, word_count: u16) -> DriverResult<Option<Bytes>> {
        Ok(self
            .words(address, word_count)?
            .map(|w| Bytes::from(ModbusCodec::words_to_bytes(&w, self.word_order))))
    }

    pub fn get_string(
        &self,
        address: u16,
        word_count: u16,
        charset: Charset,
    ) -> DriverResult<Option<String>> {
        Ok(self
            .words(address, word_count)?
            .map(|w| ModbusCodec::decode_string(&w, charset, self.word_order)))
    }

    /// Flag view over a 1, 2 or 4 word integer.
    pub fn get_flags(&self, address: u16, word_count: u16) -> DriverResult<Option<BitSet>> {
        if !matches!(word_count, 1 | 2 | 4) {
            return Err(DriverError::StructuralDecodeError(format!(
                "Flag sets span 1, 2 or 4 words, got {word_count}"
            )));
        }
        Ok(self
            .words(address, word_count)?
            .map(|w| ModbusCodec::decode_flags(&w, self.word_order)))
    }

    #[inline]
    fn msw_first<const N: usize>(&self, words: &[u16]) -> [u16; N] {
        let mut out = [0u16; N];
        out.copy_from_slice(&words[..N]);
        if matches!(self.word_order, WordOrder::LeastToMostSignificant) {
            out.reverse();
        }
        out
    }

    /// Copy of `address..address + count`, keeping original addresses and the timestamp.
    pub fn slice(&self, address: u16, count: u16) -> RegisterData {
        let end = u32::from(address) + u32::from(count);
        let words = self
            .words
            .range(address..)
            .take_while(|(a, _)| u32::from(**a) < end)
            .map(|(a, w)| (*a, *w))
            .collect();
        RegisterData {
            words,
            timestamp: self.timestamp,
            word_order: self.word_order,
        }
    }

    /// Multi-line `address: 0xWORD` listing for diagnostics.
    pub fn debug_string(&self) -> String {
        let mut out = String::from("RegisterData{\n");
        for (a, w) in &self.words {
            let _ = writeln!(out, "    {a:>5}: 0x{w:04X}");
        }
        out.push('}');
        out
    }
}

/// Mutable view handed to [`RegisterStore::update`].
///
/// Writes are staged and only applied when the update closure returns `Ok`.
pub struct RegisterTransaction<'a> {
    base: &'a RegisterData,
    pending: BTreeMap<u16, Option<u16>>,
    cleared: bool,
}

impl<'a> RegisterTransaction<'a> {
    fn new(base: &'a RegisterData) -> Self {
        Self {
            base,
            pending: BTreeMap::new(),
            cleared: false,
        }
    }

    /// Current word, including writes staged earlier in this transaction.
    pub fn word(&self, address: u16) -> Option<u16> {
        match self.pending.get(&address) {
            Some(staged) => *staged,
            None if self.cleared => None,
            None => self.base.word(address),
        }
    }

    #[inline]
    pub fn word_order(&self) -> WordOrder {
        self.base.word_order
    }

    /// Stage consecutive words starting at `address`.
    pub fn save_words(&mut self, address: u16, words: &[u16]) -> DriverResult<()> {
        check_span(address, words.len())?;
        for (i, w) in words.iter().enumerate() {
            self.pending.insert(address + i as u16, Some(*w));
        }
        Ok(())
    }

    /// Stage individual `(address, word)` pairs.
    pub fn save_map<I>(&mut self, words: I)
    where
        I: IntoIterator<Item = (u16, u16)>,
    {
        for (a, w) in words {
            self.pending.insert(a, Some(w));
        }
    }

    /// Stage raw bytes as big-endian word pairs; an odd trailing byte is zero-padded.
    pub fn save_bytes(&mut self, address: u16, bytes: &[u8]) -> DriverResult<()> {
        let words = ModbusCodec::bytes_to_words(bytes, WordOrder::MostToLeastSignificant);
        self.save_words(address, &words)
    }

    /// Encode `value` as `data_type` with the store's word order and stage it.
    pub fn save_value(
        &mut self,
        data_type: DataType,
        address: u16,
        value: &RegisterValue,
    ) -> DriverResult<()> {
        let words = ModbusCodec::encode(value, data_type, self.base.word_order)?;
        self.save_words(address, &words)
    }

    pub fn remove(&mut self, address: u16) {
        self.pending.insert(address, None);
    }

    /// Drop every register, including writes staged so far.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.cleared = true;
    }

    fn into_staged(self) -> (BTreeMap<u16, Option<u16>>, bool) {
        (self.pending, self.cleared)
    }
}

impl Deref for RegisterTransaction<'_> {
    type Target = RegisterData;

    /// Committed contents, without staged writes.
    fn deref(&self) -> &Self::Target {
        self.base
    }
}

fn check_span(address: u16, len: usize) -> DriverResult<()> {
    if u32::from(address) as usize + len > ADDRESS_SPACE as usize {
        return Err(DriverError::ValidationError(format!(
            "Writing {len} words at {address} exceeds register address space"
        )));
    }
    Ok(())
}

/// Thread-safe register bank for one device or unit.
///
/// All writes go through [`RegisterStore::update`], which is exclusive with readers, so a
/// multi-word decode never observes a partially written value.
#[derive(Debug, Default)]
pub struct RegisterStore {
    data: RwLock<RegisterData>,
}

impl RegisterStore {
    pub fn new(word_order: WordOrder) -> Self {
        Self {
            data: RwLock::new(RegisterData::new(word_order)),
        }
    }

    /// Run `f` under the exclusive lock.
    ///
    /// Staged writes are applied when `f` returns `Ok`; the timestamp advances only when it
    /// returns `Ok(true)`. On error nothing is applied and the error is returned.
    pub fn update<F>(&self, f: F) -> DriverResult<bool>
    where
        F: FnOnce(&mut RegisterTransaction<'_>) -> DriverResult<bool>,
    {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        Self::apply(&mut guard, f)
    }

    /// [`RegisterStore::update`] followed by a snapshot taken under the same lock.
    pub fn update_and_copy<F>(&self, f: F) -> DriverResult<RegisterData>
    where
        F: FnOnce(&mut RegisterTransaction<'_>) -> DriverResult<bool>,
    {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        Self::apply(&mut guard, f)?;
        Ok(guard.clone())
    }

    fn apply<F>(data: &mut RegisterData, f: F) -> DriverResult<bool>
    where
        F: FnOnce(&mut RegisterTransaction<'_>) -> DriverResult<bool>,
    {
        let (changed, pending, cleared) = {
            let mut tx = RegisterTransaction::new(data);
            let changed = f(&mut tx)?;
            let (pending, cleared) = tx.into_staged();
            (changed, pending, cleared)
        };
        if cleared {
            data.words.clear();
        }
        for (a, w) in pending {
            match w {
                Some(w) => {
                    data.words.insert(a, w);
                }
                None => {
                    data.words.remove(&a);
                }
            }
        }
        if changed {
            data.timestamp = Some(Utc::now());
        }
        Ok(changed)
    }

    /// Run `f` against the current contents under the shared lock.
    pub fn read<R>(&self, f: impl FnOnce(&RegisterData) -> R) -> R {
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Independent snapshot of the current contents.
    pub fn copy(&self) -> RegisterData {
        self.read(RegisterData::clone)
    }

    /// Forget the last update time so cached data is treated as stale.
    pub fn expire(&self) {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        guard.timestamp = None;
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.read(|d| d.timestamp)
    }

    pub fn word_order(&self) -> WordOrder {
        self.read(|d| d.word_order)
    }

    pub fn get_value(
        &self,
        data_type: DataType,
        address: u16,
        word_count: u16,
    ) -> DriverResult<Option<RegisterValue>> {
        self.read(|d| d.get_value(data_type, address, word_count))
    }

    /// Words `address..address + count`, unset registers reading as zero.
    pub fn read_words_or_zero(&self, address: u16, count: u16) -> Vec<u16> {
        self.read(|d| {
            (0..count)
                .map(|i| {
                    address
                        .checked_add(i)
                        .and_then(|a| d.word(a))
                        .unwrap_or(0)
                })
                .collect()
        })
    }
}
