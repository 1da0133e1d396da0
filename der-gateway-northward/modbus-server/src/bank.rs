use bytes::Bytes;
use der_driver_modbus::{BitSet, ModbusCodec, RegisterBlockType, RegisterStore, WordOrder};
use der_gateway_sdk::{DataType, DriverError, DriverResult, RegisterValue};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Register contents of one served unit.
///
/// Each of the four blocks is guarded independently, so a coil write never waits on a
/// holding register read.
#[derive(Debug, Default)]
pub struct RegisterBank {
    coils: Mutex<BitSet>,
    discretes: Mutex<BitSet>,
    holdings: RegisterStore,
    inputs: RegisterStore,
    word_order: WordOrder,
}

impl RegisterBank {
    pub fn new(word_order: WordOrder) -> Self {
        Self {
            coils: Mutex::default(),
            discretes: Mutex::default(),
            holdings: RegisterStore::new(word_order),
            inputs: RegisterStore::new(word_order),
            word_order,
        }
    }

    #[inline]
    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    pub fn read_coils(&self, address: u16, count: u16) -> BitSet {
        read_bit_block(&self.coils, address, count)
    }

    pub fn read_discretes(&self, address: u16, count: u16) -> BitSet {
        read_bit_block(&self.discretes, address, count)
    }

    /// Holding registers `address..address + count`, unset registers reading as zero.
    pub fn read_holdings(&self, address: u16, count: u16) -> Vec<u16> {
        self.holdings.read_words_or_zero(address, count)
    }

    pub fn read_inputs(&self, address: u16, count: u16) -> Vec<u16> {
        self.inputs.read_words_or_zero(address, count)
    }

    pub fn write_coil(&self, address: u16, value: bool) -> DriverResult<()> {
        self.write_coils(address, &[value])
    }

    pub fn write_coils(&self, address: u16, values: &[bool]) -> DriverResult<()> {
        write_bit_block(&self.coils, RegisterBlockType::Coil, address, values)
    }

    pub fn write_discrete(&self, address: u16, value: bool) -> DriverResult<()> {
        self.write_discretes(address, &[value])
    }

    pub fn write_discretes(&self, address: u16, values: &[bool]) -> DriverResult<()> {
        write_bit_block(&self.discretes, RegisterBlockType::Discrete, address, values)
    }

    pub fn write_holding(&self, address: u16, value: u16) -> DriverResult<()> {
        self.write_holdings(address, &[value])
    }

    pub fn write_holdings(&self, address: u16, words: &[u16]) -> DriverResult<()> {
        write_word_block(&self.holdings, RegisterBlockType::Holding, address, words)
    }

    pub fn write_input(&self, address: u16, value: u16) -> DriverResult<()> {
        self.write_inputs(address, &[value])
    }

    pub fn write_inputs(&self, address: u16, words: &[u16]) -> DriverResult<()> {
        write_word_block(&self.inputs, RegisterBlockType::Input, address, words)
    }

    /// Bits of a coil or discrete block, reindexed so `address` is bit 0.
    pub fn read_bits(
        &self,
        block: RegisterBlockType,
        address: u16,
        count: u16,
    ) -> DriverResult<BitSet> {
        match block {
            RegisterBlockType::Coil => Ok(self.read_coils(address, count)),
            RegisterBlockType::Discrete => Ok(self.read_discretes(address, count)),
            other => Err(block_mismatch("bit read", other)),
        }
    }

    /// Words of a holding or input block, unset registers reading as zero.
    pub fn read_words(
        &self,
        block: RegisterBlockType,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<u16>> {
        match block {
            RegisterBlockType::Holding => Ok(self.read_holdings(address, count)),
            RegisterBlockType::Input => Ok(self.read_inputs(address, count)),
            other => Err(block_mismatch("word read", other)),
        }
    }

    /// [`RegisterBank::read_words`] as big-endian bytes, two per register.
    pub fn read_word_bytes(
        &self,
        block: RegisterBlockType,
        address: u16,
        count: u16,
    ) -> DriverResult<Bytes> {
        let words = self.read_words(block, address, count)?;
        Ok(Bytes::from(ModbusCodec::words_to_bytes(
            &words,
            WordOrder::MostToLeastSignificant,
        )))
    }

    pub fn write_bit(
        &self,
        block: RegisterBlockType,
        address: u16,
        value: bool,
    ) -> DriverResult<()> {
        self.write_bits(block, address, &[value])
    }

    pub fn write_bits(
        &self,
        block: RegisterBlockType,
        address: u16,
        values: &[bool],
    ) -> DriverResult<()> {
        match block {
            RegisterBlockType::Coil => self.write_coils(address, values),
            RegisterBlockType::Discrete => self.write_discretes(address, values),
            other => Err(block_mismatch("bit write", other)),
        }
    }

    pub fn write_words(
        &self,
        block: RegisterBlockType,
        address: u16,
        words: &[u16],
    ) -> DriverResult<()> {
        match block {
            RegisterBlockType::Holding => self.write_holdings(address, words),
            RegisterBlockType::Input => self.write_inputs(address, words),
            other => Err(block_mismatch("word write", other)),
        }
    }

    /// Encode `value` as `data_type` and store it at `address` of a word block.
    ///
    /// Bytes and string types are truncated or zero-padded to exactly `word_count`
    /// words; fixed-width types always take their canonical width. A zero `word_count`
    /// for those types is rejected.
    pub fn write_typed_value(
        &self,
        block: RegisterBlockType,
        data_type: DataType,
        address: u16,
        word_count: u16,
        value: &RegisterValue,
    ) -> DriverResult<()> {
        if block.is_bit_type() {
            return Err(block_mismatch("typed write", block));
        }
        if data_type.span(word_count) == 0 {
            return Err(DriverError::ValidationError(format!(
                "{data_type} value at {address} needs a word length"
            )));
        }
        let words =
            ModbusCodec::encode_with_length(value, data_type, self.word_order, word_count)?;
        self.write_words(block, address, &words)
    }

    /// Store a boolean value in a bit block, or its typed encoding in a word block.
    pub fn write_value(
        &self,
        block: RegisterBlockType,
        data_type: DataType,
        address: u16,
        word_count: u16,
        value: &RegisterValue,
    ) -> DriverResult<()> {
        if block.is_bit_type() {
            let bit = bool::try_from(value)?;
            return self.write_bit(block, address, bit);
        }
        self.write_typed_value(block, data_type, address, word_count, value)
    }

    /// Store behind a word block, for typed reads.
    pub fn store(&self, block: RegisterBlockType) -> Option<&RegisterStore> {
        match block {
            RegisterBlockType::Holding => Some(&self.holdings),
            RegisterBlockType::Input => Some(&self.inputs),
            _ => None,
        }
    }
}

fn lock_bits(bits: &Mutex<BitSet>) -> MutexGuard<'_, BitSet> {
    bits.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_bit_block(bits: &Mutex<BitSet>, address: u16, count: u16) -> BitSet {
    lock_bits(bits).slice(address as usize, count as usize)
}

fn write_bit_block(
    bits: &Mutex<BitSet>,
    block: RegisterBlockType,
    address: u16,
    values: &[bool],
) -> DriverResult<()> {
    if values.is_empty() {
        return Ok(());
    }
    if address as usize + values.len() > 0x1_0000 {
        return Err(DriverError::ValidationError(format!(
            "{} {block} bits at {address} exceed address space",
            values.len()
        )));
    }
    debug!(
        "Writing {block} bits {}-{} values: {values:?}",
        address,
        address as usize + values.len() - 1
    );
    let mut guard = lock_bits(bits);
    for (i, v) in values.iter().enumerate() {
        guard.set(address as usize + i, *v);
    }
    Ok(())
}

fn write_word_block(
    store: &RegisterStore,
    block: RegisterBlockType,
    address: u16,
    words: &[u16],
) -> DriverResult<()> {
    if words.is_empty() {
        return Ok(());
    }
    debug!(
        "Writing {block} registers {}-{} values: [{}]",
        address,
        address as usize + words.len() - 1,
        words
            .iter()
            .map(|w| format!("0x{w:04X}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    store.update(|tx| {
        tx.save_words(address, words)?;
        Ok(true)
    })?;
    Ok(())
}

#[inline(never)]
#[cold]
fn block_mismatch(operation: &str, block: RegisterBlockType) -> DriverError {
    DriverError::ValidationError(format!("{operation} not supported on {block} block"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_registers_read_as_zero() {
        let bank = RegisterBank::default();
        bank.write_holdings(10, &[1, 2]).unwrap();
        assert_eq!(bank.read_holdings(9, 4), vec![0, 1, 2, 0]);
        assert_eq!(bank.read_inputs(0, 2), vec![0, 0]);
    }

    #[test]
    fn bit_reads_are_reindexed_copies() {
        let bank = RegisterBank::default();
        bank.write_coils(100, &[true, false, true]).unwrap();
        let bits = bank.read_coils(100, 3);
        assert_eq!(bits.to_bools(3), vec![true, false, true]);
        // the copy is independent of the bank
        bank.write_coil(100, false).unwrap();
        assert!(bits.get(0));
        assert!(!bank.read_coils(100, 1).get(0));
        assert!(bank.read_discretes(100, 3).is_empty());
    }

    #[test]
    fn block_kind_mismatch_fails() {
        let bank = RegisterBank::default();
        assert!(matches!(
            bank.write_bit(RegisterBlockType::Holding, 0, true),
            Err(DriverError::ValidationError(_))
        ));
        assert!(bank.write_words(RegisterBlockType::Coil, 0, &[1]).is_err());
        assert!(bank.read_bits(RegisterBlockType::Input, 0, 1).is_err());
        assert!(bank.read_words(RegisterBlockType::Discrete, 0, 1).is_err());
        assert!(bank
            .write_typed_value(
                RegisterBlockType::Coil,
                DataType::UInt16,
                0,
                1,
                &RegisterValue::UInt16(1)
            )
            .is_err());
    }

    #[test]
    fn long_strings_are_truncated() {
        let bank = RegisterBank::default();
        bank.write_typed_value(
            RegisterBlockType::Holding,
            DataType::StringAscii,
            0,
            2,
            &RegisterValue::String("abcdef".into()),
        )
        .unwrap();
        assert_eq!(bank.read_holdings(0, 3), vec![0x6162, 0x6364, 0]);
    }

    #[test]
    fn short_strings_are_zero_padded() {
        let bank = RegisterBank::default();
        bank.write_holdings(0, &[0xFFFF; 4]).unwrap();
        bank.write_typed_value(
            RegisterBlockType::Holding,
            DataType::StringAscii,
            0,
            4,
            &RegisterValue::String("ab".into()),
        )
        .unwrap();
        assert_eq!(bank.read_holdings(0, 4), vec![0x6162, 0, 0, 0]);
    }

    #[test]
    fn numbers_keep_canonical_width() {
        let bank = RegisterBank::new(WordOrder::LeastToMostSignificant);
        bank.write_typed_value(
            RegisterBlockType::Input,
            DataType::Int32,
            5,
            1,
            &RegisterValue::Int32(-12313489),
        )
        .unwrap();
        assert_eq!(bank.read_inputs(5, 2), vec![0x1C6F, 0xFF44]);
        assert_eq!(
            bank.store(RegisterBlockType::Input)
                .unwrap()
                .get_value(DataType::Int32, 5, 0)
                .unwrap(),
            Some(RegisterValue::Int32(-12313489))
        );
    }

    #[test]
    fn word_bytes_are_big_endian() {
        let bank = RegisterBank::default();
        bank.write_inputs(0, &[0x0102, 0x0304]).unwrap();
        assert_eq!(
            bank.read_word_bytes(RegisterBlockType::Input, 0, 2).unwrap(),
            Bytes::from_static(&[1, 2, 3, 4])
        );
    }

    #[test]
    fn boolean_values_go_to_bit_blocks() {
        let bank = RegisterBank::default();
        bank.write_value(
            RegisterBlockType::Discrete,
            DataType::Boolean,
            3,
            0,
            &RegisterValue::Boolean(true),
        )
        .unwrap();
        assert!(bank.read_discretes(3, 1).get(0));
    }

    #[test]
    fn writes_past_address_space_fail() {
        let bank = RegisterBank::default();
        assert!(bank.write_holdings(65535, &[1, 2]).is_err());
        assert_eq!(bank.read_holdings(65535, 1), vec![0]);
    }

    #[test]
    fn bit_writes_past_address_space_fail() {
        let bank = RegisterBank::default();
        assert!(matches!(
            bank.write_coils(65535, &[true, true]),
            Err(DriverError::ValidationError(_))
        ));
        assert!(bank.write_discretes(65535, &[true, true]).is_err());
        assert!(bank.read_coils(65535, 1).is_empty());
        bank.write_coil(65535, true).unwrap();
        assert!(bank.read_coils(65535, 1).get(0));
    }

    #[test]
    fn variable_length_values_need_a_word_count() {
        let bank = RegisterBank::default();
        for data_type in [DataType::StringAscii, DataType::Bytes] {
            let value = if data_type == DataType::Bytes {
                RegisterValue::Bytes(Bytes::from_static(b"ab"))
            } else {
                RegisterValue::String("ab".into())
            };
            assert!(matches!(
                bank.write_typed_value(RegisterBlockType::Holding, data_type, 0, 0, &value),
                Err(DriverError::ValidationError(_))
            ));
        }
        bank.write_typed_value(
            RegisterBlockType::Holding,
            DataType::UInt16,
            0,
            0,
            &RegisterValue::UInt16(3),
        )
        .unwrap();
        assert_eq!(bank.read_holdings(0, 1), vec![3]);
    }
}
