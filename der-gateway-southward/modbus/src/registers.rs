use crate::{
    planner::{AddressRange, AddressRangeSet},
    store::RegisterData,
    types::ModbusReadFunction,
};
use der_gateway_sdk::{DataType, DriverError, DriverResult, RegisterValue};
use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

/// Location and type of one symbolic register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    pub function: ModbusReadFunction,
    pub address: u16,
    pub data_type: DataType,
    /// Configured length; only used by variable-length types.
    pub word_length: u16,
}

impl RegisterSpec {
    /// Number of words the register occupies.
    #[inline]
    pub fn span(&self) -> u16 {
        self.data_type.span(self.word_length)
    }

    pub fn range(&self) -> DriverResult<AddressRange> {
        AddressRange::with_length(self.address, self.span())
    }
}

/// Collects register definitions at driver initialization.
///
/// Only holding and input register functions are accepted.
///
/// ```ignore
/// let map = RegisterMapBuilder::new()
///     .register(Reg::Voltage, ModbusReadFunction::ReadInputRegisters, 0, DataType::Float32)
///     .register_with_length(Reg::Serial, ModbusReadFunction::ReadHoldingRegisters, 100, DataType::StringAscii, 8)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct RegisterMapBuilder<K> {
    entries: Vec<(K, RegisterSpec)>,
}

impl<K> Default for RegisterMapBuilder<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + Debug> RegisterMapBuilder<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed-width register.
    pub fn register(
        self,
        key: K,
        function: ModbusReadFunction,
        address: u16,
        data_type: DataType,
    ) -> Self {
        self.register_with_length(key, function, address, data_type, 0)
    }

    pub fn register_with_length(
        mut self,
        key: K,
        function: ModbusReadFunction,
        address: u16,
        data_type: DataType,
        word_length: u16,
    ) -> Self {
        self.entries.push((
            key,
            RegisterSpec {
                function,
                address,
                data_type,
                word_length,
            },
        ));
        self
    }

    /// Validate the definitions and precompute per-function address ranges.
    pub fn build(self) -> DriverResult<RegisterMap<K>> {
        let mut specs = HashMap::with_capacity(self.entries.len());
        let mut order = Vec::with_capacity(self.entries.len());
        let mut ranges: HashMap<ModbusReadFunction, AddressRangeSet> = HashMap::new();
        for (key, spec) in self.entries {
            if spec.span() == 0 {
                return Err(DriverError::ValidationError(format!(
                    "Register {key:?} ({}) needs a word length",
                    spec.data_type
                )));
            }
            // readers decode word snapshots; coils and discretes go through read_bits
            if spec.function.block_type().is_bit_type() {
                return Err(DriverError::ValidationError(format!(
                    "Register {key:?} uses bit function {:?}",
                    spec.function
                )));
            }
            let range = spec.range()?;
            if specs.insert(key.clone(), spec).is_some() {
                return Err(DriverError::ValidationError(format!(
                    "Register {key:?} defined twice"
                )));
            }
            ranges.entry(spec.function).or_default().add_range(range);
            order.push(key);
        }
        Ok(RegisterMap {
            inner: Arc::new(Inner {
                specs,
                order,
                ranges,
            }),
        })
    }
}

#[derive(Debug)]
struct Inner<K> {
    specs: HashMap<K, RegisterSpec>,
    order: Vec<K>,
    ranges: HashMap<ModbusReadFunction, AddressRangeSet>,
}

/// Immutable symbolic register table; cheap to clone.
#[derive(Debug)]
pub struct RegisterMap<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for RegisterMap<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash + Clone + Debug> RegisterMap<K> {
    pub fn builder() -> RegisterMapBuilder<K> {
        RegisterMapBuilder::new()
    }

    pub fn get(&self, key: &K) -> Option<&RegisterSpec> {
        self.inner.specs.get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.order.is_empty()
    }

    /// Keys in definition order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.order.iter()
    }

    /// Read functions used by at least one register, in function code order.
    pub fn functions(&self) -> Vec<ModbusReadFunction> {
        let mut functions: Vec<_> = self.inner.ranges.keys().copied().collect();
        functions.sort();
        functions
    }

    /// Addresses to read for `function`; empty when nothing uses it.
    pub fn address_ranges(&self, function: ModbusReadFunction) -> AddressRangeSet {
        self.inner
            .ranges
            .get(&function)
            .cloned()
            .unwrap_or_default()
    }

    /// Typed accessor over a snapshot.
    pub fn reader<'a>(&'a self, data: &'a RegisterData) -> RegisterReader<'a, K> {
        RegisterReader { map: self, data }
    }
}

/// Borrowing accessor decoding symbolic registers from a snapshot.
#[derive(Debug)]
pub struct RegisterReader<'a, K> {
    map: &'a RegisterMap<K>,
    data: &'a RegisterData,
}

macro_rules! typed_getter {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&self, key: &K) -> DriverResult<Option<$ty>> {
                match self.value(key)? {
                    Some(v) => Ok(Some(<$ty>::try_from(&v)?)),
                    None => Ok(None),
                }
            }
        )*
    };
}

impl<K: Eq + Hash + Clone + Debug> RegisterReader<'_, K> {
    /// Decoded value of `key`, `None` when the registers are unset or hold NaN.
    pub fn value(&self, key: &K) -> DriverResult<Option<RegisterValue>> {
        let spec = self.map.get(key).ok_or_else(|| {
            DriverError::ValidationError(format!("Unknown register {key:?}"))
        })?;
        self.data
            .get_value(spec.data_type, spec.address, spec.word_length)
    }

    typed_getter! {
        bool => bool,
        i16 => i16,
        u16 => u16,
        i32 => i32,
        u32 => u32,
        i64 => i64,
        u64 => u64,
        f32 => f32,
        f64 => f64,
    }

    pub fn string(&self, key: &K) -> DriverResult<Option<String>> {
        Ok(self.value(key)?.map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        }))
    }
}
