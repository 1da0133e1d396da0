use crate::{
    bits::BitSet,
    network::ModbusNetwork,
    planner::{AddressRange, AddressRangeSet},
    store::{RegisterData, RegisterStore},
    transaction::TransactionExecutor,
    types::{ModbusReadFunction, RegisterBlockType, WordOrder},
};
use chrono::{DateTime, Utc};
use der_gateway_sdk::{DataType, DriverError, DriverResult, RegisterValue};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, error};

/// One sampled property of a generic Modbus device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusPropertyConfig {
    pub name: String,
    #[serde(default = "ModbusPropertyConfig::default_function")]
    pub function: ModbusReadFunction,
    pub address: u16,
    #[serde(default = "ModbusPropertyConfig::default_data_type")]
    pub data_type: DataType,
    /// Word count for variable-length types; ignored by fixed-width types.
    #[serde(default = "ModbusPropertyConfig::default_word_length")]
    pub word_length: u16,
    #[serde(default = "ModbusPropertyConfig::default_unit_multiplier")]
    pub unit_multiplier: f64,
    /// Maximum decimal places kept (half-up rounding); negative disables rounding.
    #[serde(default)]
    pub decimal_scale: i32,
}

impl ModbusPropertyConfig {
    fn default_function() -> ModbusReadFunction {
        ModbusReadFunction::ReadHoldingRegisters
    }

    fn default_data_type() -> DataType {
        DataType::Float32
    }

    fn default_word_length() -> u16 {
        1
    }

    fn default_unit_multiplier() -> f64 {
        1.0
    }

    pub fn new(
        name: impl Into<String>,
        function: ModbusReadFunction,
        address: u16,
        data_type: DataType,
    ) -> Self {
        Self {
            name: name.into(),
            function,
            address,
            data_type,
            word_length: Self::default_word_length(),
            unit_multiplier: Self::default_unit_multiplier(),
            decimal_scale: 0,
        }
    }

    /// Words (or bits) covered by this property.
    #[inline]
    pub fn span(&self) -> u16 {
        if self.function.block_type().is_bit_type() {
            1
        } else {
            self.data_type.span(self.word_length)
        }
    }

    fn range(&self) -> DriverResult<AddressRange> {
        AddressRange::with_length(self.address, self.span())
    }
}

/// Configuration of a generic Modbus data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusDataSourceConfig {
    #[serde(default = "ModbusDataSourceConfig::default_unit_id")]
    pub unit_id: u8,
    #[serde(default)]
    pub word_order: WordOrder,
    /// Upper bound on registers per read request.
    #[serde(default = "ModbusDataSourceConfig::default_max_read_word_count")]
    pub max_read_word_count: u16,
    /// Samples younger than this are served from the cache.
    #[serde(default = "ModbusDataSourceConfig::default_sample_cache_ms")]
    pub sample_cache_ms: u64,
    #[serde(default)]
    pub properties: Vec<ModbusPropertyConfig>,
}

impl ModbusDataSourceConfig {
    fn default_unit_id() -> u8 {
        1
    }

    fn default_max_read_word_count() -> u16 {
        64
    }

    fn default_sample_cache_ms() -> u64 {
        5000
    }

    #[inline]
    pub fn sample_cache(&self) -> Duration {
        Duration::from_millis(self.sample_cache_ms)
    }
}

impl Default for ModbusDataSourceConfig {
    fn default() -> Self {
        Self {
            unit_id: Self::default_unit_id(),
            word_order: WordOrder::default(),
            max_read_word_count: Self::default_max_read_word_count(),
            sample_cache_ms: Self::default_sample_cache_ms(),
            properties: Vec::new(),
        }
    }
}

/// Property values from one refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusSample {
    pub timestamp: DateTime<Utc>,
    /// Values in property configuration order; unset or NaN properties are omitted.
    pub values: Vec<(String, RegisterValue)>,
}

impl ModbusSample {
    pub fn get(&self, name: &str) -> Option<&RegisterValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Generic Modbus device whose properties come entirely from configuration.
pub struct ModbusDataSource {
    config: ModbusDataSourceConfig,
    executor: TransactionExecutor,
    plan: BTreeMap<ModbusReadFunction, AddressRangeSet>,
    holdings: RegisterStore,
    inputs: RegisterStore,
    coils: Mutex<BitSet>,
    discretes: Mutex<BitSet>,
    // also serializes refreshes
    sample_date: Mutex<Option<DateTime<Utc>>>,
}

impl ModbusDataSource {
    pub fn new(config: ModbusDataSourceConfig, network: Arc<ModbusNetwork>) -> DriverResult<Self> {
        if config.max_read_word_count == 0 {
            return Err(DriverError::ConfigurationError(
                "maxReadWordCount must be at least 1".to_string(),
            ));
        }
        let mut plan: BTreeMap<ModbusReadFunction, AddressRangeSet> = BTreeMap::new();
        for prop in &config.properties {
            if prop.name.is_empty() {
                return Err(DriverError::ConfigurationError(format!(
                    "Property at address {} has no name",
                    prop.address
                )));
            }
            let range = prop.range().map_err(|e| {
                DriverError::ConfigurationError(format!("Property {}: {e}", prop.name))
            })?;
            plan.entry(prop.function).or_default().add_range(range);
        }
        Ok(Self {
            executor: TransactionExecutor::new(network, config.unit_id),
            plan,
            holdings: RegisterStore::new(config.word_order),
            inputs: RegisterStore::new(config.word_order),
            coils: Mutex::new(BitSet::new()),
            discretes: Mutex::new(BitSet::new()),
            sample_date: Mutex::new(None),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &ModbusDataSourceConfig {
        &self.config
    }

    pub fn unit_id(&self) -> u8 {
        self.config.unit_id
    }

    /// Store for a word block; `None` for bit blocks.
    pub fn store(&self, block: RegisterBlockType) -> Option<&RegisterStore> {
        match block {
            RegisterBlockType::Holding => Some(&self.holdings),
            RegisterBlockType::Input => Some(&self.inputs),
            _ => None,
        }
    }

    /// Copy of the last read coil or discrete bits; `None` for word blocks.
    pub fn bits(&self, block: RegisterBlockType) -> Option<BitSet> {
        self.bit_cell(block).map(|b| lock(b).clone())
    }

    fn bit_cell(&self, block: RegisterBlockType) -> Option<&Mutex<BitSet>> {
        match block {
            RegisterBlockType::Coil => Some(&self.coils),
            RegisterBlockType::Discrete => Some(&self.discretes),
            _ => None,
        }
    }

    /// Time of the last successful refresh.
    pub fn sample_date(&self) -> Option<DateTime<Utc>> {
        *lock(&self.sample_date)
    }

    /// Force the next `read_sample` to go to the device.
    pub fn expire(&self) {
        *lock(&self.sample_date) = None;
        self.holdings.expire();
        self.inputs.expire();
    }

    fn is_expired(&self, sampled: Option<DateTime<Utc>>) -> bool {
        let Some(ts) = sampled else {
            return true;
        };
        let age = Utc::now().signed_duration_since(ts);
        age.to_std()
            .is_ok_and(|age| age >= self.config.sample_cache())
    }

    /// Read every configured property, refreshing from the device when the cache is stale.
    pub fn read_sample(&self) -> DriverResult<ModbusSample> {
        let timestamp = {
            let mut sampled = lock(&self.sample_date);
            match *sampled {
                Some(ts) if !self.is_expired(Some(ts)) => ts,
                _ => {
                    let ts = self.refresh().inspect_err(|e| {
                        error!(unit_id = self.config.unit_id, error = %e, "Communication problem reading Modbus device");
                    })?;
                    *sampled = Some(ts);
                    ts
                }
            }
        };
        let holdings = self.holdings.copy();
        let inputs = self.inputs.copy();
        let coils = lock(&self.coils).clone();
        let discretes = lock(&self.discretes).clone();
        let mut values = Vec::with_capacity(self.config.properties.len());
        for prop in &self.config.properties {
            let raw = match prop.function.block_type() {
                RegisterBlockType::Coil => bit_value(&coils, prop)?,
                RegisterBlockType::Discrete => bit_value(&discretes, prop)?,
                RegisterBlockType::Holding => word_value(&holdings, prop)?,
                RegisterBlockType::Input => word_value(&inputs, prop)?,
            };
            if let Some(v) = raw {
                values.push((
                    prop.name.clone(),
                    scale_value(v, prop.unit_multiplier, prop.decimal_scale),
                ));
            }
        }
        Ok(ModbusSample { timestamp, values })
    }

    /// Read all configured ranges inside one locked section.
    fn refresh(&self) -> DriverResult<DateTime<Utc>> {
        let network = self.executor.network();
        let max = self.config.max_read_word_count;
        // hold the transport for the whole refresh; the reads below nest inside it
        let conn = network.open(self.config.unit_id)?;
        for (function, ranges) in &self.plan {
            debug!(unit_id = self.config.unit_id, ?function, ranges = %ranges, "Reading Modbus ranges");
            let block = function.block_type();
            match (self.store(block), self.bit_cell(block)) {
                (Some(store), _) => {
                    self.executor.refresh(store, *function, ranges, max)?;
                }
                (None, Some(cell)) => {
                    let bits = self.executor.read_bits(*function, ranges, max)?;
                    let mut current = lock(cell);
                    for r in ranges {
                        for a in r.min()..=r.max() {
                            current.set(usize::from(a), bits.get(usize::from(a)));
                        }
                    }
                }
                (None, None) => {}
            }
        }
        conn.close()?;
        Ok(Utc::now())
    }
}

impl std::fmt::Debug for ModbusDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusDataSource")
            .field("unit_id", &self.config.unit_id)
            .field("properties", &self.config.properties.len())
            .field("sample_date", &self.sample_date())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn bit_value(bits: &BitSet, prop: &ModbusPropertyConfig) -> DriverResult<Option<RegisterValue>> {
    let value = RegisterValue::Boolean(bits.get(usize::from(prop.address)));
    if prop.data_type.is_numeric() {
        return Ok(Some(value.cast(prop.data_type)?));
    }
    Ok(Some(value))
}

fn word_value(data: &RegisterData, prop: &ModbusPropertyConfig) -> DriverResult<Option<RegisterValue>> {
    let word_count = if prop.data_type.is_variable_length() {
        prop.word_length
    } else {
        0
    };
    data.get_value(prop.data_type, prop.address, word_count)
}

/// Apply the unit multiplier, then round half-up to `decimal_scale` places.
///
/// Integers pass through untouched unless a multiplier other than 1 applies.
fn scale_value(value: RegisterValue, unit_multiplier: f64, decimal_scale: i32) -> RegisterValue {
    if matches!(value, RegisterValue::Boolean(_)) || !value.is_numeric() {
        return value;
    }
    let Some(mut v) = value.as_f64() else {
        return value;
    };
    let multiplied = unit_multiplier != 1.0;
    if !multiplied && !value.data_type().is_float() {
        return value;
    }
    if multiplied {
        v *= unit_multiplier;
    }
    if decimal_scale >= 0 && v.is_finite() {
        let factor = 10f64.powi(decimal_scale);
        // f64::round rounds half away from zero
        let rounded = (v * factor).round() / factor;
        if rounded.is_finite() {
            v = rounded;
        }
    }
    RegisterValue::Float64(v)
}
