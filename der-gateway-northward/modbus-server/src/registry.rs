use crate::{
    bank::RegisterBank,
    config::{ModbusServerConfig, RegisterBlockConfig},
};
use dashmap::DashMap;
use der_driver_modbus::WordOrder;
use der_gateway_sdk::{DriverError, DriverResult};
use std::sync::Arc;
use tracing::{debug, info};

/// Register banks keyed by Modbus unit id.
#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: DashMap<u8, Arc<RegisterBank>>,
    word_order: WordOrder,
}

impl UnitRegistry {
    pub fn new(word_order: WordOrder) -> Self {
        Self {
            units: DashMap::new(),
            word_order,
        }
    }

    /// Build a registry holding every unit of `config`, seeded with its configured values.
    pub fn from_config(config: &ModbusServerConfig) -> DriverResult<Self> {
        let registry = Self::new(config.word_order);
        for unit in &config.units {
            if registry.units.contains_key(&unit.unit_id) {
                return Err(DriverError::ConfigurationError(format!(
                    "Duplicate unit id {}",
                    unit.unit_id
                )));
            }
            let bank = RegisterBank::new(config.word_order);
            for block in &unit.blocks {
                seed_block(&bank, block)?;
            }
            info!(
                unit_id = unit.unit_id,
                blocks = unit.blocks.len(),
                "Registered Modbus server unit"
            );
            registry.register(unit.unit_id, Arc::new(bank));
        }
        Ok(registry)
    }

    #[inline]
    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    /// Install `bank` for `unit_id`, returning the bank it replaced.
    pub fn register(&self, unit_id: u8, bank: Arc<RegisterBank>) -> Option<Arc<RegisterBank>> {
        self.units.insert(unit_id, bank)
    }

    pub fn unregister(&self, unit_id: u8) -> Option<Arc<RegisterBank>> {
        self.units.remove(&unit_id).map(|(_, bank)| bank)
    }

    pub fn get(&self, unit_id: u8) -> Option<Arc<RegisterBank>> {
        self.units.get(&unit_id).map(|b| Arc::clone(b.value()))
    }

    /// Bank for `unit_id`, creating an empty one if none exists.
    pub fn get_or_create(&self, unit_id: u8) -> Arc<RegisterBank> {
        let entry = self.units.entry(unit_id).or_insert_with(|| {
            debug!(unit_id, "Creating Modbus server unit on demand");
            Arc::new(RegisterBank::new(self.word_order))
        });
        Arc::clone(entry.value())
    }

    /// Registered unit ids in ascending order.
    pub fn unit_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.units.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

fn seed_block(bank: &RegisterBank, block: &RegisterBlockConfig) -> DriverResult<()> {
    let mut address = u32::from(block.start_address);
    for value in &block.values {
        let step = if block.block_type.is_bit_type() {
            1
        } else {
            u32::from(value.span())
        };
        if step == 0 {
            return Err(DriverError::ConfigurationError(format!(
                "{} value at {address} needs a word length",
                value.data_type
            )));
        }
        let start = u16::try_from(address)
            .ok()
            .filter(|_| address + step <= 0x1_0000)
            .ok_or_else(|| {
                DriverError::ConfigurationError(format!(
                    "{} block starting at {} exceeds register address space",
                    block.block_type, block.start_address
                ))
            })?;
        let register_value = value.register_value()?;
        bank.write_value(
            block.block_type,
            value.data_type,
            start,
            value.word_length,
            &register_value,
        )?;
        address += step;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use der_driver_modbus::RegisterBlockType;

    fn config(units: serde_json::Value) -> ModbusServerConfig {
        serde_json::from_value(serde_json::json!({ "units": units })).unwrap()
    }

    #[test]
    fn seeds_values_at_consecutive_addresses() {
        let cfg = config(serde_json::json!([{
            "unitId": 1,
            "blocks": [
                {
                    "blockType": "holding",
                    "startAddress": 10,
                    "values": [
                        { "dataType": "uint16", "value": 513 },
                        { "dataType": "int32", "value": -2 },
                        { "dataType": "stringascii", "wordLength": 2, "value": "abc" }
                    ]
                },
                {
                    "blockType": "coil",
                    "startAddress": 4,
                    "values": [
                        { "dataType": "boolean", "value": true },
                        { "dataType": "boolean", "value": false },
                        { "dataType": "boolean", "value": true }
                    ]
                }
            ]
        }]));
        let registry = UnitRegistry::from_config(&cfg).unwrap();
        let bank = registry.get(1).unwrap();
        assert_eq!(
            bank.read_holdings(10, 5),
            vec![513, 0xFFFF, 0xFFFE, 0x6162, 0x6300]
        );
        assert_eq!(bank.read_coils(4, 3).to_bools(3), vec![true, false, true]);
        assert!(registry.get(2).is_none());
    }

    #[test]
    fn rejects_duplicate_units_and_overflow() {
        let dup = config(serde_json::json!([{ "unitId": 1 }, { "unitId": 1 }]));
        assert!(UnitRegistry::from_config(&dup).is_err());

        let overflow = config(serde_json::json!([{
            "unitId": 1,
            "blocks": [{
                "blockType": "input",
                "startAddress": 65535,
                "values": [{ "dataType": "float32", "value": 1.0 }]
            }]
        }]));
        assert!(UnitRegistry::from_config(&overflow).is_err());

        let no_length = config(serde_json::json!([{
            "unitId": 1,
            "blocks": [{
                "blockType": "holding",
                "values": [{ "dataType": "bytes", "value": "0102" }]
            }]
        }]));
        assert!(UnitRegistry::from_config(&no_length).is_err());
    }

    #[test]
    fn get_or_create_reuses_bank() {
        let registry = UnitRegistry::new(WordOrder::LeastToMostSignificant);
        let a = registry.get_or_create(9);
        a.write_holding(0, 42).unwrap();
        let b = registry.get_or_create(9);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.word_order(), WordOrder::LeastToMostSignificant);
        assert_eq!(registry.unit_ids(), vec![9]);

        registry.register(3, Arc::new(RegisterBank::default()));
        assert_eq!(registry.unit_ids(), vec![3, 9]);
        assert!(registry.unregister(9).is_some());
        assert_eq!(registry.len(), 1);
        assert!(registry
            .get(3)
            .unwrap()
            .read_bits(RegisterBlockType::Coil, 0, 1)
            .unwrap()
            .is_empty());
    }
}
