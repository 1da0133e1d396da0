use der_driver_modbus::{RegisterBlockType, WordOrder};
use der_gateway_sdk::{DataType, DriverError, DriverResult, RegisterValue};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

/// Modbus TCP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusServerConfig {
    /// Interface to bind, e.g. "0.0.0.0"
    #[serde(default = "ModbusServerConfig::default_bind_address")]
    pub bind_address: String,

    #[serde(default = "ModbusServerConfig::default_port")]
    pub port: u16,

    /// Accept write requests (function codes 5, 6, 15, 16) from remote masters.
    #[serde(default)]
    pub allow_writes: bool,

    /// Word order used when seeding typed values.
    #[serde(default)]
    pub word_order: WordOrder,

    /// Create an empty bank on first request for an unknown unit instead of answering
    /// with a gateway target exception.
    #[serde(default)]
    pub auto_create_units: bool,

    /// Minimum time between two requests on one connection; 0 disables throttling.
    #[serde(default = "ModbusServerConfig::default_request_throttle_ms")]
    pub request_throttle_ms: u64,

    #[serde(default)]
    pub units: Vec<UnitConfig>,
}

impl ModbusServerConfig {
    fn default_bind_address() -> String {
        "0.0.0.0".to_string()
    }
    fn default_port() -> u16 {
        502
    }
    fn default_request_throttle_ms() -> u64 {
        100
    }

    #[inline]
    pub fn request_throttle(&self) -> Duration {
        Duration::from_millis(self.request_throttle_ms)
    }

    pub fn socket_addr(&self) -> DriverResult<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| {
                DriverError::ConfigurationError(format!(
                    "Invalid bind address {}:{}: {e}",
                    self.bind_address, self.port
                ))
            })
    }
}

impl Default for ModbusServerConfig {
    fn default() -> Self {
        Self {
            bind_address: ModbusServerConfig::default_bind_address(),
            port: ModbusServerConfig::default_port(),
            allow_writes: false,
            word_order: WordOrder::default(),
            auto_create_units: false,
            request_throttle_ms: ModbusServerConfig::default_request_throttle_ms(),
            units: Vec::new(),
        }
    }
}

/// Register contents served for one unit id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitConfig {
    pub unit_id: u8,
    #[serde(default)]
    pub blocks: Vec<RegisterBlockConfig>,
}

/// Consecutive values laid out from `start_address` in one register block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBlockConfig {
    pub block_type: RegisterBlockType,
    #[serde(default)]
    pub start_address: u16,
    #[serde(default)]
    pub values: Vec<RegisterValueConfig>,
}

/// One seeded value. Bit blocks take one address per value, word blocks take the span
/// of the data type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterValueConfig {
    #[serde(default = "RegisterValueConfig::default_data_type")]
    pub data_type: DataType,

    /// Word count for bytes and string types; ignored for fixed-width types.
    #[serde(default)]
    pub word_length: u16,

    pub value: serde_json::Value,
}

impl RegisterValueConfig {
    fn default_data_type() -> DataType {
        DataType::UInt16
    }

    pub fn new(data_type: DataType, word_length: u16, value: serde_json::Value) -> Self {
        Self {
            data_type,
            word_length,
            value,
        }
    }

    /// Number of addresses this value occupies in a word block.
    #[inline]
    pub fn span(&self) -> u16 {
        self.data_type.span(self.word_length)
    }

    /// Parse the configured JSON scalar as the configured data type.
    pub fn register_value(&self) -> DriverResult<RegisterValue> {
        Ok(RegisterValue::try_from_json_scalar(
            self.data_type,
            &self.value,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_object() {
        let cfg: ModbusServerConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.bind_address, "0.0.0.0");
        assert_eq!(cfg.port, 502);
        assert!(!cfg.allow_writes);
        assert!(!cfg.auto_create_units);
        assert_eq!(cfg.word_order, WordOrder::MostToLeastSignificant);
        assert_eq!(cfg.socket_addr().unwrap().port(), 502);
        assert_eq!(cfg.request_throttle(), Duration::from_millis(100));
        assert_eq!(
            ModbusServerConfig::default().request_throttle_ms,
            cfg.request_throttle_ms
        );
    }

    #[test]
    fn throttle_can_be_disabled() {
        let cfg: ModbusServerConfig =
            serde_json::from_value(serde_json::json!({ "requestThrottleMs": 0 })).unwrap();
        assert!(cfg.request_throttle().is_zero());
    }

    #[test]
    fn unit_blocks_deserialize() {
        let cfg: ModbusServerConfig = serde_json::from_value(serde_json::json!({
            "port": 1502,
            "allowWrites": true,
            "wordOrder": "leastToMostSignificant",
            "units": [{
                "unitId": 7,
                "blocks": [{
                    "blockType": "holding",
                    "startAddress": 100,
                    "values": [
                        { "dataType": "float32", "value": 1.5 },
                        { "dataType": "stringascii", "wordLength": 4, "value": "meter" }
                    ]
                }]
            }]
        }))
        .unwrap();
        let block = &cfg.units[0].blocks[0];
        assert_eq!(cfg.units[0].unit_id, 7);
        assert_eq!(block.block_type, RegisterBlockType::Holding);
        assert_eq!(block.values[0].span(), 2);
        assert_eq!(block.values[1].span(), 4);
        assert_eq!(
            block.values[0].register_value().unwrap(),
            RegisterValue::Float32(1.5)
        );
    }

    #[test]
    fn bad_bind_address_is_reported() {
        let cfg = ModbusServerConfig {
            bind_address: "not an address".into(),
            ..Default::default()
        };
        assert!(matches!(
            cfg.socket_addr(),
            Err(DriverError::ConfigurationError(_))
        ));
    }
}
