#![allow(dead_code)]

use der_plugin_modbus_server::{ModbusServerConfig, UnitRegistry};
use std::sync::{Arc, Once};
use tracing::Level;

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

/// Unit 1 with a few seeded holding, input and coil values.
pub fn meter_config(allow_writes: bool) -> ModbusServerConfig {
    serde_json::from_value(serde_json::json!({
        "bindAddress": "127.0.0.1",
        "port": 0,
        "allowWrites": allow_writes,
        "units": [{
            "unitId": 1,
            "blocks": [
                {
                    "blockType": "holding",
                    "startAddress": 0,
                    "values": [
                        { "dataType": "float32", "value": 230.5 },
                        { "dataType": "uint16", "value": 7 }
                    ]
                },
                {
                    "blockType": "input",
                    "startAddress": 100,
                    "values": [
                        { "dataType": "stringascii", "wordLength": 3, "value": "SN01" }
                    ]
                },
                {
                    "blockType": "coil",
                    "startAddress": 0,
                    "values": [
                        { "dataType": "boolean", "value": false },
                        { "dataType": "boolean", "value": true }
                    ]
                }
            ]
        }]
    }))
    .unwrap()
}

pub fn meter_registry(config: &ModbusServerConfig) -> Arc<UnitRegistry> {
    Arc::new(UnitRegistry::from_config(config).unwrap())
}
