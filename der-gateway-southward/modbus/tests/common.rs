#![allow(dead_code)]

use der_driver_modbus::{
    ModbusConnectionConfig, ModbusNetwork, ModbusNetworkConfig, ModbusReadFunction,
    ModbusTransport, ModbusWriteFunction, TransportFactory,
};
use der_gateway_sdk::{DriverError, DriverResult, RetryPolicy};
use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex, MutexGuard, Once},
    thread,
    time::Duration,
};
use tracing::Level;

pub const UNIT_ID: u8 = 1;

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

/// Request observed by the in-memory device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    Close,
    ReadWords {
        unit_id: u8,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    },
    ReadBits {
        unit_id: u8,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    },
    WriteWords {
        unit_id: u8,
        function: ModbusWriteFunction,
        address: u16,
        words: Vec<u16>,
    },
    WriteBits {
        unit_id: u8,
        function: ModbusWriteFunction,
        address: u16,
        bits: Vec<bool>,
    },
}

/// Register contents and scripted failures of the simulated device.
#[derive(Debug, Default)]
pub struct MockDevice {
    pub holdings: BTreeMap<u16, u16>,
    pub inputs: BTreeMap<u16, u16>,
    pub coils: BTreeMap<u16, bool>,
    pub discretes: BTreeMap<u16, bool>,
    pub calls: Vec<Call>,
    /// Number of upcoming requests that fail with a broken pipe.
    pub fail_requests: usize,
    /// Number of upcoming opens that fail with connection refused.
    pub fail_opens: usize,
    pub request_delay: Option<Duration>,
}

impl MockDevice {
    pub fn requests(&self) -> Vec<Call> {
        self.calls
            .iter()
            .filter(|c| !matches!(c, Call::Open | Call::Close))
            .cloned()
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    fn request(&mut self, call: Call) -> DriverResult<()> {
        self.calls.push(call);
        if let Some(delay) = self.request_delay {
            thread::sleep(delay);
        }
        if self.fail_requests > 0 {
            self.fail_requests -= 1;
            return Err(DriverError::TransportError(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated failure",
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MockFactory {
    pub device: Arc<Mutex<MockDevice>>,
    pub description: String,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self {
            device: Arc::default(),
            description: "TCP 127.0.0.1:1502".to_string(),
        }
    }
}

impl MockFactory {
    pub fn device(&self) -> MutexGuard<'_, MockDevice> {
        self.device.lock().unwrap()
    }
}

impl TransportFactory for MockFactory {
    fn description(&self) -> String {
        self.description.clone()
    }

    fn open(&self) -> DriverResult<Box<dyn ModbusTransport>> {
        let mut device = self.device();
        device.calls.push(Call::Open);
        if device.fail_opens > 0 {
            device.fail_opens -= 1;
            return Err(DriverError::TransportError(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "simulated refusal",
            )));
        }
        Ok(Box::new(MockTransport {
            device: Arc::clone(&self.device),
        }))
    }
}

pub struct MockTransport {
    device: Arc<Mutex<MockDevice>>,
}

impl MockTransport {
    fn device(&self) -> MutexGuard<'_, MockDevice> {
        self.device.lock().unwrap()
    }
}

fn words(map: &BTreeMap<u16, u16>, address: u16, count: u16) -> Vec<u16> {
    (address..address + count)
        .map(|a| map.get(&a).copied().unwrap_or(0))
        .collect()
}

fn bits(map: &BTreeMap<u16, bool>, address: u16, count: u16) -> Vec<bool> {
    (address..address + count)
        .map(|a| map.get(&a).copied().unwrap_or(false))
        .collect()
}

impl ModbusTransport for MockTransport {
    fn read_words(
        &mut self,
        unit_id: u8,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<u16>> {
        let mut device = self.device();
        device.request(Call::ReadWords {
            unit_id,
            function,
            address,
            count,
        })?;
        match function {
            ModbusReadFunction::ReadHoldingRegisters => Ok(words(&device.holdings, address, count)),
            ModbusReadFunction::ReadInputRegisters => Ok(words(&device.inputs, address, count)),
            other => Err(DriverError::ValidationError(format!("{other:?}"))),
        }
    }

    fn read_bits(
        &mut self,
        unit_id: u8,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<bool>> {
        let mut device = self.device();
        device.request(Call::ReadBits {
            unit_id,
            function,
            address,
            count,
        })?;
        match function {
            ModbusReadFunction::ReadCoils => Ok(bits(&device.coils, address, count)),
            ModbusReadFunction::ReadDiscreteInputs => Ok(bits(&device.discretes, address, count)),
            other => Err(DriverError::ValidationError(format!("{other:?}"))),
        }
    }

    fn write_words(
        &mut self,
        unit_id: u8,
        function: ModbusWriteFunction,
        address: u16,
        words: &[u16],
    ) -> DriverResult<()> {
        let mut device = self.device();
        device.request(Call::WriteWords {
            unit_id,
            function,
            address,
            words: words.to_vec(),
        })?;
        for (i, w) in words.iter().enumerate() {
            device.holdings.insert(address + i as u16, *w);
        }
        Ok(())
    }

    fn write_bits(
        &mut self,
        unit_id: u8,
        function: ModbusWriteFunction,
        address: u16,
        bits: &[bool],
    ) -> DriverResult<()> {
        let mut device = self.device();
        device.request(Call::WriteBits {
            unit_id,
            function,
            address,
            bits: bits.to_vec(),
        })?;
        for (i, b) in bits.iter().enumerate() {
            device.coils.insert(address + i as u16, *b);
        }
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        self.device().calls.push(Call::Close);
        Ok(())
    }
}

/// Network config with a short lock timeout and fast retries.
pub fn test_network_config() -> ModbusNetworkConfig {
    let mut config = ModbusNetworkConfig::new(ModbusConnectionConfig::Tcp {
        host: "127.0.0.1".to_string(),
        port: 1502,
    });
    config.timeout_ms = 1000;
    config.retry = RetryPolicy {
        initial_interval_ms: 1,
        max_interval_ms: 5,
        ..RetryPolicy::with_max_attempts(2)
    };
    config
}

pub fn mock_network(config: ModbusNetworkConfig) -> (Arc<ModbusNetwork>, MockFactory) {
    let factory = MockFactory::default();
    let network = ModbusNetwork::with_factory(config, Box::new(factory.clone()));
    (Arc::new(network), factory)
}
