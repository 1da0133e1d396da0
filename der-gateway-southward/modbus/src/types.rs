use der_gateway_sdk::{DriverError, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{fmt, time::Duration};

/// Ordering convention for multi-word values.
///
/// Bytes inside a single word are always big-endian; only the order of the words changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WordOrder {
    /// First register holds the most significant word.
    #[default]
    MostToLeastSignificant,
    /// First register holds the least significant word.
    LeastToMostSignificant,
}

/// The four Modbus register blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RegisterBlockType {
    Coil,
    Discrete,
    Holding,
    Input,
}

impl RegisterBlockType {
    /// Whether the block is bit addressed (coils and discrete inputs).
    #[inline]
    pub fn is_bit_type(&self) -> bool {
        matches!(self, RegisterBlockType::Coil | RegisterBlockType::Discrete)
    }

    /// Whether a remote master may write to this block.
    #[inline]
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterBlockType::Coil | RegisterBlockType::Holding)
    }
}

impl fmt::Display for RegisterBlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegisterBlockType::Coil => "Coil",
            RegisterBlockType::Discrete => "Discrete",
            RegisterBlockType::Holding => "Holding",
            RegisterBlockType::Input => "Input",
        };
        f.write_str(s)
    }
}

/// Modbus read function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ModbusReadFunction {
    /// Read Coils (0x01)
    ReadCoils = 1,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 2,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 3,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 4,
}

impl ModbusReadFunction {
    #[inline]
    pub fn block_type(&self) -> RegisterBlockType {
        match self {
            ModbusReadFunction::ReadCoils => RegisterBlockType::Coil,
            ModbusReadFunction::ReadDiscreteInputs => RegisterBlockType::Discrete,
            ModbusReadFunction::ReadHoldingRegisters => RegisterBlockType::Holding,
            ModbusReadFunction::ReadInputRegisters => RegisterBlockType::Input,
        }
    }
}

impl TryFrom<u8> for ModbusReadFunction {
    type Error = DriverError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ModbusReadFunction::ReadCoils),
            2 => Ok(ModbusReadFunction::ReadDiscreteInputs),
            3 => Ok(ModbusReadFunction::ReadHoldingRegisters),
            4 => Ok(ModbusReadFunction::ReadInputRegisters),
            _ => Err(DriverError::ConfigurationError(format!(
                "Invalid read function code: {value}"
            ))),
        }
    }
}

/// Modbus write function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ModbusWriteFunction {
    /// Write Single Coil (0x05)
    WriteSingleCoil = 5,
    /// Write Single Register (0x06)
    WriteSingleRegister = 6,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 15,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 16,
}

impl ModbusWriteFunction {
    #[inline]
    pub fn block_type(&self) -> RegisterBlockType {
        match self {
            ModbusWriteFunction::WriteSingleCoil | ModbusWriteFunction::WriteMultipleCoils => {
                RegisterBlockType::Coil
            }
            ModbusWriteFunction::WriteSingleRegister
            | ModbusWriteFunction::WriteMultipleRegisters => RegisterBlockType::Holding,
        }
    }
}

impl TryFrom<u8> for ModbusWriteFunction {
    type Error = DriverError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            5 => Ok(ModbusWriteFunction::WriteSingleCoil),
            6 => Ok(ModbusWriteFunction::WriteSingleRegister),
            15 => Ok(ModbusWriteFunction::WriteMultipleCoils),
            16 => Ok(ModbusWriteFunction::WriteMultipleRegisters),
            _ => Err(DriverError::ConfigurationError(format!(
                "Invalid write function code: {value}"
            ))),
        }
    }
}

/// Modbus connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ModbusConnectionConfig {
    Tcp {
        host: String,
        #[serde(default = "ModbusConnectionConfig::default_port")]
        port: u16,
    },
    #[serde(rename_all = "camelCase")]
    Rtu {
        port: String,
        #[serde(default = "ModbusConnectionConfig::default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "ModbusConnectionConfig::default_data_bits")]
        data_bits: DataBits,
        #[serde(default = "ModbusConnectionConfig::default_stop_bits")]
        stop_bits: StopBits,
        #[serde(default = "ModbusConnectionConfig::default_parity")]
        parity: Parity,
    },
}

impl ModbusConnectionConfig {
    fn default_port() -> u16 {
        502
    }

    fn default_baud_rate() -> u32 {
        9600
    }

    fn default_data_bits() -> DataBits {
        DataBits::Eight
    }

    fn default_stop_bits() -> StopBits {
        StopBits::One
    }

    fn default_parity() -> Parity {
        Parity::None
    }

    /// Human readable transport description, used in lock timeout messages.
    pub fn description(&self) -> String {
        match self {
            ModbusConnectionConfig::Tcp { host, port } => format!("TCP {host}:{port}"),
            ModbusConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
            } => format!(
                "RTU {port} {baud_rate} {}{}{}",
                *data_bits as u8,
                parity.code(),
                *stop_bits as u8
            ),
        }
    }
}

/// Serial communication settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum DataBits {
    Five = 5,
    Six = 6,
    Seven = 7,
    Eight = 8,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(data_bits: DataBits) -> Self {
        match data_bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Serial stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum StopBits {
    One = 1,
    Two = 2,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(stop_bits: StopBits) -> Self {
        match stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Serial parity settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
}

impl Parity {
    fn code(&self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Settings for one physical Modbus transport shared by many units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModbusNetworkConfig {
    pub connection: ModbusConnectionConfig,
    /// Maximum wait for the transport lock, also used as the I/O timeout.
    #[serde(default = "ModbusNetworkConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retry policy applied to transport failures inside `perform_action`.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Close and reopen the transport before each retry.
    #[serde(default)]
    pub retry_reconnect: bool,
    /// Keep the transport open after an operation completes.
    #[serde(default)]
    pub keep_open: bool,
}

impl ModbusNetworkConfig {
    fn default_timeout_ms() -> u64 {
        10_000
    }

    pub fn new(connection: ModbusConnectionConfig) -> Self {
        Self {
            connection,
            timeout_ms: Self::default_timeout_ms(),
            retry: RetryPolicy::default(),
            retry_reconnect: false,
            keep_open: false,
        }
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_descriptions() {
        let tcp = ModbusConnectionConfig::Tcp {
            host: "10.0.0.5".into(),
            port: 502,
        };
        assert_eq!(tcp.description(), "TCP 10.0.0.5:502");

        let rtu = ModbusConnectionConfig::Rtu {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 19200,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::Even,
        };
        assert_eq!(rtu.description(), "RTU /dev/ttyUSB0 19200 8E1");
    }

    #[test]
    fn network_config_defaults() {
        let cfg: ModbusNetworkConfig = serde_json::from_value(serde_json::json!({
            "connection": { "kind": "rtu", "port": "/dev/ttyS0", "parity": 2 }
        }))
        .unwrap();
        assert_eq!(cfg.timeout(), Duration::from_secs(10));
        assert!(!cfg.keep_open);
        assert_eq!(cfg.retry.max_attempts, Some(3));
        match cfg.connection {
            ModbusConnectionConfig::Rtu {
                baud_rate, parity, ..
            } => {
                assert_eq!(baud_rate, 9600);
                assert_eq!(parity, Parity::Even);
            }
            other => panic!("unexpected connection {other:?}"),
        }
    }

    #[test]
    fn function_codes_map_to_blocks() {
        assert_eq!(
            ModbusReadFunction::try_from(4).unwrap().block_type(),
            RegisterBlockType::Input
        );
        assert_eq!(
            ModbusWriteFunction::WriteMultipleCoils.block_type(),
            RegisterBlockType::Coil
        );
        assert!(ModbusReadFunction::try_from(7).is_err());
        assert!(RegisterBlockType::Discrete.is_bit_type());
        assert!(!RegisterBlockType::Input.is_writable());
    }
}
