//! Modbus register engine: typed register codec, register stores, address planning and
//! transport locking shared by every Modbus driver.

mod bits;
mod codec;
mod connection;
mod datasource;
mod lock;
mod network;
mod planner;
mod registers;
mod store;
mod transaction;
pub mod types;

pub use bits::BitSet;
pub use codec::ModbusCodec;
pub use connection::{ModbusTransport, TokioModbusConnector, TransportFactory};
pub use datasource::{ModbusDataSource, ModbusDataSourceConfig, ModbusPropertyConfig, ModbusSample};
pub use lock::{ConnectionLock, ConnectionLockGuard};
pub use network::{ModbusConnection, ModbusNetwork};
pub use planner::{AddressRange, AddressRangeSet};
pub use registers::{RegisterMap, RegisterMapBuilder, RegisterReader, RegisterSpec};
pub use store::{RegisterData, RegisterStore, RegisterTransaction};
pub use transaction::{TransactionExecutor, WordBlocks};
pub use types::{
    ModbusConnectionConfig, ModbusNetworkConfig, ModbusReadFunction, ModbusWriteFunction,
    RegisterBlockType, WordOrder,
};
