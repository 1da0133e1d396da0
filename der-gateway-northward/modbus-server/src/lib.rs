//! Modbus TCP server exposing in-memory register banks, one per unit id, to remote
//! masters.

mod bank;
pub mod config;
mod registry;
mod server;
mod service;

pub use bank::RegisterBank;
pub use config::{ModbusServerConfig, RegisterBlockConfig, RegisterValueConfig, UnitConfig};
pub use registry::UnitRegistry;
pub use server::ModbusServer;
pub use service::ModbusRequestService;
