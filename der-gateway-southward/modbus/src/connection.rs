use crate::types::{ModbusConnectionConfig, ModbusReadFunction, ModbusWriteFunction};
use der_gateway_sdk::{DriverError, DriverResult};
use std::{io, net::ToSocketAddrs, time::Duration};
use tokio_modbus::{
    client::sync::{self, Reader, Writer},
    prelude::{Slave, SlaveContext},
    ExceptionCode,
};

/// Raw register I/O over one open physical transport.
///
/// Implementations perform exactly one request per call; locking, retries and reconnects
/// are the responsibility of [`crate::ModbusNetwork`].
pub trait ModbusTransport: Send {
    /// Read holding or input registers.
    fn read_words(
        &mut self,
        unit_id: u8,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<u16>>;

    /// Read coils or discrete inputs.
    fn read_bits(
        &mut self,
        unit_id: u8,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<bool>>;

    fn write_words(
        &mut self,
        unit_id: u8,
        function: ModbusWriteFunction,
        address: u16,
        words: &[u16],
    ) -> DriverResult<()>;

    fn write_bits(
        &mut self,
        unit_id: u8,
        function: ModbusWriteFunction,
        address: u16,
        bits: &[bool],
    ) -> DriverResult<()>;

    /// Close the underlying channel. Called at most once per opened transport.
    fn close(&mut self) -> DriverResult<()>;
}

/// Opens transports for a [`crate::ModbusNetwork`].
pub trait TransportFactory: Send + Sync {
    /// Human readable transport description, e.g. `TCP 10.0.0.5:502`.
    fn description(&self) -> String;

    fn open(&self) -> DriverResult<Box<dyn ModbusTransport>>;
}

/// Blocking tokio-modbus client for TCP and RTU links.
///
/// The sync client drives its own single-threaded runtime, so it must not be used from
/// inside an async task.
#[derive(Debug, Clone)]
pub struct TokioModbusConnector {
    config: ModbusConnectionConfig,
    timeout: Duration,
}

impl TokioModbusConnector {
    pub fn new(config: ModbusConnectionConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    fn connect(&self) -> DriverResult<sync::Context> {
        let timeout = Some(self.timeout);
        match &self.config {
            ModbusConnectionConfig::Tcp { host, port } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(|e| {
                        DriverError::ConfigurationError(format!(
                            "Invalid socket address {host}:{port}: {e}"
                        ))
                    })?
                    .next()
                    .ok_or_else(|| {
                        DriverError::ConfigurationError(format!(
                            "No address resolved for {host}:{port}"
                        ))
                    })?;
                Ok(sync::tcp::connect_slave_with_timeout(
                    addr,
                    Slave::broadcast(),
                    timeout,
                )?)
            }
            ModbusConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
            } => {
                let builder = tokio_serial::new(port, *baud_rate)
                    .data_bits((*data_bits).into())
                    .stop_bits((*stop_bits).into())
                    .parity((*parity).into())
                    .timeout(self.timeout);
                Ok(sync::rtu::connect_slave_with_timeout(
                    &builder,
                    Slave::broadcast(),
                    timeout,
                )?)
            }
        }
    }
}

impl TransportFactory for TokioModbusConnector {
    fn description(&self) -> String {
        self.config.description()
    }

    fn open(&self) -> DriverResult<Box<dyn ModbusTransport>> {
        let ctx = self.connect()?;
        tracing::debug!(transport = %self.config.description(), "Modbus transport opened");
        Ok(Box::new(TokioModbusTransport { ctx: Some(ctx) }))
    }
}

struct TokioModbusTransport {
    ctx: Option<sync::Context>,
}

impl TokioModbusTransport {
    fn ctx(&mut self, unit_id: u8) -> DriverResult<&mut sync::Context> {
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| DriverError::NotConnected("transport closed".to_string()))?;
        ctx.set_slave(Slave(unit_id));
        Ok(ctx)
    }
}

/// Flatten the nested tokio-modbus result, keeping I/O errors verbatim.
fn flatten<T>(
    unit_id: u8,
    res: Result<Result<T, ExceptionCode>, tokio_modbus::Error>,
) -> DriverResult<T> {
    match res {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(code)) => Err(DriverError::ModbusException {
            unit_id,
            code: format!("{code:?}"),
        }),
        Err(tokio_modbus::Error::Transport(e)) => Err(DriverError::TransportError(e)),
        Err(e) => Err(DriverError::TransportError(io::Error::other(e))),
    }
}

#[inline(never)]
#[cold]
fn wrong_function(function: impl std::fmt::Debug, op: &str) -> DriverError {
    DriverError::ValidationError(format!("Function {function:?} cannot be used to {op}"))
}

impl ModbusTransport for TokioModbusTransport {
    fn read_words(
        &mut self,
        unit_id: u8,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<u16>> {
        let ctx = self.ctx(unit_id)?;
        let res = match function {
            ModbusReadFunction::ReadHoldingRegisters => {
                ctx.read_holding_registers(address, count)
            }
            ModbusReadFunction::ReadInputRegisters => ctx.read_input_registers(address, count),
            other => return Err(wrong_function(other, "read registers")),
        };
        flatten(unit_id, res)
    }

    fn read_bits(
        &mut self,
        unit_id: u8,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<bool>> {
        let ctx = self.ctx(unit_id)?;
        let res = match function {
            ModbusReadFunction::ReadCoils => ctx.read_coils(address, count),
            ModbusReadFunction::ReadDiscreteInputs => ctx.read_discrete_inputs(address, count),
            other => return Err(wrong_function(other, "read bits")),
        };
        flatten(unit_id, res)
    }

    fn write_words(
        &mut self,
        unit_id: u8,
        function: ModbusWriteFunction,
        address: u16,
        words: &[u16],
    ) -> DriverResult<()> {
        let ctx = self.ctx(unit_id)?;
        let res = match (function, words) {
            (ModbusWriteFunction::WriteSingleRegister, [word]) => {
                ctx.write_single_register(address, *word)
            }
            (ModbusWriteFunction::WriteMultipleRegisters, _) => {
                ctx.write_multiple_registers(address, words)
            }
            (other, _) => return Err(wrong_function(other, "write these registers")),
        };
        flatten(unit_id, res)
    }

    fn write_bits(
        &mut self,
        unit_id: u8,
        function: ModbusWriteFunction,
        address: u16,
        bits: &[bool],
    ) -> DriverResult<()> {
        let ctx = self.ctx(unit_id)?;
        let res = match (function, bits) {
            (ModbusWriteFunction::WriteSingleCoil, [bit]) => ctx.write_single_coil(address, *bit),
            (ModbusWriteFunction::WriteMultipleCoils, _) => {
                ctx.write_multiple_coils(address, bits)
            }
            (other, _) => return Err(wrong_function(other, "write these coils")),
        };
        flatten(unit_id, res)
    }

    fn close(&mut self) -> DriverResult<()> {
        // dropping the context shuts the socket or serial port
        self.ctx.take();
        Ok(())
    }
}
