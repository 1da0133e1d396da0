use crate::{
    codec::ModbusCodec,
    connection::{ModbusTransport, TokioModbusConnector, TransportFactory},
    lock::{ConnectionLock, ConnectionLockGuard},
    types::{ModbusNetworkConfig, ModbusReadFunction, ModbusWriteFunction, WordOrder},
};
use der_gateway_sdk::{build_exponential_backoff, DataType, DriverError, DriverResult, RegisterValue};
use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    thread,
};
use tracing::{debug, warn};

/// One physical Modbus transport shared by every unit reachable through it.
///
/// All access goes through [`ModbusNetwork::open`] (or [`ModbusNetwork::perform_action`]),
/// which holds the transport lock for the lifetime of the returned [`ModbusConnection`].
pub struct ModbusNetwork {
    config: ModbusNetworkConfig,
    factory: Box<dyn TransportFactory>,
    lock: ConnectionLock,
    transport: Mutex<Option<Box<dyn ModbusTransport>>>,
}

impl ModbusNetwork {
    /// Network backed by the tokio-modbus blocking client.
    pub fn new(config: ModbusNetworkConfig) -> Self {
        let factory = TokioModbusConnector::new(config.connection.clone(), config.timeout());
        Self::with_factory(config, Box::new(factory))
    }

    pub fn with_factory(config: ModbusNetworkConfig, factory: Box<dyn TransportFactory>) -> Self {
        let lock = ConnectionLock::new(factory.description());
        Self {
            config,
            factory,
            lock,
            transport: Mutex::new(None),
        }
    }

    #[inline]
    pub fn config(&self) -> &ModbusNetworkConfig {
        &self.config
    }

    #[inline]
    pub fn description(&self) -> &str {
        self.lock.description()
    }

    #[inline]
    pub fn lock(&self) -> &ConnectionLock {
        &self.lock
    }

    pub fn is_open(&self) -> bool {
        self.transport().is_some()
    }

    fn transport(&self) -> MutexGuard<'_, Option<Box<dyn ModbusTransport>>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the transport lock, then make sure the transport is open.
    ///
    /// Fails with `LockTimeout` when the lock is not obtained within the configured timeout.
    /// If opening the transport fails the lock is released before returning.
    pub fn open(&self, unit_id: u8) -> DriverResult<ModbusConnection<'_>> {
        let guard = self.lock.acquire(self.config.timeout())?;
        {
            let mut transport = self.transport();
            if transport.is_none() {
                *transport = Some(self.factory.open()?);
            }
        }
        Ok(ModbusConnection {
            network: self,
            unit_id,
            guard: Some(guard),
        })
    }

    /// Open a connection, run `action`, then close.
    ///
    /// Transport failures are retried per the configured [`der_gateway_sdk::RetryPolicy`];
    /// lock timeouts and other errors are returned immediately.
    pub fn perform_action<T, F>(&self, unit_id: u8, mut action: F) -> DriverResult<T>
    where
        F: FnMut(&mut ModbusConnection<'_>) -> DriverResult<T>,
    {
        let mut backoff = build_exponential_backoff(&self.config.retry);
        let mut attempt: u32 = 0;
        loop {
            match self.attempt(unit_id, &mut action) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transport() => {
                    attempt = attempt.saturating_add(1);
                    let Some(delay) = self.config.retry.next_delay(attempt, &mut backoff) else {
                        return Err(e);
                    };
                    warn!(
                        transport = %self.description(),
                        unit_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Modbus action failed, retrying"
                    );
                    if self.config.retry_reconnect {
                        self.reset();
                    }
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn attempt<T, F>(&self, unit_id: u8, action: &mut F) -> DriverResult<T>
    where
        F: FnMut(&mut ModbusConnection<'_>) -> DriverResult<T>,
    {
        let mut conn = self.open(unit_id)?;
        let result = action(&mut conn);
        let closed = conn.close();
        match (result, closed) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(v), Err(e)) => {
                warn!(transport = %self.description(), error = %e, "Closing Modbus transport failed");
                Ok(v)
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Close the transport so the next `open` reconnects.
    ///
    /// Skipped when another thread holds the lock or the calling thread is mid-operation.
    pub fn reset(&self) {
        let Ok(guard) = self.lock.acquire(self.config.timeout()) else {
            return;
        };
        if guard.is_outermost() {
            if let Err(e) = self.close_transport() {
                warn!(transport = %self.description(), error = %e, "Modbus transport reset failed");
            }
        }
    }

    fn close_transport(&self) -> DriverResult<()> {
        let taken = self.transport().take();
        match taken {
            Some(mut t) => {
                debug!(transport = %self.description(), "Closing Modbus transport");
                t.close()
            }
            None => Ok(()),
        }
    }

    fn with_transport<T>(
        &self,
        f: impl FnOnce(&mut dyn ModbusTransport) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut transport = self.transport();
        match transport.as_mut() {
            Some(t) => f(t.as_mut()),
            None => Err(DriverError::NotConnected(self.description().to_string())),
        }
    }
}

impl fmt::Debug for ModbusNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusNetwork")
            .field("transport", &self.description())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Open, locked connection to one unit on a [`ModbusNetwork`].
///
/// Closing (explicitly or on drop) closes the transport when this is the outermost
/// connection and `keep_open` is off, then releases the lock in every case.
pub struct ModbusConnection<'a> {
    network: &'a ModbusNetwork,
    unit_id: u8,
    guard: Option<ConnectionLockGuard<'a>>,
}

impl<'a> ModbusConnection<'a> {
    #[inline]
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    #[inline]
    pub fn network(&self) -> &'a ModbusNetwork {
        self.network
    }

    pub fn read_words(
        &mut self,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<u16>> {
        debug!(unit_id = self.unit_id, ?function, address, count, "Modbus read words");
        let unit_id = self.unit_id;
        let words = self
            .network
            .with_transport(|t| t.read_words(unit_id, function, address, count))?;
        if words.len() < count as usize {
            return Err(DriverError::TransportError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("Expected {count} registers at {address}, got {}", words.len()),
            )));
        }
        Ok(words)
    }

    pub fn read_bits(
        &mut self,
        function: ModbusReadFunction,
        address: u16,
        count: u16,
    ) -> DriverResult<Vec<bool>> {
        debug!(unit_id = self.unit_id, ?function, address, count, "Modbus read bits");
        let unit_id = self.unit_id;
        let mut bits = self
            .network
            .with_transport(|t| t.read_bits(unit_id, function, address, count))?;
        // coil responses are padded to whole bytes
        bits.truncate(count as usize);
        Ok(bits)
    }

    pub fn write_words(
        &mut self,
        function: ModbusWriteFunction,
        address: u16,
        words: &[u16],
    ) -> DriverResult<()> {
        debug!(unit_id = self.unit_id, ?function, address, count = words.len(), "Modbus write words");
        let unit_id = self.unit_id;
        self.network
            .with_transport(|t| t.write_words(unit_id, function, address, words))
    }

    /// Write coils, using the single-coil function for one bit.
    pub fn write_bits(&mut self, address: u16, bits: &[bool]) -> DriverResult<()> {
        let function = if bits.len() == 1 {
            ModbusWriteFunction::WriteSingleCoil
        } else {
            ModbusWriteFunction::WriteMultipleCoils
        };
        debug!(unit_id = self.unit_id, ?function, address, count = bits.len(), "Modbus write bits");
        let unit_id = self.unit_id;
        self.network
            .with_transport(|t| t.write_bits(unit_id, function, address, bits))
    }

    /// Read and decode one typed value. `word_count` 0 uses the type's canonical length.
    pub fn read_value(
        &mut self,
        function: ModbusReadFunction,
        data_type: DataType,
        address: u16,
        word_count: u16,
        word_order: WordOrder,
    ) -> DriverResult<Option<RegisterValue>> {
        let span = data_type.span(word_count);
        if span == 0 {
            return Err(DriverError::StructuralDecodeError(format!(
                "No word count configured for {data_type} at {address}"
            )));
        }
        if function.block_type().is_bit_type() {
            let bits = self.read_bits(function, address, 1)?;
            let value = RegisterValue::Boolean(bits.first().copied().unwrap_or(false));
            return Ok(Some(value.cast(data_type)?));
        }
        let words = self.read_words(function, address, span)?;
        ModbusCodec::decode(data_type, &words, word_order)
    }

    /// Encode and write one typed value to holding registers (or a coil for booleans).
    pub fn write_value(
        &mut self,
        value: &RegisterValue,
        data_type: DataType,
        address: u16,
        word_count: u16,
        word_order: WordOrder,
    ) -> DriverResult<()> {
        let span = data_type.span(word_count);
        let words = ModbusCodec::encode_with_length(value, data_type, word_order, span)?;
        if words.is_empty() {
            return Err(DriverError::ValidationError(format!(
                "No word count configured for {data_type} at {address}"
            )));
        }
        let function = if words.len() == 1 {
            ModbusWriteFunction::WriteSingleRegister
        } else {
            ModbusWriteFunction::WriteMultipleRegisters
        };
        self.write_words(function, address, &words)
    }

    /// Close the transport if appropriate, then release the lock.
    pub fn close(mut self) -> DriverResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> DriverResult<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let result = if guard.is_outermost() && !self.network.config.keep_open {
            self.network.close_transport()
        } else {
            Ok(())
        };
        drop(guard);
        result
    }
}

impl Drop for ModbusConnection<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(transport = %self.network.description(), error = %e, "Closing Modbus transport failed");
        }
    }
}

impl fmt::Debug for ModbusConnection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusConnection")
            .field("transport", &self.network.description())
            .field("unit_id", &self.unit_id)
            .finish()
    }
}
