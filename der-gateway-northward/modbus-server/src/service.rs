use crate::{bank::RegisterBank, registry::UnitRegistry};
use der_driver_modbus::RegisterBlockType;
use der_gateway_sdk::DriverError;
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::time::Instant;
use tokio_modbus::{ExceptionCode, Request, Response, SlaveRequest};
use tracing::{debug, trace, warn};

/// Spaces out requests of one connection by a minimum interval.
#[derive(Debug, Clone, Default)]
struct RequestThrottle {
    interval: Duration,
    last: Arc<Mutex<Option<Instant>>>,
}

impl RequestThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Arc::default(),
        }
    }

    /// Reserve the next request slot; `None` when it is available now.
    fn reserve(&self) -> Option<Instant> {
        if self.interval.is_zero() {
            return None;
        }
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match *last {
            Some(prev) => (prev + self.interval).max(now),
            None => now,
        };
        *last = Some(slot);
        (slot > now).then_some(slot)
    }

    async fn wait(&self) {
        if let Some(slot) = self.reserve() {
            trace!(
                throttle_ms = self.interval.as_millis() as u64,
                "Request sooner than throttle, delaying"
            );
            tokio::time::sleep_until(slot).await;
        }
    }
}

/// Answers Modbus requests from the banks in a [`UnitRegistry`].
///
/// Cheap to clone; every accepted connection gets its own handle onto the same registry.
/// Clones share the request throttle, [`ModbusRequestService::for_connection`] does not.
#[derive(Debug, Clone)]
pub struct ModbusRequestService {
    registry: Arc<UnitRegistry>,
    allow_writes: bool,
    auto_create_units: bool,
    throttle: RequestThrottle,
}

impl ModbusRequestService {
    pub fn new(registry: Arc<UnitRegistry>, allow_writes: bool, auto_create_units: bool) -> Self {
        Self {
            registry,
            allow_writes,
            auto_create_units,
            throttle: RequestThrottle::default(),
        }
    }

    /// Delay requests arriving sooner than `interval` after the previous one.
    pub fn with_request_throttle(mut self, interval: Duration) -> Self {
        self.throttle = RequestThrottle::new(interval);
        self
    }

    #[inline]
    pub fn request_throttle(&self) -> Duration {
        self.throttle.interval
    }

    /// Handle for a newly accepted connection, with its own throttle state.
    pub fn for_connection(&self) -> Self {
        Self {
            throttle: RequestThrottle::new(self.throttle.interval),
            ..self.clone()
        }
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    /// Process one request addressed to `unit_id`.
    pub fn handle(&self, unit_id: u8, request: Request<'_>) -> Result<Response, ExceptionCode> {
        let bank = self.bank(unit_id)?;
        match request {
            Request::ReadCoils(address, count) => {
                check_range(address, count)?;
                let bits = bank.read_coils(address, count);
                Ok(Response::ReadCoils(bits.to_bools(count as usize)))
            }
            Request::ReadDiscreteInputs(address, count) => {
                check_range(address, count)?;
                let bits = bank.read_discretes(address, count);
                Ok(Response::ReadDiscreteInputs(bits.to_bools(count as usize)))
            }
            Request::ReadHoldingRegisters(address, count) => {
                check_range(address, count)?;
                Ok(Response::ReadHoldingRegisters(
                    bank.read_holdings(address, count),
                ))
            }
            Request::ReadInputRegisters(address, count) => {
                check_range(address, count)?;
                Ok(Response::ReadInputRegisters(bank.read_inputs(address, count)))
            }
            Request::WriteSingleCoil(address, value) => {
                self.check_writable(unit_id)?;
                write_bits(&bank, address, &[value])?;
                Ok(Response::WriteSingleCoil(address, value))
            }
            Request::WriteMultipleCoils(address, values) => {
                self.check_writable(unit_id)?;
                let count = quantity(values.len())?;
                check_range(address, count)?;
                write_bits(&bank, address, &values)?;
                Ok(Response::WriteMultipleCoils(address, count))
            }
            Request::WriteSingleRegister(address, word) => {
                self.check_writable(unit_id)?;
                write_holdings(&bank, address, &[word])?;
                Ok(Response::WriteSingleRegister(address, word))
            }
            Request::WriteMultipleRegisters(address, words) => {
                self.check_writable(unit_id)?;
                let count = quantity(words.len())?;
                check_range(address, count)?;
                write_holdings(&bank, address, &words)?;
                Ok(Response::WriteMultipleRegisters(address, count))
            }
            other => {
                debug!(unit_id, request = ?other, "Unsupported Modbus function");
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }

    fn bank(&self, unit_id: u8) -> Result<Arc<RegisterBank>, ExceptionCode> {
        if let Some(bank) = self.registry.get(unit_id) {
            return Ok(bank);
        }
        if self.auto_create_units {
            return Ok(self.registry.get_or_create(unit_id));
        }
        debug!(unit_id, "Request for unknown Modbus unit");
        Err(ExceptionCode::GatewayTargetDevice)
    }

    fn check_writable(&self, unit_id: u8) -> Result<(), ExceptionCode> {
        if self.allow_writes {
            return Ok(());
        }
        debug!(unit_id, "Rejected Modbus write, writes are disabled");
        Err(ExceptionCode::IllegalFunction)
    }
}

impl tokio_modbus::server::Service for ModbusRequestService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Exception>> + Send>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let service = self.clone();
        Box::pin(async move {
            service.throttle.wait().await;
            let SlaveRequest { slave, request } = req;
            service.handle(slave, request)
        })
    }
}

fn check_range(address: u16, count: u16) -> Result<(), ExceptionCode> {
    if count == 0 || u32::from(address) + u32::from(count) > 0x1_0000 {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

fn quantity(len: usize) -> Result<u16, ExceptionCode> {
    u16::try_from(len).map_err(|_| ExceptionCode::IllegalDataValue)
}

fn write_bits(bank: &RegisterBank, address: u16, bits: &[bool]) -> Result<(), ExceptionCode> {
    bank.write_coils(address, bits).map_err(write_exception)
}

fn write_holdings(bank: &RegisterBank, address: u16, words: &[u16]) -> Result<(), ExceptionCode> {
    bank.write_words(RegisterBlockType::Holding, address, words)
        .map_err(write_exception)
}

fn write_exception(error: DriverError) -> ExceptionCode {
    match error {
        DriverError::ValidationError(msg) => {
            debug!("Rejected Modbus write: {msg}");
            ExceptionCode::IllegalDataAddress
        }
        other => {
            warn!(error = %other, "Modbus write failed");
            ExceptionCode::ServerDeviceFailure
        }
    }
}
