use crate::ValueCastError;
use thiserror::Error;

/// Driver specific errors
#[derive(Error, Debug)]
pub enum DriverError {
    /// The transport lock was not acquired within the configured wait.
    #[error("Could not acquire {0} lock")]
    LockTimeout(String),
    /// Requested type or word count does not fit the configured register span.
    #[error("Structural decode error: {0}")]
    StructuralDecodeError(String),
    #[error("Transport error: {0}")]
    TransportError(#[from] std::io::Error),
    /// The device answered with a Modbus exception response.
    #[error("Modbus exception from unit {unit_id}: {code}")]
    ModbusException { unit_id: u8, code: String },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Codec error: {0}")]
    CodecError(String),
    #[error("Not connected: {0}")]
    NotConnected(String),
}

impl DriverError {
    /// Whether the error came from the underlying transport and a reconnect may help.
    #[inline]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DriverError::TransportError(_) | DriverError::NotConnected(_)
        )
    }

    #[inline]
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, DriverError::LockTimeout(_))
    }
}

impl From<ValueCastError> for DriverError {
    fn from(err: ValueCastError) -> Self {
        DriverError::CodecError(err.to_string())
    }
}
