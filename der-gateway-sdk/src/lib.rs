mod error;
mod retry;
mod types;
mod value;

pub type DriverResult<T> = Result<T, DriverError>;

pub use error::DriverError;
pub use retry::{build_exponential_backoff, RetryPolicy};
pub use types::{Charset, DataType};
pub use value::{RegisterValue, ValueCastError};
