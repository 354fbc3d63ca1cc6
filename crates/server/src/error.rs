//! Server error type and exit-code mapping.
//!
//! Fatal startup kinds (no device, serial not found, open failure, missing
//! or mismatched native library) each map to a distinct process exit code
//! so supervisors can tell them apart. Everything after startup is either
//! logged and survived (parameter set failures, accept errors) or scoped to
//! a single connection (socket I/O), so it never appears here.

use rk_driver::DriverError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Driver(DriverError::NoDevice) => 2,
            Error::Driver(DriverError::SerialNotFound(_)) => 3,
            Error::Driver(DriverError::OpenFailed(_)) => 4,
            Error::Driver(DriverError::LibraryNotFound) => 5,
            Error::Driver(DriverError::LibraryMismatch(_)) => 6,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
