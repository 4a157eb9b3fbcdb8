use std::io;
use std::os::raw::c_int;
use std::result;

use thiserror::Error;

/// Custom result type for lock-table operations
pub type Result<T> = result::Result<T, Error>;

/// Lock-table error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Native OS error code, passed through unchanged
    #[error("OS error code: {0}")]
    Os(c_int),
    /// I/O failure that carried no OS error code
    #[error("I/O error: {0:?}")]
    Io(io::ErrorKind),
    /// Lock file signature, version or layout mismatch
    #[error("Lock file is corrupted or was created by an incompatible build")]
    CorruptLockFile,
    /// Environment max readers limit reached
    #[error("Environment maxreaders limit reached")]
    TableFull,
    /// Process registry has no free entry
    #[error("Lock file process registry is full")]
    RegistryFull,
    /// Lock acquired, but its previous owner died while holding it
    #[error("Recovered lock abandoned by dead process {pid}")]
    StaleLockReclaimed { pid: u32 },
    /// Lock is held and the caller asked not to wait
    #[error("Lock is held by another transaction")]
    Busy,
    /// Lock wait exceeded the configured timeout
    #[error("Timed out waiting for lock")]
    Timeout,
    /// Environment is already open
    #[error("Environment is already open")]
    EnvAlreadyOpen,
    /// Environment is not initialized
    #[error("Environment is not initialized")]
    EnvNotInitialized,
    /// Environment is read-only
    #[error("Environment is read-only")]
    EnvReadOnly,
    /// Invalid environment configuration
    #[error("Invalid environment configuration")]
    EnvInvalidConfig,
    /// Environment path is invalid
    #[error("Invalid environment path")]
    EnvInvalidPath,
    /// Transaction id is reserved or out of range
    #[error("Invalid transaction id")]
    BadTxnId,
}

impl Error {
    /// Native OS error code, if this error carries one
    pub fn os_code(&self) -> Option<c_int> {
        match self {
            Error::Os(code) => Some(*code),
            _ => None,
        }
    }

    /// Whether the caller may retry after backing off
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TableFull | Error::Busy | Error::Timeout)
    }

    /// Grab the last OS error of the calling thread
    pub(crate) fn last_os_error() -> Error {
        Error::from(io::Error::last_os_error())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(code) => Error::Os(code),
            None => Error::Io(err.kind()),
        }
    }
}

/// Helper trait for converting C return codes to Results
pub(crate) trait IntoResult {
    fn into_result(self) -> Result<()>;
}

impl IntoResult for c_int {
    fn into_result(self) -> Result<()> {
        if self == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }
}
