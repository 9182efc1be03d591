use vxi11_protocol::error::{ErrorCode, ReadError};

/// Failure of a session operation.
///
/// Timeouts reported by a read and cancellation are not failures, see
/// [`Transfer`](crate::Transfer).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Session is closed")]
    Closed,
    /// The device answered with a non-zero error code.
    #[error("{operation} failed: {}", .code.describe())]
    Device {
        operation: &'static str,
        code: ErrorCode,
        transferred: usize,
    },
    /// The remote call itself failed (connection, RPC rejection, malformed reply).
    #[error("{operation} failed: {source}")]
    Rpc {
        operation: &'static str,
        transferred: usize,
        #[source]
        source: ReadError,
    },
    /// The device answered with data that contradicts the request.
    #[error("{operation} violated the protocol: {detail}")]
    Protocol {
        operation: &'static str,
        detail: String,
        transferred: usize,
    },
}

impl Error {
    /// Number of bytes moved before the failure.
    pub fn transferred(&self) -> usize {
        match self {
            Error::Device { transferred, .. }
            | Error::Rpc { transferred, .. }
            | Error::Protocol { transferred, .. } => *transferred,
            Error::InvalidArgument(_) | Error::Closed => 0,
        }
    }

    /// The device error code, if the device reported one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Device { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.code() == Some(ErrorCode::IO_TIMEOUT)
    }

    pub(crate) fn rpc(
        operation: &'static str,
        transferred: usize,
    ) -> impl FnOnce(ReadError) -> Error {
        move |source| Error::Rpc {
            operation,
            transferred,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[test]
fn device_error_uses_code_description() {
    let err = Error::Device {
        operation: "device_clear",
        code: ErrorCode::DEVICE_LOCKED,
        transferred: 0,
    };
    assert_eq!(err.to_string(), "device_clear failed: device locked by another link");
    assert!(!err.is_timeout());
}

#[test]
fn undefined_code_description() {
    let err = Error::Device {
        operation: "device_write",
        code: ErrorCode(42),
        transferred: 12,
    };
    assert_eq!(err.to_string(), "device_write failed: undefined error (42)");
    assert_eq!(err.transferred(), 12);
}
