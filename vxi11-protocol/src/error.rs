use std::{fmt::Display, io, string::FromUtf8Error};

/// Errors that may occur when reading a message from a stream.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("{0}")]
    InvalidFormat(String),
    #[error("Message too large! Maximum is {max}, but got {got}")]
    TooManyBytes { max: usize, got: usize },
    #[error("Reply xid {got} does not match call xid {expected}")]
    XidMismatch { expected: u32, got: u32 },
    #[error("RPC call rejected: {0}")]
    Rejected(String),
}

impl From<FromUtf8Error> for ReadError {
    fn from(value: FromUtf8Error) -> Self {
        ReadError::InvalidFormat(format!("Invalid UTF8: {}", value))
    }
}

/// Error code carried in every VXI-11 response (`Device_ErrorCode`).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0);
    pub const SYNTAX_ERROR: ErrorCode = ErrorCode(1);
    pub const DEVICE_NOT_ACCESSIBLE: ErrorCode = ErrorCode(3);
    pub const INVALID_LINK_IDENTIFIER: ErrorCode = ErrorCode(4);
    pub const PARAMETER_ERROR: ErrorCode = ErrorCode(5);
    pub const CHANNEL_NOT_ESTABLISHED: ErrorCode = ErrorCode(6);
    pub const OPERATION_NOT_SUPPORTED: ErrorCode = ErrorCode(8);
    pub const OUT_OF_RESOURCES: ErrorCode = ErrorCode(9);
    pub const DEVICE_LOCKED: ErrorCode = ErrorCode(11);
    pub const NO_LOCK_HELD: ErrorCode = ErrorCode(12);
    pub const IO_TIMEOUT: ErrorCode = ErrorCode(15);
    pub const IO_ERROR: ErrorCode = ErrorCode(17);
    pub const INVALID_ADDRESS: ErrorCode = ErrorCode(21);
    pub const ABORT: ErrorCode = ErrorCode(23);
    pub const CHANNEL_ALREADY_ESTABLISHED: ErrorCode = ErrorCode(29);

    pub fn is_ok(&self) -> bool {
        self.0 == 0
    }

    /// Human readable description of this code, see [`describe`].
    pub fn describe(&self) -> String {
        describe(self.0)
    }
}

/// Descriptions of the codes 0 to 29. `None` marks codes the protocol leaves undefined.
const DESCRIPTIONS: [Option<&str>; 30] = [
    Some("no error"),
    Some("syntax error"),
    None,
    Some("device not accessible"),
    Some("invalid link identifier"),
    Some("parameter error"),
    Some("channel not established"),
    None,
    Some("operation not supported"),
    Some("out of resources"),
    None,
    Some("device locked by another link"),
    Some("no lock held by this link"),
    None,
    None,
    Some("I/O timeout"),
    None,
    Some("I/O error"),
    None,
    None,
    None,
    Some("invalid address"),
    None,
    Some("abort"),
    None,
    None,
    None,
    None,
    None,
    Some("channel already established"),
];

/// Maps a VXI-11 error code to a human readable description.
///
/// Never fails: unknown codes produce `undefined error (N)`.
pub fn describe(code: u32) -> String {
    match DESCRIPTIONS.get(code as usize).copied().flatten() {
        Some(text) => text.to_string(),
        None => format!("undefined error ({})", code),
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl From<u32> for ErrorCode {
    fn from(value: u32) -> Self {
        ErrorCode(value)
    }
}
