use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeviceError>;

/// Driver-wide error taxonomy.
///
/// `Busy` and `Retry` are the only variants callers are expected to recover
/// from by trying again; everything else is reported to the client or logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("no matching device")]
    NotFound,

    #[error("device busy")]
    Busy,

    #[error("device discovery still in progress")]
    Retry,

    #[error("i/o error")]
    Io,

    #[error("operation not supported")]
    Unsupported,

    #[error("malformed descriptor chain: {0}")]
    BadDescriptor(&'static str),

    #[error("out of resources: {0}")]
    ResourceExhausted(&'static str),

    #[error("permission denied")]
    PermissionDenied,

    #[error("unrecoverable device error")]
    Fatal,
}
