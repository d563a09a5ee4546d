//! Driver error kinds and their CSI status mapping

use thiserror::Error;

/// Result type used by all driver-internal operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// The closed set of failure kinds a driver RPC can produce.
///
/// Servers convert backend errors to kinds at the edge, kinds lift to CSI
/// status codes in the response. Messages carry the failed operation and the
/// offending identifier, never credentials or raw backend response bodies.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Missing or malformed request field, unknown storage class parameter,
    /// or unusable volume capability.
    #[error("{0}")]
    InvalidInput(String),

    /// The backend reported that an entity named by the caller does not
    /// exist.
    #[error("{0}")]
    NotFound(String),

    /// Name clash on create, or a pre-existing device entry that does not
    /// match the requested publish.
    #[error("{0}")]
    AlreadyExists(String),

    /// Per-volume lock contention or a lost optimistic-concurrency race on
    /// an instance update. The CSI sidecars retry on the resulting status.
    #[error("{0}")]
    Conflict(String),

    /// The request asks for functionality the driver does not provide.
    #[error("{0}")]
    Unimplemented(String),

    /// The backend could not be reached or timed out.
    #[error("{0}")]
    Unavailable(String),

    /// Everything else.
    #[error("{0}")]
    Internal(String),
}

impl From<DriverError> for tonic::Status {
    fn from(err: DriverError) -> Self {
        let code = match err {
            DriverError::InvalidInput(..) => tonic::Code::InvalidArgument,
            DriverError::NotFound(..) => tonic::Code::NotFound,
            DriverError::AlreadyExists(..) => tonic::Code::AlreadyExists,
            DriverError::Conflict(..) => tonic::Code::Aborted,
            DriverError::Unimplemented(..) => tonic::Code::Unimplemented,
            DriverError::Unavailable(..) => tonic::Code::Unavailable,
            DriverError::Internal(..) => tonic::Code::Internal,
        };
        tonic::Status::new(code, err.to_string())
    }
}
