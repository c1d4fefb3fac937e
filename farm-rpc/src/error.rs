use std::fmt;

use farm_service::ServiceError;

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug)]
pub enum RpcError {
    NotFound(String),
    Forbidden(String),
    InvalidRequest(String),
    RetryNotAllowed(String),
    InternalError(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::NotFound(msg) => write!(f, "Not found: {}", msg),
            RpcError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            RpcError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            RpcError::RetryNotAllowed(msg) => write!(f, "Retry not allowed: {}", msg),
            RpcError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<ServiceError> for RpcError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(what) => RpcError::NotFound(what),
            ServiceError::Forbidden(message) => RpcError::Forbidden(message),
            err @ ServiceError::InvalidArgument { .. } => RpcError::InvalidRequest(err.to_string()),
            ServiceError::RetryNotAllowed(node) => RpcError::RetryNotAllowed(node),
            ServiceError::Internal(message) => RpcError::InternalError(message),
        }
    }
}
