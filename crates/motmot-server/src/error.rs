use crate::federation::FederationError;
use crate::store::StoreError;
use motmot::principal::PrincipalError;
use motmot::protocol::{ErrorCode, Message, ProtocolError};
use thiserror::Error;

/// Failure of a single request. Every variant becomes an error reply; none
/// of them tears the connection down.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(i64),

    #[error("permission denied")]
    PermissionDenied,

    #[error("session expired")]
    SessionExpired,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("{0}")]
    RemoteFederation(#[from] FederationError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("not implemented")]
    NotImplemented,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownOpcode(code) => RpcError::MethodNotFound(code),
            other => RpcError::MalformedRequest(other.to_string()),
        }
    }
}

impl From<PrincipalError> for RpcError {
    fn from(err: PrincipalError) -> Self {
        RpcError::MalformedRequest(err.to_string())
    }
}

impl RpcError {
    /// Convert to the reply sent back on the originating connection.
    /// Storage details are not leaked to the peer.
    pub fn to_reply(&self) -> Message {
        match self {
            RpcError::MalformedRequest(_) => {
                Message::error(ErrorCode::MalformedRequest, &self.to_string())
            }
            RpcError::MethodNotFound(_) => {
                Message::error(ErrorCode::MethodNotFound, "Method Not Found")
            }
            RpcError::PermissionDenied => Message::access_denied(),
            RpcError::SessionExpired => Message::error(ErrorCode::SessionExpired, "Session Expired"),
            RpcError::AuthenticationFailed => Message::auth_failed(),
            RpcError::RemoteFederation(_) => {
                Message::error(ErrorCode::RemoteFederationError, &self.to_string())
            }
            RpcError::Storage(_) | RpcError::Internal(_) => {
                Message::error(ErrorCode::InternalError, "Internal Server Error")
            }
            RpcError::NotImplemented => Message::error(ErrorCode::NotImplemented, "Not Implemented"),
        }
    }
}
