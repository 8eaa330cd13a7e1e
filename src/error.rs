use thiserror::Error;

use crate::types::CommandId;

pub const CONNECTION_EXPIRED_MESSAGE: &str =
    "Connection expired. Send a keep-alive request first.";
pub const MALFORMED_SUBMIT_MESSAGE: &str = "Invalid request format. Expected 'responses' array.";
pub const SUBMIT_FAULT_MESSAGE: &str = "Failed to process submitted commands";

/// Failures of broker operations.
///
/// The await-side variants only ever reach the caller awaiting that id; the
/// poller-side variants become transport responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("no command or result for id {0}")]
    NotFound(CommandId),
    #[error("command {0} already has a waiting caller")]
    AlreadyAwaiting(CommandId),
    #[error("command {0} timed out waiting for a result")]
    Timeout(CommandId),
    #[error("command {0} was canceled")]
    Canceled(CommandId),
    #[error("command id {0} already exists")]
    DuplicateId(CommandId),
    #[error("{0}")]
    CommandFailed(String),
    #[error("{}", CONNECTION_EXPIRED_MESSAGE)]
    ConnectionExpired,
    #[error("{}", MALFORMED_SUBMIT_MESSAGE)]
    MalformedPayload,
    #[error("Failed to process submitted commands: {0}")]
    InternalFault(String),
}

impl BrokerError {
    /// HTTP status used when the error crosses the transport boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ConnectionExpired | Self::MalformedPayload => 400,
            Self::NotFound(_) => 404,
            _ => 500,
        }
    }

    /// Message safe to hand back to the remote side.
    pub fn public_message(&self) -> String {
        match self {
            Self::InternalFault(_) => SUBMIT_FAULT_MESSAGE.to_owned(),
            other => other.to_string(),
        }
    }
}
