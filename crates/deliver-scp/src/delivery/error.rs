//! Delivery error taxonomy.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Everything that can go wrong in a delivery run.
///
/// An empty wildcard expansion is deliberately absent: it is reported as
/// [`OutcomeStatus::EmptyResolution`](crate::delivery::OutcomeStatus), not
/// as an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Empty secret, empty source spec, or a rejected subdirectory token.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The source spec names no existing path and contains no wildcard.
    #[error("Source '{0}' does not exist")]
    SourceNotFound(String),

    #[error("Authentication failed for {username}@{host}: {message} (check the username and password or key)")]
    AuthenticationFailure {
        host: String,
        username: String,
        message: String,
    },

    #[error("Connection to {host}:{port} failed: {message} (check the network and that the host is reachable)")]
    ConnectionFailure {
        host: String,
        port: u16,
        message: String,
    },

    #[error("Remote command `{command}` exited with status {exit_code}: {stderr}")]
    RemoteCommandFailure {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Channel, SCP stream, or local read failure during an operation.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Transfer of '{item}' failed: {cause}")]
    ItemTransferFailure { item: String, cause: String },

    /// A required external binary (ssh, scp, sshpass) is not installed.
    #[error("Required program '{0}' was not found on PATH")]
    MissingDependency(String),

    #[error("Delivery cancelled")]
    Cancelled,

    #[error("Unexpected failure: {0}")]
    UnexpectedFailure(String),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

impl DeliveryError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        DeliveryError::InvalidInput(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        DeliveryError::TransportFailure(msg.into())
    }

    pub fn unexpected(msg: impl Into<String>) -> Self {
        DeliveryError::UnexpectedFailure(msg.into())
    }

    pub fn item_failure(item: impl Into<String>, cause: &DeliveryError) -> Self {
        DeliveryError::ItemTransferFailure {
            item: item.into(),
            cause: cause.to_string(),
        }
    }

    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::InvalidInput(_) => "invalidInput",
            DeliveryError::SourceNotFound(_) => "sourceNotFound",
            DeliveryError::AuthenticationFailure { .. } => "authenticationFailure",
            DeliveryError::ConnectionFailure { .. } => "connectionFailure",
            DeliveryError::RemoteCommandFailure { .. } => "remoteCommandFailure",
            DeliveryError::TransportFailure(_) => "transportFailure",
            DeliveryError::ItemTransferFailure { .. } => "itemTransferFailure",
            DeliveryError::MissingDependency(_) => "missingDependency",
            DeliveryError::Cancelled => "cancelled",
            DeliveryError::UnexpectedFailure(_) => "unexpectedFailure",
        }
    }

    /// Authentication and connection failures poison the whole session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            DeliveryError::AuthenticationFailure { .. }
                | DeliveryError::ConnectionFailure { .. }
                | DeliveryError::MissingDependency(_)
                | DeliveryError::Cancelled
        )
    }
}

impl Serialize for DeliveryError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DeliveryError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

impl From<tokio::task::JoinError> for DeliveryError {
    fn from(e: tokio::task::JoinError) -> Self {
        DeliveryError::UnexpectedFailure(format!("Transport task failed: {}", e))
    }
}
