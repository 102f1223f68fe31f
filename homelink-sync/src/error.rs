//! Bridge-level error taxonomy.
//!
//! | kind               | origin                         | effect                         |
//! |--------------------|--------------------------------|--------------------------------|
//! | `InvalidPath`      | mutation target not writable   | rejected, reported to caller   |
//! | `IndexOutOfRange`  | bank slot outside the schema   | rejected, reported to caller   |
//! | `InvalidValue`     | wrong type / non-finite number | rejected, reported to caller   |
//! | `StoreUnavailable` | backing store unreachable      | write fails, caller retries    |
//! | `TransportClosed`  | peer went away                 | connection deregistered        |
//! | `MalformedMessage` | unparseable inbound payload    | logged and dropped             |
//! | `ClockExhausted`   | persisted timestamp at u64 max | sensor ingestion refused       |

use homelink_core::{ClockExhausted, MutationError, StatePath};

use crate::protocol::ProtocolError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("no value at '{0}'")]
    NotFound(StatePath),

    #[error("transport closed")]
    TransportClosed,

    #[error(transparent)]
    Clock(#[from] ClockExhausted),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Stable taxonomy name, used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mutation(MutationError::InvalidPath { .. }) => "InvalidPath",
            Self::Mutation(MutationError::IndexOutOfRange { .. }) => "IndexOutOfRange",
            Self::Mutation(MutationError::InvalidValue { .. }) => "InvalidValue",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::NotFound(_) => "NotFound",
            Self::TransportClosed => "TransportClosed",
            Self::Clock(_) => "ClockExhausted",
            Self::MalformedMessage(_) => "MalformedMessage",
            Self::Transport(_) => "Transport",
            Self::Io(_) => "Io",
        }
    }

    /// The peer went away; part of a connection's normal lifecycle.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::TransportClosed)
    }

    /// Transient failures the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(path) => Self::NotFound(path),
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
        }
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Malformed(reason) => Self::MalformedMessage(reason),
            ProtocolError::ConnectionClosed => Self::TransportClosed,
            ProtocolError::Transport(reason) => Self::Transport(reason),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use std::io::ErrorKind;
        use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                Self::TransportClosed
            }
            WsError::Io(io)
                if matches!(
                    io.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::BrokenPipe
                        | ErrorKind::UnexpectedEof
                ) =>
            {
                Self::TransportClosed
            }
            other => Self::Transport(other.to_string()),
        }
    }
}
