use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::document::ObjectId;
use crate::message_handler::{Action, ActionKind, CallId};
use crate::render::SurfaceId;

/// Failures of the underlying transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("cannot start worker thread: {0}")]
    Spawn(String),
}

/// Violations of the message protocol. These indicate the two sides of a channel are out of sync.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("cannot resolve callback {0}")]
    UnknownCallback(CallId),

    #[error("unknown action from {origin}: {action}")]
    UnknownAction { action: Action, origin: String },

    #[error("there is already an action registered for \"{0}\"")]
    DuplicateHandler(Action),

    #[error("\"{action}\" is a {actual} action, not a {expected} action")]
    WrongKind {
        action: Action,
        expected: ActionKind,
        actual: ActionKind,
    },
}

/// Why a password is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PasswordReason {
    NeedPassword,
    IncorrectPassword,
}

/// Reason carried across the channel when a remote call, stream or load fails.
///
/// The `name` tag is what the other side reports; [`RemoteError::from_name`] maps names that are not
/// recognised onto [`RemoteError::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "name")]
pub enum RemoteError {
    #[serde(rename = "AbortException")]
    #[error("{message}")]
    Abort { message: String },

    #[serde(rename = "InvalidPDFException")]
    #[error("invalid document: {message}")]
    InvalidDocument { message: String },

    #[serde(rename = "PasswordException")]
    #[error("{message}")]
    Password { message: String, code: PasswordReason },

    #[serde(rename = "MissingPDFException")]
    #[error("missing document: {message}")]
    MissingDocument { message: String },

    #[serde(rename = "UnexpectedResponseException")]
    #[error("unexpected response ({status}): {message}")]
    UnexpectedResponse { message: String, status: u16 },

    #[serde(rename = "UnknownErrorException")]
    #[error("{message}")]
    Unknown {
        message: String,
        details: Option<String>,
    },
}

impl RemoteError {
    pub fn abort(message: impl Into<String>) -> Self {
        RemoteError::Abort { message: message.into() }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        RemoteError::Unknown { message: message.into(), details: None }
    }

    /// Builds a reason from a name/message pair as reported by a backend.
    pub fn from_name(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            "AbortException" => RemoteError::Abort { message },
            "InvalidPDFException" => RemoteError::InvalidDocument { message },
            "PasswordException" => RemoteError::Password {
                message,
                code: PasswordReason::NeedPassword,
            },
            "MissingPDFException" => RemoteError::MissingDocument { message },
            "UnexpectedResponseException" => RemoteError::UnexpectedResponse { message, status: 0 },
            "UnknownErrorException" => RemoteError::Unknown { message, details: None },
            other => RemoteError::Unknown {
                message,
                details: Some(other.to_string()),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoteError::Abort { .. } => "AbortException",
            RemoteError::InvalidDocument { .. } => "InvalidPDFException",
            RemoteError::Password { .. } => "PasswordException",
            RemoteError::MissingDocument { .. } => "MissingPDFException",
            RemoteError::UnexpectedResponse { .. } => "UnexpectedResponseException",
            RemoteError::Unknown { .. } => "UnknownErrorException",
        }
    }
}

/// Translates a handler failure into something that can be sent back over a channel.
pub fn wrap_reason(err: anyhow::Error) -> RemoteError {
    let err = match err.downcast::<RemoteError>() {
        Ok(reason) => return reason,
        Err(err) => err,
    };
    match err.downcast::<MessageError>() {
        Ok(MessageError::Remote(reason)) => reason,
        Ok(other) => RemoteError::unknown(other.to_string()),
        Err(err) => RemoteError::Unknown {
            message: err.to_string(),
            details: Some(format!("{err:#}")),
        },
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("message handler destroyed")]
    Destroyed,
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::Payload(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker was destroyed")]
    Destroyed,

    #[error("cannot use more than one worker per port")]
    PortInUse,

    #[error("cannot set up loopback worker: {0}")]
    Setup(String),
}

/// Rejection reasons of a document load.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("{message}")]
    PasswordRequired { message: String, code: PasswordReason },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("missing document: {0}")]
    MissingDocument(String),

    #[error("unexpected server response ({status}): {message}")]
    UnexpectedResponse { message: String, status: u16 },

    #[error("{message}")]
    Unknown {
        message: String,
        details: Option<String>,
    },

    #[error("loading aborted: {0}")]
    Aborted(String),

    #[error("no document provider or worker configured")]
    NoBackend,

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error(transparent)]
    Channel(ChannelError),

    #[error("loading task destroyed")]
    Destroyed,
}

impl From<RemoteError> for LoadError {
    fn from(reason: RemoteError) -> Self {
        match reason {
            RemoteError::Abort { message } => LoadError::Aborted(message),
            RemoteError::InvalidDocument { message } => LoadError::InvalidDocument(message),
            RemoteError::Password { message, code } => LoadError::PasswordRequired { message, code },
            RemoteError::MissingDocument { message } => LoadError::MissingDocument(message),
            RemoteError::UnexpectedResponse { message, status } => {
                LoadError::UnexpectedResponse { message, status }
            }
            RemoteError::Unknown { message, details } => LoadError::Unknown { message, details },
        }
    }
}

impl From<MessageError> for LoadError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::Remote(reason) => reason.into(),
            MessageError::Protocol(err) => LoadError::Protocol(err),
            MessageError::Channel(err) => LoadError::Channel(err),
            MessageError::Payload(message) => LoadError::Unknown { message, details: None },
            MessageError::Destroyed => LoadError::Destroyed,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    #[error("Invalid page request: {0}")]
    InvalidPageRequest(usize),

    #[error("page {0} is currently rendering")]
    PageBusy(usize),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("document destroyed")]
    Destroyed,
}

/// Settles a render task that was cancelled. Not a failure of the render itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Rendering cancelled, page {page}")]
pub struct RenderingCancelled {
    pub page: usize,
    /// Added to the grace window before the operator list stream is aborted
    pub extra_delay: Duration,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error(transparent)]
    Cancelled(#[from] RenderingCancelled),

    #[error("surface {0} is already in use by another render task")]
    SurfaceInUse(SurfaceId),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("drawing failed: {0}")]
    Drawing(String),

    #[error("page destroyed")]
    Destroyed,
}

impl RenderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RenderError::Cancelled(_))
    }
}

impl From<DocumentError> for RenderError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::Message(err) => RenderError::Message(err),
            _ => RenderError::Destroyed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectCacheError {
    #[error("Requesting object that isn't resolved yet {0}")]
    NotResolved(ObjectId),

    #[error("object {0} was released before it resolved")]
    Cleared(ObjectId),
}

/// Rejected [`crate::config::EngineConfig`] values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("worker name must not be empty")]
    EmptyWorkerName,

    #[error("execution_steps must be at least 1")]
    ZeroExecutionSteps,

    #[error("{stream} high water mark {value} must be at least 1")]
    InvalidHighWaterMark { stream: &'static str, value: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_map_to_unknown() {
        let reason = RemoteError::from_name("FormatError", "bad xref");
        assert_eq!(
            reason,
            RemoteError::Unknown {
                message: "bad xref".into(),
                details: Some("FormatError".into())
            }
        );
        assert_eq!(reason.name(), "UnknownErrorException");
    }

    #[test]
    fn wrap_reason_keeps_remote_errors() {
        let err = anyhow::Error::new(RemoteError::MissingDocument { message: "gone".into() });
        assert_eq!(wrap_reason(err), RemoteError::MissingDocument { message: "gone".into() });

        let other = wrap_reason(anyhow::anyhow!("disk on fire"));
        assert!(matches!(other, RemoteError::Unknown { ref message, .. } if message == "disk on fire"));
    }

    #[test]
    fn remote_error_tags_by_name() {
        let value = serde_json::to_value(RemoteError::Password {
            message: "No password given".into(),
            code: PasswordReason::NeedPassword,
        })
        .unwrap();
        assert_eq!(value["name"], "PasswordException");

        let load: LoadError = RemoteError::InvalidDocument { message: "no header".into() }.into();
        assert!(matches!(load, LoadError::InvalidDocument(_)));
    }
}
