use std::fmt;

use serde::{Deserialize, Serialize};

/// How an action is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Fire-and-forget, no reply
    Notify,
    /// Exactly one reply
    Call,
    /// A stream of chunks with credit based flow control
    Stream,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Notify => write!(f, "notify"),
            ActionKind::Call => write!(f, "call"),
            ActionKind::Stream => write!(f, "stream"),
        }
    }
}

/// Every message the client and the backend exchange.
///
/// The set is closed: handlers are registered against these variants and each variant has a fixed
/// [`ActionKind`], so a mismatch between sender and handler is caught at registration or send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // Worker level
    Test,
    Ready,
    Configure,
    Echo,
    GetDocRequest,

    // Document level, client to backend
    GetDoc,
    GetPage,
    GetAnnotations,
    GetOperatorList,
    GetTextContent,
    GetData,
    Cleanup,
    Terminate,

    // Document level, backend to client
    PasswordRequest,
    DocProgress,
    UnsupportedFeature,
    CommonObj,
    Obj,
}

impl Action {
    pub const fn kind(self) -> ActionKind {
        match self {
            Action::Test
            | Action::Ready
            | Action::Configure
            | Action::DocProgress
            | Action::UnsupportedFeature
            | Action::CommonObj
            | Action::Obj => ActionKind::Notify,
            Action::GetOperatorList | Action::GetTextContent => ActionKind::Stream,
            Action::Echo
            | Action::GetDocRequest
            | Action::GetDoc
            | Action::GetPage
            | Action::GetAnnotations
            | Action::GetData
            | Action::Cleanup
            | Action::Terminate
            | Action::PasswordRequest => ActionKind::Call,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
