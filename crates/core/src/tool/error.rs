use std::borrow::Cow;
use std::fmt::{self, Display};

use crate::provider::TransportError;

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No connected provider serves the requested tool.
    Unresolved,
    /// The provider could not be reached or answered garbage.
    Transport,
    /// The provider ran the tool and reported a failure.
    Execution,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unresolved => write!(f, "Unresolved tool"),
            ErrorKind::Transport => write!(f, "Transport error"),
            ErrorKind::Execution => write!(f, "Execution error"),
        }
    }
}

/// Describes a tool call error.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Error {
    kind: ErrorKind,
    reason: Option<String>,
}

impl Error {
    /// Creates a new error for a tool no provider serves.
    #[inline]
    pub fn unresolved(name: &str) -> Self {
        Self {
            kind: ErrorKind::Unresolved,
            reason: Some(format!("no provider serves tool {name}")),
        }
    }

    /// Creates a new error with the `Transport` kind.
    #[inline]
    pub fn transport() -> Self {
        Self {
            kind: ErrorKind::Transport,
            reason: None,
        }
    }

    /// Creates a new error with the `Execution` kind.
    #[inline]
    pub fn execution() -> Self {
        Self {
            kind: ErrorKind::Execution,
            reason: None,
        }
    }

    /// Attaches a reason to the error.
    #[inline]
    pub fn with_reason<S: Into<String>>(self, reason: S) -> Self {
        Self {
            kind: self.kind,
            reason: Some(reason.into()),
        }
    }

    /// Returns the kind of the error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the reason for the error.
    #[inline]
    pub fn reason(&self) -> Cow<'_, str> {
        match self.reason.as_deref() {
            Some(reason) => Cow::Borrowed(reason),
            None => Cow::Owned(format!("{}", self.kind)),
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::transport().with_reason(err.to_string())
    }
}
