use stepwise_model::{ErrorKind, ModelProviderError};
use thiserror::Error;

/// The terminal error of one [`Agent::chat`](crate::Agent::chat) call.
#[derive(Debug, Error)]
pub enum Error {
    /// No model endpoint is configured.
    #[error("no model endpoint is configured")]
    Configuration,
    /// A tool provider could not be reached.
    #[error(transparent)]
    Connection(#[from] ConnectError),
    /// The model call failed in transport or while decoding the response.
    #[error("model call failed: {0}")]
    ModelCall(Box<dyn ModelProviderError>),
}

impl Error {
    /// Returns the provider's classification of a failed model call.
    pub fn model_error_kind(&self) -> Option<ErrorKind> {
        match self {
            Error::ModelCall(err) => Some(err.kind()),
            _ => None,
        }
    }
}

/// Failure to establish pooled provider connections.
///
/// This is `Clone` because one failed establishment is delivered to every
/// caller that was waiting on the same fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// One provider of the requested set failed to connect or to list its
    /// tools. The whole set is rejected.
    #[error("tool provider `{provider}` is unavailable: {reason}")]
    Provider {
        /// The name of the failing provider.
        provider: String,
        /// What went wrong.
        reason: String,
    },
    /// The pool actor has stopped.
    #[error("the connection pool is not running")]
    PoolClosed,
}
