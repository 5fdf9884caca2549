//! Byte stream plumbing below the response decoder.

mod chunks;
mod sse;

use std::fmt::{self, Display};

pub use chunks::Chunks;
pub use sse::Sse;

/// Failure while reading the event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The HTTP body could not be read.
    Body(String),
    /// The stream is not valid UTF-8.
    InvalidPayload,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Body(reason) => write!(f, "failed to read body: {reason}"),
            Error::InvalidPayload => write!(f, "invalid event stream payload"),
        }
    }
}
