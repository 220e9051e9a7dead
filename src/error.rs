//! The uniform error surface of the control protocol.
//!
//! Every failure a command handler can produce is rendered to the client
//! as a single `Error: <message>` line followed by the prompt; the
//! variants only classify where the failure came from.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request itself is malformed: unknown or ambiguous command
    /// words, a missing subcommand, bad option syntax.
    #[error("{0}")]
    Protocol(String),
    /// A well-formed request whose arguments do not validate.
    #[error("{0}")]
    Validation(String),
    /// The name or path is already taken by a different spec.
    #[error("{0}")]
    Conflict(String),
    /// A pattern or reference matched nothing that exists.
    #[error("{0}")]
    Lookup(String),
    /// The operating system said no.
    #[error("{0}")]
    Sys(String),
}

impl Error {
    /// `map_err` adapter gluing a context prefix onto an OS error:
    /// `.map_err(Error::sys("Bind failed"))?`.
    pub(crate) fn sys(prefix: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let prefix = prefix.into();
        move |e| Self::Sys(format!("{prefix}: {e}"))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Sys(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
