use std::fmt;
use std::io;

/// Errors surfaced by server construction, binding and lifecycle management.
///
/// Call-level failures never appear here; those travel as [`crate::Status`]
/// values all the way to the gRPC trailers.
#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
    InvalidTarget(String),
    InvalidOption(String),
    InvalidCredentials(String),
    DuplicateMethod(String),
    NotBound,
    AlreadyStarted,
    Transport(h2::Error),
    Tls(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::InvalidTarget(t) => write!(f, "Could not parse listen target: {}", t),
            Self::InvalidOption(msg) => write!(f, "Invalid server option: {}", msg),
            Self::InvalidCredentials(msg) => write!(f, "Invalid credentials: {}", msg),
            Self::DuplicateMethod(path) => write!(f, "Method handler already exists for {}", path),
            Self::NotBound => write!(f, "Server is not bound to any address"),
            Self::AlreadyStarted => write!(f, "Server is already started"),
            Self::Transport(err) => write!(f, "HTTP/2 transport error: {}", err),
            Self::Tls(msg) => write!(f, "TLS error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<h2::Error> for ServerError {
    fn from(err: h2::Error) -> Self {
        Self::Transport(err)
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
