//! Error types for interception operations

use std::fmt;

/// Main error type for the interception core
#[derive(Debug)]
pub enum InterceptError {
    /// Network-related errors (binding listeners, serving)
    Network(String),
    /// Certificate-related errors
    Certificate(String),
    /// Configuration errors
    Configuration(String),
    /// HTTP conversion errors
    Http(String),
    /// General I/O errors
    Io(std::io::Error),
    /// General errors
    General(String),
}

impl fmt::Display for InterceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptError::Network(msg) => write!(f, "Network error: {}", msg),
            InterceptError::Certificate(msg) => write!(f, "Certificate error: {}", msg),
            InterceptError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            InterceptError::Http(msg) => write!(f, "HTTP error: {}", msg),
            InterceptError::Io(err) => write!(f, "I/O error: {}", err),
            InterceptError::General(msg) => write!(f, "General error: {}", msg),
        }
    }
}

impl std::error::Error for InterceptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InterceptError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for InterceptError {
    fn from(err: std::io::Error) -> Self {
        InterceptError::Io(err)
    }
}
