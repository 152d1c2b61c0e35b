/*!
 * Error types for the vidhub core crate.
 */
use thiserror::Error;

/// Error type for vidhub core operations
#[derive(Error, Debug)]
pub enum Error {
    /// A bounded wait elapsed before its condition was met
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A connection state name could not be parsed
    #[error("Invalid state name: {0}")]
    InvalidStateName(String),

    /// An operation was called in a way its contract forbids
    #[error("Precondition violation: {0}")]
    PreconditionViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event channel error
    #[error("Event error: {0}")]
    Event(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for vidhub core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Error::Timeout(msg.as_ref().to_string())
    }

    /// Create a new invalid state name error
    pub fn invalid_state_name<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidStateName(msg.as_ref().to_string())
    }

    /// Create a new precondition violation error
    pub fn precondition<S: AsRef<str>>(msg: S) -> Self {
        Error::PreconditionViolation(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new event error
    pub fn event<S: AsRef<str>>(msg: S) -> Self {
        Error::Event(msg.as_ref().to_string())
    }

    /// Create a new runtime error
    pub fn runtime<S: AsRef<str>>(msg: S) -> Self {
        Error::Runtime(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }

    /// Whether this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        assert!(Error::timeout("waiting").is_timeout());
        assert!(!Error::other("x").is_timeout());
        assert_eq!(
            Error::precondition("missing failure flag").to_string(),
            "Precondition violation: missing failure flag"
        );
        assert!(matches!(Error::from("boom"), Error::Other(_)));
    }
}
