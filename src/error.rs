use std::fmt;
use thiserror::Error;

/// Main error type for the fasthttpd server
#[derive(Error, Debug)]
pub enum FasthttpdError {
    /// Configuration related errors (unknown references, bad values)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Route table construction errors (bad match mode, regex failure)
    #[error("Route error: {message}")]
    Route { message: String },

    /// Listener acquisition errors (bind failure, bad listen address)
    #[error("Listener error: {message}")]
    Listener { message: String },

    /// TLS/SSL related errors (cert load, key parse)
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// Network errors surfaced by the HTTP engine
    #[error("Network error: {message}")]
    Network { message: String },

    /// Handler construction or dispatch errors
    #[error("Handler error: {message}")]
    Handler { message: String },

    /// Filter construction errors
    #[error("Filter error: {message}")]
    Filter { message: String },

    /// File system errors (log sinks, static roots, error pages)
    #[error("File system error: {message}")]
    FileSystem { message: String },

    /// Internal server errors
    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl FasthttpdError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a route error
    pub fn route<S: Into<String>>(message: S) -> Self {
        Self::Route {
            message: message.into(),
        }
    }

    /// Create a listener error
    pub fn listener<S: Into<String>>(message: S) -> Self {
        Self::Listener {
            message: message.into(),
        }
    }

    /// Create a TLS error
    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a handler error
    pub fn handler<S: Into<String>>(message: S) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create a filter error
    pub fn filter<S: Into<String>>(message: S) -> Self {
        Self::Filter {
            message: message.into(),
        }
    }

    /// Create a file system error
    pub fn file_system<S: Into<String>>(message: S) -> Self {
        Self::FileSystem {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error aborts startup (as opposed to a per-request error)
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            FasthttpdError::Config { .. }
                | FasthttpdError::Route { .. }
                | FasthttpdError::Listener { .. }
                | FasthttpdError::Tls { .. }
                | FasthttpdError::Filter { .. }
        )
    }
}

/// Result type alias for fasthttpd operations
pub type FasthttpdResult<T> = Result<T, FasthttpdError>;

impl From<std::io::Error> for FasthttpdError {
    fn from(err: std::io::Error) -> Self {
        FasthttpdError::file_system(format!("IO error: {}", err))
    }
}

impl From<hyper::Error> for FasthttpdError {
    fn from(err: hyper::Error) -> Self {
        FasthttpdError::network(format!("HTTP error: {}", err))
    }
}

impl From<hyper::http::Error> for FasthttpdError {
    fn from(err: hyper::http::Error) -> Self {
        FasthttpdError::network(format!("HTTP error: {}", err))
    }
}

impl From<hyper::http::uri::InvalidUri> for FasthttpdError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        FasthttpdError::config(format!("Invalid URI: {}", err))
    }
}

impl From<regex::Error> for FasthttpdError {
    fn from(err: regex::Error) -> Self {
        FasthttpdError::route(format!("Regex compile failure: {}", err))
    }
}

impl From<serde_yaml::Error> for FasthttpdError {
    fn from(err: serde_yaml::Error) -> Self {
        FasthttpdError::config(format!("YAML parsing error: {}", err))
    }
}

impl From<std::net::AddrParseError> for FasthttpdError {
    fn from(err: std::net::AddrParseError) -> Self {
        FasthttpdError::listener(format!("Invalid listen address: {}", err))
    }
}

/// A joined error built while draining several fallible shutdown steps
#[derive(Debug, Default)]
pub struct ErrorList(Vec<String>);

impl ErrorList {
    pub fn push(&mut self, err: impl fmt::Display) {
        self.0.push(err.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self, what: &str) -> FasthttpdResult<()> {
        if self.0.is_empty() {
            return Ok(());
        }
        Err(FasthttpdError::internal(format!(
            "failed to {}: {}",
            what,
            self.0.join("; ")
        )))
    }
}
