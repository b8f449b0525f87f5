//! Server error types.

use thiserror::Error;

/// Errors raised while starting or running the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested `host:port`.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Listener I/O failed after binding.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The metrics recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

impl ServerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Io(_) => "io",
            Self::Metrics(_) => "metrics",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_address() {
        let err = ServerError::Bind {
            addr: "127.0.0.1:80".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "failed to bind 127.0.0.1:80: denied");
        assert_eq!(err.error_kind(), "bind");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::other("boom");
        let err: ServerError = io.into();
        assert_eq!(err.error_kind(), "io");
        assert!(err.to_string().contains("boom"));
    }
}
