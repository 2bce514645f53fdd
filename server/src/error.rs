use thiserror::Error;

/// Error taxonomy shared by the supervisor, the tenant stores, and the control surface.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input to create/update. Reported, never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Record store or vector index failure.
    #[error("storage failure: {0}")]
    Storage(String),

    /// A session failed to open, become ready, or close in time.
    #[error("lifecycle failure: {0}")]
    Lifecycle(String),

    /// Chat platform or generation backend failure.
    #[error("upstream failure: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound { kind, id: id.into() }
    }

    /// Stable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Storage(_) => "STORAGE",
            Error::Lifecycle(_) => "LIFECYCLE",
            Error::Upstream(_) => "UPSTREAM",
        }
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(Error::not_found("instance", "abc").code(), "NOT_FOUND");
        assert_eq!(
            Error::not_found("instance", "abc").to_string(),
            "instance not found: abc"
        );
    }

    #[test]
    fn io_errors_map_to_storage() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, Error::Storage(ref m) if m.contains("disk gone")));
    }
}
