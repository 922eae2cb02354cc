//! Error types for the launcher core.
//!
//! Every error carries a kind plus a human-readable annotation. Per-instance
//! failures are recovered locally (captured on the instance record and
//! surfaced through status channels); only infrastructure failures are
//! returned from the public entry points.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors originated by the launcher core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed input at the public surface.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No such instance, override, or service.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registration where uniqueness is required.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Service artifact is missing or unusable.
    #[error("broken service: {0}")]
    BrokenService(String),

    /// Runtime spec could not be generated.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Worker or pool fault.
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation attempted after shutdown.
    #[error("launcher is shut down")]
    Shutdown,

    /// Backing store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Pass-through from the runner.
    #[error("runner error: {0}")]
    Runner(String),
}

impl Error {
    /// Short tag for the error kind, used in status reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid-argument",
            Self::NotFound(_) => "not-found",
            Self::AlreadyExists(_) => "already-exists",
            Self::BrokenService(_) => "broken-service",
            Self::InvalidSpec(_) => "invalid-spec",
            Self::Internal(_) => "internal",
            Self::Shutdown => "shutdown",
            Self::Storage(_) => "storage",
            Self::Runner(_) => "runner",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_lowercase_and_annotated() {
        let err = Error::BrokenService("service1 has no image".to_string());
        assert_eq!(err.to_string(), "broken service: service1 has no image");
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(Error::Shutdown.kind(), "shutdown");
        assert_eq!(Error::Runner(String::new()).kind(), "runner");
    }
}
