//! Error types for the test environment

use thiserror::Error;

/// Main error type for environment lifecycle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster command or API call failed
    #[error("cluster error: {0}")]
    Cluster(String),

    /// A resource already exists or conflicts with an existing one.
    /// Non-fatal at most call sites (logged and skipped).
    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    /// Materializing a manifest from its template failed
    #[error("manifest generation failed: {0}")]
    ManifestGeneration(String),

    /// Control-plane installation failed
    #[error("install failed: {0}")]
    Install(String),

    /// The configuration snapshot requests an impossible combination
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),

    /// A readiness check exhausted its bound
    #[error("readiness check failed: {0}")]
    Readiness(#[from] crate::poll::PollError),

    /// Teardown finished but one or more steps failed.
    /// Carries every recorded step failure; teardown never aborts early.
    #[error("teardown completed with {} failure(s): {}", .0.len(), .0.join("; "))]
    Teardown(Vec<String>),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a cluster error with the given message
    pub fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    /// Create a resource-conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ResourceConflict(msg.into())
    }

    /// Create a manifest-generation error with the given message
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::ManifestGeneration(msg.into())
    }

    /// Create an install error with the given message
    pub fn install(msg: impl Into<String>) -> Self {
        Self::Install(msg.into())
    }

    /// Create a configuration-conflict error with the given message
    pub fn config_conflict(msg: impl Into<String>) -> Self {
        Self::ConfigurationConflict(msg.into())
    }

    /// Whether this error is a conflict with an existing resource.
    ///
    /// Setup treats these as non-fatal (e.g. the ingress TLS secret
    /// surviving a previous run).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ResourceConflict(_))
    }
}
