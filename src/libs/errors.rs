// Structured error type shared by the engine, the installers and the
// resolution pipeline. Each variant corresponds to one error kind the
// engine reports: the variant decides whether a failure aborts at plan
// time, fails a single resource, or aborts the whole apply.

use thiserror::Error;

/// The error type returned by every fallible envbox subsystem.
///
/// Variants map onto the failure classes the engine distinguishes:
/// - `Configuration` and `Graph` surface at plan time and abort before
///   any execution happens.
/// - `Resolution`, `Transport`, `Integrity`, `Filesystem` and `Execution`
///   fail the owning resource; the engine annotates them with the
///   resource reference and applies its fail-fast policy.
/// - `Lock` and `State` concern the persisted state store.
#[derive(Debug, Error)]
pub enum EnvboxError {
    /// Invalid manifest contents: missing required fields, unknown enum
    /// values, conflicting resource names.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Dependency graph problems: cycles or unresolved references.
    #[error("dependency graph error: {0}")]
    Graph(String),

    /// Version or package resolution failed: alias could not be resolved,
    /// registry entry missing, environment unsupported.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// Network failure or unexpected HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    /// Checksum mismatch, path traversal in an archive, malformed archive,
    /// or signature verification failure. No state mutation happens for
    /// the affected resource.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Filesystem-level failure: permissions, disk space, rename.
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// A delegation command exited non-zero.
    #[error("execution error: {0}")]
    Execution(String),

    /// Another apply holds the state lock.
    #[error("lock error: {0}")]
    Lock(String),

    /// The persisted state could not be read or written.
    #[error("state error: {0}")]
    State(String),
}

impl EnvboxError {
    /// Prefixes the error message with the owning resource reference,
    /// keeping the variant (and with it the error class) intact.
    pub fn for_resource(self, reference: &crate::schemas::resource::Ref) -> EnvboxError {
        let tag = reference.to_string();
        match self {
            EnvboxError::Configuration(m) => EnvboxError::Configuration(format!("{tag}: {m}")),
            EnvboxError::Graph(m) => EnvboxError::Graph(format!("{tag}: {m}")),
            EnvboxError::Resolution(m) => EnvboxError::Resolution(format!("{tag}: {m}")),
            EnvboxError::Transport(m) => EnvboxError::Transport(format!("{tag}: {m}")),
            EnvboxError::Integrity(m) => EnvboxError::Integrity(format!("{tag}: {m}")),
            EnvboxError::Filesystem(m) => EnvboxError::Filesystem(format!("{tag}: {m}")),
            EnvboxError::Execution(m) => EnvboxError::Execution(format!("{tag}: {m}")),
            EnvboxError::Lock(m) => EnvboxError::Lock(format!("{tag}: {m}")),
            EnvboxError::State(m) => EnvboxError::State(format!("{tag}: {m}")),
        }
    }
}

impl From<std::io::Error> for EnvboxError {
    fn from(err: std::io::Error) -> Self {
        EnvboxError::Filesystem(err.to_string())
    }
}
