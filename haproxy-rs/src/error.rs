//! Error types for haproxy-rs

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for synthesis operations
pub type Result<T> = std::result::Result<T, HaproxyError>;

/// Which kind of derived identifier collided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    /// A frontend ACL match name (`<domain>_req`)
    Acl,
    /// A `backend` block name
    Backend,
    /// A `server` id inside one backend
    Server,
    /// A routed domain
    Domain,
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifierKind::Acl => write!(f, "ACL"),
            IdentifierKind::Backend => write!(f, "backend"),
            IdentifierKind::Server => write!(f, "server"),
            IdentifierKind::Domain => write!(f, "domain"),
        }
    }
}

/// Synthesis error types
#[derive(Error, Debug)]
pub enum HaproxyError {
    /// The configuration skeleton could not be read
    #[error("Failed to load template {path:?}: {source}")]
    TemplateLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A placeholder in the skeleton has no value
    #[error("Template variable '{variable}' has no value")]
    Render { variable: String },

    /// No domains or groups were supplied
    #[error("Topology has no backend groups")]
    EmptyTopology,

    /// Two inputs derive the same identifier
    #[error("{kind} name '{name}' is derived from both '{first}' and '{second}'")]
    NameCollision {
        kind: IdentifierKind,
        name: String,
        first: String,
        second: String,
    },

    /// Invalid options or deployment file
    #[error("Configuration error: {0}")]
    Config(String),

    /// The orchestration collaborator refused a request
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),
}
