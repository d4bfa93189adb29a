use thiserror::Error;

/// Missing or unresolvable configuration for one connection. Never fatal to
/// the process; the affected connection is skipped for this reconciliation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
}

/// Outcome of a single persistence write. Failed writes are dropped by
/// policy; callers decide what to log based on the failure edge.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("backend unreachable: {0}")]
    Connectivity(String),
    #[error("unknown backend or stream: {0}")]
    NotFound(String),
    #[error("write queue full")]
    QueueFull,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("graph api unreachable: {0}")]
    Connectivity(String),
    #[error("unexpected graph api response: {0}")]
    Protocol(String),
}

impl GraphError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound(_))
    }
}
