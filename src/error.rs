use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },

    /// The object changed since it was read. The whole pass must be retried.
    #[error("{kind} '{key}' was modified concurrently")]
    Conflict { kind: &'static str, key: String },

    #[error("invalid namespace selector: {0}")]
    InvalidSelector(String),

    #[error("{0} has no uid, cannot reference it as an owner")]
    MissingUid(String),

    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Returns true when a kube error is an API 404.
pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Returns true when a kube error is an API 409.
pub(crate) fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}
