use thiserror::Error;

/// Failure taxonomy shared by both extenders.
///
/// Placement and cache mutators return these so the HTTP surface can surface
/// the message verbatim in the extender response `Error` field, and so the
/// work-queue consumers can tell retryable failures from drops.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request input: conflicting pod annotations, odd xe-link GPU
    /// count, empty node list and the like.
    #[error("bad arguments: {0}")]
    BadArgs(String),

    /// No feasible placement for the pod on the candidate node.
    #[error("will not fit: {0}")]
    WillNotFit(String),

    /// Pod, node, policy or metric vanished between lookups.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bind request references a pod UID that no longer matches.
    #[error("stale pod UID: expected {expected}, got {got}")]
    BadUid { expected: String, got: String },

    /// Same-GPU constraint violation or prohibited resource request.
    #[error("resource conflict: {0}")]
    ResConflict(String),

    /// Malformed pod annotation content.
    #[error("malformed annotation: {0}")]
    Annotation(String),

    /// Resource-map arithmetic wrapped past i64 range.
    #[error("resource overflow: {0}")]
    Overflow(String),

    /// Negative amount, missing subtract key, zero or negative divider.
    #[error("invalid input: {0}")]
    Input(String),

    /// Work-queue item carried an action the handler does not know.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// HTTP payload could not be decoded or encoded.
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("kubernetes api: {0}")]
    Api(#[from] kube::Error),
}

impl Error {
    /// Capacity misses keep a recognizable reason in extender responses.
    pub fn not_enough_resources(node: &str) -> Self {
        Error::WillNotFit(format!("Not enough GPU-resources for deployment on node {node}"))
    }

    pub fn is_will_not_fit(&self) -> bool {
        matches!(self, Error::WillNotFit(_))
    }

    pub fn is_retryable(&self) -> bool {
        // queue consumers requeue everything except items nobody can handle
        !matches!(self, Error::UnknownAction(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
