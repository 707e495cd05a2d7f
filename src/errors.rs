//! Error kinds surfaced by the execution engine, the periodic driver, and the
//! shutdown coordinator.
//!
//! Every fallible operation in this crate returns [`Result`], whose error
//! variant is this single [`CheckerError`] enum. No error is retried inside
//! an iteration; recovery happens at the next interval tick (see
//! [`crate::driver`]).

use thiserror::Error;

/// A `Result` is an alias of [`std::result::Result`] with its error variant
/// pre-populated with [`CheckerError`].
pub type Result<T> = std::result::Result<T, CheckerError>;

#[derive(Error, Debug)]
pub enum CheckerError {
    /// The pod template was missing, had no containers, or a container had
    /// an empty image reference.
    #[error("invalid pod spec: {0}")]
    InvalidSpec(#[from] InvalidSpecError),

    /// The namespace, pod name, or API client were unset at the start of an
    /// iteration. This indicates a programmer error in the driving
    /// supervisor, not a transient cluster condition.
    #[error("sanity check failed: {0}")]
    SanityViolation(String),

    /// Any failure surfaced by the cluster API adapter.
    #[error("cluster API request failed: {0}")]
    Api(#[from] ApiError),

    /// The pod did not reach a non-pending phase within the startup timeout.
    /// `teardown_error`, when present, is the delete failure encountered
    /// while cleaning up the stuck pod.
    #[error("failed to see pod running within timeout{}", render_teardown(.teardown_error))]
    StartupTimeout { teardown_error: Option<ApiError> },

    /// The pod did not reach a terminal phase within the max run time.
    /// `teardown_error`, when present, is the delete failure encountered
    /// while cleaning up the runaway pod.
    #[error("pod ran too long and was shut down{}", render_teardown(.teardown_error))]
    RunTimeout { teardown_error: Option<ApiError> },

    /// The phase watcher's cancellation signal fired before its target
    /// predicate was satisfied.
    #[error("pod watch was aborted before reaching the target phase")]
    WatchAborted,

    /// The upstream watch stream ended before the target predicate fired
    /// and before cancellation.
    #[error("kubernetes closed the pod watch stream before the target phase was reached")]
    WatchPrematureClose,

    /// Shutdown's poll-for-absence loop exceeded its deadline.
    #[error("pod was still present when the shutdown deadline was reached")]
    ShutdownTimeout,
}

fn render_teardown(delete_err: &Option<ApiError>) -> String {
    match delete_err {
        None => String::new(),
        Some(err) => format!(" (and cleanup delete also failed: {})", err),
    }
}

#[derive(Error, Debug)]
pub enum InvalidSpecError {
    #[error("no pod template was provided")]
    MissingTemplate,
    #[error("pod template has no containers")]
    EmptyContainers,
    #[error("container {index} ({name:?}) has an empty image reference")]
    EmptyImage { index: usize, name: String },
}

/// Wraps any failure returned by the cluster API collaborator.
///
/// Buckets the underlying client error by its broad category so that a log
/// line or a status message can distinguish "the server rejected the
/// request" from "we could not reach the server at all".
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("the cluster API server rejected the request: {0}")]
    Api(#[source] kube::Error),
    #[error("failed to connect to the cluster API server: {0}")]
    Connection(#[source] kube::Error),
    #[error("unexpected cluster API failure: {0}")]
    Other(#[source] kube::Error),

    /// The watch stream itself reported an error (as opposed to a
    /// create/delete/get call).
    #[error("pod watch stream failed: {0}")]
    WatchStream(String),
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(_) => ApiError::Api(err),
            kube::Error::Connection(_) => ApiError::Connection(err),
            _ => ApiError::Other(err),
        }
    }
}

impl From<kube_runtime::watcher::Error> for ApiError {
    fn from(err: kube_runtime::watcher::Error) -> Self {
        ApiError::WatchStream(err.to_string())
    }
}
