//! A per-check periodic reconciler: runs a user-defined pod to completion
//! on a fixed interval, watches its lifecycle through a startup and a
//! run-time timeout, and reaps it before starting the next iteration.
//!
//! The crate never initializes a logger — only `log::{trace,debug,info,
//! warn,error}` calls are emitted. A binary embedding this crate is
//! expected to install `env_logger` (or another `log` backend) at
//! startup.

pub mod api;
pub mod checker;
pub mod engine;
pub mod errors;
pub mod pod;
pub mod runid;
mod term_colors;
mod watcher;

pub use api::{ClusterApi, KubeApi, PodEvent};
pub use checker::{Checker, Status};
pub use engine::SharedState;
pub use errors::{ApiError, CheckerError, InvalidSpecError, Result};
pub use pod::{Phase, PodExt};
