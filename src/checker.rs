//! `Checker`: the public façade over one configured check. Owns the
//! periodic driver, the status snapshot, and the shutdown coordinator.
//!
//! Uses `tokio_util::sync::CancellationToken` to let an external signal
//! interrupt a running supervisory loop.

use crate::api::ClusterApi;
use crate::engine::{self, IterationConfig, SharedState};
use crate::errors::{CheckerError, Result};
use crate::pod;
use crate::term_colors::{cyan, red};
use k8s_openapi::api::core::v1::Pod;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run interval default: 10 minutes.
pub const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Startup timeout default: 5 minutes.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Max run time default: 15 minutes.
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(15 * 60);
/// Default reporting URL, a cluster-local DNS name.
pub const DEFAULT_REPORTING_URL: &str = "http://kuberhealthy.kuberhealthy.svc.local";
/// The environment variable consulted for the default namespace.
const NAMESPACE_ENV: &str = "POD_NAMESPACE";
/// Poll interval used by the shutdown coordinator's wait-for-absence loop.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A point-in-time read of whether the most recent iteration succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// The error buffer is empty.
    Ok,
    /// The error buffer holds the diagnostics from the most recent failed
    /// iteration.
    Failing(Vec<String>),
}

/// One configured check, driven either to completion of a single debug
/// iteration or in an infinite periodic loop until [`Checker::shutdown`]
/// is invoked.
///
/// Constructed with the pod template and check name as required
/// arguments — there is no valid half-initialized `Checker` to
/// accidentally run.
pub struct Checker<A: ClusterApi> {
    api: Arc<A>,
    check_name: String,
    namespace: String,
    pod_template: Pod,
    run_interval: Duration,
    startup_timeout: Duration,
    max_run_time: Duration,
    reporting_url: String,
    debug: bool,
    errors: Mutex<Vec<String>>,
    shared: Arc<SharedState>,
}

impl<A: ClusterApi + 'static> Checker<A> {
    /// Builds a checker for `check_name`, running `pod_template` against
    /// `api`. The namespace defaults from `POD_NAMESPACE`, read once here
    /// rather than per iteration.
    pub fn new(api: Arc<A>, check_name: impl Into<String>, pod_template: Pod) -> Self {
        let namespace = std::env::var(NAMESPACE_ENV).unwrap_or_default();
        Checker {
            api,
            check_name: check_name.into(),
            namespace,
            pod_template,
            run_interval: DEFAULT_RUN_INTERVAL,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            max_run_time: DEFAULT_MAX_RUN_TIME,
            reporting_url: DEFAULT_REPORTING_URL.to_string(),
            debug: false,
            errors: Mutex::new(Vec::new()),
            shared: Arc::new(SharedState::default()),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_run_interval(mut self, interval: Duration) -> Self {
        self.run_interval = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_max_run_time(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = max_run_time;
        self
    }

    pub fn with_reporting_url(mut self, url: impl Into<String>) -> Self {
        self.reporting_url = url.into();
        self
    }

    /// When set, [`Checker::run`] performs exactly one iteration (no
    /// initial sleep) and returns, instead of looping forever.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Returns the current status snapshot.
    pub fn status(&self) -> Status {
        let errors = self.errors.lock().unwrap();
        if errors.is_empty() {
            Status::Ok
        } else {
            Status::Failing(errors.clone())
        }
    }

    /// Returns a cloneable handle over the pod-deployed/pod-name state
    /// shared with a shutdown coordinator driven from another task.
    pub fn shared_state(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    fn iteration_config(&self) -> IterationConfig<A> {
        IterationConfig {
            api: self.api.clone(),
            check_name: self.check_name.clone(),
            namespace: self.namespace.clone(),
            startup_timeout: self.startup_timeout,
            max_run_time: self.max_run_time,
            reporting_url: self.reporting_url.clone(),
        }
    }

    /// Drives the periodic loop: sleep (unless in debug
    /// mode), run one iteration, replace the error buffer wholesale on
    /// failure, clear it at the start of every iteration otherwise so a
    /// success following a failure reports [`Status::Ok`] and not a stale
    /// [`Status::Failing`].
    ///
    /// Returns after exactly one iteration when `debug` is set; otherwise
    /// loops until `cancellation` fires.
    pub async fn run(&self, cancellation: CancellationToken) {
        loop {
            // Error buffer is cleared up front so a successful iteration
            // never leaves a stale failure visible to the status query.
            self.errors.lock().unwrap().clear();

            if !self.debug {
                tokio::select! {
                    _ = tokio::time::sleep(self.run_interval) => {}
                    _ = cancellation.cancelled() => return,
                }
            }

            let cfg = self.iteration_config();
            let outcome = tokio::select! {
                result = engine::run_iteration(&cfg, &self.pod_template, &self.shared) => result,
                _ = cancellation.cancelled() => return,
            };

            match outcome {
                Ok(()) => {
                    log::info!("check {} completed successfully", cyan(&self.check_name));
                }
                Err(err) => {
                    log::warn!(
                        "check {} {}: {}",
                        cyan(&self.check_name),
                        red("failed"),
                        err
                    );
                    *self.errors.lock().unwrap() = vec![err.to_string()];
                }
            }

            if self.debug {
                return;
            }
        }
    }

    /// Cancels the current iteration (if any), deletes this check's pod,
    /// and waits — bounded by `max run time` — for the pod to disappear
    /// from the cluster API.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.shared.is_pod_deployed() {
            return Ok(());
        }

        let deadline = tokio::time::sleep(self.max_run_time);
        tokio::pin!(deadline);

        let selector = pod::check_name_selector(&self.check_name);
        self.api.delete_by_selector(&selector).await?;

        let pod_name = self.shared.current_pod_name();
        loop {
            if let Some(name) = &pod_name {
                tokio::select! {
                    result = self.api.get(name) => {
                        if result?.is_none() {
                            return Ok(());
                        }
                    }
                    _ = &mut deadline => return Err(CheckerError::ShutdownTimeout),
                }
            } else {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(SHUTDOWN_POLL_INTERVAL) => {}
                _ = &mut deadline => return Err(CheckerError::ShutdownTimeout),
            }
        }
    }
}
