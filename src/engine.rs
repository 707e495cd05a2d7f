//! The execution engine: one iteration of
//! `MintID → Validate → Decorate → SanityCheck → DeleteStrays → Create →
//! AwaitRunning → AwaitTerminal → Done`.
//!
//! Each await phase races a [`crate::watcher::PhaseWatch`] against a plain
//! timeout, the same shape a daemon racing a health-check coroutine against
//! an event stream with `select!` + `pin_mut!` would use.

use crate::api::ClusterApi;
use crate::errors::{ApiError, CheckerError, Result};
use crate::pod;
use crate::term_colors::{cyan, green, orange, red};
use crate::watcher::{self, PhaseWatch};
use k8s_openapi::api::core::v1::Pod;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// State shared between one running iteration and the shutdown
/// coordinator: whether a pod is currently live, and its name if so.
///
/// `pod_deployed` and `pod_name` are written by the engine and read by
/// shutdown, which may run on a different task.
#[derive(Default)]
pub struct SharedState {
    pod_deployed: Mutex<bool>,
    pod_name: Mutex<Option<String>>,
}

impl SharedState {
    pub fn is_pod_deployed(&self) -> bool {
        *self.pod_deployed.lock().unwrap()
    }

    pub fn current_pod_name(&self) -> Option<String> {
        self.pod_name.lock().unwrap().clone()
    }

    fn set_deployed(&self, name: &str) {
        *self.pod_deployed.lock().unwrap() = true;
        *self.pod_name.lock().unwrap() = Some(name.to_string());
    }

    fn set_torn_down(&self) {
        *self.pod_deployed.lock().unwrap() = false;
        *self.pod_name.lock().unwrap() = None;
    }
}

/// Everything one iteration needs, independent of the `Checker` that owns
/// it. `api` is `Arc`-wrapped because the phase watcher spawns a task that
/// must outlive the borrow of a single function call.
pub struct IterationConfig<A: ClusterApi> {
    pub api: Arc<A>,
    pub check_name: String,
    pub namespace: String,
    pub startup_timeout: Duration,
    pub max_run_time: Duration,
    pub reporting_url: String,
}

/// Runs exactly one iteration of the execution engine against `template`.
pub async fn run_iteration<A: ClusterApi + 'static>(
    cfg: &IterationConfig<A>,
    template: &Pod,
    shared: &SharedState,
) -> Result<()> {
    // MintID
    let run_id = crate::runid::generate();

    // Validate
    pod::validate(Some(template))?;

    // SanityCheck
    let pod_name = pod::exposed_name(&cfg.check_name);
    if cfg.namespace.is_empty() {
        return Err(CheckerError::SanityViolation(
            "namespace is empty".to_string(),
        ));
    }
    if cfg.check_name.is_empty() {
        return Err(CheckerError::SanityViolation(
            "check name is empty".to_string(),
        ));
    }
    if pod_name.is_empty() {
        return Err(CheckerError::SanityViolation(
            "pod name is empty".to_string(),
        ));
    }

    // Decorate
    let decorated = pod::decorate(template.clone(), &cfg.check_name, &run_id, &cfg.reporting_url);

    log::info!(
        "starting iteration {} for check {}",
        cyan(&run_id),
        cyan(&cfg.check_name)
    );

    // DeleteStrays
    let stray_selector = pod::check_name_selector(&cfg.check_name);
    cfg.api
        .delete_by_selector(&stray_selector)
        .await
        .map_err(|err| wrap_api(err, "failed to clean up pods before starting external checker"))?;

    // Create
    let created = cfg.api.create(decorated).await?;
    let pod_name = created.metadata.name.clone().unwrap_or(pod_name);
    shared.set_deployed(&pod_name);
    log::debug!("created pod {}", cyan(&pod_name));

    let run_selector = pod::run_id_selector(&cfg.check_name, &run_id);

    // AwaitRunning
    if let Err(err) = await_phase(
        cfg,
        &run_selector,
        &run_id,
        cfg.startup_timeout,
        watcher::running_or_terminal,
        CheckerError::WatchAborted,
        CheckerError::WatchPrematureClose,
    )
    .await
    {
        let teardown_error = delete_one(cfg, &pod_name).await.err();
        shared.set_torn_down();
        log::error!(
            "pod {} {} to start within {:?}: {}",
            cyan(&pod_name),
            red("failed"),
            cfg.startup_timeout,
            err
        );
        return Err(CheckerError::StartupTimeout {
            teardown_error: teardown_error.map(into_api_error),
        });
    }
    log::info!("pod {} entered the running phase", cyan(&pod_name));

    // AwaitTerminal
    match await_phase(
        cfg,
        &run_selector,
        &run_id,
        cfg.max_run_time,
        watcher::terminal,
        CheckerError::WatchAborted,
        CheckerError::WatchPrematureClose,
    )
    .await
    {
        Ok(()) => {
            log::info!(
                "pod {} {} for check {}",
                cyan(&pod_name),
                green("completed"),
                cyan(&cfg.check_name)
            );
        }
        Err(err) => {
            let teardown_error = delete_one(cfg, &pod_name).await.err();
            shared.set_torn_down();
            log::error!(
                "pod {} ran longer than {} and was {}: {}",
                cyan(&pod_name),
                orange(format!("{:?}", cfg.max_run_time)),
                red("shut down"),
                err
            );
            return Err(CheckerError::RunTimeout {
                teardown_error: teardown_error.map(into_api_error),
            });
        }
    }

    // Done: eagerly reap this iteration's pod rather than leaving
    // pod-deployed stale-true until the next DeleteStrays call.
    cfg.api
        .delete_by_selector(&stray_selector)
        .await
        .map_err(|err| wrap_api(err, "failed to clean up pods after completed iteration"))?;
    shared.set_torn_down();
    Ok(())
}

async fn await_phase<A, F>(
    cfg: &IterationConfig<A>,
    selector: &str,
    run_id: &str,
    timeout: Duration,
    target: F,
    on_aborted: CheckerError,
    on_premature_close: CheckerError,
) -> Result<()>
where
    A: ClusterApi + 'static,
    F: Fn(pod::Phase) -> bool + Send + 'static,
{
    let watch =
        PhaseWatch::spawn(cfg.api.clone(), selector.to_string(), run_id.to_string(), target).await?;
    let (mut cancel, outcome) = watch.into_parts();
    tokio::pin!(outcome);
    let timer = tokio::time::sleep(timeout);
    tokio::pin!(timer);
    tokio::select! {
        _ = &mut timer => {
            if let Some(tx) = cancel.take() {
                let _ = tx.send(());
            }
            Err(CheckerError::WatchAborted)
        }
        result = &mut outcome => {
            let outcome = result.unwrap_or(watcher::Outcome::Aborted);
            watcher::into_result(outcome, on_aborted, on_premature_close).map(|_| ())
        }
    }
}

async fn delete_one<A: ClusterApi>(cfg: &IterationConfig<A>, pod_name: &str) -> Result<()> {
    cfg.api.delete_one(pod_name).await
}

fn into_api_error(err: CheckerError) -> ApiError {
    match err {
        CheckerError::Api(api_err) => api_err,
        other => ApiError::WatchStream(other.to_string()),
    }
}

fn wrap_api(err: CheckerError, context: &str) -> CheckerError {
    match err {
        CheckerError::Api(api_err) => {
            CheckerError::Api(ApiError::WatchStream(format!("{}: {}", context, api_err)))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeApi;
    use crate::api::PodEvent;
    use crate::pod::empty_template;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodStatus};

    fn template() -> Pod {
        let mut pod = empty_template("probe");
        pod.spec = Some(PodSpec {
            containers: vec![Container {
                name: "probe".to_string(),
                image: Some("echo:latest".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });
        pod
    }

    fn cfg(api: Arc<FakeApi>) -> IterationConfig<FakeApi> {
        IterationConfig {
            api,
            check_name: "demo".to_string(),
            namespace: "default".to_string(),
            startup_timeout: Duration::from_millis(200),
            max_run_time: Duration::from_millis(200),
            reporting_url: "http://kuberhealthy.kuberhealthy.svc.local".to_string(),
        }
    }

    #[tokio::test]
    async fn rejects_invalid_template() {
        let api = Arc::new(FakeApi::new());
        let shared = SharedState::default();
        let bad = empty_template("probe");
        let err = run_iteration(&cfg(api), &bad, &shared).await.unwrap_err();
        assert!(matches!(err, CheckerError::InvalidSpec(_)));
        assert!(!shared.is_pod_deployed());
    }

    #[tokio::test]
    async fn sanity_check_rejects_empty_namespace() {
        let api = Arc::new(FakeApi::new());
        let shared = SharedState::default();
        let mut config = cfg(api);
        config.namespace = String::new();
        let err = run_iteration(&config, &template(), &shared).await.unwrap_err();
        assert!(matches!(err, CheckerError::SanityViolation(_)));
    }

    #[tokio::test]
    async fn happy_path_reaps_pod_at_close() {
        let api = Arc::new(FakeApi::new());
        let shared = SharedState::default();
        let config = cfg(api.clone());
        let tmpl = template();

        let driver = tokio::spawn(async move { run_iteration(&config, &tmpl, &shared).await });

        let created = wait_for(|| api.last_created()).await;
        let mut running = created.clone();
        running.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        api.push_event(PodEvent::Modified(running));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut succeeded = created.clone();
        succeeded.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        api.push_event(PodEvent::Modified(succeeded));

        let result = driver.await.unwrap();
        assert!(result.is_ok(), "expected success, got {:?}", result);
        // DeleteStrays before create, plus the eager reap at close.
        assert_eq!(api.delete_call_count(), 2);
    }

    // The next two tests pause tokio's clock and jump it forward with
    // `tokio::time::advance` rather than sleeping in real time, so the
    // default (minutes-long) startup/run timeouts can be exercised exactly
    // as configured without making the suite slow. They drive their future
    // through `tokio_test::block_on` instead of `#[tokio::test]` so the
    // runtime is paused from the very first poll.

    #[test]
    fn startup_timeout_deletes_pod_and_reports_error() {
        tokio_test::block_on(async {
            tokio::time::pause();
            let api = Arc::new(FakeApi::new());
            let shared = SharedState::default();
            let mut config = cfg(api.clone());
            config.startup_timeout = Duration::from_secs(5 * 60);
            let tmpl = template();

            let driver = tokio::spawn(async move { run_iteration(&config, &tmpl, &shared).await });
            wait_for(|| api.last_created()).await;
            tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;

            let err = driver.await.unwrap().unwrap_err();
            assert!(matches!(err, CheckerError::StartupTimeout { .. }));
            // DeleteStrays before create, plus the timeout teardown delete.
            assert_eq!(api.delete_call_count(), 2);
        });
    }

    #[test]
    fn run_timeout_deletes_pod_and_reports_error() {
        tokio_test::block_on(async {
            tokio::time::pause();
            let api = Arc::new(FakeApi::new());
            let shared = SharedState::default();
            let mut config = cfg(api.clone());
            config.max_run_time = Duration::from_secs(15 * 60);
            let tmpl = template();

            let driver = tokio::spawn(async move { run_iteration(&config, &tmpl, &shared).await });
            let created = wait_for(|| api.last_created()).await;
            let mut running = created;
            running.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            });
            api.push_event(PodEvent::Modified(running));

            tokio::time::advance(Duration::from_secs(15 * 60 + 1)).await;

            let err = driver.await.unwrap().unwrap_err();
            assert!(matches!(err, CheckerError::RunTimeout { .. }));
        });
    }

    async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
        for _ in 0..200 {
            if let Some(value) = probe() {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition was not met in time");
    }
}
