//! End-to-end scenarios driven against the in-memory fake cluster,
//! exercising `Checker` the way a supervisor embedding this crate would:
//! build it, run a debug iteration, read back its status, shut it down.

use external_checker::api::fake::FakeApi;
use external_checker::api::PodEvent;
use external_checker::{Checker, ClusterApi, Status};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn probe_template() -> Pod {
    let mut pod = Pod::default();
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

async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not met in time");
}

#[tokio::test]
async fn debug_run_completes_a_pod_through_to_success() {
    let api = Arc::new(FakeApi::new());
    let checker = Checker::new(api.clone(), "demo", probe_template())
        .with_namespace("default")
        .with_debug(true)
        .with_startup_timeout(Duration::from_secs(5))
        .with_max_run_time(Duration::from_secs(5));

    let driver = tokio::spawn(async move {
        checker.run(CancellationToken::new()).await;
        checker
    });

    let created = wait_for(|| api.last_created()).await;
    let mut running = created.clone();
    running.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        ..Default::default()
    });
    api.push_event(PodEvent::Modified(running));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut succeeded = created;
    succeeded.status = Some(PodStatus {
        phase: Some("Succeeded".to_string()),
        ..Default::default()
    });
    api.push_event(PodEvent::Modified(succeeded));

    let checker = driver.await.unwrap();
    assert_eq!(checker.status(), Status::Ok);
}

#[tokio::test]
async fn debug_run_reports_invalid_spec_without_touching_the_cluster() {
    let api = Arc::new(FakeApi::new());
    let checker = Checker::new(api.clone(), "demo", Pod::default())
        .with_namespace("default")
        .with_debug(true);

    checker.run(CancellationToken::new()).await;

    match checker.status() {
        Status::Failing(errors) => assert_eq!(errors.len(), 1),
        Status::Ok => panic!("an empty pod template must fail validation"),
    }
    assert_eq!(api.create_call_count(), 0);
}

#[tokio::test]
async fn stray_pods_are_reaped_before_a_new_run() {
    let api = Arc::new(FakeApi::new());
    let mut stray = probe_template();
    stray.metadata.name = Some("stray".to_string());
    let mut labels = std::collections::BTreeMap::new();
    labels.insert("kuberhealthy-check-name".to_string(), "demo".to_string());
    labels.insert("kuberhealthy-run-id".to_string(), "old-run".to_string());
    stray.metadata.labels = Some(labels);
    api.seed_pod(stray);

    let checker = Checker::new(api.clone(), "demo", probe_template())
        .with_namespace("default")
        .with_debug(true)
        .with_startup_timeout(Duration::from_millis(30));

    checker.run(CancellationToken::new()).await;

    // The stray never got the chance to report Running, so this debug
    // iteration times out waiting for the *new* pod — but the important
    // assertion is that the old one was deleted up front.
    assert!(matches!(checker.status(), Status::Failing(_)));
    assert_eq!(api.get("stray").await.unwrap(), None);
}

#[tokio::test]
async fn shutdown_deletes_a_live_pod_and_waits_for_its_absence() {
    let api = Arc::new(FakeApi::new());
    let checker = Arc::new(
        Checker::new(api.clone(), "demo", probe_template())
            .with_namespace("default")
            .with_startup_timeout(Duration::from_secs(5))
            .with_max_run_time(Duration::from_secs(30)),
    );

    let cancellation = CancellationToken::new();
    let run_checker = checker.clone();
    let run_cancellation = cancellation.clone();
    let driver = tokio::spawn(async move { run_checker.run(run_cancellation).await });

    let created = wait_for(|| api.last_created()).await;
    let mut running = created.clone();
    running.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        ..Default::default()
    });
    api.push_event(PodEvent::Modified(running));

    // Give the engine a moment to observe Running and mark pod-deployed.
    tokio::time::sleep(Duration::from_millis(20)).await;

    cancellation.cancel();
    driver.await.unwrap();

    // Shutdown's own `delete_by_selector` removes the fake's record of the
    // pod synchronously, so the poll-for-absence loop should see it gone on
    // its very first check.
    let result = checker.shutdown().await;
    assert!(result.is_ok(), "expected shutdown to succeed, got {:?}", result);
    assert_eq!(api.get(created.metadata.name.as_deref().unwrap()).await.unwrap(), None);
}

// Pauses the clock and jumps it forward with `tokio::time::advance` rather
// than sleeping in real time, so the default (minutes-long) startup timeout
// can be exercised exactly as configured without making the suite slow.
// Driven through `tokio_test::block_on` instead of `#[tokio::test]` so the
// runtime is paused from the very first poll.
#[test]
fn startup_timeout_surfaces_as_a_distinct_error_kind() {
    tokio_test::block_on(async {
        tokio::time::pause();
        let api = Arc::new(FakeApi::new());
        let checker = Arc::new(
            Checker::new(api.clone(), "demo", probe_template())
                .with_namespace("default")
                .with_debug(true),
        );

        let run_checker = checker.clone();
        let driver = tokio::spawn(async move { run_checker.run(CancellationToken::new()).await });

        wait_for(|| api.last_created()).await;
        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        driver.await.unwrap();

        match checker.status() {
            Status::Failing(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("running"));
            }
            Status::Ok => panic!("expected a startup timeout failure"),
        }
    });
}
