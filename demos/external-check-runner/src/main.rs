//! Exercises `external_checker` against a real (or `kind`-provisioned)
//! cluster: builds a `Checker` for a trivial `echo` pod and runs it until
//! the process receives an interrupt signal.

use external_checker::{Checker, KubeApi};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn demo_pod() -> Pod {
    let mut pod = Pod::default();
    pod.spec = Some(PodSpec {
        containers: vec![Container {
            name: "probe".to_string(),
            image: Some("busybox:latest".to_string()),
            command: Some(vec!["true".to_string()]),
            ..Default::default()
        }],
        ..Default::default()
    });
    pod
}

#[tokio::main]
async fn main() {
    std::env::set_var("RUST_LOG_STYLE", "always");
    env_logger::init();

    let client = Client::try_default()
        .await
        .expect("failed to build a default Kubernetes client");
    let api = Arc::new(KubeApi::new(client, "default"));
    let checker = Checker::new(api, "demo-echo", demo_pod()).with_namespace("default");

    let cancellation = CancellationToken::new();
    let signal = cancellation.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        signal.cancel();
    });

    checker.run(cancellation).await;
    if let Err(err) = checker.shutdown().await {
        log::error!("shutdown did not complete cleanly: {}", err);
    }
}
