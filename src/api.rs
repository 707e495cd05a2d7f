//! The thin boundary over the cluster API.
//!
//! [`ClusterApi`] is a trait rather than a concrete `kube::Api<Pod>` so that
//! the execution engine, phase watcher, and shutdown coordinator can be
//! driven against an in-memory fake in tests, the same seam a `Box<dyn
//! Api<Pod>>` abstraction gives a pod-watcher to stay testable without a
//! real cluster. [`KubeApi`] is the production implementation: a namespaced
//! `kube::Api<Pod>` wrapper that panics only at client construction, never
//! on a per-call basis.

use crate::errors::{ApiError, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::Api;
use kube::Client;
use kube_runtime::watcher;

/// One change observed on a watched pod.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

/// The cluster API collaborator. Every operation may fail transparently
/// with [`ApiError`](crate::errors::ApiError).
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Creates `pod` in the configured namespace and returns the created
    /// pod (its name is authoritative; the server may have mutated it).
    async fn create(&self, pod: Pod) -> Result<Pod>;

    /// Deletes every pod matching `selector`. Idempotent: absence of
    /// matches is success, not an error.
    async fn delete_by_selector(&self, selector: &str) -> Result<()>;

    /// Deletes the single pod named `name`. Idempotent in the same sense
    /// as [`delete_by_selector`](ClusterApi::delete_by_selector).
    async fn delete_one(&self, name: &str) -> Result<()>;

    /// Returns the pod named `name`, or `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Pod>>;

    /// Opens an event stream of pods matching `selector`. The stream ends
    /// on server disconnect or when the returned stream is dropped.
    async fn watch(&self, selector: &str) -> Result<BoxStream<'static, Result<PodEvent>>>;
}

/// A `kube::Api<Pod>`-backed [`ClusterApi`] scoped to one namespace.
pub struct KubeApi {
    client: Api<Pod>,
}

impl KubeApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        KubeApi {
            client: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeApi {
    async fn create(&self, pod: Pod) -> Result<Pod> {
        Ok(self
            .client
            .create(&PostParams::default(), &pod)
            .await
            .map_err(ApiError::from)?)
    }

    async fn delete_by_selector(&self, selector: &str) -> Result<()> {
        match self
            .client
            .delete_collection(&DeleteParams::default(), &ListParams::default().labels(selector))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(ApiError::from(err).into()),
        }
    }

    async fn delete_one(&self, name: &str) -> Result<()> {
        match self.client.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(err) => Err(ApiError::from(err).into()),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<Pod>> {
        match self.client.get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(err) => Err(ApiError::from(err).into()),
        }
    }

    async fn watch(&self, selector: &str) -> Result<BoxStream<'static, Result<PodEvent>>> {
        let stream = watcher::watcher(self.client.clone(), ListParams::default().labels(selector));
        let translated = stream.flat_map(|event| {
            let events: Vec<Result<PodEvent>> = match event {
                Ok(watcher::Event::Applied(pod)) => vec![Ok(PodEvent::Modified(pod))],
                Ok(watcher::Event::Deleted(pod)) => vec![Ok(PodEvent::Deleted(pod))],
                Ok(watcher::Event::Restarted(pods)) => {
                    pods.into_iter().map(|pod| Ok(PodEvent::Added(pod))).collect()
                }
                Err(err) => {
                    log::warn!("watch stream reported an error: {}", err);
                    vec![Err(ApiError::from(err).into())]
                }
            };
            futures_util::stream::iter(events)
        });
        Ok(translated.boxed())
    }
}

/// An in-memory [`ClusterApi`] used to drive the execution engine, phase
/// watcher, and shutdown coordinator in tests without a real cluster.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    pub struct FakeApi {
        inner: Mutex<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        pods: BTreeMap<String, Pod>,
        create_calls: Vec<String>,
        delete_selector_calls: Vec<String>,
        delete_one_calls: Vec<String>,
        fail_create: Option<String>,
        fail_delete: Option<String>,
        senders: Vec<(BTreeMap<String, String>, mpsc::UnboundedSender<Result<PodEvent>>)>,
    }

    impl FakeApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_create(&self, message: &str) {
            self.inner.lock().unwrap().fail_create = Some(message.to_string());
        }

        pub fn fail_deletes(&self, message: &str) {
            self.inner.lock().unwrap().fail_delete = Some(message.to_string());
        }

        pub fn seed_pod(&self, pod: Pod) {
            let name = pod.metadata.name.clone().unwrap();
            self.inner.lock().unwrap().pods.insert(name, pod);
        }

        pub fn create_call_count(&self) -> usize {
            self.inner.lock().unwrap().create_calls.len()
        }

        /// The most recently created pod, if any — lets tests discover the
        /// run ID and name the engine minted without threading them back
        /// out of `run_iteration`.
        pub fn last_created(&self) -> Option<Pod> {
            let inner = self.inner.lock().unwrap();
            let name = inner.create_calls.last()?;
            inner.pods.get(name).cloned()
        }

        pub fn delete_call_count(&self) -> usize {
            let inner = self.inner.lock().unwrap();
            inner.delete_selector_calls.len() + inner.delete_one_calls.len()
        }

        /// Pushes an event to every open watch stream whose selector
        /// matches the pod, and updates the fake's view of cluster state
        /// to match.
        pub fn push_event(&self, event: PodEvent) {
            let mut inner = self.inner.lock().unwrap();
            let pod = match &event {
                PodEvent::Added(pod) | PodEvent::Modified(pod) => {
                    inner
                        .pods
                        .insert(pod.metadata.name.clone().unwrap(), pod.clone());
                    pod.clone()
                }
                PodEvent::Deleted(pod) => {
                    inner.pods.remove(pod.metadata.name.as_deref().unwrap_or(""));
                    pod.clone()
                }
            };
            inner
                .senders
                .retain(|(selector, tx)| !label_subset(&pod, selector) || tx.send(Ok(event.clone())).is_ok());
        }
    }

    fn label_subset(pod: &Pod, wanted: &BTreeMap<String, String>) -> bool {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    fn parse_selector(selector: &str) -> BTreeMap<String, String> {
        selector
            .split(',')
            .filter_map(|pair| {
                let mut parts = pair.splitn(2, '=');
                Some((parts.next()?.to_string(), parts.next()?.to_string()))
            })
            .collect()
    }

    #[async_trait]
    impl ClusterApi for FakeApi {
        async fn create(&self, mut pod: Pod) -> Result<Pod> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(message) = inner.fail_create.take() {
                return Err(ApiError::WatchStream(message).into());
            }
            let name = pod
                .metadata
                .name
                .clone()
                .unwrap_or_else(|| "fake-pod".to_string());
            pod.metadata = ObjectMeta {
                name: Some(name.clone()),
                labels: pod.metadata.labels.clone(),
                ..Default::default()
            };
            inner.pods.insert(name.clone(), pod.clone());
            inner.create_calls.push(name);
            Ok(pod)
        }

        async fn delete_by_selector(&self, selector: &str) -> Result<()> {
            let wanted = parse_selector(selector);
            let mut inner = self.inner.lock().unwrap();
            if let Some(message) = inner.fail_delete.clone() {
                return Err(ApiError::WatchStream(message).into());
            }
            let doomed: Vec<String> = inner
                .pods
                .values()
                .filter(|pod| label_subset(pod, &wanted))
                .filter_map(|pod| pod.metadata.name.clone())
                .collect();
            for name in &doomed {
                inner.pods.remove(name);
            }
            inner.delete_selector_calls.push(selector.to_string());
            Ok(())
        }

        async fn delete_one(&self, name: &str) -> Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(message) = inner.fail_delete.clone() {
                return Err(ApiError::WatchStream(message).into());
            }
            inner.pods.remove(name);
            inner.delete_one_calls.push(name.to_string());
            Ok(())
        }

        async fn get(&self, name: &str) -> Result<Option<Pod>> {
            Ok(self.inner.lock().unwrap().pods.get(name).cloned())
        }

        async fn watch(&self, selector: &str) -> Result<BoxStream<'static, Result<PodEvent>>> {
            let wanted = parse_selector(selector);
            let (tx, rx) = mpsc::unbounded_channel();
            {
                let inner = self.inner.lock().unwrap();
                for pod in inner.pods.values().filter(|pod| label_subset(pod, &wanted)) {
                    let _ = tx.send(Ok(PodEvent::Added(pod.clone())));
                }
            }
            self.inner.lock().unwrap().senders.push((wanted, tx));
            Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async {
                rx.recv().await.map(|item| (item, rx))
            })))
        }
    }
}
