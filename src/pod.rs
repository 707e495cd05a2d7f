//! The pod-spec preparer (validate + decorate) and a small [`PodExt`]
//! extension trait used to read the coarse phase off of a pod's status.
//!
//! `PodExt` answers narrow yes/no questions about a pod rather than
//! exposing the raw `k8s_openapi` status struct to callers: which coarse
//! `Phase` is this pod currently in, and what run ID does it carry.

use crate::errors::{InvalidSpecError, Result};
use k8s_openapi::api::core::v1::{EnvVar, Pod};
use std::collections::BTreeMap;

pub const CHECK_NAME_LABEL: &str = "kuberhealthy-check-name";
pub const RUN_ID_LABEL: &str = "kuberhealthy-run-id";
pub const REPORTING_URL_ENV: &str = "KUBERHEALTHY_URL";
pub const RUN_ID_ENV: &str = "KUBERHEALTHY_RUN_ID";

/// Fixed prefix every check's pod is exposed to the cluster under.
pub const EXPOSED_NAME_PREFIX: &str = "external-check";
/// Kubernetes' DNS label length limit, enforced on the exposed name below.
const MAX_NAME_LEN: usize = 63;

/// Derives the Kubernetes object name a check's pod is created under:
/// `external-check-<check_name>`, truncated to stay within the 63-character
/// DNS label limit the same way a name-mangling helper trims an overlong
/// prefix rather than have the API server reject the create outright.
pub fn exposed_name(check_name: &str) -> String {
    let full = format!("{}-{}", EXPOSED_NAME_PREFIX, check_name);
    if full.len() <= MAX_NAME_LEN {
        full
    } else {
        full.chars().take(MAX_NAME_LEN).collect()
    }
}

/// The cluster API's coarse pod state.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    pub fn is_running_or_terminal(self) -> bool {
        matches!(self, Phase::Running | Phase::Failed)
    }
}

/// `PodExt` is an extension trait used to answer common questions about
/// pods observed over a watch stream.
pub trait PodExt {
    fn phase(&self) -> Phase;
    fn run_id_label(&self) -> Option<&str>;
}

impl PodExt for Pod {
    fn phase(&self) -> Phase {
        match self
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
        {
            Some("Pending") => Phase::Pending,
            Some("Running") => Phase::Running,
            Some("Succeeded") => Phase::Succeeded,
            Some("Failed") => Phase::Failed,
            _ => Phase::Unknown,
        }
    }

    fn run_id_label(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(RUN_ID_LABEL))
            .map(String::as_str)
    }
}

/// Validates a caller-supplied pod template.
///
/// Fails with [`InvalidSpecError`] when the template is absent, has no
/// containers, or any container has an empty image reference.
pub fn validate(template: Option<&Pod>) -> Result<()> {
    let template = template.ok_or(InvalidSpecError::MissingTemplate)?;
    let containers = template
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or(&[]);
    if containers.is_empty() {
        return Err(InvalidSpecError::EmptyContainers.into());
    }
    for (index, container) in containers.iter().enumerate() {
        if container.image.as_deref().unwrap_or("").is_empty() {
            return Err(InvalidSpecError::EmptyImage {
                index,
                name: container.name.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Decorates a validated pod template for one iteration.
///
/// This is deterministic: for a fixed `template`, `check_name`, `run_id`,
/// and `reporting_url`, the output is byte-identical. It does not touch any
/// field outside of name, hostname, per-container env, restart policy, and
/// the two identity labels — node selectors, tolerations, resource
/// requests, volumes, and service accounts all pass through unmodified.
pub fn decorate(mut template: Pod, check_name: &str, run_id: &str, reporting_url: &str) -> Pod {
    {
        let spec = template
            .spec
            .get_or_insert_with(k8s_openapi::api::core::v1::PodSpec::default);
        spec.hostname = Some(check_name.to_string());
        spec.restart_policy = Some("Never".to_string());
        for container in spec.containers.iter_mut() {
            let env = container.env.get_or_insert_with(Vec::new);
            env.push(EnvVar {
                name: REPORTING_URL_ENV.to_string(),
                value: Some(reporting_url.to_string()),
                value_from: None,
            });
            env.push(EnvVar {
                name: RUN_ID_ENV.to_string(),
                value: Some(run_id.to_string()),
                value_from: None,
            });
        }
    }
    template.metadata.name = Some(exposed_name(check_name));
    let mut labels = template.metadata.labels.take().unwrap_or_default();
    labels.insert(CHECK_NAME_LABEL.to_string(), check_name.to_string());
    labels.insert(RUN_ID_LABEL.to_string(), run_id.to_string());
    template.metadata.labels = Some(labels);
    template
}

/// Returns the label selector used to find every pod belonging to this
/// check, regardless of run ID: `kuberhealthy-check-name=<check_name>`.
pub fn check_name_selector(check_name: &str) -> String {
    format!("{}={}", CHECK_NAME_LABEL, check_name)
}

/// Returns the label selector used to find pods belonging to one specific
/// iteration: both the check-name and run-id labels.
pub fn run_id_selector(check_name: &str, run_id: &str) -> String {
    format!(
        "{}={},{}={}",
        CHECK_NAME_LABEL, check_name, RUN_ID_LABEL, run_id
    )
}

/// Builds a minimal, empty `Pod` shell with the given metadata name,
/// suitable as a starting point in tests.
pub fn empty_template<N: AsRef<str>>(name: N) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.as_ref().to_string());
    pod.metadata.labels = Some(BTreeMap::new());
    pod
}
