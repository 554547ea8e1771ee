//! Cluster orchestrator seam and its `kubectl` CLI client.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Deserialize;
use std::fmt;

use crate::backends::process::{run, stream_stdout};
use crate::types::{Error, Result};

// =============================================================================
// Status types
// =============================================================================

/// Replica counts returned by a scale request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaleStatus {
    pub spec_replicas: u32,
    pub status_replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentCondition {
    pub kind: String,
    pub status: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub replicas: u32,
    pub conditions: Vec<DeploymentCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
    /// Absent on older clusters.
    pub started: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodStatus {
    pub name: String,
    pub container_statuses: Vec<ContainerStatus>,
}

/// A deployment is scaled when it reports replicas, every condition holds,
/// and every pod has only ready (and, where reported, started) containers.
pub fn is_scaled(deployment: &DeploymentStatus, pods: &[PodStatus]) -> bool {
    if deployment.replicas == 0 || deployment.conditions.iter().any(|c| !c.status) {
        return false;
    }
    if pods.is_empty() {
        return false;
    }
    pods.iter().all(|pod| {
        !pod.container_statuses.is_empty()
            && pod
                .container_statuses
                .iter()
                .all(|c| c.ready && c.started != Some(false))
    })
}

// =============================================================================
// Orchestrator API
// =============================================================================

#[async_trait]
pub trait OrchestratorApi: Send + Sync + fmt::Debug {
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: u32) -> Result<ScaleStatus>;

    async fn read_deployment(&self, namespace: &str, name: &str) -> Result<DeploymentStatus>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodStatus>>;

    async fn read_pod_log(&self, namespace: &str, pod: &str) -> Result<String>;

    /// Run `command` in the pod and stream its stdout.
    async fn exec_stream(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<BoxStream<'static, Result<Bytes>>>;
}

// =============================================================================
// kubectl client
// =============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct DeploymentJson {
    spec: ReplicasJson,
    status: DeploymentStatusJson,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ReplicasJson {
    replicas: u32,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct DeploymentStatusJson {
    replicas: u32,
    conditions: Vec<ConditionJson>,
}

#[derive(Debug, Deserialize)]
struct ConditionJson {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct PodListJson {
    items: Vec<PodJson>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct PodJson {
    metadata: MetadataJson,
    status: PodStatusJson,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct MetadataJson {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct PodStatusJson {
    container_statuses: Vec<ContainerStatusJson>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatusJson {
    name: String,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    started: Option<bool>,
}

pub(crate) fn parse_deployment(json: &str) -> Result<(ScaleStatus, DeploymentStatus)> {
    let parsed: DeploymentJson = serde_json::from_str(json)?;
    let scale = ScaleStatus {
        spec_replicas: parsed.spec.replicas,
        status_replicas: parsed.status.replicas,
    };
    let status = DeploymentStatus {
        replicas: parsed.status.replicas,
        conditions: parsed
            .status
            .conditions
            .into_iter()
            .map(|c| DeploymentCondition {
                status: c.status.eq_ignore_ascii_case("true"),
                kind: c.kind,
            })
            .collect(),
    };
    Ok((scale, status))
}

pub(crate) fn parse_pods(json: &str) -> Result<Vec<PodStatus>> {
    let parsed: PodListJson = serde_json::from_str(json)?;
    Ok(parsed
        .items
        .into_iter()
        .map(|pod| PodStatus {
            name: pod.metadata.name,
            container_statuses: pod
                .status
                .container_statuses
                .into_iter()
                .map(|c| ContainerStatus {
                    name: c.name,
                    ready: c.ready,
                    started: c.started,
                })
                .collect(),
        })
        .collect())
}

/// `kubectl` CLI client using the ambient kubeconfig.
#[derive(Debug, Clone)]
pub struct KubectlOrchestrator {
    binary: String,
}

impl Default for KubectlOrchestrator {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl KubectlOrchestrator {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn args(namespace: &str, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["-n".to_string(), namespace.to_string()];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<(ScaleStatus, DeploymentStatus)> {
        let output = run(&self.binary, &Self::args(namespace, &["get", "deployment", name, "-o", "json"])).await?;
        parse_deployment(&output.stdout)
    }
}

#[async_trait]
impl OrchestratorApi for KubectlOrchestrator {
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: u32) -> Result<ScaleStatus> {
        let target = format!("deployment/{}", name);
        let count = format!("--replicas={}", replicas);
        run(&self.binary, &Self::args(namespace, &["scale", &target, &count]))
            .await
            .map_err(|e| Error::backend(format!("scale failed: {}", e)))?;
        Ok(self.get_deployment(namespace, name).await?.0)
    }

    async fn read_deployment(&self, namespace: &str, name: &str) -> Result<DeploymentStatus> {
        Ok(self.get_deployment(namespace, name).await?.1)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodStatus>> {
        let output = run(
            &self.binary,
            &Self::args(namespace, &["get", "pods", "-l", label_selector, "-o", "json"]),
        )
        .await?;
        parse_pods(&output.stdout)
    }

    async fn read_pod_log(&self, namespace: &str, pod: &str) -> Result<String> {
        let output = run(&self.binary, &Self::args(namespace, &["logs", pod])).await?;
        Ok(output.stdout)
    }

    async fn exec_stream(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let mut args = Self::args(namespace, &["exec", pod, "--"]);
        args.extend(command.iter().cloned());
        stream_stdout(&self.binary, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pod(containers: Vec<ContainerStatus>) -> PodStatus {
        PodStatus {
            name: "kernel-a-0".to_string(),
            container_statuses: containers,
        }
    }

    fn container(ready: bool, started: Option<bool>) -> ContainerStatus {
        ContainerStatus {
            name: "kernel".to_string(),
            ready,
            started,
        }
    }

    fn deployment(replicas: u32, conditions: &[bool]) -> DeploymentStatus {
        DeploymentStatus {
            replicas,
            conditions: conditions
                .iter()
                .map(|&status| DeploymentCondition {
                    kind: "Available".to_string(),
                    status,
                })
                .collect(),
        }
    }

    #[test]
    fn test_is_scaled() {
        let ready = vec![pod(vec![container(true, Some(true))])];
        assert!(is_scaled(&deployment(1, &[true, true]), &ready));
        assert!(is_scaled(&deployment(1, &[]), &[pod(vec![container(true, None)])]));

        assert!(!is_scaled(&deployment(0, &[true]), &ready));
        assert!(!is_scaled(&deployment(1, &[true, false]), &ready));
        assert!(!is_scaled(&deployment(1, &[true]), &[]));
        assert!(!is_scaled(&deployment(1, &[true]), &[pod(vec![])]));
        assert!(!is_scaled(&deployment(1, &[true]), &[pod(vec![container(false, Some(true))])]));
        assert!(!is_scaled(&deployment(1, &[true]), &[pod(vec![container(true, Some(false))])]));
    }

    #[test]
    fn test_parse_deployment_json() {
        let json = r#"{
            "spec": {"replicas": 1},
            "status": {
                "replicas": 1,
                "conditions": [
                    {"type": "Available", "status": "True"},
                    {"type": "Progressing", "status": "False"}
                ]
            }
        }"#;
        let (scale, status) = parse_deployment(json).unwrap();
        assert_eq!(scale, ScaleStatus { spec_replicas: 1, status_replicas: 1 });
        assert_eq!(status.conditions.len(), 2);
        assert!(status.conditions[0].status);
        assert!(!status.conditions[1].status);
    }

    #[test]
    fn test_parse_deployment_without_status() {
        let (scale, status) = parse_deployment(r#"{"spec": {"replicas": 0}}"#).unwrap();
        assert_eq!(scale.status_replicas, 0);
        assert!(status.conditions.is_empty());
    }

    #[test]
    fn test_parse_pods_json() {
        let json = r#"{"items": [
            {"metadata": {"name": "kernel-a-0"},
             "status": {"containerStatuses": [{"name": "kernel", "ready": true, "started": true}]}},
            {"metadata": {"name": "kernel-a-1"}, "status": {}}
        ]}"#;
        let pods = parse_pods(json).unwrap();
        assert_eq!(pods.len(), 2);
        assert_eq!(pods[0].container_statuses[0], container(true, Some(true)));
        assert!(pods[1].container_statuses.is_empty());
    }
}
