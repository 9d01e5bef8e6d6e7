//! Kubernetes driver: workers are batch/v1 Jobs.
//!
//! A Job gives us the three lifecycle properties a worker needs:
//! `activeDeadlineSeconds` caps the worker's wall-clock lifetime,
//! `ttlSecondsAfterFinished` collects the object after it finishes, and
//! `restartPolicy: Never` makes the run one-shot. The driver speaks to the
//! API server over plain HTTPS with the service-account bearer token, so it
//! works identically in-cluster and against a kubeconfig-proxied endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{Orchestrator, OrchestratorError, WorkerSpec, TERMINAL_PORT};

/// Label carried by every worker pod; the cluster's network policy selects
/// on it to restrict ingress on the terminal port to the gateway.
const WORKER_LABEL: &str = "hatchery.dev/worker";

/// Default in-cluster paths.
const IN_CLUSTER_API: &str = "https://kubernetes.default.svc";
const IN_CLUSTER_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const IN_CLUSTER_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(Debug, Clone)]
pub struct KubeDriverConfig {
    /// API server base URL.
    pub api_url: String,
    /// Namespace all worker objects live in.
    pub namespace: String,
    /// Path to the bearer token file; `None` means anonymous (test servers).
    pub token_path: Option<String>,
    /// Path to the API server CA bundle; `None` trusts the system roots.
    pub ca_path: Option<String>,
    /// Per-request timeout against the API server.
    pub request_timeout: Duration,
    /// Poll cadence for endpoint resolution.
    pub poll_interval: Duration,
}

impl Default for KubeDriverConfig {
    fn default() -> Self {
        Self {
            api_url: IN_CLUSTER_API.to_string(),
            namespace: "hatchery-workers".to_string(),
            token_path: Some(IN_CLUSTER_TOKEN.to_string()),
            ca_path: Some(IN_CLUSTER_CA.to_string()),
            request_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
pub struct KubeDriver {
    client: reqwest::Client,
    api_url: String,
    namespace: String,
    token: Option<String>,
    poll_interval: Duration,
}

impl KubeDriver {
    pub fn new(config: KubeDriverConfig) -> Result<Self, OrchestratorError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.request_timeout);

        if let Some(ca_path) = &config.ca_path {
            let pem = std::fs::read(ca_path)
                .map_err(|e| OrchestratorError::Unavailable(format!("{ca_path}: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| OrchestratorError::Unavailable(format!("{ca_path}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let token = match &config.token_path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map(|t| t.trim().to_string())
                    .map_err(|e| OrchestratorError::Unavailable(format!("{path}: {e}")))?,
            ),
            None => None,
        };

        let client = builder
            .build()
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            namespace: config.namespace,
            token,
            poll_interval: config.poll_interval,
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// The Job manifest for one worker, hardened per the isolation
    /// requirements: non-root, all capabilities dropped, read-only root
    /// filesystem, default seccomp, no service-account token.
    fn job_manifest(&self, spec: &WorkerSpec) -> serde_json::Value {
        let env: Vec<serde_json::Value> = spec
            .env()
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": spec.name,
                "namespace": self.namespace,
                "labels": {
                    WORKER_LABEL: "true",
                    "hatchery.dev/session": spec.session_id,
                },
            },
            "spec": {
                "backoffLimit": 0,
                "activeDeadlineSeconds": spec.active_deadline.as_secs(),
                "ttlSecondsAfterFinished": spec.collect_after.as_secs(),
                "template": {
                    "metadata": {
                        "labels": {
                            WORKER_LABEL: "true",
                            "hatchery.dev/session": spec.session_id,
                            "job-name": spec.name,
                        },
                    },
                    "spec": {
                        "restartPolicy": "Never",
                        "automountServiceAccountToken": false,
                        "securityContext": {
                            "runAsNonRoot": true,
                            "runAsUser": 1000,
                            "seccompProfile": { "type": "RuntimeDefault" },
                        },
                        "containers": [{
                            "name": "worker",
                            "image": spec.image,
                            "env": env,
                            "ports": [{ "containerPort": TERMINAL_PORT, "name": "terminal" }],
                            "securityContext": {
                                "allowPrivilegeEscalation": false,
                                "readOnlyRootFilesystem": true,
                                "capabilities": { "drop": ["ALL"] },
                            },
                            "volumeMounts": [{ "name": "workdir", "mountPath": "/workspace" }],
                        }],
                        "volumes": [{ "name": "workdir", "emptyDir": {} }],
                    },
                },
            },
        })
    }

    /// One pod-list probe. Returns the endpoint when a pod of the job is
    /// running with an assigned IP.
    async fn probe_endpoint(
        &self,
        worker_name: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods?labelSelector=job-name%3D{}",
            self.api_url, self.namespace, worker_name
        );
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OrchestratorError::Resolve(format!(
                "pod list returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OrchestratorError::Resolve(e.to_string()))?;

        let items = body["items"].as_array().cloned().unwrap_or_default();
        for pod in items {
            let phase = pod["status"]["phase"].as_str().unwrap_or_default();
            let pod_ip = pod["status"]["podIP"].as_str();
            if phase == "Running" {
                if let Some(ip) = pod_ip {
                    return Ok(Some(format!("{ip}:{TERMINAL_PORT}")));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Orchestrator for KubeDriver {
    async fn submit(&self, spec: &WorkerSpec) -> Result<String, OrchestratorError> {
        let url = format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.api_url, self.namespace
        );
        let response = self
            .authorized(self.client.post(&url))
            .json(&self.job_manifest(spec))
            .send()
            .await
            .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Submit(format!(
                "job create returned {status}: {body}"
            )));
        }

        tracing::info!(worker = %spec.name, session = %spec.session_id, "worker submitted");
        Ok(spec.name.clone())
    }

    async fn resolve_endpoint(
        &self,
        worker_name: &str,
        deadline: Duration,
    ) -> Result<Option<String>, OrchestratorError> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(endpoint) = self.probe_endpoint(worker_name).await? {
                return Ok(Some(endpoint));
            }
            if started.elapsed() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline)).await;
        }
    }

    async fn best_effort_delete(&self, worker_name: &str) {
        let url = format!(
            "{}/apis/batch/v1/namespaces/{}/jobs/{}?propagationPolicy=Background",
            self.api_url, self.namespace, worker_name
        );
        match self.authorized(self.client.delete(&url)).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(worker = %worker_name, "worker deleted");
            }
            Ok(response) => {
                tracing::debug!(worker = %worker_name, status = %response.status(),
                    "worker delete ignored");
            }
            Err(e) => {
                tracing::debug!(worker = %worker_name, error = %e, "worker delete failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> KubeDriver {
        KubeDriver::new(KubeDriverConfig {
            api_url: "https://kube.test".into(),
            namespace: "workers".into(),
            token_path: None,
            ca_path: None,
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        })
        .unwrap()
    }

    fn spec() -> WorkerSpec {
        WorkerSpec {
            name: "worker-abc".into(),
            session_id: "sess-abc".into(),
            image: "hatchery-worker:latest".into(),
            code_url: "https://github.com/x/y/tree/main/app".into(),
            command: "node index.js".into(),
            install_cmd: None,
            prompt: None,
            active_deadline: Duration::from_secs(600),
            collect_after: Duration::from_secs(300),
        }
    }

    #[test]
    fn manifest_sets_lifecycle_caps() {
        let manifest = driver().job_manifest(&spec());
        assert_eq!(manifest["spec"]["activeDeadlineSeconds"], 600);
        assert_eq!(manifest["spec"]["ttlSecondsAfterFinished"], 300);
        assert_eq!(manifest["spec"]["backoffLimit"], 0);
        assert_eq!(
            manifest["spec"]["template"]["spec"]["restartPolicy"],
            "Never"
        );
    }

    #[test]
    fn manifest_hardens_the_pod() {
        let manifest = driver().job_manifest(&spec());
        let pod = &manifest["spec"]["template"]["spec"];
        assert_eq!(pod["securityContext"]["runAsNonRoot"], true);
        assert_eq!(pod["automountServiceAccountToken"], false);
        let container = &pod["containers"][0];
        assert_eq!(container["securityContext"]["readOnlyRootFilesystem"], true);
        assert_eq!(
            container["securityContext"]["capabilities"]["drop"][0],
            "ALL"
        );
        assert_eq!(container["securityContext"]["allowPrivilegeEscalation"], false);
    }

    #[test]
    fn manifest_carries_worker_env_and_port() {
        let manifest = driver().job_manifest(&spec());
        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["ports"][0]["containerPort"], 7681);

        let env = container["env"].as_array().unwrap();
        let names: Vec<&str> = env.iter().map(|e| e["name"].as_str().unwrap()).collect();
        assert!(names.contains(&"CODE_URL"));
        assert!(names.contains(&"COMMAND"));
        assert!(names.contains(&"INSTALL_CMD"));
        assert!(names.contains(&"TTYD_PORT"));
        assert!(names.contains(&"EXIT_ON_JOB"));
    }

    #[test]
    fn manifest_labels_select_the_ingress_policy() {
        let manifest = driver().job_manifest(&spec());
        assert_eq!(manifest["metadata"]["labels"][WORKER_LABEL], "true");
        assert_eq!(
            manifest["spec"]["template"]["metadata"]["labels"][WORKER_LABEL],
            "true"
        );
        assert_eq!(
            manifest["spec"]["template"]["metadata"]["labels"]["job-name"],
            "worker-abc"
        );
    }

    #[test]
    fn missing_token_file_is_an_error() {
        let err = KubeDriver::new(KubeDriverConfig {
            token_path: Some("/nonexistent/token".into()),
            ca_path: None,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Unavailable(_)));
    }
}
