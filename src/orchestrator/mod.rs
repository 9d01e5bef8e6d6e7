//! Orchestrator abstraction: launch, locate, and collect workers.
//!
//! The controller talks to the orchestrator through [`Orchestrator`] only;
//! the concrete [`kube::KubeDriver`] maps the operations onto the
//! Kubernetes Jobs API. Tests substitute `testutil::MockOrchestrator`.

pub mod kube;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use kube::{KubeDriver, KubeDriverConfig};

/// Port the worker's terminal server listens on.
pub const TERMINAL_PORT: u16 = 7681;

/// Everything the orchestrator needs to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Orchestrator object handle, chosen by the controller, unique.
    pub name: String,
    /// Session the worker belongs to; stamped into labels for traceability.
    pub session_id: String,
    /// Container image running the worker entrypoint.
    pub image: String,
    pub code_url: String,
    pub command: String,
    pub install_cmd: Option<String>,
    pub prompt: Option<String>,
    /// Hard wall-clock cap on the worker's lifetime.
    pub active_deadline: Duration,
    /// How long a finished worker lingers before the orchestrator collects
    /// it.
    pub collect_after: Duration,
}

impl WorkerSpec {
    /// The environment contract the worker entrypoint consumes.
    ///
    /// `INSTALL_CMD` defaults to `npm install` when the caller gave none;
    /// `CLAUDE_PROMPT` is only present when a prompt was supplied.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("CODE_URL".to_string(), self.code_url.clone()),
            ("COMMAND".to_string(), self.command.clone()),
            (
                "INSTALL_CMD".to_string(),
                self.install_cmd
                    .clone()
                    .unwrap_or_else(|| "npm install".to_string()),
            ),
            ("TTYD_PORT".to_string(), TERMINAL_PORT.to_string()),
            ("EXIT_ON_JOB".to_string(), "true".to_string()),
        ];
        if let Some(prompt) = &self.prompt {
            env.push(("CLAUDE_PROMPT".to_string(), prompt.clone()));
        }
        env
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("worker submission failed: {0}")]
    Submit(String),

    #[error("endpoint resolution failed: {0}")]
    Resolve(String),

    #[error("orchestrator unreachable: {0}")]
    Unavailable(String),
}

/// Driver operations, one per lifecycle phase.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Submits the worker lifecycle object. Returns the accepted object
    /// name. Not retried by the controller: the caller may re-POST and
    /// receive a fresh session.
    async fn submit(&self, spec: &WorkerSpec) -> Result<String, OrchestratorError>;

    /// Polls for the worker's terminal endpoint (`host:port`) up to
    /// `deadline`. `Ok(None)` means the worker is still pending, which is
    /// not an error: a background resolver or the gateway may try again.
    async fn resolve_endpoint(
        &self,
        worker_name: &str,
        deadline: Duration,
    ) -> Result<Option<String>, OrchestratorError>;

    /// Deletes the worker object, swallowing failures. Used to undo a
    /// partially created session; the orchestrator's own TTL is the
    /// backstop when this loses a race.
    async fn best_effort_delete(&self, worker_name: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(install_cmd: Option<&str>, prompt: Option<&str>) -> WorkerSpec {
        WorkerSpec {
            name: "worker-1".into(),
            session_id: "sess-1".into(),
            image: "hatchery-worker:latest".into(),
            code_url: "https://github.com/x/y/tree/main/app".into(),
            command: "node index.js".into(),
            install_cmd: install_cmd.map(String::from),
            prompt: prompt.map(String::from),
            active_deadline: Duration::from_secs(600),
            collect_after: Duration::from_secs(300),
        }
    }

    fn env_value(env: &[(String, String)], key: &str) -> Option<String> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn env_carries_required_contract() {
        let env = spec(Some("pip install -r requirements.txt"), None).env();
        assert_eq!(
            env_value(&env, "CODE_URL").as_deref(),
            Some("https://github.com/x/y/tree/main/app")
        );
        assert_eq!(env_value(&env, "COMMAND").as_deref(), Some("node index.js"));
        assert_eq!(
            env_value(&env, "INSTALL_CMD").as_deref(),
            Some("pip install -r requirements.txt")
        );
        assert_eq!(env_value(&env, "TTYD_PORT").as_deref(), Some("7681"));
        assert_eq!(env_value(&env, "EXIT_ON_JOB").as_deref(), Some("true"));
    }

    #[test]
    fn install_cmd_defaults_to_npm_install() {
        let env = spec(None, None).env();
        assert_eq!(env_value(&env, "INSTALL_CMD").as_deref(), Some("npm install"));
    }

    #[test]
    fn prompt_only_present_when_supplied() {
        let env = spec(None, None).env();
        assert!(env_value(&env, "CLAUDE_PROMPT").is_none());

        let env = spec(None, Some("fix the failing test")).env();
        assert_eq!(
            env_value(&env, "CLAUDE_PROMPT").as_deref(),
            Some("fix the failing test")
        );
    }
}
