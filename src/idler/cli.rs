//! Batch/cli-workload idling.
//!
//! Cli deployments have no route, so there is no hit check; instead each
//! backing pod is probed for running user processes, and pods with none let
//! their deployment be scaled down. Deployments declaring scheduled jobs are
//! never idled.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use log::{info, warn};
use serde_json::json;

use crate::config::render_selector;
use crate::idler::Idler;

/// Anything running with parent PID 0 is likely a user process; the first
/// two entries are the pod's own entrypoint and the probe shell.
const PROCESS_PROBE: &str = "pgrep -P 0|tail -n +3|wc -l|tr -d ' '";

impl Idler {
    /// Evaluates one namespace's cli deployments, scaling down the ones
    /// whose pods are idle.
    pub async fn cli_idle_namespace(&self, namespace: &Namespace) {
        let name = namespace.name_any();

        if !self.selectors.cli.skip_build_check
            && self.build_in_progress(&name, &self.selectors.cli.builds).await
        {
            info!(target: "cli_idler", "environment {} has running build, skipping", name);
            return;
        }

        let selector = render_selector(&self.selectors.cli.deployments);
        let deployments = match self.store.list_deployments(&name, &selector).await {
            Ok(deployments) => deployments,
            Err(e) => {
                warn!(target: "cli_idler", "error getting deployments in {}: {}", name, e);
                return;
            }
        };

        for deployment in &deployments {
            let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            if replicas == 0 {
                if self.debug {
                    info!(target: "cli_idler", "deployment {} already idled", deployment.name_any());
                }
                continue;
            }
            if !self.selectors.cli.skip_cron_check && has_cronjobs(deployment) {
                info!(
                    target: "cli_idler",
                    "deployment {} has cronjobs defined, skipping", deployment.name_any()
                );
                continue;
            }
            self.cli_idle_deployment(&name, deployment).await;
        }
    }

    async fn cli_idle_deployment(&self, namespace: &str, deployment: &Deployment) {
        let deployment_name = deployment.name_any();
        let pod_selector =
            format!("{}={}", self.selectors.service_name_label, deployment_name);
        let pods = match self.store.list_pods(namespace, &pod_selector).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(target: "cli_idler", "error listing pods in {}: {}", namespace, e);
                return;
            }
        };
        for pod in &pods {
            let pod_name = pod.name_any();
            if !self.selectors.cli.skip_process_check {
                if self.debug {
                    info!(target: "cli_idler", "checking pod {} for running processes", pod_name);
                }
                let stdout = match self
                    .store
                    .exec_pod(namespace, &pod_name, &["/bin/sh", "-c", PROCESS_PROBE])
                    .await
                {
                    Ok(stdout) => stdout,
                    Err(e) => {
                        // probe failure only skips this pod
                        warn!(target: "cli_idler", "error when trying to exec to pod {}: {}", pod_name, e);
                        continue;
                    }
                };
                if parse_process_count(&stdout) > 0 {
                    continue;
                }
                info!(target: "cli_idler", "pod {} has no running processes, idling", pod_name);
            }
            if self.dry_run {
                info!(target: "cli_idler", "deployment {} would be scaled to 0", deployment_name);
                continue;
            }
            let patch = json!({
                "spec": {
                    "replicas": 0,
                },
            });
            if let Err(e) = self.store.patch_deployment(namespace, &deployment_name, &patch).await
            {
                warn!(target: "cli_idler", "error scaling deployment {}: {}", deployment_name, e);
            } else {
                info!(target: "cli_idler", "deployment {} scaled to 0", deployment_name);
                self.metrics.cli_idle_events.inc();
            }
        }
    }
}

/// Scheduled jobs are declared through a CRONJOBS environment variable on
/// any container; a deployment with scheduled work is never idled.
fn has_cronjobs(deployment: &Deployment) -> bool {
    let containers = deployment
        .spec
        .as_ref()
        .map(|s| s.template.spec.as_ref().map(|p| p.containers.as_slice()).unwrap_or_default())
        .unwrap_or_default();
    containers.iter().any(|container| {
        container
            .env
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|env| env.name == "CRONJOBS" && env.value.as_deref().is_some_and(|v| !v.is_empty()))
    })
}

fn parse_process_count(stdout: &str) -> u32 {
    let trimmed = stdout.trim();
    trimmed.parse().unwrap_or_else(|_| {
        trimmed.chars().last().and_then(|c| c.to_digit(10)).unwrap_or(0)
    })
}
