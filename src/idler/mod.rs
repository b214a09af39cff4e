//! Decides when environments are inactive enough to scale to zero.
//!
//! Two sweeps run on independent schedules: the interactive (service) sweep
//! idles web-facing deployments and marks their ingresses with the sentinel
//! code, and the cli sweep scales down batch deployments whose pods show no
//! running user processes.

mod cli;
mod service;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use log::{info, warn};

use crate::config::{render_selector, Selectors};
use crate::metrics::Metrics;
use crate::oracle::TrafficOracle;
use crate::store::ResourceStore;

pub struct Idler {
    pub store: Arc<dyn ResourceStore>,
    pub oracle: Arc<dyn TrafficOracle>,
    pub metrics: Arc<Metrics>,
    pub selectors: Selectors,
    pub pod_check_interval: Duration,
    pub prometheus_check_interval: Duration,
    pub dry_run: bool,
    pub debug: bool,
}

impl Idler {
    /// The interactive-workload sweep over all candidate namespaces.
    pub async fn service_idler(&self) {
        let selector = render_selector(&self.selectors.service.namespace);
        let namespaces = match self.store.list_namespaces(&selector).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                warn!(target: "idler", "unable to get any namespaces: {}", e);
                return;
            }
        };
        for namespace in &namespaces {
            if !self.eligible(namespace) {
                continue;
            }
            info!(
                target: "idler",
                "checking namespace {} (project {}, dry-run {})",
                namespace.name_any(),
                namespace
                    .labels()
                    .get(&self.selectors.namespace_labels.project_name)
                    .map(String::as_str)
                    .unwrap_or("unknown"),
                self.dry_run,
            );
            self.idle_namespace(namespace, false, false).await;
        }
    }

    /// The batch/cli sweep over all candidate namespaces.
    pub async fn cli_idler(&self) {
        let selector = render_selector(&self.selectors.cli.namespace);
        let namespaces = match self.store.list_namespaces(&selector).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                warn!(target: "idler", "unable to get any namespaces: {}", e);
                return;
            }
        };
        for namespace in &namespaces {
            // cli pods are reaped in every environment type; only the
            // idling opt-in labels gate the batch sweep
            if !self.idling_enabled(namespace) {
                continue;
            }
            self.cli_idle_namespace(namespace).await;
        }
    }

    /// Both the project and the environment have to opt into idling.
    fn idling_enabled(&self, namespace: &Namespace) -> bool {
        let labels = namespace.labels();
        let names = &self.selectors.namespace_labels;
        match (labels.get(&names.project_idling), labels.get(&names.environment_idling)) {
            (Some(project), Some(environment)) => {
                let ok = project == "1" && environment == "1";
                if !ok && self.debug {
                    info!(
                        target: "idler",
                        "skipping namespace {}; autoidle values are env:{} proj:{}",
                        namespace.name_any(), environment, project,
                    );
                }
                ok
            }
            _ => {
                if self.debug {
                    info!(target: "idler", "skipping namespace {}; not managed", namespace.name_any());
                }
                false
            }
        }
    }

    /// The interactive sweep additionally requires the idle-eligible
    /// environment type.
    fn eligible(&self, namespace: &Namespace) -> bool {
        if !self.idling_enabled(namespace) {
            return false;
        }
        let env_type =
            namespace.labels().get(&self.selectors.namespace_labels.environment_type);
        match env_type {
            Some(env_type) if env_type == &self.selectors.idle_environment_type => true,
            _ => {
                if self.debug {
                    info!(
                        target: "idler",
                        "skipping namespace {}; type is {:?}",
                        namespace.name_any(), env_type,
                    );
                }
                false
            }
        }
    }

    /// True when the namespace has a build pod running or pending; such
    /// environments are never idled mid-build.
    async fn build_in_progress(
        &self,
        namespace: &str,
        builds_selector: &[crate::config::Requirement],
    ) -> bool {
        let selector = render_selector(builds_selector);
        match self.store.list_pods(namespace, &selector).await {
            Ok(pods) => pods.iter().any(|pod| {
                matches!(
                    pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                    Some("Running") | Some("Pending")
                )
            }),
            Err(e) => {
                warn!(target: "idler", "error getting running builds for namespace {}: {}", namespace, e);
                false
            }
        }
    }
}
