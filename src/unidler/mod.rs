//! Restores idled environments when traffic arrives.

pub mod handler;
pub mod pages;
pub mod restrictions;
pub mod verify;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use log::{info, warn};
use serde_json::json;

use crate::keys;
use crate::locks::{LockGuard, LockRegistry};
use crate::metrics::Metrics;
use crate::store::ResourceStore;
use crate::unidler::restrictions::GlobalLists;
use crate::utils::poll_until;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_secs(90);

pub struct Unidler {
    pub store: Arc<dyn ResourceStore>,
    pub metrics: Arc<Metrics>,
    pub locks: LockRegistry,
    pub global_lists: GlobalLists,
    pub refresh_interval: u32,
    pub default_response_code: u16,
    pub verified_unidling: bool,
    pub verified_secret: String,
    pub debug: bool,
}

impl Unidler {
    /// Scales an idled namespace back up and removes the ingress sentinel.
    /// Runs under the namespace lock; the guard is released on every path
    /// when it drops at the end of this function.
    pub async fn unidle(&self, namespace: &str, _guard: LockGuard) {
        self.migrate_legacy_deployments(namespace).await;

        let selector = format!("{}=true", keys::WATCH);
        let deployments = match self.store.list_deployments(namespace, &selector).await {
            Ok(deployments) => deployments,
            Err(e) => {
                warn!(target: "unidler", "unable to get any deployments in {}: {}", namespace, e);
                return;
            }
        };

        let mut restored: Vec<&Deployment> = Vec::new();
        for deployment in &deployments {
            let idled = deployment.labels().get(keys::IDLED).map(String::as_str) == Some("true");
            let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            if !idled || replicas != 0 {
                continue;
            }
            let new_replicas = restore_replicas(deployment);
            let patch = json!({
                "spec": {
                    "replicas": new_replicas,
                },
                "metadata": {
                    "labels": {
                        keys::IDLED: "false",
                        keys::FORCE_IDLED: null,
                        keys::FORCE_SCALED: null,
                    },
                    "annotations": {
                        keys::IDLED_AT: null,
                    },
                },
            });
            let name = deployment.name_any();
            if let Err(e) = self.store.patch_deployment(namespace, &name, &patch).await {
                // try and scale the rest of the deployments anyway
                warn!(target: "unidler", "error scaling deployment {} in {}: {}", name, namespace, e);
            } else {
                info!(target: "unidler", "deployment {} scaled to {} in {}", name, new_replicas, namespace);
                restored.push(deployment);
            }
        }

        // wait for the restored deployments to have a running pod; endpoints
        // may still lag, the page refresh covers the rest
        for deployment in &restored {
            let name = deployment.name_any();
            info!(target: "unidler", "waiting for {} to be running in {}", name, namespace);
            let running = poll_until(POLL_INTERVAL, POLL_TIMEOUT, || {
                self.has_running_pod(namespace, deployment)
            })
            .await;
            if !running {
                warn!(target: "unidler", "timed out waiting for {} in {}", name, namespace);
            }
        }

        self.clear_ingress_sentinel(namespace).await;

        let patch = json!({
            "metadata": {
                "labels": {
                    keys::IDLED: "false",
                },
            },
        });
        if let Err(e) = self.store.patch_namespace(namespace, &patch).await {
            warn!(target: "unidler", "error patching namespace {}: {}", namespace, e);
        }
        self.metrics.unidle_events.inc();
    }

    /// True when any deployment in the namespace carries the force-scaled
    /// label; such environments are never unidled automatically.
    pub async fn is_force_scaled(&self, namespace: &str) -> bool {
        let selector = format!("{}=true", keys::FORCE_SCALED);
        match self.store.list_deployments(namespace, &selector).await {
            Ok(deployments) => !deployments.is_empty(),
            Err(e) => {
                warn!(target: "unidler", "unable to get any deployments in {}: {}", namespace, e);
                false
            }
        }
    }

    async fn has_running_pod(&self, namespace: &str, deployment: &Deployment) -> bool {
        let Some(match_labels) = deployment
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.as_ref())
        else {
            return false;
        };
        let selector = match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        match self.store.list_pods(namespace, &selector).await {
            Ok(pods) => pods.iter().any(|pod| {
                pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            }),
            Err(_) => false,
        }
    }

    /// Strips the sentinel code from every ingress in the namespace. Already
    /// clean ingresses are left untouched, so a second pass is a no-op.
    pub async fn clear_ingress_sentinel(&self, namespace: &str) {
        let ingresses = match self.store.list_ingresses(namespace, "").await {
            Ok(ingresses) => ingresses,
            Err(e) => {
                warn!(target: "unidler", "unable to get any ingresses in {}: {}", namespace, e);
                return;
            }
        };
        for ingress in &ingresses {
            let Some(codes) = ingress.annotations().get(keys::CUSTOM_HTTP_ERRORS) else {
                continue;
            };
            let remaining = keys::remove_status_code(codes, keys::SENTINEL_CODE);
            if remaining.as_deref() == Some(codes.as_str()) {
                continue;
            }
            let name = ingress.name_any();
            let patch = json!({
                "metadata": {
                    "labels": {
                        keys::IDLED: "false",
                    },
                    "annotations": {
                        keys::CUSTOM_HTTP_ERRORS: remaining,
                        keys::IDLED_AT: null,
                    },
                },
            });
            if let Err(e) = self.store.patch_ingress(namespace, &name, &patch).await {
                // patch the rest of the ingresses anyway
                warn!(target: "unidler", "error patching ingress {} in {}: {}", name, namespace, e);
            } else {
                info!(target: "unidler", "ingress {} sentinel removed in {}", name, namespace);
            }
        }
    }

    /// Moves deprecated-prefix labels and annotations on deployments to the
    /// current prefix. Idempotent; safe to run before every unidle.
    async fn migrate_legacy_deployments(&self, namespace: &str) {
        let legacy_watch = format!("{}/watch", keys::LEGACY_PREFIX);
        let deployments = match self.store.list_deployments(namespace, &legacy_watch).await {
            Ok(deployments) => deployments,
            Err(e) => {
                warn!(target: "unidler", "unable to list legacy deployments in {}: {}", namespace, e);
                return;
            }
        };
        for deployment in &deployments {
            let labels = rename_patch(deployment.labels(), keys::LEGACY_LABEL_KEYS);
            let annotations = rename_patch(deployment.annotations(), keys::LEGACY_ANNOTATION_KEYS);
            if labels.as_object().map(|m| m.is_empty()).unwrap_or(true)
                && annotations.as_object().map(|m| m.is_empty()).unwrap_or(true)
            {
                continue;
            }
            let name = deployment.name_any();
            let patch = json!({
                "metadata": {
                    "labels": labels,
                    "annotations": annotations,
                },
            });
            info!(target: "unidler", "migrating deprecated idling keys on deployment {} in {}", name, namespace);
            if let Err(e) = self.store.patch_deployment(namespace, &name, &patch).await {
                warn!(target: "unidler", "error migrating deployment {} in {}: {}", name, namespace, e);
            }
        }
    }
}

/// Replica count to restore, from the annotation saved at idle time.
/// Defaults to one; non-positive values are ignored.
fn restore_replicas(deployment: &Deployment) -> i32 {
    deployment
        .annotations()
        .get(keys::UNIDLE_REPLICAS)
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(1)
}

/// Builds the label/annotation rename object for one metadata map.
pub(crate) fn rename_patch(
    current: &std::collections::BTreeMap<String, String>,
    suffixes: &[&str],
) -> serde_json::Value {
    let mut patch = serde_json::Map::new();
    for (old, new) in keys::legacy_renames(suffixes) {
        if let Some(value) = current.get(&old) {
            patch.insert(new, serde_json::Value::String(value.clone()));
            patch.insert(old, serde_json::Value::Null);
        }
    }
    serde_json::Value::Object(patch)
}
