//! Interactive-workload idling: pod-age eligibility, the traffic hit check,
//! ingress sentinel patching and scaling deployments to zero.

use anyhow::{anyhow, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::chrono::Utc;
use kube::ResourceExt;
use log::{info, warn};
use serde_json::json;

use crate::config::{duration_override, render_selector};
use crate::idler::Idler;
use crate::keys;

impl Idler {
    /// Evaluates one namespace for interactive idling and performs it when
    /// the criteria hold. The force flags bypass the eligibility and hit
    /// checks; they are driven by the reconciler's administrative labels.
    pub async fn idle_namespace(&self, namespace: &Namespace, force_idle: bool, force_scale: bool) {
        let name = namespace.name_any();
        let annotations = namespace.annotations();

        // per-namespace interval overrides
        let pod_check_interval =
            duration_override(annotations, keys::POD_INTERVAL, self.pod_check_interval);
        let prometheus_check_interval = duration_override(
            annotations,
            keys::PROMETHEUS_INTERVAL,
            self.prometheus_check_interval,
        );

        if !self.selectors.service.skip_build_check
            && self.build_in_progress(&name, &self.selectors.service.builds).await
        {
            info!(target: "idler", "environment {} has running build, skipping", name);
            return;
        }

        let selector = render_selector(&self.selectors.service.deployments);
        let deployments = match self.store.list_deployments(&name, &selector).await {
            Ok(deployments) => deployments,
            Err(e) => {
                warn!(target: "idler", "error getting deployments in {}: {}", name, e);
                return;
            }
        };

        let mut idle = false;
        for deployment in &deployments {
            let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            if replicas == 0 {
                if self.debug {
                    info!(target: "idler", "deployment {} already idled", deployment.name_any());
                }
                continue;
            }
            info!(
                target: "idler",
                "deployment {} has {} running replicas", deployment.name_any(), replicas
            );
            // pods carry the deployment name under the service name label
            let pod_selector =
                format!("{}={}", self.selectors.service_name_label, deployment.name_any());
            let pods = match self.store.list_pods(&name, &pod_selector).await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(target: "idler", "error listing pods in {}: {}", name, e);
                    break;
                }
            };
            for pod in &pods {
                let Some(started) = pod.status.as_ref().and_then(|s| s.start_time.as_ref()) else {
                    continue;
                };
                let age = (Utc::now() - started.0).to_std().unwrap_or_default();
                if self.debug {
                    info!(
                        target: "idler",
                        "pod {} has been running for {:?}", pod.name_any(), age
                    );
                }
                if age > pod_check_interval {
                    idle = true;
                }
            }
        }

        if !idle && !force_idle && !force_scale {
            return;
        }

        if !self.selectors.service.skip_hit_check && !force_idle && !force_scale {
            info!(target: "idler", "environment {} marked for idling, checking router hits", name);
            let hits = match self
                .oracle
                .namespace_hits(&name, prometheus_check_interval)
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    // no hit data available; don't guess, try again next sweep
                    warn!(target: "idler", "error querying traffic oracle for {}: {}", name, e);
                    return;
                }
            };
            info!(
                target: "idler",
                "environment {} has had {} hits in the last {:?}",
                name, hits, prometheus_check_interval
            );
            if hits != 0 {
                info!(target: "idler", "environment {} does not need idling", name);
                return;
            }
        }

        // an un-routed sentinel would make the environment unrecoverable by
        // traffic, so ingress failures stop the whole attempt
        if let Err(e) = self.patch_ingresses(&name).await {
            info!(target: "idler", "environment {} not idled due to errors patching ingress: {}", name, e);
            return;
        }

        info!(target: "idler", "environment {} will be idled", name);
        self.idle_deployments(&name, &deployments, force_idle, force_scale).await;
    }

    /// Adds the sentinel code to every matching ingress so the router sends
    /// traffic for the idled environment to the unidler backend.
    async fn patch_ingresses(&self, namespace: &str) -> Result<()> {
        if self.selectors.service.skip_ingress_patch {
            return Ok(());
        }
        let selector = render_selector(&self.selectors.service.ingress);
        let ingresses = self
            .store
            .list_ingresses(namespace, &selector)
            .await
            .map_err(|e| anyhow!("error getting ingress: {}", e))?;
        for ingress in &ingresses {
            let name = ingress.name_any();
            if self.dry_run {
                info!(target: "idler", "ingress {} would be patched", name);
                continue;
            }
            let codes = ingress.annotations().get(keys::CUSTOM_HTTP_ERRORS).map(String::as_str);
            let Some(updated) = keys::add_status_code(codes, keys::SENTINEL_CODE) else {
                // sentinel already present
                continue;
            };
            let patch = json!({
                "metadata": {
                    "labels": {
                        keys::IDLED: "true",
                    },
                    "annotations": {
                        keys::CUSTOM_HTTP_ERRORS: updated,
                    },
                },
            });
            self.store
                .patch_ingress(namespace, &name, &patch)
                .await
                .map_err(|e| anyhow!("error patching ingress {}: {}", name, e))?;
            info!(target: "idler", "ingress {} patched", name);
        }
        Ok(())
    }

    /// Scales the deployments to zero, saving the replica count to restore.
    /// Individual patch failures are logged and the rest continue; some
    /// idled is better than none.
    async fn idle_deployments(
        &self,
        namespace: &str,
        deployments: &[Deployment],
        force_idle: bool,
        force_scale: bool,
    ) {
        for deployment in deployments {
            let name = deployment.name_any();
            let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            // deployments somebody already scaled down are left alone unless
            // an administrator forced the whole environment
            if replicas == 0 && !force_idle && !force_scale {
                continue;
            }
            if self.dry_run {
                info!(target: "idler", "deployment {} would be scaled to 0", name);
                continue;
            }
            let patch = idle_patch(deployment, force_idle, force_scale);
            if let Err(e) = self.store.patch_deployment(namespace, &name, &patch).await {
                warn!(target: "idler", "error scaling deployment {}: {}", name, e);
            } else {
                info!(target: "idler", "deployment {} scaled to 0", name);
            }
        }
        if !self.dry_run {
            self.metrics.idle_events.inc();
        }
    }
}

/// Builds the merge patch that idles one deployment.
fn idle_patch(deployment: &Deployment, force_idle: bool, force_scale: bool) -> serde_json::Value {
    let replicas = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    // save the current count for the unidler; an already-idled deployment
    // keeps its previously saved count instead of being clamped to one
    let unidle_replicas = if replicas > 0 {
        replicas
    } else {
        deployment
            .annotations()
            .get(keys::UNIDLE_REPLICAS)
            .and_then(|v| v.parse::<i32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(1)
    };
    let mut labels = serde_json::Map::new();
    labels.insert(keys::WATCH.to_string(), json!("true"));
    labels.insert(keys::IDLED.to_string(), json!("true"));
    if force_idle {
        labels.insert(keys::FORCE_IDLED.to_string(), json!("true"));
    }
    if force_scale {
        labels.insert(keys::FORCE_SCALED.to_string(), json!("true"));
    }
    json!({
        "spec": {
            "replicas": 0,
        },
        "metadata": {
            "labels": labels,
            "annotations": {
                keys::IDLED_AT: Utc::now().to_rfc3339(),
                keys::UNIDLE_REPLICAS: unidle_replicas.to_string(),
            },
        },
    })
}
