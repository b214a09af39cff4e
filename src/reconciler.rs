//! Namespace label reconciliation.
//!
//! Watches namespaces for administrative trigger labels and acts on them:
//! force-scaled and force-idled cause an immediate idle of the environment,
//! unidle wakes it, and deprecated-prefix keys are migrated in place. Each
//! trigger label is removed once acted on so the action runs once.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use log::{info, warn};
use serde_json::json;

use crate::config::render_selector;
use crate::idler::Idler;
use crate::keys;
use crate::unidler::{rename_patch, Unidler};

pub struct Reconciler {
    pub idler: Arc<Idler>,
    pub unidler: Arc<Unidler>,
    pub debug: bool,
}

impl Reconciler {
    /// Watches candidate namespaces and reconciles each applied event.
    /// Returns only on watch errors; the caller restarts it.
    pub async fn run(&self, client: Client) -> anyhow::Result<()> {
        let selector = render_selector(&self.idler.selectors.service.namespace);
        let namespaces: Api<Namespace> = Api::all(client);
        let config = if selector.is_empty() {
            watcher::Config::default()
        } else {
            watcher::Config::default().labels(&selector)
        };
        let mut stream = watcher(namespaces, config).applied_objects().boxed();
        while let Some(namespace) = stream.try_next().await? {
            self.reconcile(&namespace).await;
        }
        Ok(())
    }

    /// Acts on the trigger labels carried by one namespace.
    pub async fn reconcile(&self, namespace: &Namespace) {
        let name = namespace.name_any();

        self.migrate_legacy_keys(namespace).await;

        let labels = namespace.labels();
        let triggered = |key: &str| labels.get(key).map(String::as_str).is_some_and(keys::truthy);

        if triggered(keys::FORCE_SCALED) {
            info!(target: "reconciler", "namespace {} is labelled for force-scaling", name);
            self.idler.idle_namespace(namespace, false, true).await;
            self.clear_label(&name, keys::FORCE_SCALED).await;
        } else if triggered(keys::FORCE_IDLED) {
            info!(target: "reconciler", "namespace {} is labelled for force-idling", name);
            self.idler.idle_namespace(namespace, true, false).await;
            self.clear_label(&name, keys::FORCE_IDLED).await;
        }

        if triggered(keys::UNIDLE) {
            // a held lock means another unidle is already in flight, in which
            // case that one will also clear the label
            if let Some(guard) = self.unidler.locks.try_acquire(&name) {
                info!(target: "reconciler", "namespace {} is labelled for unidling", name);
                self.unidler.unidle(&name, guard).await;
                self.clear_label(&name, keys::UNIDLE).await;
            } else if self.debug {
                info!(target: "reconciler", "namespace {} is already being unidled", name);
            }
        }
    }

    async fn clear_label(&self, namespace: &str, key: &str) {
        let patch = json!({
            "metadata": {
                "labels": {
                    key: null,
                },
            },
        });
        if let Err(e) = self.idler.store.patch_namespace(namespace, &patch).await {
            warn!(target: "reconciler", "error removing label {} from {}: {}", key, namespace, e);
        }
    }

    /// Moves deprecated-prefix keys on the namespace and its ingresses to the
    /// current prefix. Deployment migration happens on the unidle path.
    async fn migrate_legacy_keys(&self, namespace: &Namespace) {
        let name = namespace.name_any();
        let labels = rename_patch(namespace.labels(), keys::LEGACY_LABEL_KEYS);
        let annotations = rename_patch(namespace.annotations(), keys::LEGACY_ANNOTATION_KEYS);
        let empty =
            |v: &serde_json::Value| v.as_object().map(|m| m.is_empty()).unwrap_or(true);
        if !empty(&labels) || !empty(&annotations) {
            info!(target: "reconciler", "migrating deprecated idling keys on namespace {}", name);
            let patch = json!({
                "metadata": {
                    "labels": labels,
                    "annotations": annotations,
                },
            });
            if let Err(e) = self.idler.store.patch_namespace(&name, &patch).await {
                warn!(target: "reconciler", "error migrating namespace {}: {}", name, e);
            }
        }

        let ingresses = match self.idler.store.list_ingresses(&name, "").await {
            Ok(ingresses) => ingresses,
            Err(e) => {
                warn!(target: "reconciler", "unable to get any ingresses in {}: {}", name, e);
                return;
            }
        };
        for ingress in &ingresses {
            let labels = rename_patch(ingress.labels(), keys::LEGACY_LABEL_KEYS);
            let annotations = rename_patch(ingress.annotations(), keys::LEGACY_ANNOTATION_KEYS);
            if empty(&labels) && empty(&annotations) {
                continue;
            }
            let ingress_name = ingress.name_any();
            info!(
                target: "reconciler",
                "migrating deprecated idling keys on ingress {} in {}", ingress_name, name
            );
            let patch = json!({
                "metadata": {
                    "labels": labels,
                    "annotations": annotations,
                },
            });
            if let Err(e) = self.idler.store.patch_ingress(&name, &ingress_name, &patch).await {
                warn!(target: "reconciler", "error migrating ingress {} in {}: {}", ingress_name, name, e);
            }
        }
    }
}
