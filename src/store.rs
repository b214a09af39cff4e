//! Access to the kubernetes API for the four resource kinds the controller
//! touches: namespaces, deployments, pods and ingresses.
//!
//! Everything above this module goes through the [`ResourceStore`] trait so
//! the sweep and unidle logic can be exercised against an in-memory store.
//! All writes are merge patches; there is no read-modify-write transaction
//! and no conflict retry.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, AttachParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::Value;
use tokio::io::AsyncReadExt;

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>>;
    async fn get_namespace(&self, name: &str) -> Result<Namespace>;
    async fn patch_namespace(&self, name: &str, patch: &Value) -> Result<()>;

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>>;
    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn list_ingresses(&self, namespace: &str, selector: &str) -> Result<Vec<Ingress>>;
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress>;
    async fn patch_ingress(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    /// Runs a one-shot command inside a pod and returns its stdout.
    async fn exec_pod(&self, namespace: &str, pod: &str, command: &[&str]) -> Result<String>;
}

/// The real store, backed by a kube client.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        KubeStore { client }
    }

    fn list_params(selector: &str) -> ListParams {
        if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(selector)
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&Self::list_params(selector)).await.context("listing namespaces")?.items)
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get(name).await.with_context(|| format!("getting namespace {}", name))
    }

    async fn patch_namespace(&self, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .with_context(|| format!("patching namespace {}", name))?;
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .list(&Self::list_params(selector))
            .await
            .with_context(|| format!("listing deployments in {}", namespace))?
            .items)
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .with_context(|| format!("patching deployment {}/{}", namespace, name))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .list(&Self::list_params(selector))
            .await
            .with_context(|| format!("listing pods in {}", namespace))?
            .items)
    }

    async fn list_ingresses(&self, namespace: &str, selector: &str) -> Result<Vec<Ingress>> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .list(&Self::list_params(selector))
            .await
            .with_context(|| format!("listing ingresses in {}", namespace))?
            .items)
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.with_context(|| format!("getting ingress {}/{}", namespace, name))
    }

    async fn patch_ingress(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .with_context(|| format!("patching ingress {}/{}", namespace, name))?;
        Ok(())
    }

    async fn exec_pod(&self, namespace: &str, pod: &str, command: &[&str]) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut attached = api
            .exec(pod, command.iter().copied(), &AttachParams::default().stderr(false))
            .await
            .with_context(|| format!("exec into pod {}/{}", namespace, pod))?;
        let mut stdout_stream = attached
            .stdout()
            .ok_or_else(|| anyhow!("no stdout stream from pod {}/{}", namespace, pod))?;
        let mut stdout = String::new();
        stdout_stream
            .read_to_string(&mut stdout)
            .await
            .with_context(|| format!("reading exec output from pod {}/{}", namespace, pod))?;
        let _ = attached.join().await;
        Ok(stdout)
    }
}
