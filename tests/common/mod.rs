//! In-memory kubernetes store for exercising the sweeps, the unidler and the
//! HTTP handler without a cluster.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Namespace, Pod, PodStatus};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use k8s_openapi::chrono::{Duration as ChronoDuration, Utc};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use snooze::oracle::TrafficOracle;
use snooze::store::ResourceStore;

#[derive(Default)]
pub struct FakeStore {
    pub namespaces: Mutex<Vec<Namespace>>,
    pub deployments: Mutex<Vec<Deployment>>,
    pub pods: Mutex<Vec<Pod>>,
    pub ingresses: Mutex<Vec<Ingress>>,
    /// pod name -> canned exec stdout; a missing entry fails the exec
    pub exec_responses: Mutex<HashMap<String, String>>,
    /// (kind, namespace/name, patch) for every write that went through
    pub patch_log: Mutex<Vec<(String, String, Value)>>,
    pub fail_ingress_patches: AtomicBool,
    pub fail_deployment_patches: AtomicBool,
}

impl FakeStore {
    pub fn patch_count(&self, kind: &str) -> usize {
        self.patch_log.lock().unwrap().iter().filter(|(k, _, _)| k == kind).count()
    }

    pub fn deployment(&self, name: &str) -> Deployment {
        self.deployments
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.name_any() == name)
            .cloned()
            .unwrap_or_else(|| panic!("no deployment named {}", name))
    }

    pub fn ingress(&self, name: &str) -> Ingress {
        self.ingresses
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.name_any() == name)
            .cloned()
            .unwrap_or_else(|| panic!("no ingress named {}", name))
    }

    pub fn namespace(&self, name: &str) -> Namespace {
        self.namespaces
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.name_any() == name)
            .cloned()
            .unwrap_or_else(|| panic!("no namespace named {}", name))
    }
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn list_namespaces(&self, selector: &str) -> Result<Vec<Namespace>> {
        Ok(self
            .namespaces
            .lock()
            .unwrap()
            .iter()
            .filter(|n| matches_selector(n.labels(), selector))
            .cloned()
            .collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        self.namespaces
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.name_any() == name)
            .cloned()
            .ok_or_else(|| anyhow!("namespace {} not found", name))
    }

    async fn patch_namespace(&self, name: &str, patch: &Value) -> Result<()> {
        self.patch_log.lock().unwrap().push((
            "namespace".to_string(),
            name.to_string(),
            patch.clone(),
        ));
        apply_patch(&mut self.namespaces.lock().unwrap(), None, name, patch)
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .deployments
            .lock()
            .unwrap()
            .iter()
            .filter(|d| in_namespace(d.namespace(), namespace))
            .filter(|d| matches_selector(d.labels(), selector))
            .cloned()
            .collect())
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        if self.fail_deployment_patches.load(Ordering::SeqCst) {
            return Err(anyhow!("deployment patches are failing"));
        }
        self.patch_log.lock().unwrap().push((
            "deployment".to_string(),
            format!("{}/{}", namespace, name),
            patch.clone(),
        ));
        apply_patch(&mut self.deployments.lock().unwrap(), Some(namespace), name, patch)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| in_namespace(p.namespace(), namespace))
            .filter(|p| matches_selector(p.labels(), selector))
            .cloned()
            .collect())
    }

    async fn list_ingresses(&self, namespace: &str, selector: &str) -> Result<Vec<Ingress>> {
        Ok(self
            .ingresses
            .lock()
            .unwrap()
            .iter()
            .filter(|i| in_namespace(i.namespace(), namespace))
            .filter(|i| matches_selector(i.labels(), selector))
            .cloned()
            .collect())
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Ingress> {
        self.ingresses
            .lock()
            .unwrap()
            .iter()
            .find(|i| in_namespace(i.namespace(), namespace) && i.name_any() == name)
            .cloned()
            .ok_or_else(|| anyhow!("ingress {}/{} not found", namespace, name))
    }

    async fn patch_ingress(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        if self.fail_ingress_patches.load(Ordering::SeqCst) {
            return Err(anyhow!("ingress patches are failing"));
        }
        self.patch_log.lock().unwrap().push((
            "ingress".to_string(),
            format!("{}/{}", namespace, name),
            patch.clone(),
        ));
        apply_patch(&mut self.ingresses.lock().unwrap(), Some(namespace), name, patch)
    }

    async fn exec_pod(&self, _namespace: &str, pod: &str, _command: &[&str]) -> Result<String> {
        self.exec_responses
            .lock()
            .unwrap()
            .get(pod)
            .cloned()
            .ok_or_else(|| anyhow!("exec to pod {} failed", pod))
    }
}

/// Canned traffic oracle. `Err` simulates an unreachable prometheus.
pub struct FakeOracle {
    pub hits: std::result::Result<u64, String>,
}

#[async_trait]
impl TrafficOracle for FakeOracle {
    async fn namespace_hits(&self, _namespace: &str, _window: Duration) -> Result<u64> {
        self.hits.clone().map_err(|e| anyhow!(e))
    }
}

fn in_namespace(actual: Option<String>, wanted: &str) -> bool {
    actual.as_deref() == Some(wanted)
}

fn apply_patch<T>(
    items: &mut [T],
    namespace: Option<&str>,
    name: &str,
    patch: &Value,
) -> Result<()>
where
    T: Serialize + DeserializeOwned + kube::Resource<DynamicType = ()>,
{
    for item in items.iter_mut() {
        if item.name_any() != name {
            continue;
        }
        if let Some(ns) = namespace {
            if !in_namespace(item.namespace(), ns) {
                continue;
            }
        }
        let mut value = serde_json::to_value(&*item)?;
        merge_patch(&mut value, patch);
        *item = serde_json::from_value(value)?;
        return Ok(());
    }
    Err(anyhow!("{} not found for patching", name))
}

/// RFC 7386 merge patch: objects merge recursively, null removes the key.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let map = target.as_object_mut().unwrap();
    for (key, value) in patch_map {
        if value.is_null() {
            map.remove(key);
        } else {
            merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

/// Evaluates a label selector string the way the list API would. Supports
/// the forms the sweeps render: `k`, `!k`, `k=v`, `k!=v`, `k in (a,b)` and
/// `k notin (a,b)`.
pub fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    split_terms(selector).iter().all(|term| matches_term(labels, term))
}

fn split_terms(selector: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in selector.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                terms.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        terms.push(current.trim().to_string());
    }
    terms
}

fn matches_term(labels: &BTreeMap<String, String>, term: &str) -> bool {
    if let Some(key) = term.strip_prefix('!') {
        return !labels.contains_key(key.trim());
    }
    if let Some((key, values)) = parse_set(term, " notin ") {
        return labels.get(key).map(|v| !values.contains(&v.as_str())).unwrap_or(true);
    }
    if let Some((key, values)) = parse_set(term, " in ") {
        return labels.get(key).map(|v| values.contains(&v.as_str())).unwrap_or(false);
    }
    if let Some((key, value)) = term.split_once("!=") {
        return labels.get(key.trim()).map(String::as_str) != Some(value.trim());
    }
    if let Some((key, value)) = term.split_once('=') {
        return labels.get(key.trim()).map(String::as_str) == Some(value.trim());
    }
    labels.contains_key(term)
}

fn parse_set<'a>(term: &'a str, op: &str) -> Option<(&'a str, Vec<&'a str>)> {
    let (key, rest) = term.split_once(op)?;
    let values = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
    Some((key.trim(), values.split(',').map(str::trim).collect()))
}

fn meta(
    namespace: Option<&str>,
    name: &str,
    labels: &[(&str, &str)],
    annotations: &[(&str, &str)],
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
        annotations: Some(
            annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        ),
        ..Default::default()
    }
}

pub fn mk_namespace(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Namespace {
    Namespace { metadata: meta(None, name, labels, annotations), ..Default::default() }
}

pub fn mk_deployment(
    namespace: &str,
    name: &str,
    replicas: i32,
    labels: &[(&str, &str)],
    annotations: &[(&str, &str)],
) -> Deployment {
    Deployment {
        metadata: meta(Some(namespace), name, labels, annotations),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(
                    [("app".to_string(), name.to_string())].into_iter().collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mk_pod(
    namespace: &str,
    name: &str,
    labels: &[(&str, &str)],
    phase: &str,
    age_hours: i64,
) -> Pod {
    Pod {
        metadata: meta(Some(namespace), name, labels, &[]),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            start_time: Some(Time(Utc::now() - ChronoDuration::hours(age_hours))),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mk_ingress(
    namespace: &str,
    name: &str,
    labels: &[(&str, &str)],
    annotations: &[(&str, &str)],
) -> Ingress {
    Ingress { metadata: meta(Some(namespace), name, labels, annotations), ..Default::default() }
}
