//! End-to-end idling sweeps against the in-memory store.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{mk_deployment, mk_ingress, mk_namespace, mk_pod, FakeOracle, FakeStore};
use snooze::config::Selectors;
use snooze::idler::Idler;
use snooze::keys;
use snooze::metrics::Metrics;

const NS_LABELS: &[(&str, &str)] = &[
    ("snooze.dev/project", "app"),
    ("snooze.dev/project-idling", "1"),
    ("snooze.dev/environment-idling", "1"),
    ("snooze.dev/environment-type", "development"),
];

fn idler(store: Arc<FakeStore>, hits: Result<u64, String>, dry_run: bool) -> Idler {
    Idler {
        store,
        oracle: Arc::new(FakeOracle { hits }),
        metrics: Arc::new(Metrics::new().unwrap()),
        selectors: Selectors::with_defaults(),
        pod_check_interval: Duration::from_secs(4 * 3600),
        prometheus_check_interval: Duration::from_secs(3600),
        dry_run,
        debug: true,
    }
}

/// An inactive environment: one web deployment with two replicas whose pods
/// have outlived the age threshold.
fn inactive_environment() -> Arc<FakeStore> {
    let store = FakeStore::default();
    store.namespaces.lock().unwrap().push(mk_namespace("app-dev", NS_LABELS, &[]));
    store.deployments.lock().unwrap().push(mk_deployment("app-dev", "web", 2, &[], &[]));
    store.pods.lock().unwrap().push(mk_pod(
        "app-dev",
        "web-1",
        &[("app", "web"), ("snooze.dev/service", "web")],
        "Running",
        5,
    ));
    store.ingresses.lock().unwrap().push(mk_ingress(
        "app-dev",
        "web",
        &[("snooze.dev/service", "web")],
        &[(keys::CUSTOM_HTTP_ERRORS, "404")],
    ));
    Arc::new(store)
}

#[tokio::test]
async fn inactive_environment_is_idled() {
    let store = inactive_environment();
    idler(store.clone(), Ok(0), false).service_idler().await;

    let deployment = store.deployment("web");
    assert_eq!(deployment.spec.unwrap().replicas, Some(0));
    let annotations = deployment.metadata.annotations.unwrap();
    assert_eq!(annotations.get(keys::UNIDLE_REPLICAS).map(String::as_str), Some("2"));
    assert!(annotations.contains_key(keys::IDLED_AT));
    let labels = deployment.metadata.labels.unwrap();
    assert_eq!(labels.get(keys::WATCH).map(String::as_str), Some("true"));
    assert_eq!(labels.get(keys::IDLED).map(String::as_str), Some("true"));

    // the router now sends traffic for the environment to the unidler
    let ingress = store.ingress("web");
    let annotations = ingress.metadata.annotations.unwrap();
    assert_eq!(annotations.get(keys::CUSTOM_HTTP_ERRORS).map(String::as_str), Some("404,503"));
}

#[tokio::test]
async fn recent_traffic_cancels_idling() {
    let store = inactive_environment();
    idler(store.clone(), Ok(7), false).service_idler().await;

    assert_eq!(store.deployment("web").spec.unwrap().replicas, Some(2));
    assert_eq!(store.patch_count("deployment"), 0);
    assert_eq!(store.patch_count("ingress"), 0);
}

#[tokio::test]
async fn oracle_failure_cancels_idling() {
    let store = inactive_environment();
    idler(store.clone(), Err("prometheus unreachable".to_string()), false)
        .service_idler()
        .await;

    assert_eq!(store.deployment("web").spec.unwrap().replicas, Some(2));
    assert_eq!(store.patch_count("ingress"), 0);
}

#[tokio::test]
async fn young_pods_keep_the_environment_awake() {
    let store = inactive_environment();
    store.pods.lock().unwrap().clear();
    store.pods.lock().unwrap().push(mk_pod(
        "app-dev",
        "web-1",
        &[("app", "web"), ("snooze.dev/service", "web")],
        "Running",
        1,
    ));
    idler(store.clone(), Ok(0), false).service_idler().await;

    assert_eq!(store.deployment("web").spec.unwrap().replicas, Some(2));
}

#[tokio::test]
async fn running_build_blocks_idling() {
    let store = inactive_environment();
    store.pods.lock().unwrap().push(mk_pod(
        "app-dev",
        "build-1",
        &[("snooze.dev/jobType", "build")],
        "Running",
        0,
    ));
    idler(store.clone(), Ok(0), false).service_idler().await;

    assert_eq!(store.deployment("web").spec.unwrap().replicas, Some(2));
    assert_eq!(store.patch_count("ingress"), 0);
}

#[tokio::test]
async fn ingress_patch_failure_aborts_the_namespace() {
    let store = inactive_environment();
    store.fail_ingress_patches.store(true, Ordering::SeqCst);
    idler(store.clone(), Ok(0), false).service_idler().await;

    // deployments stay up when the sentinel could not be installed
    assert_eq!(store.deployment("web").spec.unwrap().replicas, Some(2));
    assert_eq!(store.patch_count("deployment"), 0);
}

#[tokio::test]
async fn dry_run_patches_nothing() {
    let store = inactive_environment();
    idler(store.clone(), Ok(0), true).service_idler().await;

    assert_eq!(store.patch_count("deployment"), 0);
    assert_eq!(store.patch_count("ingress"), 0);
    assert_eq!(store.deployment("web").spec.unwrap().replicas, Some(2));
}

#[tokio::test]
async fn unmanaged_namespaces_are_skipped() {
    let store = inactive_environment();
    {
        let mut namespaces = store.namespaces.lock().unwrap();
        namespaces.clear();
        namespaces.push(mk_namespace(
            "app-dev",
            &[
                ("snooze.dev/project", "app"),
                ("snooze.dev/project-idling", "1"),
                ("snooze.dev/environment-idling", "1"),
                ("snooze.dev/environment-type", "production"),
            ],
            &[],
        ));
    }
    idler(store.clone(), Ok(0), false).service_idler().await;

    assert_eq!(store.patch_count("deployment"), 0);
}

#[tokio::test]
async fn cli_sweep_scales_down_idle_cli_pods() {
    let store = FakeStore::default();
    store.namespaces.lock().unwrap().push(mk_namespace("app-dev", NS_LABELS, &[]));
    store.deployments.lock().unwrap().push(mk_deployment(
        "app-dev",
        "cli",
        1,
        &[("snooze.dev/service-type", "cli")],
        &[],
    ));
    store.pods.lock().unwrap().push(mk_pod(
        "app-dev",
        "cli-1",
        &[("app", "cli"), ("snooze.dev/service", "cli")],
        "Running",
        2,
    ));
    store.exec_responses.lock().unwrap().insert("cli-1".to_string(), "0\n".to_string());
    let store = Arc::new(store);

    idler(store.clone(), Ok(0), false).cli_idler().await;

    assert_eq!(store.deployment("cli").spec.unwrap().replicas, Some(0));
}

#[tokio::test]
async fn cli_sweep_idles_every_environment_type() {
    // cli reaping is not limited to the idle-eligible environment type
    let store = FakeStore::default();
    store.namespaces.lock().unwrap().push(mk_namespace(
        "app-main",
        &[
            ("snooze.dev/project", "app"),
            ("snooze.dev/project-idling", "1"),
            ("snooze.dev/environment-idling", "1"),
            ("snooze.dev/environment-type", "production"),
        ],
        &[],
    ));
    store.deployments.lock().unwrap().push(mk_deployment(
        "app-main",
        "cli",
        1,
        &[("snooze.dev/service-type", "cli")],
        &[],
    ));
    store.pods.lock().unwrap().push(mk_pod(
        "app-main",
        "cli-1",
        &[("app", "cli"), ("snooze.dev/service", "cli")],
        "Running",
        2,
    ));
    store.exec_responses.lock().unwrap().insert("cli-1".to_string(), "0\n".to_string());
    let store = Arc::new(store);

    idler(store.clone(), Ok(0), false).cli_idler().await;

    assert_eq!(store.deployment("cli").spec.unwrap().replicas, Some(0));
}

#[tokio::test]
async fn cli_sweep_still_requires_the_idling_labels() {
    let store = FakeStore::default();
    store.namespaces.lock().unwrap().push(mk_namespace(
        "app-main",
        &[
            ("snooze.dev/project", "app"),
            ("snooze.dev/project-idling", "0"),
            ("snooze.dev/environment-idling", "1"),
            ("snooze.dev/environment-type", "production"),
        ],
        &[],
    ));
    store.deployments.lock().unwrap().push(mk_deployment(
        "app-main",
        "cli",
        1,
        &[("snooze.dev/service-type", "cli")],
        &[],
    ));
    store.exec_responses.lock().unwrap().insert("cli-1".to_string(), "0\n".to_string());
    let store = Arc::new(store);

    idler(store.clone(), Ok(0), false).cli_idler().await;

    assert_eq!(store.deployment("cli").spec.unwrap().replicas, Some(1));
    assert_eq!(store.patch_count("deployment"), 0);
}

#[tokio::test]
async fn cli_sweep_skips_busy_pods_and_failed_probes() {
    let store = FakeStore::default();
    store.namespaces.lock().unwrap().push(mk_namespace("app-dev", NS_LABELS, &[]));
    store.deployments.lock().unwrap().push(mk_deployment(
        "app-dev",
        "cli",
        1,
        &[("snooze.dev/service-type", "cli")],
        &[],
    ));
    // busy-1 reports a running process, probe-1 has no canned response so
    // its exec fails; neither may cause a scale down
    store.pods.lock().unwrap().push(mk_pod(
        "app-dev",
        "busy-1",
        &[("app", "cli"), ("snooze.dev/service", "cli")],
        "Running",
        2,
    ));
    store.pods.lock().unwrap().push(mk_pod(
        "app-dev",
        "probe-1",
        &[("app", "cli"), ("snooze.dev/service", "cli")],
        "Running",
        2,
    ));
    store.exec_responses.lock().unwrap().insert("busy-1".to_string(), "2\n".to_string());
    let store = Arc::new(store);

    idler(store.clone(), Ok(0), false).cli_idler().await;

    assert_eq!(store.deployment("cli").spec.unwrap().replicas, Some(1));
    assert_eq!(store.patch_count("deployment"), 0);
}
