use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use kube::Client;
use log::{error, info, warn};
use tokio::signal;

use snooze::config::{parse_duration, read_list_file, Selectors};
use snooze::idler::Idler;
use snooze::locks::LockRegistry;
use snooze::metrics::Metrics;
use snooze::oracle::PrometheusOracle;
use snooze::reconciler::Reconciler;
use snooze::store::KubeStore;
use snooze::unidler::restrictions::GlobalLists;
use snooze::unidler::{handler, Unidler};

#[derive(Debug, Parser)]
struct Opt {
    /// JSON file with the sweep selectors; built-in defaults when unset.
    #[clap(long, env = "SELECTORS_FILE")]
    selectors_file: Option<PathBuf>,

    /// Log would-be changes without patching anything.
    #[clap(long, env = "DRY_RUN", default_value_t = false)]
    dry_run: bool,

    #[clap(long, env = "ENABLE_SERVICE_IDLER", action = ArgAction::Set, default_value_t = true)]
    enable_service_idler: bool,

    #[clap(long, env = "ENABLE_CLI_IDLER", action = ArgAction::Set, default_value_t = true)]
    enable_cli_idler: bool,

    #[clap(long, env = "SERVICE_IDLER_INTERVAL", default_value = "30m")]
    service_idler_interval: String,

    #[clap(long, env = "CLI_IDLER_INTERVAL", default_value = "30m")]
    cli_idler_interval: String,

    /// Minimum pod age before an environment is considered for idling.
    /// A bare integer is taken as hours.
    #[clap(long, env = "POD_CHECK_INTERVAL", default_value = "4h")]
    pod_check_interval: String,

    #[clap(
        long,
        env = "PROMETHEUS_ADDRESS",
        default_value = "http://monitoring-kube-prometheus-prometheus.monitoring.svc:9090"
    )]
    prometheus_address: String,

    /// Window queried for router hits before idling.
    #[clap(long, env = "PROMETHEUS_CHECK_INTERVAL", default_value = "1h")]
    prometheus_check_interval: String,

    /// Idle without consulting the traffic oracle.
    #[clap(long, env = "SKIP_HIT_CHECK", default_value_t = false)]
    skip_hit_check: bool,

    /// Seconds between refreshes of the waiting page.
    #[clap(long, env = "REFRESH_INTERVAL", default_value_t = 5)]
    refresh_interval: u32,

    #[clap(long, env = "UNIDLER_PORT", default_value_t = 5000)]
    unidler_port: u16,

    /// Require an HMAC verifier before unidling.
    #[clap(long, env = "VERIFIED_UNIDLING", default_value_t = false)]
    verified_unidling: bool,

    #[clap(long, env = "VERIFIED_SECRET", default_value = "")]
    verified_secret: String,

    /// Status code served when the ingress controller supplies none.
    #[clap(long, env = "DEFAULT_HTTP_RESPONSE_CODE", default_value_t = 404)]
    default_http_response_code: u16,

    /// Directory holding the global allow/block list files.
    #[clap(long, env = "LISTS_DIR", default_value = "/lists")]
    lists_dir: PathBuf,

    #[clap(long, env = "DEBUG", default_value_t = false)]
    debug: bool,
}

/// Accepts "4h30m" style durations, or a bare integer meaning hours.
fn duration_flag(value: &str) -> Result<Duration> {
    if let Ok(hours) = value.trim().parse::<u64>() {
        let seconds = hours
            .checked_mul(3600)
            .with_context(|| format!("duration {value:?} overflows"))?;
        return Ok(Duration::from_secs(seconds));
    }
    parse_duration(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::init();

    let mut selectors = match &opt.selectors_file {
        Some(path) => Selectors::from_file(path)?,
        None => Selectors::with_defaults(),
    };
    if opt.skip_hit_check {
        selectors.service.skip_hit_check = true;
    }

    let service_idler_interval = parse_duration(&opt.service_idler_interval)
        .context("invalid --service-idler-interval")?;
    let cli_idler_interval =
        parse_duration(&opt.cli_idler_interval).context("invalid --cli-idler-interval")?;
    let pod_check_interval =
        duration_flag(&opt.pod_check_interval).context("invalid --pod-check-interval")?;
    let prometheus_check_interval = parse_duration(&opt.prometheus_check_interval)
        .context("invalid --prometheus-check-interval")?;

    if opt.verified_unidling && opt.verified_secret.is_empty() {
        warn!("verified unidling is enabled without a secret; requests will not verify");
    }

    let client = Client::try_default().await.context("building kubernetes client")?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let oracle = Arc::new(PrometheusOracle::new(opt.prometheus_address.clone())?);
    let metrics = Arc::new(Metrics::new()?);
    let locks = LockRegistry::new();

    let global_lists = GlobalLists {
        allowed_ips: read_list_file(&opt.lists_dir.join("ip-allow-list")),
        blocked_ips: read_list_file(&opt.lists_dir.join("ip-block-list")),
        allowed_agents: read_list_file(&opt.lists_dir.join("allowed-agents")),
        blocked_agents: read_list_file(&opt.lists_dir.join("blocked-agents")),
    };

    let idler = Arc::new(Idler {
        store: store.clone(),
        oracle,
        metrics: Arc::clone(&metrics),
        selectors,
        pod_check_interval,
        prometheus_check_interval,
        dry_run: opt.dry_run,
        debug: opt.debug,
    });
    let unidler = Arc::new(Unidler {
        store,
        metrics,
        locks,
        global_lists,
        refresh_interval: opt.refresh_interval,
        default_response_code: opt.default_http_response_code,
        verified_unidling: opt.verified_unidling,
        verified_secret: opt.verified_secret.clone(),
        debug: opt.debug,
    });

    if opt.enable_service_idler {
        let idler = Arc::clone(&idler);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service_idler_interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                info!("starting service idler sweep");
                idler.service_idler().await;
            }
        });
    }
    if opt.enable_cli_idler {
        let idler = Arc::clone(&idler);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cli_idler_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!("starting cli idler sweep");
                idler.cli_idler().await;
            }
        });
    }

    {
        let reconciler = Reconciler {
            idler: Arc::clone(&idler),
            unidler: Arc::clone(&unidler),
            debug: opt.debug,
        };
        tokio::spawn(async move {
            loop {
                if let Err(e) = reconciler.run(client.clone()).await {
                    error!("namespace watch failed, restarting: {}", e);
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    tokio::select! {
        result = handler::run(unidler, opt.unidler_port) => result?,
        _ = signal::ctrl_c() => info!("exiting..."),
    }

    Ok(())
}
