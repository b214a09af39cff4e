//! Selector configuration for the idler sweeps.
//!
//! The selectors describe which namespaces, builds, deployments, pods and
//! ingresses each sweep should look at. They are loaded once at startup from
//! a JSON file, falling back to built-in defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Exists,
    DoesNotExist,
    Equals,
    NotEquals,
    In,
    NotIn,
}

/// A single label requirement, rendered into a kubernetes label selector.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Requirement {
    pub name: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Requirement {
    pub fn exists(name: &str) -> Self {
        Requirement { name: name.to_string(), operator: Operator::Exists, values: vec![] }
    }

    pub fn is_in(name: &str, values: &[&str]) -> Self {
        Requirement {
            name: name.to_string(),
            operator: Operator::In,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn render(&self) -> String {
        match self.operator {
            Operator::Exists => self.name.clone(),
            Operator::DoesNotExist => format!("!{}", self.name),
            Operator::Equals => format!("{}={}", self.name, self.values.first().map(String::as_str).unwrap_or("")),
            Operator::NotEquals => format!("{}!={}", self.name, self.values.first().map(String::as_str).unwrap_or("")),
            Operator::In => format!("{} in ({})", self.name, self.values.join(",")),
            Operator::NotIn => format!("{} notin ({})", self.name, self.values.join(",")),
        }
    }
}

/// Renders a set of requirements into a label selector string usable with
/// the kubernetes list API.
pub fn render_selector(requirements: &[Requirement]) -> String {
    requirements.iter().map(Requirement::render).collect::<Vec<_>>().join(",")
}

/// Namespace labels used to gate idling eligibility.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NamespaceLabels {
    pub project_name: String,
    pub environment_name: String,
    pub project_idling: String,
    pub environment_idling: String,
    pub environment_type: String,
}

impl Default for NamespaceLabels {
    fn default() -> Self {
        NamespaceLabels {
            project_name: "snooze.dev/project".to_string(),
            environment_name: "snooze.dev/environment".to_string(),
            project_idling: "snooze.dev/project-idling".to_string(),
            environment_idling: "snooze.dev/environment-idling".to_string(),
            environment_type: "snooze.dev/environment-type".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceSelectors {
    pub skip_build_check: bool,
    pub skip_hit_check: bool,
    pub skip_ingress_patch: bool,
    pub namespace: Vec<Requirement>,
    pub builds: Vec<Requirement>,
    pub deployments: Vec<Requirement>,
    pub ingress: Vec<Requirement>,
}

impl Default for ServiceSelectors {
    fn default() -> Self {
        ServiceSelectors {
            skip_build_check: false,
            skip_hit_check: false,
            skip_ingress_patch: false,
            namespace: vec![Requirement::exists("snooze.dev/project")],
            builds: vec![Requirement::is_in("snooze.dev/jobType", &["build"])],
            deployments: vec![Requirement {
                name: "snooze.dev/service-type".to_string(),
                operator: Operator::NotIn,
                values: vec!["cli".to_string(), "cli-persistent".to_string()],
            }],
            ingress: vec![Requirement::exists("snooze.dev/service")],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CliSelectors {
    pub skip_build_check: bool,
    pub skip_cron_check: bool,
    pub skip_process_check: bool,
    pub namespace: Vec<Requirement>,
    pub builds: Vec<Requirement>,
    pub deployments: Vec<Requirement>,
}

impl Default for CliSelectors {
    fn default() -> Self {
        CliSelectors {
            skip_build_check: false,
            skip_cron_check: false,
            skip_process_check: false,
            namespace: vec![Requirement::exists("snooze.dev/project")],
            builds: vec![Requirement::is_in("snooze.dev/jobType", &["build"])],
            deployments: vec![Requirement::is_in(
                "snooze.dev/service-type",
                &["cli", "cli-persistent"],
            )],
        }
    }
}

/// The full selector configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Selectors {
    pub namespace_labels: NamespaceLabels,
    /// Pods carry this label with the name of the deployment backing them.
    pub service_name_label: String,
    /// Environment type that is eligible for idling.
    pub idle_environment_type: String,
    pub service: ServiceSelectors,
    pub cli: CliSelectors,
}

impl Selectors {
    pub fn with_defaults() -> Self {
        Selectors {
            service_name_label: "snooze.dev/service".to_string(),
            idle_environment_type: "development".to_string(),
            ..Default::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read selectors file {}", path.display()))?;
        let mut selectors: Selectors = serde_json::from_str(&raw)
            .with_context(|| format!("unable to decode selectors file {}", path.display()))?;
        if selectors.service_name_label.is_empty() {
            selectors.service_name_label = "snooze.dev/service".to_string();
        }
        if selectors.idle_environment_type.is_empty() {
            selectors.idle_environment_type = "development".to_string();
        }
        Ok(selectors)
    }
}

/// Parses durations of the form "90s", "30m", "4h", "1d" or compounds like
/// "1h30m". Used for flag values and per-namespace annotation overrides.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return Err(anyhow!("empty duration"));
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut matched = false;
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().map_err(|_| anyhow!("invalid duration {value:?}"))?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(anyhow!("invalid duration unit {c:?} in {value:?}")),
        };
        let seconds =
            n.checked_mul(unit).ok_or_else(|| anyhow!("duration {value:?} overflows"))?;
        total = total
            .checked_add(Duration::from_secs(seconds))
            .ok_or_else(|| anyhow!("duration {value:?} overflows"))?;
        matched = true;
    }
    if !digits.is_empty() || !matched {
        return Err(anyhow!("invalid duration {value:?}"));
    }
    Ok(total)
}

/// Reads a newline separated list from a file, returning `None` when the
/// file does not exist. Used for the global allow/block lists.
pub fn read_list_file(path: &Path) -> Option<Vec<String>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let lines: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines)
    }
}

/// Looks up a duration override in a namespace annotation, falling back to
/// the given default when absent or unparseable.
pub fn duration_override(
    annotations: &BTreeMap<String, String>,
    key: &str,
    default: Duration,
) -> Duration {
    annotations
        .get(key)
        .and_then(|v| parse_duration(v).ok())
        .unwrap_or(default)
}
