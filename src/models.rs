use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One observed sample, keyed by whole-second `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: i64,
    pub measure: Option<f64>,
    pub utilization_percent: Option<f64>,
    pub period_boundary: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Measure => self.measure,
            Metric::Utilization => self.utilization_percent,
        }
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Metric {
    Measure,
    Utilization,
}

impl Metric {
    pub fn as_label(self) -> &'static str {
        match self {
            Metric::Measure => "measure",
            Metric::Utilization => "utilization",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Auto,
    Code,
    Console,
}

impl MonitorMode {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(MonitorMode::Auto),
            "code" => Some(MonitorMode::Code),
            "console" => Some(MonitorMode::Console),
            _ => None,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            MonitorMode::Auto => "auto",
            MonitorMode::Code => "code",
            MonitorMode::Console => "console",
        }
    }
}

/// A vendor-reported rate limit bucket, kept for display only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitWindow {
    pub label: String,
    pub utilization: f64,
    pub resets_at: Option<DateTime<Utc>>,
}

/// Who the dashboard is reporting on. Fetched once at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub organization: Option<String>,
}

impl AccountProfile {
    /// Vendor names sometimes carry a literal "Organization" suffix.
    pub fn clean_name(raw: &str) -> Option<String> {
        let cleaned = raw.replace("Organization", "");
        let cleaned = cleaned.trim();
        (!cleaned.is_empty()).then(|| cleaned.to_string())
    }

    pub fn label(&self) -> Option<String> {
        let who = match (&self.display_name, &self.email) {
            (Some(name), Some(email)) => Some(format!("{name} ({email})")),
            (Some(name), None) => Some(name.clone()),
            (None, Some(email)) => Some(email.clone()),
            (None, None) => None,
        };
        match (who, &self.organization) {
            (Some(who), Some(org)) => Some(format!("{who} · {org}")),
            (Some(who), None) => Some(who),
            (None, Some(org)) => Some(org.clone()),
            (None, None) => None,
        }
    }
}

/// What an API client returns for a single poll. Any numeric field may be
/// missing when the vendor omitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub observed_at: DateTime<Utc>,
    pub measure: Option<f64>,
    pub utilization_percent: Option<f64>,
    pub period_boundary: Option<DateTime<Utc>>,
    pub limits: Vec<LimitWindow>,
    pub period_label: Option<String>,
    pub plan: Option<String>,
}

impl Observation {
    pub fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            timestamp: self.observed_at.timestamp(),
            measure: self.measure,
            utilization_percent: self.utilization_percent,
            period_boundary: self.period_boundary,
        }
    }
}
