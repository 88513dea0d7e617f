use crate::config::{db_path, get_admin_key, has_admin_key, AppConfig};
use crate::credentials::default_credentials_path;
use crate::error::{AppError, StorageWarning};
use crate::models::{AccountProfile, Metric, MonitorMode, Observation};
use crate::projection::{minutes_to_duration, Projection, ProjectionEngine, ReadinessPolicy};
use crate::providers::console::ConsoleCostSource;
use crate::providers::oauth::OAuthUsageSource;
use crate::providers::UsageSource;
use crate::storage::{Retention, SnapshotStore, SnapshotTable};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;

/// Outcome of one record -> prune -> project cycle.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub observation: Observation,
    /// `None` when the vendor did not report a period boundary.
    pub projection: Option<Projection>,
    pub warnings: Vec<StorageWarning>,
    pub pruned: usize,
}

pub struct MonitorService {
    client: Client,
    source: Box<dyn UsageSource>,
}

impl MonitorService {
    pub fn new(source: Box<dyn UsageSource>) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("usage-pulse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, source })
    }

    pub fn for_mode(mode: MonitorMode, cfg: &AppConfig) -> Result<Self, AppError> {
        let source: Box<dyn UsageSource> = match resolve_mode(mode) {
            MonitorMode::Console => Box::new(ConsoleCostSource::new(get_admin_key()?, cfg.api_base())),
            MonitorMode::Code | MonitorMode::Auto => {
                let credentials_path = cfg
                    .credentials_path
                    .clone()
                    .or_else(default_credentials_path)
                    .ok_or_else(|| {
                        AppError::Credentials("Could not locate the home directory".into())
                    })?;
                Box::new(OAuthUsageSource::new(credentials_path, cfg.api_base()))
            }
        };
        Self::new(source)
    }

    pub fn source(&self) -> &dyn UsageSource {
        self.source.as_ref()
    }

    /// `None` when the profile can't be fetched; monitoring doesn't need it.
    pub async fn profile(&self) -> Option<AccountProfile> {
        match self.source.fetch_profile(&self.client).await {
            Ok(profile) => Some(profile),
            Err(err) => {
                tracing::warn!(source = self.source.name(), error = %err, "could not load account profile");
                None
            }
        }
    }

    pub async fn poll(
        &self,
        store: &SnapshotStore,
        engine: &ProjectionEngine,
    ) -> Result<PollReport, AppError> {
        let now = Utc::now();
        let observation = self.source.fetch(&self.client, now).await?;
        Ok(record_and_project(
            store,
            engine,
            self.source.metric(),
            observation,
            now,
        ))
    }
}

/// Storage faults land in `warnings`; the cycle itself always completes.
pub fn record_and_project(
    store: &SnapshotStore,
    engine: &ProjectionEngine,
    metric: Metric,
    observation: Observation,
    now: DateTime<Utc>,
) -> PollReport {
    let snapshot = observation.to_snapshot();
    let mut warnings = Vec::new();

    if let Err(warning) = store.record(&snapshot) {
        warnings.push(warning);
    }
    let pruned = match store.prune_expired(now) {
        Ok(n) => n,
        Err(warning) => {
            warnings.push(warning);
            0
        }
    };

    let projection = observation
        .period_boundary
        .map(|boundary| engine.project(store, metric, &snapshot, boundary, now));

    PollReport {
        observation,
        projection,
        warnings,
        pruned,
    }
}

pub fn resolve_mode(requested: MonitorMode) -> MonitorMode {
    match requested {
        MonitorMode::Auto if has_admin_key() => MonitorMode::Console,
        MonitorMode::Auto => MonitorMode::Code,
        explicit => explicit,
    }
}

pub fn open_store(cfg: &AppConfig, table: SnapshotTable) -> Result<SnapshotStore, AppError> {
    SnapshotStore::open(
        &db_path()?,
        table,
        Retention::for_table(table, cfg.retention_hours)?,
    )
}

pub fn engine_for(cfg: &AppConfig) -> Result<ProjectionEngine, AppError> {
    let min_collection = minutes_to_duration(cfg.min_collection_minutes).ok_or_else(|| {
        AppError::Config(format!(
            "min_collection_minutes {} is out of range.",
            cfg.min_collection_minutes
        ))
    })?;
    ProjectionEngine::from_minutes(
        &cfg.rate_windows_minutes,
        ReadinessPolicy {
            min_collection,
            utilization_threshold: cfg.utilization_gate_percent,
        },
    )
    .ok_or_else(|| AppError::Config("rate_windows_minutes is out of range.".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rusqlite::Connection;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).single().expect("valid timestamp")
    }

    fn observation(ts: i64, cost: f64, boundary: Option<i64>) -> Observation {
        Observation {
            observed_at: at(ts),
            measure: Some(cost),
            utilization_percent: None,
            period_boundary: boundary.map(at),
            limits: vec![],
            period_label: Some("November 2025".into()),
            plan: None,
        }
    }

    fn open_in(tmp: &TempDir) -> SnapshotStore {
        SnapshotStore::open(
            &tmp.path().join("usage_history.sqlite"),
            SnapshotTable::FiveHour,
            Retention::Rolling(Duration::days(30)),
        )
        .expect("open store")
    }

    const NOW: i64 = 1_763_136_000;

    #[test]
    fn first_poll_records_and_reports_insufficient_data() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_in(&tmp);
        let engine = ProjectionEngine::default();

        let report = record_and_project(
            &store,
            &engine,
            Metric::Measure,
            observation(NOW, 10.0, Some(NOW + 3600)),
            at(NOW),
        );

        assert!(report.warnings.is_empty());
        assert_eq!(report.projection, Some(Projection::InsufficientData));
        assert_eq!(store.count().expect("count"), 1);
    }

    #[test]
    fn second_poll_projects_from_history() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_in(&tmp);
        let engine = ProjectionEngine::default();

        record_and_project(
            &store,
            &engine,
            Metric::Measure,
            observation(NOW - 1800, 10.0, Some(NOW + 3600)),
            at(NOW - 1800),
        );
        let report = record_and_project(
            &store,
            &engine,
            Metric::Measure,
            observation(NOW, 12.0, Some(NOW + 3600)),
            at(NOW),
        );

        let ready = report
            .projection
            .as_ref()
            .and_then(Projection::ready)
            .expect("ready projection");
        assert_eq!(ready.rate_per_hour, 4.0);
        assert_eq!(ready.projected_value, 16.0);
    }

    #[test]
    fn missing_boundary_skips_projection() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_in(&tmp);

        let report = record_and_project(
            &store,
            &ProjectionEngine::default(),
            Metric::Measure,
            observation(NOW, 10.0, None),
            at(NOW),
        );
        assert!(report.projection.is_none());
        assert_eq!(store.count().expect("count"), 1);
    }

    #[test]
    fn poll_prunes_expired_rows() {
        let tmp = TempDir::new().expect("tempdir");
        let store = SnapshotStore::open(
            &tmp.path().join("usage_history.sqlite"),
            SnapshotTable::FiveHour,
            Retention::Rolling(Duration::hours(24)),
        )
        .expect("open store");
        store
            .record(&observation(NOW - 25 * 3600, 1.0, None).to_snapshot())
            .expect("seed old row");

        let report = record_and_project(
            &store,
            &ProjectionEngine::default(),
            Metric::Measure,
            observation(NOW, 2.0, None),
            at(NOW),
        );
        assert_eq!(report.pruned, 1);
        assert_eq!(store.count().expect("count"), 1);
    }

    #[test]
    fn storage_failure_keeps_the_cycle_going() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_in(&tmp);
        let engine = ProjectionEngine::default();
        record_and_project(
            &store,
            &engine,
            Metric::Measure,
            observation(NOW - 1800, 10.0, Some(NOW + 3600)),
            at(NOW - 1800),
        );

        let conn = Connection::open(tmp.path().join("usage_history.sqlite")).expect("open sqlite");
        conn.execute_batch(
            "CREATE TRIGGER no_writes BEFORE INSERT ON usage_snapshots
             BEGIN SELECT RAISE(ABORT, 'attempt to write a readonly database'); END;",
        )
        .expect("install trigger");

        let report = record_and_project(
            &store,
            &engine,
            Metric::Measure,
            observation(NOW, 11.0, Some(NOW + 3600)),
            at(NOW),
        );

        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].operation, "record");
        let ready = report
            .projection
            .as_ref()
            .and_then(Projection::ready)
            .expect("live value still projects");
        assert_eq!(ready.current_value, 11.0);
        assert_eq!(ready.rate_per_hour, 2.0);
    }

    struct ScriptedSource {
        costs: Mutex<Vec<f64>>,
        organization: Option<&'static str>,
    }

    #[async_trait]
    impl UsageSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn metric(&self) -> Metric {
            Metric::Measure
        }

        fn table(&self) -> SnapshotTable {
            SnapshotTable::Monthly
        }

        async fn fetch(&self, _: &Client, now: DateTime<Utc>) -> Result<Observation, AppError> {
            let next = self
                .costs
                .lock()
                .expect("costs lock")
                .pop()
                .ok_or_else(|| AppError::Api("script exhausted".into()))?;
            Ok(Observation {
                observed_at: now,
                measure: Some(next),
                utilization_percent: None,
                period_boundary: Some(now + Duration::days(3)),
                limits: vec![],
                period_label: None,
                plan: None,
            })
        }

        async fn fetch_profile(&self, _: &Client) -> Result<AccountProfile, AppError> {
            let name = self
                .organization
                .ok_or_else(|| AppError::Api("API error: 404 Not Found".into()))?;
            Ok(AccountProfile {
                organization: Some(name.to_string()),
                ..AccountProfile::default()
            })
        }
    }

    #[tokio::test]
    async fn poll_runs_a_full_cycle_with_any_source() {
        let tmp = TempDir::new().expect("tempdir");
        let store = SnapshotStore::open(
            &tmp.path().join("usage_history.sqlite"),
            SnapshotTable::Monthly,
            Retention::CalendarMonth,
        )
        .expect("open store");
        let service = MonitorService::new(Box::new(ScriptedSource {
            costs: Mutex::new(vec![3.0]),
            organization: Some("Acme"),
        }))
        .expect("service");

        let report = service
            .poll(&store, &ProjectionEngine::default())
            .await
            .expect("poll");
        assert_eq!(report.observation.measure, Some(3.0));
        assert_eq!(report.projection, Some(Projection::InsufficientData));
        assert_eq!(service.source().name(), "scripted");

        let err = service
            .poll(&store, &ProjectionEngine::default())
            .await
            .expect_err("fetch errors propagate");
        assert!(err.to_string().contains("script exhausted"));
    }

    #[test]
    fn explicit_modes_are_kept() {
        assert_eq!(resolve_mode(MonitorMode::Code), MonitorMode::Code);
        assert_eq!(resolve_mode(MonitorMode::Console), MonitorMode::Console);
    }

    #[test]
    fn engine_follows_config_windows() {
        let cfg = AppConfig {
            rate_windows_minutes: vec![15, 45],
            ..AppConfig::default()
        };
        let engine = engine_for(&cfg).expect("engine");
        assert_eq!(
            engine.windows(),
            &[Duration::minutes(15), Duration::minutes(45)]
        );
    }

    #[test]
    fn engine_rejects_out_of_range_durations() {
        let huge_windows = AppConfig {
            rate_windows_minutes: vec![30, u64::MAX],
            ..AppConfig::default()
        };
        assert!(matches!(engine_for(&huge_windows), Err(AppError::Config(_))));

        let huge_collection = AppConfig {
            min_collection_minutes: u64::MAX,
            ..AppConfig::default()
        };
        assert!(matches!(engine_for(&huge_collection), Err(AppError::Config(_))));
    }

    #[test]
    fn corrupt_database_still_yields_a_report() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("usage_history.sqlite");
        std::fs::write(&path, vec![0x42u8; 8192]).expect("write garbage");
        let store = SnapshotStore::open(&path, SnapshotTable::FiveHour, Retention::Rolling(Duration::days(30)))
            .expect("corrupt file is not fatal");

        let report = record_and_project(
            &store,
            &ProjectionEngine::default(),
            Metric::Measure,
            observation(NOW, 10.0, Some(NOW + 3600)),
            at(NOW),
        );

        let operations: Vec<&str> = report.warnings.iter().map(|w| w.operation).collect();
        assert_eq!(operations, vec!["record", "prune"]);
        assert_eq!(report.observation.measure, Some(10.0));
        assert_eq!(report.projection, Some(Projection::InsufficientData));
    }

    #[tokio::test]
    async fn profile_failure_is_not_fatal() {
        let service = MonitorService::new(Box::new(ScriptedSource {
            costs: Mutex::new(vec![]),
            organization: None,
        }))
        .expect("service");
        assert_eq!(service.profile().await, None);

        let named = MonitorService::new(Box::new(ScriptedSource {
            costs: Mutex::new(vec![]),
            organization: Some("Acme"),
        }))
        .expect("service");
        assert_eq!(
            named.profile().await.and_then(|p| p.organization).as_deref(),
            Some("Acme")
        );
    }
}
