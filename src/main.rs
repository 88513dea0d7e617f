mod config;
mod credentials;
mod error;
mod models;
mod period;
mod projection;
mod providers;
mod service;
mod storage;
mod ui;

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use config::{ensure_initialized, load_config, log_path, set_admin_key};
use error::AppError;
use models::{AccountProfile, Metric, MonitorMode, Snapshot};
use projection::Projection;
use service::{engine_for, open_store, resolve_mode, MonitorService, PollReport};
use std::fs::OpenOptions;
use std::sync::Mutex;
use storage::SnapshotTable;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ui::run::run_tui;

#[derive(Debug, Parser)]
#[command(name = "usage-pulse")]
#[command(about = "Live Claude usage limits and spend projections")]
struct Cli {
    /// Log at debug level to the data directory log file.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    SetAdminKey {
        #[arg(long)]
        key: String,
    },
    Watch {
        #[arg(long)]
        mode: Option<String>,
    },
    Poll {
        #[arg(long)]
        mode: Option<String>,
    },
    History {
        #[arg(long, default_value = "five-hour")]
        table: String,
        #[arg(long, default_value_t = 24)]
        hours: u64,
        #[arg(long, default_value = "json")]
        format: String,
    },
    Prune {
        #[arg(long, default_value = "five-hour")]
        table: String,
    },
    Status {
        #[arg(long, default_value = "five-hour")]
        table: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportFormat {
    Json,
    Csv,
}

fn validate_mode(input: Option<&str>, fallback: MonitorMode) -> Result<MonitorMode, AppError> {
    match input {
        None => Ok(fallback),
        Some(raw) => MonitorMode::parse(raw).ok_or_else(|| {
            AppError::Config("Unsupported mode. Use auto, code, or console.".into())
        }),
    }
}

fn validate_table(input: &str) -> Result<SnapshotTable, AppError> {
    SnapshotTable::parse(input)
        .ok_or_else(|| AppError::Config("Unsupported table. Use five-hour or monthly.".into()))
}

fn validate_format(input: &str) -> Result<ExportFormat, AppError> {
    if input.eq_ignore_ascii_case("json") {
        Ok(ExportFormat::Json)
    } else if input.eq_ignore_ascii_case("csv") {
        Ok(ExportFormat::Csv)
    } else {
        Err(AppError::Config(
            "Unsupported export format. Use json or csv".into(),
        ))
    }
}

fn validate_hours(hours: u64) -> Result<Duration, AppError> {
    if hours == 0 {
        return Err(AppError::Config(
            "History window must be at least 1 hour.".into(),
        ));
    }
    i64::try_from(hours)
        .ok()
        .and_then(Duration::try_hours)
        .ok_or_else(|| AppError::Config("History window is too large.".into()))
}

fn history_start(now: DateTime<Utc>, span: Duration) -> Result<DateTime<Utc>, AppError> {
    now.checked_sub_signed(span)
        .ok_or_else(|| AppError::Config("History window is too large.".into()))
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn optional_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn snapshot_csv_row(snapshot: &Snapshot) -> String {
    format!(
        "{},{},{},{},{}",
        snapshot.timestamp,
        csv_field(
            &snapshot
                .observed_at()
                .map(|d| d.to_rfc3339())
                .unwrap_or_default()
        ),
        optional_number(snapshot.measure),
        optional_number(snapshot.utilization_percent),
        csv_field(
            &snapshot
                .period_boundary
                .map(|d| d.to_rfc3339())
                .unwrap_or_default()
        ),
    )
}

fn describe_snapshot(snapshot: &Snapshot) -> String {
    let at = snapshot
        .observed_at()
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| snapshot.timestamp.to_string());
    let mut parts = vec![at];
    if let Some(measure) = snapshot.measure {
        parts.push(format!("measure {measure}"));
    }
    if let Some(utilization) = snapshot.utilization_percent {
        parts.push(format!("utilization {utilization}%"));
    }
    parts.join(", ")
}

fn describe_projection(projection: Option<&Projection>, metric: Metric) -> String {
    match projection {
        None => "skipped (no period boundary)".to_string(),
        Some(Projection::Ready(p)) => format!(
            "{} {} -> {:.2} at boundary ({:.4}/h over {} min, {:.2} h left{})",
            metric.as_label(),
            p.current_value,
            p.projected_value,
            p.rate_per_hour,
            p.window_used.num_minutes(),
            p.hours_until_boundary,
            if p.is_ready { "" } else { ", still collecting" }
        ),
        Some(other) => other.status_label().to_string(),
    }
}

fn print_report(report: &PollReport, metric: Metric) {
    let obs = &report.observation;
    println!("Observed at {}", obs.observed_at.to_rfc3339());
    if let Some(utilization) = obs.utilization_percent {
        println!("Utilization: {utilization:.1}%");
    }
    if let Some(measure) = obs.measure {
        println!("Spend: ${measure:.2}");
    }
    for limit in &obs.limits {
        println!("  {}: {:.1}%", limit.label, limit.utilization);
    }
    println!(
        "Projection: {}",
        describe_projection(report.projection.as_ref(), metric)
    );
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
}

fn setup_logging(debug: bool) -> Result<(), AppError> {
    let filter = if debug {
        EnvFilter::new("usage_pulse=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("usage_pulse=info"))
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path()?)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    ensure_initialized()?;
    setup_logging(cli.debug)?;

    match cli.command {
        Commands::Init => {
            println!("Initialized usage-pulse config and data directories.");
        }
        Commands::SetAdminKey { key } => {
            if key.trim().is_empty() {
                return Err(AppError::Config("Admin key must not be empty.".into()));
            }
            set_admin_key(&key)?;
            println!("Admin key stored in the system keyring.");
        }
        Commands::Watch { mode } => {
            let cfg = load_config()?;
            let mode = validate_mode(mode.as_deref(), cfg.default_mode)?;
            run_tui(mode).await?;
        }
        Commands::Poll { mode } => {
            let cfg = load_config()?;
            let mode = resolve_mode(validate_mode(mode.as_deref(), cfg.default_mode)?);
            let svc = MonitorService::for_mode(mode, &cfg)?;
            let store = open_store(&cfg, svc.source().table())?;
            let engine = engine_for(&cfg)?;
            let profile = svc.profile().await;
            let report = svc.poll(&store, &engine).await?;
            println!(
                "Mode: {} ({} history)",
                mode.as_label(),
                store.table().as_label()
            );
            if let Some(label) = profile.as_ref().and_then(AccountProfile::label) {
                println!("Account: {label}");
            }
            print_report(&report, svc.source().metric());
        }
        Commands::History {
            table,
            hours,
            format,
        } => {
            let table = validate_table(&table)?;
            let format = validate_format(&format)?;
            let span = validate_hours(hours)?;
            let cfg = load_config()?;
            let store = open_store(&cfg, table)?;
            let now = Utc::now();
            let since = history_start(now, span)?;
            let rows = store.query_range(since.timestamp(), now.timestamp())?;
            match format {
                ExportFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
                ExportFormat::Csv => {
                    println!("timestamp,observed_at,measure,utilization_percent,period_boundary");
                    for row in &rows {
                        println!("{}", snapshot_csv_row(row));
                    }
                }
            }
        }
        Commands::Prune { table } => {
            let table = validate_table(&table)?;
            let cfg = load_config()?;
            let store = open_store(&cfg, table)?;
            let pruned = store.prune_expired(Utc::now())?;
            println!("Pruned {pruned} snapshots from {} history.", table.as_label());
        }
        Commands::Status { table } => {
            let table = validate_table(&table)?;
            let cfg = load_config()?;
            let store = open_store(&cfg, table)?;
            let windows: Vec<String> = engine_for(&cfg)?
                .windows()
                .iter()
                .map(|w| format!("{}m", w.num_minutes()))
                .collect();
            println!("History: {}", table.as_label());
            println!("Snapshots stored: {}", store.count()?);
            if let Some(first) = store.earliest()? {
                println!("Earliest: {}", describe_snapshot(&first));
            }
            if let Some(last) = store.latest()? {
                println!("Latest: {}", describe_snapshot(&last));
            }
            println!("Rate windows: {}", windows.join(", "));
        }
    }

    Ok(())
}
