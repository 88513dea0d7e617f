use crate::error::AppError;
use crate::models::MonitorMode;
use crate::projection::DEFAULT_WINDOWS_MINUTES;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "usage-pulse";
pub const ENV_PREFIX: &str = "USAGE_PULSE";
const ADMIN_KEY_USER: &str = "admin-key";
const ADMIN_KEY_ENV: &str = "ANTHROPIC_ADMIN_KEY";
pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

const MAX_POLL_SECONDS: u64 = 86_400;
const MAX_RETENTION_HOURS: u64 = 366 * 24;
const MAX_WINDOW_MINUTES: u64 = 31 * 24 * 60;

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("USAGE_PULSE_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "usage-pulse", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".usage-pulse"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub poll_seconds_code: u64,
    pub poll_seconds_console: u64,
    pub default_mode: MonitorMode,
    pub retention_hours: u64,
    pub min_collection_minutes: u64,
    pub utilization_gate_percent: Option<f64>,
    pub rate_windows_minutes: Vec<u64>,
    pub credentials_path: Option<PathBuf>,
    pub api_base_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_seconds_code: 30,
            poll_seconds_console: 120,
            default_mode: MonitorMode::Auto,
            retention_hours: 24,
            min_collection_minutes: 30,
            utilization_gate_percent: None,
            rate_windows_minutes: DEFAULT_WINDOWS_MINUTES.to_vec(),
            credentials_path: None,
            api_base_url: None,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.poll_seconds_code == 0 || self.poll_seconds_console == 0 {
            return Err(AppError::Config(
                "Poll intervals must be greater than 0 seconds.".into(),
            ));
        }
        if self.poll_seconds_code > MAX_POLL_SECONDS || self.poll_seconds_console > MAX_POLL_SECONDS {
            return Err(AppError::Config(format!(
                "Poll intervals must be at most {MAX_POLL_SECONDS} seconds."
            )));
        }
        if self.retention_hours == 0 {
            return Err(AppError::Config(
                "retention_hours must be greater than 0.".into(),
            ));
        }
        if self.retention_hours > MAX_RETENTION_HOURS {
            return Err(AppError::Config(format!(
                "retention_hours must be at most {MAX_RETENTION_HOURS}."
            )));
        }
        if self.min_collection_minutes > MAX_WINDOW_MINUTES {
            return Err(AppError::Config(format!(
                "min_collection_minutes must be at most {MAX_WINDOW_MINUTES}."
            )));
        }
        if self.rate_windows_minutes.is_empty() {
            return Err(AppError::Config(
                "rate_windows_minutes needs at least one window.".into(),
            ));
        }
        if self.rate_windows_minutes[0] == 0
            || self.rate_windows_minutes.windows(2).any(|w| w[1] <= w[0])
        {
            return Err(AppError::Config(
                "rate_windows_minutes must be positive and strictly increasing.".into(),
            ));
        }
        if self.rate_windows_minutes.iter().any(|m| *m > MAX_WINDOW_MINUTES) {
            return Err(AppError::Config(format!(
                "rate_windows_minutes must each be at most {MAX_WINDOW_MINUTES}."
            )));
        }
        if let Some(base) = &self.api_base_url {
            url::Url::parse(base)
                .map_err(|e| AppError::Config(format!("Invalid api_base_url '{base}': {e}")))?;
        }
        Ok(())
    }

    pub fn poll_seconds(&self, mode: MonitorMode) -> u64 {
        match mode {
            MonitorMode::Console => self.poll_seconds_console,
            MonitorMode::Code | MonitorMode::Auto => self.poll_seconds_code,
        }
    }

    pub fn api_base(&self) -> &str {
        self.api_base_url.as_deref().unwrap_or(DEFAULT_API_BASE)
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("usage_history.sqlite"))
}

pub fn log_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("usage-pulse.log"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from(&config_path()?)
}

/// Layers `USAGE_PULSE_*` environment variables over the TOML file.
pub fn load_config_from(path: &Path) -> Result<AppConfig, AppError> {
    let settings = config::Config::builder()
        .add_source(
            config::File::from(path)
                .format(config::FileFormat::Toml)
                .required(false),
        )
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("rate_windows_minutes"),
        )
        .build()?;

    let parsed: AppConfig = settings.try_deserialize()?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

pub fn set_admin_key(key: &str) -> Result<(), AppError> {
    let entry = keyring::Entry::new(SERVICE_NAME, ADMIN_KEY_USER)?;
    entry.set_password(key.trim())?;
    Ok(())
}

pub fn has_admin_key() -> bool {
    match get_admin_key() {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!(error = %err, "no console admin key available");
            false
        }
    }
}

pub fn get_admin_key() -> Result<String, AppError> {
    if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, ADMIN_KEY_USER) {
        if let Ok(value) = entry.get_password() {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }

    if let Ok(value) = std::env::var(ADMIN_KEY_ENV) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    Err(AppError::Credentials(format!(
        "No admin API key found. Run 'usage-pulse set-admin-key' or set {ADMIN_KEY_ENV}."
    )))
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}
