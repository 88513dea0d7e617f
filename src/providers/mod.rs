use crate::error::AppError;
use crate::models::{AccountProfile, Metric, Observation};
use crate::storage::SnapshotTable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use url::Url;

pub mod console;
pub mod oauth;

/// A vendor endpoint that yields one observation per poll.
#[async_trait]
pub trait UsageSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Which snapshot field the projection engine should extrapolate.
    fn metric(&self) -> Metric;

    /// Which snapshot relation this source's history lives in.
    fn table(&self) -> SnapshotTable;

    async fn fetch(&self, client: &Client, now: DateTime<Utc>) -> Result<Observation, AppError>;

    /// Account and organization names for the dashboard header.
    async fn fetch_profile(&self, client: &Client) -> Result<AccountProfile, AppError>;
}

pub fn endpoint(base: &str, path: &str) -> Result<Url, AppError> {
    let base = Url::parse(base).map_err(|e| AppError::Config(format!("Invalid base URL '{base}': {e}")))?;
    base.join(path)
        .map_err(|e| AppError::Config(format!("Invalid endpoint path '{path}': {e}")))
}

pub fn status_error(status: StatusCode) -> AppError {
    match status.as_u16() {
        401 | 403 => AppError::Api("Authentication failed - check credentials".into()),
        429 => AppError::Api(
            "Rate limit exceeded - please wait a few minutes and try again".into(),
        ),
        _ => AppError::Api(format!("API error: {status}")),
    }
}
