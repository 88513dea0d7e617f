use crate::credentials::{load_oauth_credentials, TOKEN_EXPIRED_MESSAGE};
use crate::error::AppError;
use crate::models::{AccountProfile, LimitWindow, Metric, Observation};
use crate::period::parse_timestamp;
use crate::providers::{endpoint, status_error, UsageSource};
use crate::storage::SnapshotTable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::path::PathBuf;

const USAGE_PATH: &str = "/api/oauth/usage";
const PROFILE_PATH: &str = "/api/oauth/profile";
const OAUTH_BETA: &str = "oauth-2025-04-20";

const LIMIT_KEYS: [(&str, &str); 4] = [
    ("five_hour", "5-Hour"),
    ("seven_day", "7-Day"),
    ("seven_day_sonnet", "7-Day Sonnet"),
    ("seven_day_opus", "7-Day Opus"),
];

/// Claude Code subscription limits, read with the CLI's OAuth token.
pub struct OAuthUsageSource {
    credentials_path: PathBuf,
    base_url: String,
}

impl OAuthUsageSource {
    pub fn new(credentials_path: PathBuf, base_url: impl Into<String>) -> Self {
        Self {
            credentials_path,
            base_url: base_url.into(),
        }
    }

    /// Authenticated GET; also hands back the subscription type from the
    /// credentials file.
    async fn get(
        &self,
        client: &Client,
        path: &str,
        now: DateTime<Utc>,
    ) -> Result<(Value, Option<String>), AppError> {
        let creds = load_oauth_credentials(&self.credentials_path)?;
        if creds.is_expired(now) {
            return Err(AppError::Credentials(TOKEN_EXPIRED_MESSAGE.into()));
        }

        let url = endpoint(&self.base_url, path)?;
        let response = client
            .get(url)
            .bearer_auth(&creds.access_token)
            .header("anthropic-beta", OAUTH_BETA)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AppError::Credentials(TOKEN_EXPIRED_MESSAGE.into()));
        }
        if !status.is_success() {
            return Err(status_error(status));
        }
        Ok((response.json().await?, creds.subscription_type))
    }

    pub fn parse_profile(body: &Value) -> AccountProfile {
        let account = body.get("account");
        let text = |section: Option<&Value>, key: &str| {
            section
                .and_then(|v| v.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        AccountProfile {
            display_name: text(account, "display_name")
                .or_else(|| text(account, "full_name"))
                .and_then(|name| AccountProfile::clean_name(&name)),
            email: text(account, "email").filter(|e| !e.is_empty()),
            organization: text(body.get("organization"), "name")
                .and_then(|name| AccountProfile::clean_name(&name)),
        }
    }

    fn parse_limit(label: &str, item: &Value) -> Option<LimitWindow> {
        let utilization = item.get("utilization").and_then(Value::as_f64)?;
        let resets_at = item
            .get("resets_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        Some(LimitWindow {
            label: label.to_string(),
            utilization,
            resets_at,
        })
    }

    /// The five-hour bucket drives history and projection; the other buckets
    /// are carried along for display.
    pub fn parse_usage(body: &Value, observed_at: DateTime<Utc>) -> Observation {
        let limits: Vec<LimitWindow> = LIMIT_KEYS
            .iter()
            .filter_map(|(key, label)| {
                body.get(*key)
                    .filter(|v| !v.is_null())
                    .and_then(|item| Self::parse_limit(label, item))
            })
            .collect();

        let five_hour = body
            .get("five_hour")
            .filter(|v| !v.is_null())
            .and_then(|item| Self::parse_limit("5-Hour", item));

        Observation {
            observed_at,
            measure: None,
            utilization_percent: five_hour.as_ref().map(|l| l.utilization),
            period_boundary: five_hour.and_then(|l| l.resets_at),
            limits,
            period_label: None,
            plan: None,
        }
    }
}

#[async_trait]
impl UsageSource for OAuthUsageSource {
    fn name(&self) -> &'static str {
        "code"
    }

    fn metric(&self) -> Metric {
        Metric::Utilization
    }

    fn table(&self) -> SnapshotTable {
        SnapshotTable::FiveHour
    }

    async fn fetch(&self, client: &Client, now: DateTime<Utc>) -> Result<Observation, AppError> {
        let (body, plan) = self.get(client, USAGE_PATH, now).await?;
        let mut observation = Self::parse_usage(&body, now);
        observation.plan = plan;
        tracing::debug!(
            utilization = ?observation.utilization_percent,
            limits = observation.limits.len(),
            "fetched oauth usage"
        );
        Ok(observation)
    }

    async fn fetch_profile(&self, client: &Client) -> Result<AccountProfile, AppError> {
        let (body, _) = self.get(client, PROFILE_PATH, Utc::now()).await?;
        Ok(Self::parse_profile(&body))
    }
}
