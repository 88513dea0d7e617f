use crate::error::AppError;
use crate::models::{AccountProfile, Metric, Observation};
use crate::period::{end_of_month, month_to_date, parse_timestamp};
use crate::providers::{endpoint, status_error, UsageSource};
use crate::storage::SnapshotTable;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use reqwest::Client;
use serde_json::Value;

const COST_REPORT_PATH: &str = "/v1/organizations/cost_report";
const ORGANIZATION_PATH: &str = "/v1/organizations/me";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_PAGES: usize = 50;

/// Organization month-to-date spend from the Admin API cost report.
pub struct ConsoleCostSource {
    admin_key: String,
    base_url: String,
}

impl ConsoleCostSource {
    pub fn new(admin_key: String, base_url: impl Into<String>) -> Self {
        Self {
            admin_key,
            base_url: base_url.into(),
        }
    }

    /// Sums USD amounts across daily buckets and derives the period label
    /// from the first bucket's start date.
    pub fn aggregate_cost(items: &[Value]) -> (f64, Option<String>) {
        let label = items
            .first()
            .and_then(|item| item.get("starting_at"))
            .and_then(Value::as_str)
            .and_then(Self::period_label);

        let total = items
            .iter()
            .filter_map(|item| item.get("results").and_then(Value::as_array))
            .flatten()
            .filter(|result| result.get("currency").and_then(Value::as_str) == Some("USD"))
            .filter_map(|result| match result.get("amount") {
                Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
                Some(Value::Number(n)) => n.as_f64(),
                _ => None,
            })
            .sum::<f64>();

        (total, label)
    }

    pub fn period_label(starting_at: &str) -> Option<String> {
        let date = NaiveDate::parse_from_str(starting_at, "%Y-%m-%d")
            .ok()
            .or_else(|| parse_timestamp(starting_at).map(|d| d.date_naive()))?;
        Some(date.format("%B %Y").to_string())
    }

    async fn fetch_pages(
        &self,
        client: &Client,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Value>, AppError> {
        let url = endpoint(&self.base_url, COST_REPORT_PATH)?;
        let range = [
            ("starting_at", start.format("%Y-%m-%d").to_string()),
            ("ending_at", end.format("%Y-%m-%d").to_string()),
        ];

        let mut items = Vec::new();
        let mut cursor: Option<(&'static str, String)> = None;

        for _ in 0..MAX_PAGES {
            let mut request = client
                .get(url.clone())
                .header("x-api-key", &self.admin_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .query(&range);
            if let Some((key, value)) = &cursor {
                request = request.query(&[(*key, value.as_str())]);
            }

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_error(status));
            }
            let body: Value = response.json().await?;

            if let Some(data) = body.get("data").and_then(Value::as_array) {
                items.extend(data.iter().cloned());
            }

            let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            cursor = next_cursor(&body);
            if !has_more || cursor.is_none() {
                return Ok(items);
            }
        }

        tracing::warn!(pages = MAX_PAGES, "cost report pagination cut short");
        Ok(items)
    }
}

pub fn parse_organization(body: &Value) -> AccountProfile {
    AccountProfile {
        organization: body
            .get("name")
            .and_then(Value::as_str)
            .and_then(AccountProfile::clean_name),
        ..AccountProfile::default()
    }
}

fn next_cursor(body: &Value) -> Option<(&'static str, String)> {
    if let Some(token) = body.get("next_page_token").and_then(Value::as_str) {
        return Some(("page_token", token.to_string()));
    }
    body.get("next_page")
        .and_then(Value::as_str)
        .map(|page| ("page", page.to_string()))
}

#[async_trait]
impl UsageSource for ConsoleCostSource {
    fn name(&self) -> &'static str {
        "console"
    }

    fn metric(&self) -> Metric {
        Metric::Measure
    }

    fn table(&self) -> SnapshotTable {
        SnapshotTable::Monthly
    }

    async fn fetch(&self, client: &Client, now: DateTime<Utc>) -> Result<Observation, AppError> {
        let local_now = now.with_timezone(&Local);
        let (start, end) = month_to_date(local_now.date_naive())
            .ok_or_else(|| AppError::Api("Could not compute month-to-date range".into()))?;

        let items = self.fetch_pages(client, start, end).await?;
        let (total, label) = Self::aggregate_cost(&items);
        tracing::debug!(buckets = items.len(), total, "fetched cost report");

        Ok(Observation {
            observed_at: now,
            measure: Some(total),
            utilization_percent: None,
            period_boundary: end_of_month(&local_now),
            limits: vec![],
            period_label: label.or_else(|| Some(local_now.format("%B %Y").to_string())),
            plan: None,
        })
    }

    async fn fetch_profile(&self, client: &Client) -> Result<AccountProfile, AppError> {
        let response = client
            .get(endpoint(&self.base_url, ORGANIZATION_PATH)?)
            .header("x-api-key", &self.admin_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }
        let body: Value = response.json().await?;
        Ok(parse_organization(&body))
    }
}
