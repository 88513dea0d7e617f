//! Rate estimation and forward projection over the snapshot log.
//!
//! The engine asks the history for progressively wider windows until one of
//! them holds at least two usable points, derives a per-hour rate from the
//! first and last of those points and extrapolates to the period boundary.

use crate::models::{Metric, Snapshot};
use crate::period::hours_between;
use crate::storage::SnapshotHistory;
use chrono::{DateTime, Duration, Utc};

/// 30 min, 1 h, 3 h, 6 h, 24 h, 7 d.
pub const DEFAULT_WINDOWS_MINUTES: [u64; 6] = [30, 60, 180, 360, 1440, 10080];

#[derive(Debug, Clone, PartialEq)]
pub struct RateEstimate {
    pub rate_per_hour: f64,
    pub window_used: Duration,
    pub first_timestamp: i64,
    pub points: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadyProjection {
    pub rate_per_hour: f64,
    pub projected_value: f64,
    pub window_used: Duration,
    pub hours_until_boundary: f64,
    pub current_value: f64,
    /// False while the installation is still collecting history or the
    /// utilization gate has not been reached. The numbers are valid either
    /// way; this only tells the renderer whether to show them.
    pub is_ready: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    InsufficientData,
    StaleBoundary { boundary: DateTime<Utc> },
    Ready(ReadyProjection),
}

impl Projection {
    pub fn status_label(&self) -> &'static str {
        match self {
            Projection::InsufficientData => "insufficient_data",
            Projection::StaleBoundary { .. } => "stale_boundary",
            Projection::Ready(_) => "ready",
        }
    }

    pub fn ready(&self) -> Option<&ReadyProjection> {
        match self {
            Projection::Ready(ready) => Some(ready),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessPolicy {
    pub min_collection: Duration,
    pub utilization_threshold: Option<f64>,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            min_collection: Duration::minutes(30),
            utilization_threshold: None,
        }
    }
}

enum WindowCheck {
    Usable(RateEstimate),
    TooFewPoints,
    Degenerate,
}

#[derive(Debug, Clone)]
pub struct ProjectionEngine {
    windows: Vec<Duration>,
    readiness: ReadinessPolicy,
}

impl Default for ProjectionEngine {
    fn default() -> Self {
        Self::new(
            DEFAULT_WINDOWS_MINUTES
                .iter()
                .map(|m| Duration::minutes(*m as i64))
                .collect(),
            ReadinessPolicy::default(),
        )
    }
}

/// `None` when `minutes` doesn't fit in a `Duration`.
pub fn minutes_to_duration(minutes: u64) -> Option<Duration> {
    i64::try_from(minutes).ok().and_then(Duration::try_minutes)
}

impl ProjectionEngine {
    pub fn new(windows: Vec<Duration>, readiness: ReadinessPolicy) -> Self {
        Self { windows, readiness }
    }

    pub fn from_minutes(windows: &[u64], readiness: ReadinessPolicy) -> Option<Self> {
        let windows = windows
            .iter()
            .map(|m| minutes_to_duration(*m))
            .collect::<Option<Vec<_>>>()?;
        Some(Self::new(windows, readiness))
    }

    pub fn windows(&self) -> &[Duration] {
        &self.windows
    }

    /// Tries each candidate window in order and returns the first usable
    /// rate. `current` is the live observation; it is merged into whatever
    /// the history returns so a failed write does not hide it.
    pub fn estimate_rate<H: SnapshotHistory + ?Sized>(
        &self,
        history: &H,
        metric: Metric,
        current: &Snapshot,
        now: DateTime<Utc>,
    ) -> Option<RateEstimate> {
        let until = now.timestamp();
        for window in &self.windows {
            let since = until - window.num_seconds();
            let rows = match history.query_range(since, until) {
                Ok(rows) => rows,
                Err(warning) => {
                    tracing::debug!(%warning, "history unreadable, no rate this cycle");
                    return None;
                }
            };

            let points = window_points(rows, current, metric, since, until);
            match check_window(&points, *window) {
                WindowCheck::Usable(estimate) => return Some(estimate),
                WindowCheck::TooFewPoints => {
                    tracing::trace!(window_min = window.num_minutes(), "too few points, widening");
                }
                WindowCheck::Degenerate => {
                    tracing::trace!(window_min = window.num_minutes(), "degenerate window, widening");
                }
            }
        }
        None
    }

    pub fn project<H: SnapshotHistory + ?Sized>(
        &self,
        history: &H,
        metric: Metric,
        current: &Snapshot,
        boundary: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Projection {
        if boundary < now {
            return Projection::StaleBoundary { boundary };
        }

        let Some(current_value) = current.value(metric) else {
            return Projection::InsufficientData;
        };
        let Some(estimate) = self.estimate_rate(history, metric, current, now) else {
            return Projection::InsufficientData;
        };

        let hours_until_boundary = hours_between(now, boundary).max(0.0);
        let is_ready = self.is_ready(history, current, estimate.first_timestamp, now);
        tracing::debug!(
            metric = metric.as_label(),
            window_min = estimate.window_used.num_minutes(),
            points = estimate.points,
            rate = estimate.rate_per_hour,
            is_ready,
            "projection computed"
        );

        Projection::Ready(ReadyProjection {
            rate_per_hour: estimate.rate_per_hour,
            projected_value: project_value(current_value, estimate.rate_per_hour, hours_until_boundary),
            window_used: estimate.window_used,
            hours_until_boundary,
            current_value,
            is_ready,
        })
    }

    fn is_ready<H: SnapshotHistory + ?Sized>(
        &self,
        history: &H,
        current: &Snapshot,
        window_start: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let collecting_since = match history.earliest() {
            Ok(Some(oldest)) => oldest.timestamp.min(window_start),
            _ => window_start,
        };
        let collected_long_enough =
            now.timestamp() - collecting_since >= self.readiness.min_collection.num_seconds();

        let utilization_reached = match self.readiness.utilization_threshold {
            Some(threshold) => current
                .utilization_percent
                .is_some_and(|u| u >= threshold),
            None => true,
        };

        collected_long_enough && utilization_reached
    }
}

/// `current + rate * hours`, never extrapolating backwards.
pub fn project_value(current: f64, rate_per_hour: f64, hours_until_boundary: f64) -> f64 {
    current + rate_per_hour * hours_until_boundary.max(0.0)
}

/// Per-hour rate between two `(timestamp, value)` points, or `None` when they
/// share a timestamp.
pub fn rate_per_hour(first: (i64, f64), last: (i64, f64)) -> Option<f64> {
    let elapsed = last.0 - first.0;
    if elapsed <= 0 {
        return None;
    }
    Some((last.1 - first.1) / (elapsed as f64 / 3600.0))
}

fn window_points(
    rows: Vec<Snapshot>,
    current: &Snapshot,
    metric: Metric,
    since: i64,
    until: i64,
) -> Vec<(i64, f64)> {
    let mut points: Vec<(i64, f64)> = rows
        .into_iter()
        .filter(|s| s.timestamp != current.timestamp)
        .filter_map(|s| s.value(metric).map(|v| (s.timestamp, v)))
        .collect();

    if (since..=until).contains(&current.timestamp) {
        if let Some(value) = current.value(metric) {
            points.push((current.timestamp, value));
        }
    }
    points.sort_by_key(|(ts, _)| *ts);
    drop_before_last_reset(&mut points);
    points
}

/// A decrease means the period rolled over inside the window; only the
/// points from the last decrease onwards belong to the current period.
fn drop_before_last_reset(points: &mut Vec<(i64, f64)>) {
    let last_reset = points
        .windows(2)
        .rposition(|pair| pair[1].1 < pair[0].1)
        .map(|idx| idx + 1);
    if let Some(start) = last_reset {
        tracing::debug!(dropped = start, "period reset inside window");
        points.drain(..start);
    }
}

fn check_window(points: &[(i64, f64)], window: Duration) -> WindowCheck {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return WindowCheck::TooFewPoints;
    };
    if points.len() < 2 {
        return WindowCheck::TooFewPoints;
    }
    match rate_per_hour(*first, *last) {
        Some(rate) => WindowCheck::Usable(RateEstimate {
            rate_per_hour: rate,
            window_used: window,
            first_timestamp: first.0,
            points: points.len(),
        }),
        None => WindowCheck::Degenerate,
    }
}
