use crate::error::{AppError, StorageWarning};
use crate::models::Snapshot;
use crate::period::{parse_timestamp, start_of_month};
use chrono::{DateTime, Duration, Local, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTable {
    FiveHour,
    Monthly,
}

impl SnapshotTable {
    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "five-hour" => Some(SnapshotTable::FiveHour),
            "monthly" => Some(SnapshotTable::Monthly),
            _ => None,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            SnapshotTable::FiveHour => "five-hour",
            SnapshotTable::Monthly => "monthly",
        }
    }

    fn table_name(self) -> &'static str {
        match self {
            SnapshotTable::FiveHour => "usage_snapshots",
            SnapshotTable::Monthly => "cost_snapshots",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Rolling(Duration),
    CalendarMonth,
}

impl Retention {
    pub fn for_table(table: SnapshotTable, rolling_hours: u64) -> Result<Self, AppError> {
        match table {
            SnapshotTable::FiveHour => i64::try_from(rolling_hours)
                .ok()
                .and_then(Duration::try_hours)
                .map(Retention::Rolling)
                .ok_or_else(|| {
                    AppError::Config(format!("retention_hours {rolling_hours} is out of range."))
                }),
            SnapshotTable::Monthly => Ok(Retention::CalendarMonth),
        }
    }
}

/// Read side of the snapshot log, as seen by the projection engine.
pub trait SnapshotHistory {
    /// Snapshots with `since <= timestamp <= until`, ascending.
    fn query_range(&self, since: i64, until: i64) -> Result<Vec<Snapshot>, StorageWarning>;

    fn earliest(&self) -> Result<Option<Snapshot>, StorageWarning>;
}

/// SQLite-backed snapshot log.
///
/// Each operation opens its own connection and closes it on return, so a
/// second dashboard process on the same file serializes on SQLite's file
/// lock instead of deadlocking on a long-held handle.
pub struct SnapshotStore {
    path: PathBuf,
    table: SnapshotTable,
    retention: Retention,
    unavailable: Option<String>,
}

impl SnapshotStore {
    /// Opens the store and creates the schema.
    ///
    /// A file that can't be opened or isn't a database leaves the store
    /// unavailable: every later operation returns a `StorageWarning` and the
    /// dashboard keeps running on live data. Only a schema failure on a
    /// usable file is returned as an error.
    pub fn open(path: &Path, table: SnapshotTable, retention: Retention) -> Result<Self, AppError> {
        let mut this = Self {
            path: path.to_path_buf(),
            table,
            retention,
            unavailable: None,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(err) = fs::create_dir_all(parent) {
                    this.mark_unavailable(err.to_string());
                    return Ok(this);
                }
            }
        }

        let prepared = this.connect().and_then(|conn| this.init(&conn));
        match prepared {
            Ok(()) => {
                tracing::debug!(path = %this.path.display(), table = table.as_label(), "snapshot store ready");
            }
            Err(err) if is_unavailable(&err) => this.mark_unavailable(err.to_string()),
            Err(err) => return Err(err.into()),
        }
        Ok(this)
    }

    fn mark_unavailable(&mut self, detail: String) {
        tracing::warn!(
            path = %self.path.display(),
            table = self.table.as_label(),
            error = %detail,
            "snapshot store unavailable, monitoring without history"
        );
        self.unavailable = Some(detail);
    }

    pub fn is_available(&self) -> bool {
        self.unavailable.is_none()
    }

    pub fn table(&self) -> SnapshotTable {
        self.table
    }

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Ok(conn)
    }

    fn init(&self, conn: &Connection) -> Result<(), rusqlite::Error> {
        let table = self.table.table_name();
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                timestamp INTEGER PRIMARY KEY,
                credits_used REAL,
                utilization_percent REAL,
                resets_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_timestamp
                ON {table}(timestamp DESC);
            "#
        ))?;
        Ok(())
    }

    fn ensure_available(&self, operation: &'static str) -> Result<(), StorageWarning> {
        match &self.unavailable {
            Some(detail) => Err(StorageWarning::new(operation, detail)),
            None => Ok(()),
        }
    }

    fn degraded(&self, operation: &'static str, err: rusqlite::Error) -> StorageWarning {
        let warning = StorageWarning::new(operation, err);
        tracing::warn!(
            table = self.table.as_label(),
            operation,
            error = %warning.detail,
            "snapshot store degraded, continuing without it"
        );
        warning
    }

    /// Upserts the row keyed by `snapshot.timestamp`; the last write wins.
    pub fn record(&self, snapshot: &Snapshot) -> Result<(), StorageWarning> {
        self.ensure_available("record")?;
        self.try_record(snapshot)
            .map_err(|err| self.degraded("record", err))
    }

    fn try_record(&self, snapshot: &Snapshot) -> Result<(), rusqlite::Error> {
        let conn = self.connect()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (timestamp, credits_used, utilization_percent, resets_at)
                 VALUES (?1, ?2, ?3, ?4)",
                self.table.table_name()
            ),
            params![
                snapshot.timestamp,
                snapshot.measure,
                snapshot.utilization_percent,
                snapshot.period_boundary.map(|b| b.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Deletes every row with `timestamp < older_than`, returning the count.
    pub fn prune(&self, older_than: i64) -> Result<usize, StorageWarning> {
        self.ensure_available("prune")?;
        self.try_prune(older_than)
            .map_err(|err| self.degraded("prune", err))
    }

    fn try_prune(&self, older_than: i64) -> Result<usize, rusqlite::Error> {
        let conn = self.connect()?;
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {} WHERE timestamp < ?1",
                self.table.table_name()
            ),
            [older_than],
        )?;
        if deleted > 0 {
            tracing::debug!(table = self.table.as_label(), deleted, "pruned snapshots");
        }
        Ok(deleted)
    }

    /// Cutoff timestamp for this table's retention policy at `now`.
    pub fn retention_cutoff(&self, now: DateTime<Utc>) -> i64 {
        match self.retention {
            Retention::Rolling(keep) => now
                .checked_sub_signed(keep)
                .map(|cutoff| cutoff.timestamp())
                .unwrap_or(i64::MIN),
            Retention::CalendarMonth => start_of_month(&now.with_timezone(&Local))
                .map(|start| start.timestamp())
                .unwrap_or_else(|| (now - Duration::days(31)).timestamp()),
        }
    }

    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageWarning> {
        self.prune(self.retention_cutoff(now))
    }

    pub fn query_range(&self, since: i64, until: i64) -> Result<Vec<Snapshot>, StorageWarning> {
        self.ensure_available("query_range")?;
        self.try_query_range(since, until)
            .map_err(|err| self.degraded("query_range", err))
    }

    fn try_query_range(&self, since: i64, until: i64) -> Result<Vec<Snapshot>, rusqlite::Error> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT timestamp, credits_used, utilization_percent, resets_at
             FROM {} WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp ASC",
            self.table.table_name()
        ))?;
        let rows = stmt
            .query_map([since, until], snapshot_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest(&self) -> Result<Option<Snapshot>, StorageWarning> {
        self.ensure_available("latest")?;
        self.edge("DESC").map_err(|err| self.degraded("latest", err))
    }

    pub fn earliest(&self) -> Result<Option<Snapshot>, StorageWarning> {
        self.ensure_available("earliest")?;
        self.edge("ASC").map_err(|err| self.degraded("earliest", err))
    }

    fn edge(&self, order: &str) -> Result<Option<Snapshot>, rusqlite::Error> {
        let conn = self.connect()?;
        conn.query_row(
            &format!(
                "SELECT timestamp, credits_used, utilization_percent, resets_at
                 FROM {} ORDER BY timestamp {order} LIMIT 1",
                self.table.table_name()
            ),
            [],
            snapshot_from_row,
        )
        .optional()
    }

    pub fn count(&self) -> Result<u64, StorageWarning> {
        self.ensure_available("count")?;
        self.try_count().map_err(|err| self.degraded("count", err))
    }

    fn try_count(&self) -> Result<u64, rusqlite::Error> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

impl SnapshotHistory for SnapshotStore {
    fn query_range(&self, since: i64, until: i64) -> Result<Vec<Snapshot>, StorageWarning> {
        SnapshotStore::query_range(self, since, until)
    }

    fn earliest(&self) -> Result<Option<Snapshot>, StorageWarning> {
        SnapshotStore::earliest(self)
    }
}

/// Faults that mean the file itself is unusable, as opposed to a bad statement.
fn is_unavailable(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;
    matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::CannotOpen
                | ErrorCode::ReadOnly
                | ErrorCode::PermissionDenied
                | ErrorCode::DiskFull
                | ErrorCode::SystemIoFailure
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::FileLockingProtocolFailed
        )
    )
}

fn snapshot_from_row(r: &Row<'_>) -> Result<Snapshot, rusqlite::Error> {
    let period_boundary = match r.get::<_, Option<String>>(3)? {
        Some(raw) => Some(parse_timestamp(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                format!("invalid resets_at value '{raw}'").into(),
            )
        })?),
        None => None,
    };

    Ok(Snapshot {
        timestamp: r.get(0)?,
        measure: r.get(1)?,
        utilization_percent: r.get(2)?,
        period_boundary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> SnapshotStore {
        SnapshotStore::open(
            &tmp.path().join("usage_history.sqlite"),
            SnapshotTable::FiveHour,
            Retention::Rolling(Duration::hours(24)),
        )
        .expect("open store")
    }

    fn snap(ts: i64, measure: f64) -> Snapshot {
        Snapshot {
            timestamp: ts,
            measure: Some(measure),
            utilization_percent: Some(measure / 10.0),
            period_boundary: Utc.timestamp_opt(1_700_018_000, 0).single(),
        }
    }

    fn timestamps(rows: &[Snapshot]) -> Vec<i64> {
        rows.iter().map(|s| s.timestamp).collect()
    }

    fn fail_on(tmp: &TempDir, event: &str) {
        let conn = Connection::open(tmp.path().join("usage_history.sqlite")).expect("open sqlite");
        conn.execute_batch(&format!(
            "CREATE TRIGGER fail_{event} BEFORE {event} ON usage_snapshots
             BEGIN SELECT RAISE(ABORT, 'database or disk is full'); END;"
        ))
        .expect("install failing trigger");
    }

    #[test]
    fn open_creates_schema() {
        let tmp = TempDir::new().expect("tempdir");
        let _store = open_store(&tmp);

        let conn = Connection::open(tmp.path().join("usage_history.sqlite")).expect("open sqlite");
        let mut stmt = conn
            .prepare("PRAGMA table_info(usage_snapshots)")
            .expect("table info");
        let columns = stmt
            .query_map([], |r| Ok((r.get::<_, String>(1)?, r.get::<_, String>(2)?)))
            .expect("query columns")
            .collect::<Result<Vec<_>, _>>()
            .expect("collect columns");
        assert_eq!(
            columns,
            vec![
                ("timestamp".to_string(), "INTEGER".to_string()),
                ("credits_used".to_string(), "REAL".to_string()),
                ("utilization_percent".to_string(), "REAL".to_string()),
                ("resets_at".to_string(), "TEXT".to_string()),
            ]
        );
    }

    #[test]
    fn open_is_repeatable_and_keeps_rows() {
        let tmp = TempDir::new().expect("tempdir");
        open_store(&tmp).record(&snap(100, 1.0)).expect("record");

        let reopened = open_store(&tmp);
        assert_eq!(reopened.count().expect("count"), 1);
    }

    #[test]
    fn record_same_timestamp_keeps_last_write() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);

        store.record(&snap(1_000, 10.0)).expect("first write");
        store.record(&snap(1_000, 25.0)).expect("second write");
        store.record(&snap(1_000, 25.0)).expect("repeat write");

        assert_eq!(store.count().expect("count"), 1);
        let latest = store.latest().expect("latest").expect("one row");
        assert_eq!(latest.measure, Some(25.0));
    }

    #[test]
    fn record_accepts_partial_snapshots() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let partial = Snapshot {
            timestamp: 500,
            measure: None,
            utilization_percent: Some(12.5),
            period_boundary: None,
        };

        store.record(&partial).expect("record partial");
        let rows = store.query_range(0, 1_000).expect("query");
        assert_eq!(rows, vec![partial]);
    }

    #[test]
    fn query_range_is_inclusive_and_ascending() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        for ts in [400, 100, 300, 200] {
            store.record(&snap(ts, ts as f64)).expect("record");
        }

        let rows = store.query_range(150, 350).expect("query");
        assert_eq!(timestamps(&rows), vec![200, 300]);

        let edges = store.query_range(200, 300).expect("query edges");
        assert_eq!(timestamps(&edges), vec![200, 300]);

        assert!(store.query_range(401, 900).expect("empty query").is_empty());
    }

    #[test]
    fn prune_drops_only_older_rows() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        for ts in [100, 200, 300, 400] {
            store.record(&snap(ts, ts as f64)).expect("record");
        }

        assert_eq!(store.prune(300).expect("prune"), 2);
        assert!(store.query_range(0, 299).expect("query old").is_empty());
        assert_eq!(
            timestamps(&store.query_range(300, 1_000).expect("query new")),
            vec![300, 400]
        );
        assert_eq!(store.prune(300).expect("prune again"), 0);
    }

    #[test]
    fn latest_and_earliest_on_empty_store_are_none() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        assert!(store.latest().expect("latest").is_none());
        assert!(store.earliest().expect("earliest").is_none());

        store.record(&snap(300, 3.0)).expect("record");
        store.record(&snap(100, 1.0)).expect("record");
        assert_eq!(store.latest().expect("latest").map(|s| s.timestamp), Some(300));
        assert_eq!(store.earliest().expect("earliest").map(|s| s.timestamp), Some(100));
    }

    #[test]
    fn failed_write_is_a_warning_and_old_rows_stay_readable() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        store.record(&snap(100, 1.0)).expect("record before failure");
        fail_on(&tmp, "INSERT");

        let warning = store
            .record(&snap(200, 2.0))
            .expect_err("write should degrade");
        assert_eq!(warning.operation, "record");
        assert!(warning.detail.contains("disk is full"));

        let rows = store.query_range(0, 1_000).expect("reads still work");
        assert_eq!(timestamps(&rows), vec![100]);
    }

    #[test]
    fn failed_prune_is_a_warning_and_rows_survive() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        store.record(&snap(100, 1.0)).expect("record");
        fail_on(&tmp, "DELETE");

        let warning = store.prune(1_000).expect_err("prune should degrade");
        assert_eq!(warning.operation, "prune");
        assert_eq!(store.count().expect("count"), 1);
    }

    #[test]
    fn unreachable_backing_file_degrades_reads() {
        let tmp = TempDir::new().expect("tempdir");
        let data_dir = tmp.path().join("data");
        let store = SnapshotStore::open(
            &data_dir.join("usage_history.sqlite"),
            SnapshotTable::FiveHour,
            Retention::Rolling(Duration::hours(24)),
        )
        .expect("open store");
        fs::remove_dir_all(&data_dir).expect("remove data dir");

        assert!(store.query_range(0, 100).is_err());
        assert!(store.record(&snap(50, 1.0)).is_err());
    }

    #[test]
    fn blocked_data_dir_leaves_store_unavailable() {
        let tmp = TempDir::new().expect("tempdir");
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"not a directory").expect("write blocker");

        let store = SnapshotStore::open(
            &blocker.join("usage_history.sqlite"),
            SnapshotTable::FiveHour,
            Retention::Rolling(Duration::hours(24)),
        )
        .expect("open degrades instead of failing");
        assert!(!store.is_available());
        assert_eq!(store.count().expect_err("count degrades").operation, "count");
    }

    #[test]
    fn garbage_file_opens_as_unavailable_store() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("usage_history.sqlite");
        fs::write(&path, vec![0x42u8; 8192]).expect("write garbage");

        let store = SnapshotStore::open(&path, SnapshotTable::FiveHour, Retention::Rolling(Duration::hours(24)))
            .expect("corrupt file is not fatal");
        assert!(!store.is_available());

        let warning = store.record(&snap(100, 1.0)).expect_err("record degrades");
        assert_eq!(warning.operation, "record");
        assert!(!warning.detail.is_empty());
        assert_eq!(
            store.query_range(0, 1_000).expect_err("query degrades").operation,
            "query_range"
        );
        assert_eq!(store.prune(1_000).expect_err("prune degrades").operation, "prune");
        assert!(store.earliest().is_err());
        assert!(store.latest().is_err());

        assert_eq!(fs::read(&path).expect("read back"), vec![0x42u8; 8192]);
    }

    #[test]
    fn schema_error_on_healthy_file_is_fatal() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("usage_history.sqlite");
        let conn = Connection::open(&path).expect("open sqlite");
        conn.execute_batch("CREATE VIEW usage_snapshots AS SELECT 1 AS timestamp;")
            .expect("create clashing view");
        drop(conn);

        let result = SnapshotStore::open(&path, SnapshotTable::FiveHour, Retention::Rolling(Duration::hours(24)));
        assert!(matches!(result, Err(AppError::Sql(_))));
    }

    #[test]
    fn second_handle_on_same_file_sees_writes() {
        let tmp = TempDir::new().expect("tempdir");
        let first = open_store(&tmp);
        let second = open_store(&tmp);

        first.record(&snap(100, 1.0)).expect("first writer");
        second.record(&snap(200, 2.0)).expect("second writer");

        assert_eq!(timestamps(&first.query_range(0, 1_000).expect("query")), vec![100, 200]);
    }

    #[test]
    fn tables_are_independent() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("usage_history.sqlite");
        let five_hour = open_store(&tmp);
        let monthly = SnapshotStore::open(&path, SnapshotTable::Monthly, Retention::CalendarMonth)
            .expect("open monthly");

        five_hour.record(&snap(100, 1.0)).expect("record five-hour");
        assert_eq!(monthly.count().expect("monthly count"), 0);
        assert_eq!(five_hour.count().expect("five-hour count"), 1);
    }

    #[test]
    fn rolling_retention_cutoff_subtracts_window() {
        let tmp = TempDir::new().expect("tempdir");
        let store = open_store(&tmp);
        let now = Utc.timestamp_opt(1_700_100_000, 0).single().expect("valid now");
        assert_eq!(store.retention_cutoff(now), 1_700_100_000 - 24 * 3600);
    }

    #[test]
    fn calendar_retention_cutoff_is_not_after_now() {
        let tmp = TempDir::new().expect("tempdir");
        let store = SnapshotStore::open(
            &tmp.path().join("usage_history.sqlite"),
            SnapshotTable::Monthly,
            Retention::CalendarMonth,
        )
        .expect("open monthly");
        let now = Utc::now();
        let cutoff = store.retention_cutoff(now);
        assert!(cutoff <= now.timestamp());
        assert!(now.timestamp() - cutoff <= 32 * 24 * 3600);
    }

    #[test]
    fn retention_rejects_hours_beyond_duration_range() {
        assert!(matches!(
            Retention::for_table(SnapshotTable::FiveHour, u64::MAX),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            Retention::for_table(SnapshotTable::FiveHour, i64::MAX as u64),
            Err(AppError::Config(_))
        ));
        assert_eq!(
            Retention::for_table(SnapshotTable::FiveHour, 24).expect("24 hours"),
            Retention::Rolling(Duration::hours(24))
        );
        assert_eq!(
            Retention::for_table(SnapshotTable::Monthly, u64::MAX).expect("monthly ignores hours"),
            Retention::CalendarMonth
        );
    }

    #[test]
    fn table_labels_parse_back() {
        for table in [SnapshotTable::FiveHour, SnapshotTable::Monthly] {
            assert_eq!(SnapshotTable::parse(table.as_label()), Some(table));
        }
        assert_eq!(SnapshotTable::parse("weekly"), None);
    }
}
