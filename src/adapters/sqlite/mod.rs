//! SQLite adapter: Implementation of the `Ledger` port.
//!
//! One file, WAL journaling, a single connection behind a `Mutex`. All
//! multi-row operations run inside one transaction so a crash mid-batch
//! leaves the store exactly as it was. The activity log is append-only;
//! day-sketch blobs are a cache keyed by day.
//!
//! # Mutex Behavior
//!
//! A poisoned mutex (panic in another thread) is surfaced as a database
//! error rather than propagating the panic; the pipeline treats it like
//! any other transient failure.

use std::path::Path;
use std::sync::Mutex;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::event::{Metric, Op};
use crate::domain::keys::{SaltEpoch, UserKey};
use crate::domain::release::ReleaseRecord;
use crate::ports::ledger::{
    ActivityRow, ErasureRequest, ErasureStatus, Ledger, LedgerError, NewErasure,
};

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// SQLite-backed ledger.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (or create) the ledger file and initialize the schema.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Database(format!("creating ledger dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    /// In-memory ledger for tests.
    ///
    /// # Errors
    /// Returns an error if the database cannot be created.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Database("connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                day TEXT NOT NULL,
                user_key BLOB NOT NULL,
                user_root BLOB NOT NULL,
                op TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_activity_day ON activity_log(day);
            CREATE INDEX IF NOT EXISTS idx_activity_root ON activity_log(user_root);

            CREATE TABLE IF NOT EXISTS erasure_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_root BLOB NOT NULL,
                days TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_erasure_status ON erasure_log(status);

            CREATE TABLE IF NOT EXISTS releases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                metric TEXT NOT NULL,
                day TEXT NOT NULL,
                period TEXT NOT NULL,
                epsilon REAL NOT NULL,
                delta REAL NOT NULL,
                mechanism TEXT NOT NULL,
                raw REAL NOT NULL,
                estimate REAL NOT NULL,
                ci_low REAL NOT NULL,
                ci_high REAL NOT NULL,
                seed INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_releases_metric_period
                ON releases(metric, period);

            CREATE TABLE IF NOT EXISTS rdp_releases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                metric TEXT NOT NULL,
                day TEXT NOT NULL,
                period TEXT NOT NULL,
                order_value REAL NOT NULL,
                rdp REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_rdp_metric_period
                ON rdp_releases(metric, period);

            CREATE TABLE IF NOT EXISTS salt_epochs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                secret TEXT NOT NULL,
                effective_date TEXT NOT NULL,
                rotation_days INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS day_sketch_blob (
                day TEXT PRIMARY KEY,
                impl TEXT NOT NULL,
                blob BLOB NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            ",
        )?;
        Ok(())
    }

    fn parse_day(raw: &str) -> Result<NaiveDate, LedgerError> {
        raw.parse()
            .map_err(|_| LedgerError::Serialization(format!("unreadable day '{raw}'")))
    }

    fn parse_days(raw: &str) -> Result<Vec<NaiveDate>, LedgerError> {
        let days: Vec<String> = serde_json::from_str(raw)
            .map_err(|e| LedgerError::Serialization(format!("erasure day list: {e}")))?;
        days.iter().map(|d| Self::parse_day(d)).collect()
    }
}

impl Ledger for SqliteLedger {
    fn append_batch(
        &self,
        rows: &[ActivityRow],
        erasures: &[NewErasure],
    ) -> Result<(), LedgerError> {
        if rows.is_empty() && erasures.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut insert_row = tx.prepare(
                "INSERT INTO activity_log (day, user_key, user_root, op, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                insert_row.execute(params![
                    row.day.to_string(),
                    row.user_key.as_bytes(),
                    row.user_root.as_bytes(),
                    row.op.as_str(),
                    row.metadata,
                ])?;
            }

            let mut insert_erasure = tx.prepare(
                "INSERT INTO erasure_log (user_root, days, status) VALUES (?1, ?2, 'pending')",
            )?;
            for erasure in erasures {
                let days: Vec<String> = erasure.days.iter().map(ToString::to_string).collect();
                let days_json = serde_json::to_string(&days)
                    .map_err(|e| LedgerError::Serialization(e.to_string()))?;
                insert_erasure.execute(params![erasure.user_root.as_bytes(), days_json])?;
            }
        }
        tx.commit()?;
        tracing::debug!(
            rows = rows.len(),
            erasures = erasures.len(),
            "Committed activity batch"
        );
        Ok(())
    }

    fn day_rows(&self, day: NaiveDate) -> Result<Vec<(Op, UserKey)>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT op, user_key FROM activity_log WHERE day = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![day.to_string()], |row| {
            let op: String = row.get(0)?;
            let key: Vec<u8> = row.get(1)?;
            Ok((op, key))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (op_raw, key_raw) = row?;
            let op: Op = op_raw
                .parse()
                .map_err(LedgerError::Serialization)?;
            let key = UserKey::from_slice(&key_raw).map_err(LedgerError::Serialization)?;
            result.push((op, key));
        }
        Ok(result)
    }

    fn days_for_root(&self, root: &UserKey) -> Result<Vec<NaiveDate>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT day FROM activity_log WHERE user_root = ?1 ORDER BY day ASC",
        )?;
        let rows = stmt.query_map(params![root.as_bytes()], |row| row.get::<_, String>(0))?;
        let mut days = Vec::new();
        for raw in rows {
            days.push(Self::parse_day(&raw?)?);
        }
        Ok(days)
    }

    fn pending_erasures(&self) -> Result<Vec<ErasureRequest>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_root, days FROM erasure_log WHERE status = 'pending' ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let root: Vec<u8> = row.get(1)?;
            let days: String = row.get(2)?;
            Ok((id, root, days))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (id, root_raw, days_raw) = row?;
            result.push(ErasureRequest {
                id,
                user_root: UserKey::from_slice(&root_raw).map_err(LedgerError::Serialization)?,
                days: Self::parse_days(&days_raw)?,
                status: ErasureStatus::Pending,
            });
        }
        Ok(result)
    }

    fn mark_erasure_done(&self, id: i64) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE erasure_log
             SET status = 'done', completed_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(())
    }

    fn record_release(
        &self,
        record: &ReleaseRecord,
        rdp: &[(f64, f64)],
    ) -> Result<(), LedgerError> {
        let period = record.day.format("%Y-%m").to_string();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO releases
             (metric, day, period, epsilon, delta, mechanism, raw, estimate, ci_low, ci_high, seed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.metric.as_str(),
                record.day.to_string(),
                period,
                record.epsilon,
                record.delta,
                record.mechanism.as_str(),
                record.raw,
                record.estimate,
                record.ci_low,
                record.ci_high,
                record.seed,
            ],
        )?;
        {
            let mut insert_rdp = tx.prepare(
                "INSERT INTO rdp_releases (metric, day, period, order_value, rdp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for &(order, value) in rdp {
                insert_rdp.execute(params![
                    record.metric.as_str(),
                    record.day.to_string(),
                    period,
                    order,
                    value,
                ])?;
            }
        }
        tx.commit()?;
        tracing::info!(
            metric = record.metric.as_str(),
            day = %record.day,
            epsilon = record.epsilon,
            mechanism = record.mechanism.as_str(),
            "Recorded release"
        );
        Ok(())
    }

    fn spent_epsilon(&self, metric: Metric, period: &str) -> Result<f64, LedgerError> {
        let conn = self.lock()?;
        let spent: f64 = conn.query_row(
            "SELECT COALESCE(SUM(epsilon), 0) FROM releases WHERE metric = ?1 AND period = ?2",
            params![metric.as_str(), period],
            |row| row.get(0),
        )?;
        Ok(spent)
    }

    fn release_count(&self, metric: Metric, period: &str) -> Result<u64, LedgerError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM releases WHERE metric = ?1 AND period = ?2",
            params![metric.as_str(), period],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn releases_for(&self, metric: Metric, period: &str) -> Result<Vec<(f64, f64)>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT epsilon, delta FROM releases
             WHERE metric = ?1 AND period = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![metric.as_str(), period], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn rdp_totals(&self, metric: Metric, period: &str) -> Result<Vec<(f64, f64)>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT order_value, COALESCE(SUM(rdp), 0) FROM rdp_releases
             WHERE metric = ?1 AND period = ?2
             GROUP BY order_value ORDER BY order_value ASC",
        )?;
        let rows = stmt.query_map(params![metric.as_str(), period], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn reset_budget(&self, metric: Metric, period: &str) -> Result<(), LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM releases WHERE metric = ?1 AND period = ?2",
            params![metric.as_str(), period],
        )?;
        tx.execute(
            "DELETE FROM rdp_releases WHERE metric = ?1 AND period = ?2",
            params![metric.as_str(), period],
        )?;
        tx.commit()?;
        tracing::warn!(metric = metric.as_str(), period, "Budget reset");
        Ok(())
    }

    fn append_salt_epoch(
        &self,
        secret: &str,
        effective_date: NaiveDate,
        rotation_days: u32,
    ) -> Result<SaltEpoch, LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO salt_epochs (secret, effective_date, rotation_days)
             VALUES (?1, ?2, ?3)",
            params![secret, effective_date.to_string(), rotation_days],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(epoch_id = id, effective = %effective_date, "Appended salt epoch");
        Ok(SaltEpoch {
            id,
            secret: secret.to_string(),
            effective_date,
            rotation_days,
        })
    }

    fn salt_epochs(&self) -> Result<Vec<SaltEpoch>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, secret, effective_date, rotation_days
             FROM salt_epochs ORDER BY effective_date ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let secret: String = row.get(1)?;
            let effective: String = row.get(2)?;
            let rotation_days: u32 = row.get(3)?;
            Ok((id, secret, effective, rotation_days))
        })?;

        let mut epochs = Vec::new();
        for row in rows {
            let (id, secret, effective_raw, rotation_days) = row?;
            epochs.push(SaltEpoch {
                id,
                secret,
                effective_date: Self::parse_day(&effective_raw)?,
                rotation_days,
            });
        }
        Ok(epochs)
    }

    fn save_sketch_blob(
        &self,
        day: NaiveDate,
        kind: &str,
        blob: &[u8],
    ) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO day_sketch_blob (day, impl, blob, updated_at)
             VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
             ON CONFLICT(day) DO UPDATE
             SET impl = excluded.impl, blob = excluded.blob, updated_at = CURRENT_TIMESTAMP",
            params![day.to_string(), kind, blob],
        )?;
        Ok(())
    }

    fn load_sketch_blob(
        &self,
        day: NaiveDate,
    ) -> Result<Option<(String, Vec<u8>)>, LedgerError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT impl, blob FROM day_sketch_blob WHERE day = ?1",
            params![day.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(Into::into)
    }

    fn backup_to(&self, dest: &Path) -> Result<(), LedgerError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Database(format!("creating backup dir: {e}")))?;
        }
        let conn = self.lock()?;
        conn.execute("VACUUM INTO ?1", params![dest.to_string_lossy()])?;
        tracing::info!(dest = %dest.display(), "Ledger backup written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::release::MechanismKind;

    fn day(s: &str) -> NaiveDate {
        s.parse().expect("Valid date")
    }

    fn key(tag: u8) -> UserKey {
        UserKey::from_bytes([tag; 32])
    }

    fn activity(tag: u8, d: &str, op: Op) -> ActivityRow {
        ActivityRow {
            day: day(d),
            user_key: key(tag),
            user_root: key(tag),
            op,
            metadata: "{}".to_string(),
        }
    }

    fn release(metric: Metric, d: &str, epsilon: f64) -> ReleaseRecord {
        ReleaseRecord {
            metric,
            day: day(d),
            epsilon,
            delta: 0.0,
            mechanism: MechanismKind::Laplace,
            raw: 10.0,
            estimate: 11.0,
            ci_low: 3.0,
            ci_high: 19.0,
            seed: 12345,
        }
    }

    #[test]
    fn test_activity_roundtrip_preserves_order() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        ledger
            .append_batch(
                &[
                    activity(1, "2025-10-01", Op::Add),
                    activity(2, "2025-10-01", Op::Add),
                    activity(1, "2025-10-01", Op::Remove),
                    activity(3, "2025-10-02", Op::Add),
                ],
                &[],
            )
            .expect("Should append");

        let rows = ledger.day_rows(day("2025-10-01")).expect("Should load");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (Op::Add, key(1)));
        assert_eq!(rows[2], (Op::Remove, key(1)));
        assert_eq!(ledger.day_rows(day("2025-10-02")).expect("load").len(), 1);
    }

    #[test]
    fn test_duplicate_rows_are_kept() {
        // The activity log is an audit trail; dedup happens in sketches.
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        ledger
            .append_batch(
                &[
                    activity(1, "2025-10-01", Op::Add),
                    activity(1, "2025-10-01", Op::Add),
                ],
                &[],
            )
            .expect("Should append");
        assert_eq!(ledger.day_rows(day("2025-10-01")).expect("load").len(), 2);
    }

    #[test]
    fn test_days_for_root_distinct_sorted() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        ledger
            .append_batch(
                &[
                    activity(1, "2025-10-03", Op::Add),
                    activity(1, "2025-10-01", Op::Add),
                    activity(1, "2025-10-01", Op::Add),
                    activity(2, "2025-10-02", Op::Add),
                ],
                &[],
            )
            .expect("Should append");
        let days = ledger.days_for_root(&key(1)).expect("Should query");
        assert_eq!(days, vec![day("2025-10-01"), day("2025-10-03")]);
    }

    #[test]
    fn test_erasure_lifecycle() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        ledger
            .append_batch(
                &[],
                &[NewErasure {
                    user_root: key(9),
                    days: vec![day("2025-10-01"), day("2025-10-04")],
                }],
            )
            .expect("Should append");

        let pending = ledger.pending_erasures().expect("Should list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].days.len(), 2);
        assert_eq!(pending[0].status, ErasureStatus::Pending);

        ledger.mark_erasure_done(pending[0].id).expect("Should mark");
        assert!(ledger.pending_erasures().expect("Should list").is_empty());
        // Marking again is a no-op, not an error.
        ledger.mark_erasure_done(pending[0].id).expect("Should mark");
    }

    #[test]
    fn test_budget_accounting_queries() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        ledger
            .record_release(&release(Metric::Dau, "2025-10-01", 0.3), &[(2.0, 0.1), (4.0, 0.2)])
            .expect("Should record");
        ledger
            .record_release(&release(Metric::Dau, "2025-10-02", 0.3), &[(2.0, 0.1), (4.0, 0.2)])
            .expect("Should record");
        ledger
            .record_release(&release(Metric::Mau, "2025-10-02", 0.5), &[])
            .expect("Should record");
        ledger
            .record_release(&release(Metric::Dau, "2025-11-01", 0.3), &[])
            .expect("Should record");

        assert!((ledger.spent_epsilon(Metric::Dau, "2025-10").expect("spent") - 0.6).abs() < 1e-9);
        assert_eq!(ledger.release_count(Metric::Dau, "2025-10").expect("count"), 2);
        assert_eq!(
            ledger.rdp_totals(Metric::Dau, "2025-10").expect("totals"),
            vec![(2.0, 0.2), (4.0, 0.4)]
        );
        assert_eq!(
            ledger.releases_for(Metric::Dau, "2025-10").expect("list"),
            vec![(0.3, 0.0), (0.3, 0.0)]
        );

        ledger.reset_budget(Metric::Dau, "2025-10").expect("Should reset");
        assert_eq!(ledger.spent_epsilon(Metric::Dau, "2025-10").expect("spent"), 0.0);
        assert!(ledger.rdp_totals(Metric::Dau, "2025-10").expect("totals").is_empty());
        // Other metric and other month untouched.
        assert_eq!(ledger.release_count(Metric::Mau, "2025-10").expect("count"), 1);
        assert_eq!(ledger.release_count(Metric::Dau, "2025-11").expect("count"), 1);
        // Reset is idempotent.
        ledger.reset_budget(Metric::Dau, "2025-10").expect("Should reset");
    }

    #[test]
    fn test_salt_epoch_storage() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        let first = ledger
            .append_salt_epoch("b64:AAAA", day("2025-01-01"), 30)
            .expect("Should append");
        ledger
            .append_salt_epoch("b64:BBBB", day("2025-03-01"), 45)
            .expect("Should append");

        let epochs = ledger.salt_epochs().expect("Should list");
        assert_eq!(epochs.len(), 2);
        assert_eq!(epochs[0].id, first.id);
        assert_eq!(epochs[1].rotation_days, 45);
    }

    #[test]
    fn test_sketch_blob_upsert() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        assert!(ledger.load_sketch_blob(day("2025-10-01")).expect("load").is_none());

        ledger
            .save_sketch_blob(day("2025-10-01"), "kmv", &[1, 2, 3])
            .expect("Should save");
        ledger
            .save_sketch_blob(day("2025-10-01"), "kmv", &[9, 9])
            .expect("Should overwrite");

        let (kind, blob) = ledger
            .load_sketch_blob(day("2025-10-01"))
            .expect("Should load")
            .expect("Should exist");
        assert_eq!(kind, "kmv");
        assert_eq!(blob, vec![9, 9]);
    }

    #[test]
    fn test_uncommitted_transaction_leaves_no_rows() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        {
            let mut conn = ledger.conn.lock().expect("Lock works in test");
            let tx = conn.transaction().expect("Should begin");
            tx.execute(
                "INSERT INTO activity_log (day, user_key, user_root, op, metadata)
                 VALUES ('2025-10-01', X'00', X'00', '+', '{}')",
                [],
            )
            .expect("Should insert inside tx");
            // Dropped without commit: simulates a crash mid-batch.
        }
        assert!(ledger.day_rows(day("2025-10-01")).expect("load").is_empty());
        assert_eq!(ledger.spent_epsilon(Metric::Dau, "2025-10").expect("spent"), 0.0);
    }

    #[test]
    fn test_backup_produces_consistent_copy() {
        let dir = tempfile::tempdir().expect("Should create tempdir");
        let ledger = SqliteLedger::open(dir.path().join("ledgers/ledger.sqlite"))
            .expect("Should open");
        ledger
            .append_batch(&[activity(1, "2025-10-01", Op::Add)], &[])
            .expect("Should append");

        let backup_path = dir.path().join("backups/ledger-20251001.sqlite");
        ledger.backup_to(&backup_path).expect("Should back up");

        let restored = SqliteLedger::open(&backup_path).expect("Should reopen");
        assert_eq!(restored.day_rows(day("2025-10-01")).expect("load").len(), 1);
    }
}
