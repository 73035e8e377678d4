//! Ledger port: durable activity, erasure, release and budget state.
//!
//! The activity log is the authoritative record; day sketches are a cache
//! rebuilt from it. Implementations must make each multi-row method a
//! single atomic transaction: a failed ingest or release leaves no
//! partial rows behind.

use chrono::NaiveDate;

use crate::domain::event::{Metric, Op};
use crate::domain::keys::{SaltEpoch, UserKey};
use crate::domain::release::ReleaseRecord;

/// Error type for ledger operations.
///
/// `Database` failures are treated as transient by the pipeline and
/// retried once before surfacing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// One appended activity record.
///
/// `op` is `Remove` both for caller-submitted erasure events and for the
/// tombstones the pipeline writes against every prior day the user was
/// active.
#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub day: NaiveDate,
    pub user_key: UserKey,
    pub user_root: UserKey,
    pub op: Op,
    /// Opaque JSON metadata
    pub metadata: String,
}

/// Erasure lifecycle state. A request flips to `Done` exactly once, after
/// every affected day has been rebuilt; there is no rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErasureStatus {
    Pending,
    Done,
}

impl ErasureStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
        }
    }
}

/// A queued erasure, before it has an identity in the store.
#[derive(Debug, Clone)]
pub struct NewErasure {
    pub user_root: UserKey,
    pub days: Vec<NaiveDate>,
}

/// A stored erasure request.
#[derive(Debug, Clone)]
pub struct ErasureRequest {
    pub id: i64,
    pub user_root: UserKey,
    pub days: Vec<NaiveDate>,
    pub status: ErasureStatus,
}

/// Durable store behind the pipeline.
pub trait Ledger: Send + Sync {
    /// Append activity rows and erasure requests atomically. The whole
    /// batch commits or none of it does.
    fn append_batch(
        &self,
        rows: &[ActivityRow],
        erasures: &[NewErasure],
    ) -> Result<(), LedgerError>;

    /// All ops for a day in insertion order.
    fn day_rows(&self, day: NaiveDate) -> Result<Vec<(Op, UserKey)>, LedgerError>;

    /// Distinct days on which a user root appears in the activity log.
    fn days_for_root(&self, root: &UserKey) -> Result<Vec<NaiveDate>, LedgerError>;

    fn pending_erasures(&self) -> Result<Vec<ErasureRequest>, LedgerError>;

    fn mark_erasure_done(&self, id: i64) -> Result<(), LedgerError>;

    /// Record a release and its per-order Renyi contributions atomically.
    fn record_release(
        &self,
        record: &ReleaseRecord,
        rdp: &[(f64, f64)],
    ) -> Result<(), LedgerError>;

    /// Sum of epsilon spent on a metric within a `YYYY-MM` period.
    fn spent_epsilon(&self, metric: Metric, period: &str) -> Result<f64, LedgerError>;

    fn release_count(&self, metric: Metric, period: &str) -> Result<u64, LedgerError>;

    /// `(epsilon, delta)` of every release in the period, insertion order.
    fn releases_for(&self, metric: Metric, period: &str) -> Result<Vec<(f64, f64)>, LedgerError>;

    /// `(order, total)` of accumulated Renyi terms in the period.
    fn rdp_totals(&self, metric: Metric, period: &str) -> Result<Vec<(f64, f64)>, LedgerError>;

    /// Remove all release and Renyi rows for the period. Idempotent.
    fn reset_budget(&self, metric: Metric, period: &str) -> Result<(), LedgerError>;

    fn append_salt_epoch(
        &self,
        secret: &str,
        effective_date: NaiveDate,
        rotation_days: u32,
    ) -> Result<SaltEpoch, LedgerError>;

    fn salt_epochs(&self) -> Result<Vec<SaltEpoch>, LedgerError>;

    /// Cache a serialized day sketch. Advisory only; the activity log
    /// stays authoritative.
    fn save_sketch_blob(
        &self,
        day: NaiveDate,
        kind: &str,
        blob: &[u8],
    ) -> Result<(), LedgerError>;

    fn load_sketch_blob(&self, day: NaiveDate)
        -> Result<Option<(String, Vec<u8>)>, LedgerError>;

    /// Write a consistent copy of the store to `dest`.
    fn backup_to(&self, dest: &std::path::Path) -> Result<(), LedgerError>;
}
