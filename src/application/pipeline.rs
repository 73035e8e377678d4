//! Pipeline: single-writer orchestration of ingestion, erasure replay and
//! DP releases.
//!
//! One exclusive lock covers the window store, the ledger and the
//! accountant for the duration of every top-level operation, so releases
//! are serialized: a release for day D reflects every ingest and erasure
//! that committed before it and none that commit after. Read-only
//! snapshots take the shared side of the lock.
//!
//! Every ingest batch is all-or-nothing: validation failures reject the
//! whole batch before anything is derived, and the ledger commit is one
//! transaction. Transient ledger failures are retried once, then
//! surfaced.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{NaiveDate, Utc};
use serde::Serialize;

use crate::application::accountant::{BudgetCaps, BudgetSnapshot, PrivacyAccountant};
use crate::application::windows::WindowStore;
use crate::config::AppConfig;
use crate::domain::event::{Event, Metric, Op};
use crate::domain::keys::{derive_root_key, generate_random_secret, SaltEpoch, SaltSchedule, UserKey};
use crate::domain::release::{
    gaussian_mechanism, laplace_mechanism, release_seed, MechanismKind, MechanismResult,
    ReleaseRecord,
};
use crate::domain::sketch::SketchConfig;
use crate::ports::ledger::{ActivityRow, Ledger, LedgerError, NewErasure};
use crate::ports::noise::NoiseFactory;
use crate::{CountveilError, Result};

/// Epoch seeded from the configured secret when the store is empty.
const BOOTSTRAP_EPOCH_START: &str = "1970-01-01";

/// Released metric plus everything a caller needs to interpret it.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutput {
    pub day: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_days: Option<u32>,
    pub estimate: f64,
    /// Pre-noise sketch estimate; exposed for operators, not for
    /// publication
    pub raw: f64,
    pub lower_95: f64,
    pub upper_95: f64,
    pub epsilon_used: f64,
    pub delta: f64,
    pub mechanism: MechanismKind,
    pub sketch_impl: String,
    /// True when any day in the window went through a Bloom-assisted
    /// difference, which over-deletes by at most the configured rate
    pub bloom_diff_bias: bool,
    pub budget_remaining: f64,
    pub budget: BudgetSnapshot,
    pub version: String,
}

struct PipelineState {
    windows: WindowStore,
    salts: SaltSchedule,
}

/// Process-wide engine root. Constructed once at startup and shared.
pub struct Pipeline<L: Ledger, N: NoiseFactory> {
    ledger: L,
    noise: N,
    accountant: PrivacyAccountant,
    config: AppConfig,
    state: RwLock<PipelineState>,
}

impl<L: Ledger, N: NoiseFactory> Pipeline<L, N> {
    /// Build the pipeline, bootstrapping the salt epoch table from the
    /// configured secret on first run.
    ///
    /// # Errors
    /// Fails when the ledger is unreachable or the bootstrap date is
    /// unrepresentable.
    pub fn new(ledger: L, noise: N, config: AppConfig) -> Result<Self> {
        let mut schedule = SaltSchedule::new(ledger.salt_epochs()?);
        if schedule.is_empty() {
            let start: NaiveDate = BOOTSTRAP_EPOCH_START
                .parse()
                .map_err(|_| CountveilError::Fatal("bootstrap epoch date".to_string()))?;
            let epoch = ledger.append_salt_epoch(
                &config.security.hash_salt_secret,
                start,
                config.security.hash_salt_rotation_days,
            )?;
            schedule.push(epoch);
            tracing::info!("Bootstrapped salt epoch from configured secret");
        }

        let sketch_config = SketchConfig {
            k: config.sketch.k,
            use_bloom_for_diff: config.sketch.use_bloom_for_diff,
            bloom_fp_rate: config.sketch.bloom_fp_rate,
        };
        let windows = WindowStore::new(config.sketch.kind, sketch_config);
        let accountant = PrivacyAccountant::new(
            BudgetCaps {
                dau: config.dp.dau_budget_total,
                mau: config.dp.mau_budget_total,
            },
            config.dp.delta,
            config.dp.advanced_delta,
            config.dp.rdp_orders.clone(),
        );

        Ok(Self {
            ledger,
            noise,
            accountant,
            config,
            state: RwLock::new(PipelineState {
                windows,
                salts: schedule,
            }),
        })
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, PipelineState>> {
        self.state
            .write()
            .map_err(|_| CountveilError::Fatal("pipeline state lock poisoned".to_string()))
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, PipelineState>> {
        self.state
            .read()
            .map_err(|_| CountveilError::Fatal("pipeline state lock poisoned".to_string()))
    }

    fn retry_once<T>(op: impl Fn() -> std::result::Result<T, LedgerError>) -> Result<T> {
        match op() {
            Ok(value) => Ok(value),
            Err(first) => {
                tracing::warn!(error = %first, "Ledger operation failed, retrying once");
                op().map_err(CountveilError::Ledger)
            }
        }
    }

    /// Ingest a batch of events atomically.
    ///
    /// Every event is validated before anything is derived; one bad event
    /// rejects the whole batch. `+` events update the day sketch; `-`
    /// events queue an erasure for the day and write tombstones against
    /// every prior day the user was active, marking all of them dirty.
    ///
    /// # Errors
    /// `Validation` for malformed events, `Ledger` when the commit fails
    /// after a retry.
    pub fn ingest(&self, events: &[Event]) -> Result<usize> {
        let today = Self::today();
        let mut problems = Vec::new();
        for (index, event) in events.iter().enumerate() {
            if let Err(errors) = event.validate(today) {
                for error in errors {
                    problems.push(format!("event[{index}]: {error}"));
                }
            }
        }
        if !problems.is_empty() {
            return Err(CountveilError::Validation(problems.join("; ")));
        }
        if events.is_empty() {
            return Ok(0);
        }

        let mut state = self.write_state()?;

        let mut rows: Vec<ActivityRow> = Vec::with_capacity(events.len());
        let mut erasures: Vec<NewErasure> = Vec::new();
        // Days each root was added on within this same batch; the ledger
        // query below cannot see them yet.
        let mut batch_days: HashMap<UserKey, BTreeSet<NaiveDate>> = HashMap::new();
        // (day, hash) pairs to fold into in-memory sketches after commit
        let mut touches: Vec<(NaiveDate, u64)> = Vec::new();
        let mut dirtied: BTreeSet<NaiveDate> = BTreeSet::new();

        for event in events {
            let epoch = state.salts.epoch_for(event.day).ok_or_else(|| {
                CountveilError::Validation(format!("no salt epoch covers day {}", event.day))
            })?;
            let user_key = epoch
                .derive_key(&event.user_id)
                .map_err(CountveilError::Fatal)?;
            let user_root = derive_root_key(&self.config.security.hash_salt_secret, &event.user_id)
                .map_err(CountveilError::Fatal)?;

            let metadata = match &event.metadata {
                serde_json::Value::Null => "{}".to_string(),
                other => other.to_string(),
            };
            rows.push(ActivityRow {
                day: event.day,
                user_key,
                user_root,
                op: event.op,
                metadata,
            });

            match event.op {
                Op::Add => {
                    batch_days.entry(user_root).or_default().insert(event.day);
                    touches.push((event.day, user_key.sketch_hash()));
                }
                Op::Remove => {
                    let mut days: BTreeSet<NaiveDate> = match event.erasure_day_hints() {
                        Some(hints) => hints.into_iter().collect(),
                        None => self.ledger.days_for_root(&user_root)?.into_iter().collect(),
                    };
                    if let Some(seen) = batch_days.get(&user_root) {
                        days.extend(seen.iter().copied());
                    }
                    days.insert(event.day);

                    // Tombstones against every prior active day; the event
                    // day already carries its own `-` row.
                    for &affected in &days {
                        if affected != event.day {
                            let day_epoch = state.salts.epoch_for(affected).ok_or_else(|| {
                                CountveilError::Validation(format!(
                                    "no salt epoch covers day {affected}"
                                ))
                            })?;
                            let day_key = day_epoch
                                .derive_key(&event.user_id)
                                .map_err(CountveilError::Fatal)?;
                            rows.push(ActivityRow {
                                day: affected,
                                user_key: day_key,
                                user_root,
                                op: Op::Remove,
                                metadata: "{\"tombstone\":true}".to_string(),
                            });
                        }
                        dirtied.insert(affected);
                    }

                    erasures.push(NewErasure {
                        user_root,
                        days: days.into_iter().collect(),
                    });
                }
            }
        }

        Self::retry_once(|| self.ledger.append_batch(&rows, &erasures))?;

        for day in &dirtied {
            state.windows.mark_dirty(*day);
        }
        let mut touched_days: BTreeSet<NaiveDate> = BTreeSet::new();
        for (day, hashed) in touches {
            state.windows.touch(day, hashed);
            touched_days.insert(day);
        }
        for day in touched_days {
            state.windows.persist_day(day, &self.ledger)?;
        }

        tracing::info!(
            events = events.len(),
            erasures = erasures.len(),
            "Ingested batch"
        );
        Ok(events.len())
    }

    fn replay_deletions_locked(&self, state: &mut PipelineState) -> Result<usize> {
        let pending = self.ledger.pending_erasures()?;
        let mut processed = 0usize;
        for erasure in pending {
            for &day in &erasure.days {
                state.windows.mark_dirty(day);
            }
            for &day in &erasure.days {
                state.windows.rebuild(day, &self.ledger)?;
            }
            // Every affected day rebuilt successfully; the request is done
            // and stays done.
            Self::retry_once(|| self.ledger.mark_erasure_done(erasure.id))?;
            processed += 1;
        }
        if processed > 0 {
            tracing::info!(erasures = processed, "Replayed pending erasures");
        }
        Ok(processed)
    }

    /// Replay every pending erasure: mark its days dirty, rebuild them,
    /// and flip the request to done. Idempotent; may be called any time.
    ///
    /// # Errors
    /// `Ledger` when the store is unreachable.
    pub fn replay_deletions(&self) -> Result<usize> {
        let mut state = self.write_state()?;
        self.replay_deletions_locked(&mut state)
    }

    fn release(
        &self,
        metric: Metric,
        day: NaiveDate,
        window_days: Option<u32>,
    ) -> Result<ReleaseOutput> {
        if day > Self::today() {
            return Err(CountveilError::Validation(format!(
                "release day {day} is in the future"
            )));
        }
        let span = window_days.unwrap_or(1);
        if window_days.is_some() && !(1..=366).contains(&span) {
            return Err(CountveilError::Validation(format!(
                "window of {span} days is outside 1..=366"
            )));
        }

        let mut state = self.write_state()?;
        self.replay_deletions_locked(&mut state)?;

        let estimate = state.windows.rolling_union(day, span, &self.ledger)?;
        let raw = estimate.raw;

        let (epsilon, delta) = match metric {
            Metric::Dau => (self.config.dp.epsilon_dau, 0.0),
            Metric::Mau => (self.config.dp.epsilon_mau, self.config.dp.delta),
        };
        let sensitivity = f64::from(self.config.dp.w_bound);

        if !self
            .accountant
            .can_release(&self.ledger, metric, epsilon, day)?
        {
            let failure = self.accountant.exhausted(&self.ledger, metric, day)?;
            tracing::warn!(
                metric = metric.as_str(),
                day = %day,
                spent = failure.spent,
                cap = failure.cap,
                "Release rejected, budget exhausted"
            );
            return Err(CountveilError::BudgetExhausted(Box::new(failure)));
        }

        let seed = release_seed(metric, day, self.config.dp.default_seed);
        let mut noise = self.noise.seeded(seed);
        let result: MechanismResult = match metric {
            Metric::Dau => laplace_mechanism(raw, sensitivity, epsilon, &mut noise, seed)?,
            Metric::Mau => {
                gaussian_mechanism(raw, sensitivity, epsilon, delta, &mut noise, seed)?
            }
        };

        let record = ReleaseRecord {
            metric,
            day,
            epsilon,
            delta,
            mechanism: result.mechanism,
            raw,
            estimate: result.estimate,
            ci_low: result.ci_low,
            ci_high: result.ci_high,
            seed,
        };
        let rdp = self
            .accountant
            .rdp_contributions(result.mechanism, epsilon, delta, sensitivity);
        Self::retry_once(|| self.ledger.record_release(&record, &rdp))?;

        let budget = self.accountant.snapshot(&self.ledger, metric, day)?;
        self.export_budget_report(&budget);

        Ok(ReleaseOutput {
            day,
            window_days,
            estimate: result.estimate,
            raw,
            lower_95: result.ci_low,
            upper_95: result.ci_high,
            epsilon_used: epsilon,
            delta,
            mechanism: result.mechanism,
            sketch_impl: self.config.sketch.kind.as_str().to_string(),
            bloom_diff_bias: estimate.bloom_diff_applied,
            budget_remaining: budget.epsilon_remaining,
            budget,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// DP count of distinct users active on one day.
    ///
    /// # Errors
    /// `BudgetExhausted` when the monthly cap would be exceeded;
    /// `Validation` for a future day.
    pub fn release_dau(&self, day: NaiveDate) -> Result<ReleaseOutput> {
        self.release(Metric::Dau, day, None)
    }

    /// DP count of distinct users active in the window ending at `end`.
    ///
    /// # Errors
    /// As [`Self::release_dau`], plus `Validation` for a window outside
    /// 1..=366 days.
    pub fn release_mau(&self, end: NaiveDate, window_days: Option<u32>) -> Result<ReleaseOutput> {
        let span = window_days.unwrap_or(self.config.sketch.mau_window_days);
        self.release(Metric::Mau, end, Some(span))
    }

    /// Accountant state without consuming anything.
    ///
    /// # Errors
    /// `Ledger` when the store is unreachable.
    pub fn budget_snapshot(&self, metric: Metric, day: NaiveDate) -> Result<BudgetSnapshot> {
        let _state = self.read_state()?;
        self.accountant.snapshot(&self.ledger, metric, day)
    }

    /// Zero a month's budget. Logged and idempotent; operator use only.
    ///
    /// # Errors
    /// `Validation` for a malformed month key.
    pub fn reset_budget(&self, metric: Metric, month: &str) -> Result<()> {
        if NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").is_err() {
            return Err(CountveilError::Validation(format!(
                "month must be YYYY-MM, got '{month}'"
            )));
        }
        let _state = self.write_state()?;
        self.accountant.reset_month(&self.ledger, metric, month)
    }

    /// Append a new salt epoch taking effect strictly after the active
    /// MAU window.
    ///
    /// Rotating inside the window would re-key users mid-window and break
    /// distinct-count identity, so any effective date at or before today
    /// is a `Conflict` and the current state is untouched. Days already
    /// materialized at or after the effective date are queued for rebuild.
    ///
    /// # Errors
    /// `Conflict` as above, `Validation` for a cadence shorter than the
    /// MAU window.
    pub fn rotate_salt(
        &self,
        effective_date: NaiveDate,
        rotation_days: Option<u32>,
        secret: Option<String>,
    ) -> Result<SaltEpoch> {
        let rotation_days = rotation_days.unwrap_or(self.config.security.hash_salt_rotation_days);
        if rotation_days < self.config.sketch.mau_window_days {
            return Err(CountveilError::Validation(format!(
                "rotation cadence {rotation_days} is shorter than the {}-day MAU window",
                self.config.sketch.mau_window_days
            )));
        }
        let today = Self::today();
        if effective_date <= today {
            return Err(CountveilError::Conflict(format!(
                "salt rotation effective {effective_date} falls inside the active window ending {today}; \
                 schedule it strictly after the window"
            )));
        }

        let mut state = self.write_state()?;
        let secret = secret.unwrap_or_else(generate_random_secret);
        let epoch = Self::retry_once(|| {
            self.ledger
                .append_salt_epoch(&secret, effective_date, rotation_days)
        })?;
        state.salts.push(epoch.clone());
        state.windows.invalidate_from(effective_date);
        Ok(epoch)
    }

    /// Liveness check used by the health endpoint.
    ///
    /// # Errors
    /// `Ledger` when the store is unreachable.
    pub fn health(&self) -> Result<()> {
        let _state = self.read_state()?;
        self.ledger.salt_epochs()?;
        Ok(())
    }

    /// Write a dated backup of the ledger under `DATA_DIR/backups`.
    ///
    /// # Errors
    /// `Ledger` when the copy fails.
    pub fn backup_ledger(&self) -> Result<PathBuf> {
        let _state = self.read_state()?;
        let name = format!("ledger-{}.sqlite", Self::today().format("%Y%m%d"));
        let dest = self.config.backups_dir().join(name);
        self.ledger.backup_to(&dest)?;
        Ok(dest)
    }

    /// Best-effort JSON report of the latest budget snapshot.
    fn export_budget_report(&self, snapshot: &BudgetSnapshot) {
        let dir = self.config.reports_dir();
        let path = dir.join("budget-snapshot.json");
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            let payload = serde_json::to_vec_pretty(snapshot)?;
            std::fs::write(&path, payload)
        };
        if let Err(e) = write() {
            tracing::warn!(error = %e, path = %path.display(), "Budget report not written");
        }
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::noise::ChaChaNoiseFactory;
    use crate::adapters::sqlite::SqliteLedger;
    use crate::domain::sketch::SketchKind;

    fn day(s: &str) -> NaiveDate {
        s.parse().expect("Valid date")
    }

    fn pipeline() -> Pipeline<SqliteLedger, ChaChaNoiseFactory> {
        pipeline_with(|_| {})
    }

    fn pipeline_with(
        tweak: impl FnOnce(&mut AppConfig),
    ) -> Pipeline<SqliteLedger, ChaChaNoiseFactory> {
        // into_path keeps the directory alive for report/backup writes.
        let dir = tempfile::tempdir().expect("Should create tempdir").into_path();
        let mut config = AppConfig::for_tests(dir);
        tweak(&mut config);
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        Pipeline::new(ledger, ChaChaNoiseFactory, config).expect("Should build pipeline")
    }

    fn add(user: &str, d: &str) -> Event {
        Event::new(user, Op::Add, day(d))
    }

    fn remove(user: &str, d: &str) -> Event {
        Event::new(user, Op::Remove, day(d))
    }

    #[test]
    fn test_dau_release_happy_path() {
        let pipeline = pipeline();
        pipeline
            .ingest(&[add("u1", "2025-10-01"), add("u2", "2025-10-01"), add("u1", "2025-10-02")])
            .expect("Should ingest");

        let out = pipeline.release_dau(day("2025-10-01")).expect("Should release");
        assert_eq!(out.raw, 2.0);
        assert_eq!(out.epsilon_used, 0.3);
        assert_eq!(out.mechanism, MechanismKind::Laplace);
        assert_eq!(out.delta, 0.0);
        // Noise at scale W/eps = 2/0.3; the estimate stays in a loose band.
        assert!((out.estimate - 2.0).abs() < 100.0);
        assert!(out.lower_95 <= out.estimate && out.estimate <= out.upper_95);
        assert!((out.budget.epsilon_spent - 0.3).abs() < 1e-9);
        assert!((out.budget_remaining - 2.7).abs() < 1e-9);
    }

    #[test]
    fn test_mau_counts_distinct_users_across_window() {
        let pipeline = pipeline();
        let mut events = Vec::new();
        for i in 0..100 {
            let offset = i % 30;
            let d = day("2025-09-02")
                .checked_add_days(chrono::Days::new(offset as u64))
                .expect("in range");
            events.push(Event::new(format!("user-{i:03}"), Op::Add, d));
        }
        pipeline.ingest(&events).expect("Should ingest");

        let out = pipeline
            .release_mau(day("2025-10-01"), Some(30))
            .expect("Should release");
        assert_eq!(out.raw, 100.0);
        assert_eq!(out.window_days, Some(30));
        assert_eq!(out.mechanism, MechanismKind::Gaussian);
        assert!(out.delta > 0.0);
    }

    #[test]
    fn test_same_user_counts_once_in_mau() {
        let pipeline = pipeline();
        pipeline
            .ingest(&[
                add("walker", "2025-10-01"),
                add("walker", "2025-10-05"),
                add("walker", "2025-10-12"),
                add("walker", "2025-10-20"),
            ])
            .expect("Should ingest");

        let out = pipeline
            .release_mau(day("2025-10-20"), Some(30))
            .expect("Should release");
        assert_eq!(out.raw, 1.0);
    }

    #[test]
    fn test_erasure_tombstones_prior_days() {
        let pipeline = pipeline();
        pipeline.ingest(&[add("u1", "2025-10-01")]).expect("Should ingest");
        pipeline.ingest(&[remove("u1", "2025-10-05")]).expect("Should ingest");

        pipeline.replay_deletions().expect("Should replay");
        let out = pipeline.release_dau(day("2025-10-01")).expect("Should release");
        assert_eq!(out.raw, 0.0);

        // Replay is idempotent: nothing left pending.
        assert_eq!(pipeline.replay_deletions().expect("Should replay"), 0);
    }

    #[test]
    fn test_duplicate_adds_double_log_single_count() {
        let pipeline = pipeline();
        pipeline
            .ingest(&[add("u1", "2025-10-01"), add("u1", "2025-10-01")])
            .expect("Should ingest");
        pipeline
            .ingest(&[add("u1", "2025-10-01"), add("u1", "2025-10-01")])
            .expect("Should ingest");

        let out = pipeline.release_dau(day("2025-10-01")).expect("Should release");
        assert_eq!(out.raw, 1.0);
    }

    #[test]
    fn test_budget_exhaustion_surfaces_and_resets() {
        let pipeline = pipeline();
        pipeline.ingest(&[add("u1", "2025-10-01")]).expect("Should ingest");

        for _ in 0..10 {
            pipeline.release_dau(day("2025-10-01")).expect("Should release");
        }
        let failure = pipeline.release_dau(day("2025-10-01"));
        match failure {
            Err(CountveilError::BudgetExhausted(payload)) => {
                assert_eq!(payload.metric, Metric::Dau);
                assert_eq!(payload.cap, 3.0);
                assert_eq!(payload.remaining, 0.0);
                assert_eq!(payload.reset_month, "2025-11");
            }
            other => panic!("expected budget exhaustion, got {other:?}"),
        }
        // Exhaustion persists until a manual reset.
        assert!(matches!(
            pipeline.release_dau(day("2025-10-01")),
            Err(CountveilError::BudgetExhausted(_))
        ));

        pipeline.reset_budget(Metric::Dau, "2025-10").expect("Should reset");
        pipeline.release_dau(day("2025-10-01")).expect("Should release again");
    }

    #[test]
    fn test_rejected_release_not_recorded() {
        let pipeline = pipeline();
        pipeline.ingest(&[add("u1", "2025-10-01")]).expect("Should ingest");
        for _ in 0..10 {
            pipeline.release_dau(day("2025-10-01")).expect("Should release");
        }
        let before = pipeline
            .budget_snapshot(Metric::Dau, day("2025-10-01"))
            .expect("Should snapshot");
        let _ = pipeline.release_dau(day("2025-10-01"));
        let after = pipeline
            .budget_snapshot(Metric::Dau, day("2025-10-01"))
            .expect("Should snapshot");
        assert_eq!(before.release_count, after.release_count);
        assert_eq!(before.epsilon_spent, after.epsilon_spent);
    }

    fn today_plus(days: u64) -> NaiveDate {
        Utc::now()
            .date_naive()
            .checked_add_days(chrono::Days::new(days))
            .expect("in range")
    }

    #[test]
    fn test_batch_rejected_as_a_whole() {
        let pipeline = pipeline();
        let future = today_plus(2);
        let result = pipeline.ingest(&[
            add("good", "2025-10-01"),
            Event::new("late", Op::Add, future),
            Event::new("", Op::Add, day("2025-10-01")),
        ]);
        match result {
            Err(CountveilError::Validation(message)) => {
                assert!(message.contains("event[1]"));
                assert!(message.contains("event[2]"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
        // Nothing from the batch landed.
        let out = pipeline.release_dau(day("2025-10-01")).expect("Should release");
        assert_eq!(out.raw, 0.0);
    }

    #[test]
    fn test_rotate_salt_conflicts_inside_window() {
        let pipeline = pipeline();
        // Effective today or earlier re-keys the active window.
        let today = Utc::now().date_naive();
        assert!(matches!(
            pipeline.rotate_salt(today, None, None),
            Err(CountveilError::Conflict(_))
        ));
        assert!(matches!(
            pipeline.rotate_salt(day("2025-10-01"), None, None),
            Err(CountveilError::Conflict(_))
        ));

        // Strictly after the window end is allowed.
        let epoch = pipeline
            .rotate_salt(today_plus(1), Some(45), None)
            .expect("Should rotate");
        assert_eq!(epoch.rotation_days, 45);
        assert!(epoch.secret.starts_with("b64:"));

        // Cadence shorter than the window is a configuration error.
        assert!(matches!(
            pipeline.rotate_salt(today_plus(2), Some(7), None),
            Err(CountveilError::Validation(_))
        ));
    }

    #[test]
    fn test_erasure_with_day_hints_skips_log_scan() {
        let pipeline = pipeline();
        pipeline
            .ingest(&[add("u9", "2025-10-01"), add("u9", "2025-10-03")])
            .expect("Should ingest");

        let mut erase = remove("u9", "2025-10-05");
        erase.metadata = serde_json::json!({"days": ["2025-10-01", "2025-10-03"]});
        pipeline.ingest(&[erase]).expect("Should ingest");
        pipeline.replay_deletions().expect("Should replay");

        assert_eq!(
            pipeline.release_dau(day("2025-10-01")).expect("release").raw,
            0.0
        );
        assert_eq!(
            pipeline.release_dau(day("2025-10-03")).expect("release").raw,
            0.0
        );
    }

    #[test]
    fn test_add_and_erase_in_same_batch() {
        let pipeline = pipeline();
        pipeline
            .ingest(&[add("u5", "2025-10-01"), remove("u5", "2025-10-02")])
            .expect("Should ingest");
        pipeline.replay_deletions().expect("Should replay");
        let out = pipeline.release_dau(day("2025-10-01")).expect("Should release");
        assert_eq!(out.raw, 0.0);
    }

    #[test]
    fn test_deterministic_noise_under_seed() {
        let make = || {
            let p = pipeline();
            p.ingest(&[add("u1", "2025-10-01"), add("u2", "2025-10-01")])
                .expect("Should ingest");
            p.release_dau(day("2025-10-01")).expect("Should release")
        };
        let a = make();
        let b = make();
        // Same configured seed root, same day, same metric: same noise.
        assert_eq!(a.estimate, b.estimate);
    }

    #[test]
    fn test_releases_reflect_prior_erasures() {
        let pipeline = pipeline();
        pipeline
            .ingest(&[add("u1", "2025-10-01"), add("u2", "2025-10-01")])
            .expect("Should ingest");
        // The release path replays deletions itself; no explicit flush.
        pipeline.ingest(&[remove("u2", "2025-10-01")]).expect("Should ingest");
        let out = pipeline.release_dau(day("2025-10-01")).expect("Should release");
        assert_eq!(out.raw, 1.0);
    }
}
