//! Per-day sketch store with rolling-window unions and dirty tracking.
//!
//! The store owns every materialized `DaySketch`. Days touched by an
//! erasure are marked dirty and lazily reconstructed from the activity
//! log: all `+` rows are re-added and the distinct `-` hashes are removed
//! through the sketch's difference operation. A rolling union first
//! rebuilds every dirty day in range, so the result reflects all
//! completed erasures, and always returns a fresh sketch that shares no
//! state with the store.
//!
//! Serialized sketches are cached in the ledger per day; the activity log
//! stays authoritative and a cache miss or backend mismatch simply falls
//! back to a rebuild.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Days, NaiveDate};

use crate::domain::event::Op;
use crate::domain::sketch::{DaySketch, SketchConfig, SketchKind};
use crate::ports::ledger::Ledger;
use crate::{CountveilError, Result};

/// Result of a window evaluation.
#[derive(Debug, Clone)]
pub struct WindowEstimate {
    /// Pre-noise cardinality estimate
    pub raw: f64,

    /// Fresh union sketch, not shared with the store
    pub sketch: DaySketch,

    /// True when any day in range was rebuilt through a Bloom-assisted
    /// difference, whose false positives over-delete by at most the
    /// configured rate
    pub bloom_diff_applied: bool,
}

pub struct WindowStore {
    kind: SketchKind,
    config: SketchConfig,
    sketches: BTreeMap<NaiveDate, DaySketch>,
    dirty: BTreeSet<NaiveDate>,
    /// Days whose current sketch went through a Bloom-filtered diff
    bloom_diffed: BTreeSet<NaiveDate>,
}

impl WindowStore {
    #[must_use]
    pub fn new(kind: SketchKind, config: SketchConfig) -> Self {
        Self {
            kind,
            config,
            sketches: BTreeMap::new(),
            dirty: BTreeSet::new(),
            bloom_diffed: BTreeSet::new(),
        }
    }

    /// Record one key for a day.
    ///
    /// Only a materialized, clean sketch is updated in place; anything
    /// else defers to the next rebuild, which replays the activity log.
    pub fn touch(&mut self, day: NaiveDate, hashed: u64) {
        if self.dirty.contains(&day) {
            return;
        }
        match self.sketches.get_mut(&day) {
            Some(sketch) => sketch.add(hashed),
            None => {
                self.dirty.insert(day);
            }
        }
    }

    /// Schedule a day for reconstruction. Idempotent.
    pub fn mark_dirty(&mut self, day: NaiveDate) {
        self.dirty.insert(day);
    }

    #[must_use]
    pub fn is_dirty(&self, day: NaiveDate) -> bool {
        self.dirty.contains(&day)
    }

    /// Reconstruct a day from the activity log: re-add every `+` hash,
    /// then remove the distinct `-` hashes via the sketch difference.
    pub fn rebuild<L: Ledger + ?Sized>(&mut self, day: NaiveDate, ledger: &L) -> Result<()> {
        let rows = ledger.day_rows(day)?;

        let mut sketch = DaySketch::new(self.kind, self.config);
        let mut removed: BTreeSet<u64> = BTreeSet::new();
        for (op, key) in &rows {
            match op {
                Op::Add => sketch.add(key.sketch_hash()),
                Op::Remove => {
                    removed.insert(key.sketch_hash());
                }
            }
        }

        if removed.is_empty() {
            self.bloom_diffed.remove(&day);
        } else {
            let removed: Vec<u64> = removed.into_iter().collect();
            sketch = sketch.diff(&removed);
            if self.config.bloom_diff_applies(self.kind, removed.len()) {
                self.bloom_diffed.insert(day);
            } else {
                self.bloom_diffed.remove(&day);
            }
        }

        ledger.save_sketch_blob(day, sketch.kind().as_str(), &sketch.serialize())?;
        self.sketches.insert(day, sketch);
        self.dirty.remove(&day);
        tracing::debug!(day = %day, rows = rows.len(), "Rebuilt day sketch");
        Ok(())
    }

    /// Make a day present and clean, preferring the cached blob over a
    /// full replay when the backend matches.
    fn ensure_day<L: Ledger + ?Sized>(&mut self, day: NaiveDate, ledger: &L) -> Result<()> {
        if self.dirty.contains(&day) {
            return self.rebuild(day, ledger);
        }
        if self.sketches.contains_key(&day) {
            return Ok(());
        }
        if let Some((kind_raw, blob)) = ledger.load_sketch_blob(day)? {
            if kind_raw == self.kind.as_str() {
                if let Ok(sketch) = DaySketch::deserialize(self.kind, &blob, self.config) {
                    self.sketches.insert(day, sketch);
                    return Ok(());
                }
                tracing::warn!(day = %day, "Corrupt sketch blob, rebuilding from activity log");
            }
        }
        self.rebuild(day, ledger)
    }

    /// Persist the cached blob for a day that was updated in place.
    pub fn persist_day<L: Ledger + ?Sized>(&self, day: NaiveDate, ledger: &L) -> Result<()> {
        if let Some(sketch) = self.sketches.get(&day) {
            if !self.dirty.contains(&day) {
                ledger.save_sketch_blob(day, sketch.kind().as_str(), &sketch.serialize())?;
            }
        }
        Ok(())
    }

    /// Union of the `window_days` day sketches ending at `end`.
    ///
    /// Every dirty day in range is rebuilt first; afterwards the whole
    /// range is clean. DAU is the `window_days == 1` case.
    pub fn rolling_union<L: Ledger + ?Sized>(
        &mut self,
        end: NaiveDate,
        window_days: u32,
        ledger: &L,
    ) -> Result<WindowEstimate> {
        let span = window_days.max(1);
        let start = end
            .checked_sub_days(Days::new(u64::from(span) - 1))
            .ok_or_else(|| {
                CountveilError::Validation(format!("window of {span} days before {end} underflows"))
            })?;

        let mut union = DaySketch::new(self.kind, self.config);
        let mut bias = false;
        let mut day = start;
        while day <= end {
            self.ensure_day(day, ledger)?;
            if let Some(sketch) = self.sketches.get(&day) {
                union = union.union(sketch)?;
            }
            bias |= self.bloom_diffed.contains(&day);
            day = day
                .succ_opt()
                .ok_or_else(|| CountveilError::Fatal(format!("day overflow past {day}")))?;
        }

        Ok(WindowEstimate {
            raw: union.cardinality(),
            sketch: union,
            bloom_diff_applied: bias,
        })
    }

    /// Days currently marked dirty, for diagnostics.
    #[must_use]
    pub fn dirty_days(&self) -> Vec<NaiveDate> {
        self.dirty.iter().copied().collect()
    }

    /// Drop in-memory sketches for days at or after `from`, forcing the
    /// next evaluation to rebuild them (used after a salt rotation).
    pub fn invalidate_from(&mut self, from: NaiveDate) {
        let stale: Vec<NaiveDate> = self
            .sketches
            .range(from..)
            .map(|(day, _)| *day)
            .collect();
        for day in stale {
            self.sketches.remove(&day);
            self.dirty.insert(day);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteLedger;
    use crate::domain::keys::UserKey;
    use crate::ports::ledger::ActivityRow;

    fn day(s: &str) -> NaiveDate {
        s.parse().expect("Valid date")
    }

    fn key(tag: u8) -> UserKey {
        UserKey::from_bytes([tag; 32])
    }

    fn config() -> SketchConfig {
        SketchConfig {
            k: 256,
            use_bloom_for_diff: true,
            bloom_fp_rate: 0.01,
        }
    }

    fn seed_rows(ledger: &SqliteLedger, rows: &[(u8, &str, Op)]) {
        let rows: Vec<ActivityRow> = rows
            .iter()
            .map(|&(tag, d, op)| ActivityRow {
                day: day(d),
                user_key: key(tag),
                user_root: key(tag),
                op,
                metadata: "{}".to_string(),
            })
            .collect();
        ledger.append_batch(&rows, &[]).expect("Should append");
    }

    #[test]
    fn test_rebuild_dedupes_repeated_adds() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        seed_rows(
            &ledger,
            &[
                (1, "2025-10-01", Op::Add),
                (1, "2025-10-01", Op::Add),
                (2, "2025-10-01", Op::Add),
            ],
        );
        let mut store = WindowStore::new(SketchKind::Exact, config());
        let estimate = store
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should evaluate");
        assert_eq!(estimate.raw, 2.0);
    }

    #[test]
    fn test_rebuild_excludes_removed_keys() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        seed_rows(
            &ledger,
            &[
                (1, "2025-10-01", Op::Add),
                (2, "2025-10-01", Op::Add),
                (1, "2025-10-01", Op::Remove),
            ],
        );
        let mut store = WindowStore::new(SketchKind::Exact, config());
        store.mark_dirty(day("2025-10-01"));
        let estimate = store
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should evaluate");
        assert_eq!(estimate.raw, 1.0);
        assert!(!store.is_dirty(day("2025-10-01")));
    }

    #[test]
    fn test_same_user_counts_once_across_window() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        seed_rows(
            &ledger,
            &[
                (1, "2025-10-01", Op::Add),
                (1, "2025-10-02", Op::Add),
                (1, "2025-10-03", Op::Add),
                (2, "2025-10-02", Op::Add),
            ],
        );
        let mut store = WindowStore::new(SketchKind::Exact, config());
        let estimate = store
            .rolling_union(day("2025-10-03"), 3, &ledger)
            .expect("Should evaluate");
        assert_eq!(estimate.raw, 2.0);
    }

    #[test]
    fn test_touch_updates_clean_day_in_place() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        seed_rows(&ledger, &[(1, "2025-10-01", Op::Add)]);
        let mut store = WindowStore::new(SketchKind::Exact, config());
        store
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should materialize");

        seed_rows(&ledger, &[(2, "2025-10-01", Op::Add)]);
        store.touch(day("2025-10-01"), key(2).sketch_hash());
        let estimate = store
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should evaluate");
        assert_eq!(estimate.raw, 2.0);
    }

    #[test]
    fn test_touch_on_unmaterialized_day_defers_to_rebuild() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        seed_rows(&ledger, &[(1, "2025-10-01", Op::Add)]);
        let mut store = WindowStore::new(SketchKind::Exact, config());
        store.touch(day("2025-10-01"), key(1).sketch_hash());
        assert!(store.is_dirty(day("2025-10-01")));
        let estimate = store
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should evaluate");
        assert_eq!(estimate.raw, 1.0);
    }

    #[test]
    fn test_blob_rehydration_avoids_replay() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        seed_rows(&ledger, &[(1, "2025-10-01", Op::Add), (2, "2025-10-01", Op::Add)]);

        let mut first = WindowStore::new(SketchKind::Kmv, config());
        first
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should materialize and persist blob");

        // A fresh store finds the cached blob.
        let mut second = WindowStore::new(SketchKind::Kmv, config());
        let estimate = second
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should rehydrate");
        assert_eq!(estimate.raw, 2.0);
    }

    #[test]
    fn test_union_result_is_fresh_copy() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        seed_rows(&ledger, &[(1, "2025-10-01", Op::Add)]);
        let mut store = WindowStore::new(SketchKind::Exact, config());
        let mut estimate = store
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should evaluate");

        // Mutating the returned sketch must not leak into the store.
        estimate.sketch.add(key(9).sketch_hash());
        let again = store
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should evaluate");
        assert_eq!(again.raw, 1.0);
    }

    #[test]
    fn test_bloom_diff_flag_surfaces() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        // More removals than the exact-membership cutoff forces the
        // Bloom path for the kmv backend.
        let mut rows: Vec<(u8, &str, Op)> = Vec::new();
        for tag in 1..=200u8 {
            rows.push((tag, "2025-10-01", Op::Add));
        }
        for tag in 1..=100u8 {
            rows.push((tag, "2025-10-01", Op::Remove));
        }
        seed_rows(&ledger, &rows);

        let mut store = WindowStore::new(SketchKind::Kmv, config());
        store.mark_dirty(day("2025-10-01"));
        let estimate = store
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should evaluate");
        assert!(estimate.bloom_diff_applied);

        // The exact backend never reports the bias.
        let mut exact = WindowStore::new(SketchKind::Exact, config());
        let estimate = exact
            .rolling_union(day("2025-10-01"), 1, &ledger)
            .expect("Should evaluate");
        assert!(!estimate.bloom_diff_applied);
        assert_eq!(estimate.raw, 100.0);
    }

    #[test]
    fn test_invalidate_from_marks_later_days() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        seed_rows(
            &ledger,
            &[
                (1, "2025-10-01", Op::Add),
                (2, "2025-10-05", Op::Add),
                (3, "2025-10-09", Op::Add),
            ],
        );
        let mut store = WindowStore::new(SketchKind::Exact, config());
        store
            .rolling_union(day("2025-10-09"), 9, &ledger)
            .expect("Should materialize");

        store.invalidate_from(day("2025-10-05"));
        assert!(!store.is_dirty(day("2025-10-01")));
        assert!(store.is_dirty(day("2025-10-05")));
        assert!(store.is_dirty(day("2025-10-09")));
    }
}
