//! Synthetic workload generation.
//!
//! Produces a seeded JSONL stream of activity with a configurable
//! fraction of erasures, for local evaluation and load testing. Erasure
//! events carry the user's accumulated day list in `metadata.days`, the
//! same hint the ingestion path honors.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use chrono::{Days, NaiveDate};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde_json::json;

use crate::domain::event::{Event, Op};
use crate::{CountveilError, Result};

/// Knobs for the generator.
#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub days: u32,
    pub daily_users: usize,
    /// Fraction of previously-active users erased per day
    pub delete_rate: f64,
    pub seed: u64,
    pub start: NaiveDate,
}

/// Generate the workload and write it as JSONL.
///
/// Returns the number of events written.
///
/// # Errors
/// `Validation` for out-of-range knobs; `Io` when the output file cannot
/// be written.
pub fn generate(out: &Path, spec: &SyntheticSpec) -> Result<usize> {
    if spec.days == 0 || spec.daily_users == 0 {
        return Err(CountveilError::Validation(
            "days and daily-users must be at least 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&spec.delete_rate) {
        return Err(CountveilError::Validation(format!(
            "delete-rate {} must be within [0, 1]",
            spec.delete_rate
        )));
    }

    let mut rng = ChaCha20Rng::seed_from_u64(spec.seed);
    let user_pool: Vec<String> = (0..spec.daily_users * 2)
        .map(|i| format!("user-{i:06}"))
        .collect();
    // Days each user has been active on and not yet erased
    let mut activity: HashMap<String, Vec<String>> = HashMap::new();
    let mut events: Vec<Event> = Vec::new();

    for offset in 0..spec.days {
        let day = spec
            .start
            .checked_add_days(Days::new(u64::from(offset)))
            .ok_or_else(|| CountveilError::Validation("day range overflows".to_string()))?;

        let active: Vec<&String> = user_pool
            .choose_multiple(&mut rng, spec.daily_users)
            .collect();
        for user in active {
            let mut event = Event::new(user.clone(), Op::Add, day);
            event.metadata = json!({"source": "synthetic", "day_offset": offset});
            events.push(event);
            activity
                .entry(user.clone())
                .or_default()
                .push(day.to_string());
        }

        let mut deletable: Vec<String> = activity
            .iter()
            .filter(|(_, days)| !days.is_empty())
            .map(|(user, _)| user.clone())
            .collect();
        deletable.sort();
        let delete_count = (spec.delete_rate * deletable.len() as f64).round() as usize;
        let deletes: Vec<String> = deletable
            .choose_multiple(&mut rng, delete_count)
            .cloned()
            .collect();
        for user in deletes {
            let days = activity.entry(user.clone()).or_default();
            let mut event = Event::new(user, Op::Remove, day);
            event.metadata = json!({"source": "synthetic", "days": days.clone()});
            events.push(event);
            days.clear();
        }
    }

    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(out)?;
    for event in &events {
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
    }
    tracing::info!(
        events = events.len(),
        days = spec.days,
        out = %out.display(),
        "Synthetic workload written"
    );
    Ok(events.len())
}
