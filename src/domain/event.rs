//! Turnstile event types.
//!
//! An event is `(user_id, op, day)` with optional opaque metadata. The
//! stream carries insertions (`+`) and retroactive erasures (`-`); no
//! ordering is assumed beyond insertion order.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Turnstile operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Remove,
}

impl Op {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Remove => "-",
        }
    }
}

impl std::str::FromStr for Op {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "+" => Ok(Self::Add),
            "-" => Ok(Self::Remove),
            other => Err(format!("op must be '+' or '-', got '{other}'")),
        }
    }
}

/// Released metric kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Dau,
    Mau,
}

impl Metric {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dau => "dau",
            Self::Mau => "mau",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dau" => Ok(Self::Dau),
            "mau" => Ok(Self::Mau),
            other => Err(format!("metric must be 'dau' or 'mau', got '{other}'")),
        }
    }
}

/// Inbound turnstile event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// External user identifier; pseudonymized before anything persists
    pub user_id: String,

    pub op: Op,

    /// Calendar day in the configured timezone (UTC)
    pub day: NaiveDate,

    /// Opaque caller-supplied metadata. An erasure may carry a `days`
    /// array naming the days it covers; otherwise the activity log is
    /// consulted.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Event {
    #[must_use]
    pub fn new(user_id: impl Into<String>, op: Op, day: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            op,
            day,
            metadata: serde_json::Value::Null,
        }
    }

    /// Validate one event against the ingestion rules.
    ///
    /// # Errors
    /// Returns every violation found, so a rejected batch can report all
    /// problems at once.
    pub fn validate(&self, today: NaiveDate) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.user_id.trim().is_empty() {
            errors.push("user_id must not be empty".to_string());
        }
        if self.user_id.len() > 512 {
            errors.push(format!(
                "user_id length {} exceeds 512 bytes",
                self.user_id.len()
            ));
        }
        if self.day > today {
            errors.push(format!("day {} is in the future", self.day));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Days named by an erasure's `metadata.days` hint, if present and
    /// well-formed. Malformed entries are ignored rather than rejected;
    /// the activity log remains the authoritative source.
    #[must_use]
    pub fn erasure_day_hints(&self) -> Option<Vec<NaiveDate>> {
        let days = self.metadata.get("days")?.as_array()?;
        let parsed: Vec<NaiveDate> = days
            .iter()
            .filter_map(|v| v.as_str())
            .filter_map(|s| s.parse().ok())
            .collect();
        if parsed.is_empty() {
            None
        } else {
            Some(parsed)
        }
    }
}
