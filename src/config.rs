//! Runtime configuration loaded from environment variables.
//!
//! Every knob has a documented default; `DATA_DIR` and `HASH_SALT_SECRET`
//! are required. Invalid values fail startup instead of being silently
//! replaced, because a mis-parsed epsilon or window length would change
//! the privacy guarantees of every subsequent release.

use std::path::PathBuf;

use crate::domain::keys::decode_secret;
use crate::domain::sketch::SketchKind;
use crate::CountveilError;

/// Differential privacy parameters.
#[derive(Debug, Clone)]
pub struct DpSettings {
    /// Epsilon per DAU release
    pub epsilon_dau: f64,

    /// Epsilon per MAU release
    pub epsilon_mau: f64,

    /// Delta for the Gaussian mechanism (MAU releases)
    pub delta: f64,

    /// Delta prime reserved for the advanced composition bound
    pub advanced_delta: f64,

    /// Maximum toggles a single user can contribute within one release
    /// horizon; bounds the sensitivity of both metrics
    pub w_bound: u32,

    /// Monthly epsilon cap for DAU releases
    pub dau_budget_total: f64,

    /// Monthly epsilon cap for MAU releases
    pub mau_budget_total: f64,

    /// Renyi orders tracked by the accountant
    pub rdp_orders: Vec<f64>,

    /// Deterministic seed root for tests; release noise uses OS entropy
    /// when unset
    pub default_seed: Option<u64>,
}

/// Sketch backend selection and sizing.
#[derive(Debug, Clone)]
pub struct SketchSettings {
    pub kind: SketchKind,
    pub k: usize,
    pub use_bloom_for_diff: bool,
    pub bloom_fp_rate: f64,
    pub mau_window_days: u32,
}

/// Identity pseudonymization parameters.
#[derive(Clone)]
pub struct SecuritySettings {
    /// HMAC secret, raw UTF-8 or `b64:`-prefixed base64
    pub hash_salt_secret: String,

    /// Cadence of salt epochs in days; must cover the MAU window
    pub hash_salt_rotation_days: u32,

    /// Shared secret for the HTTP surface; auth disabled when unset
    pub api_key: Option<String>,

    pub timezone: String,
}

impl std::fmt::Debug for SecuritySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuritySettings")
            .field("hash_salt_secret", &"[redacted]")
            .field("hash_salt_rotation_days", &self.hash_salt_rotation_days)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("timezone", &self.timezone)
            .finish()
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub dp: DpSettings,
    pub sketch: SketchSettings,
    pub security: SecuritySettings,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_f64(name: &str, default: f64) -> Result<f64, CountveilError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                CountveilError::Validation(format!("{name} must be a finite number, got '{raw}'"))
            }),
    }
}

fn parse_u32(name: &str, default: u32) -> Result<u32, CountveilError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
            CountveilError::Validation(format!("{name} must be a non-negative integer, got '{raw}'"))
        }),
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool, CountveilError> {
    match env_var(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(CountveilError::Validation(format!(
                "{name} must be a boolean string (true/false), got '{raw}'"
            ))),
        },
    }
}

fn parse_orders(name: &str, default: &[f64]) -> Result<Vec<f64>, CountveilError> {
    let raw = match env_var(name) {
        None => return Ok(default.to_vec()),
        Some(raw) => raw,
    };
    let mut orders = Vec::new();
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let value: f64 = item.parse().map_err(|_| {
            CountveilError::Validation(format!("{name} must be a comma-separated list of numbers"))
        })?;
        if value > 1.0 {
            orders.push(value);
        }
    }
    if orders.is_empty() {
        return Err(CountveilError::Validation(format!(
            "{name} must contain at least one order greater than 1"
        )));
    }
    orders.sort_by(f64::total_cmp);
    Ok(orders)
}

impl AppConfig {
    /// Default Renyi orders tracked when `RDP_ORDERS` is unset.
    pub const DEFAULT_RDP_ORDERS: [f64; 5] = [2.0, 4.0, 8.0, 16.0, 32.0];

    /// Load configuration from the environment.
    ///
    /// # Errors
    /// Returns `Validation` if a required variable is missing, a value
    /// fails to parse, or the combination is unsound (rotation cadence
    /// shorter than the MAU window, out-of-range delta, unknown sketch).
    pub fn from_env() -> Result<Self, CountveilError> {
        let data_dir = env_var("DATA_DIR")
            .map(PathBuf::from)
            .ok_or_else(|| CountveilError::Validation("DATA_DIR must be set".to_string()))?;

        let hash_salt_secret = env_var("HASH_SALT_SECRET").ok_or_else(|| {
            CountveilError::Validation("HASH_SALT_SECRET must be set".to_string())
        })?;
        // Fail fast on a malformed b64: secret rather than at first ingest.
        decode_secret(&hash_salt_secret)
            .map_err(|e| CountveilError::Validation(format!("HASH_SALT_SECRET: {e}")))?;

        let epsilon_dau = parse_f64("EPSILON_DAU", 0.3)?;
        let epsilon_mau = parse_f64("EPSILON_MAU", 0.5)?;
        if epsilon_dau <= 0.0 || epsilon_mau <= 0.0 {
            return Err(CountveilError::Validation(
                "EPSILON_DAU and EPSILON_MAU must be positive".to_string(),
            ));
        }

        let delta = parse_f64("DELTA", 1e-6)?;
        let advanced_delta = parse_f64("ADVANCED_DELTA", 1e-7)?;
        if !(0.0..1.0).contains(&delta) || delta == 0.0 {
            return Err(CountveilError::Validation(
                "DELTA must satisfy 0 < delta < 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&advanced_delta) || advanced_delta == 0.0 {
            return Err(CountveilError::Validation(
                "ADVANCED_DELTA must satisfy 0 < delta < 1".to_string(),
            ));
        }

        let w_bound = parse_u32("W_BOUND", 2)?;
        if w_bound == 0 {
            return Err(CountveilError::Validation(
                "W_BOUND must be at least 1".to_string(),
            ));
        }

        let kind: SketchKind = env_var("SKETCH_IMPL")
            .as_deref()
            .unwrap_or("kmv")
            .parse()
            .map_err(CountveilError::Validation)?;

        let k = parse_u32("SKETCH_K", 4096)? as usize;
        if k == 0 {
            return Err(CountveilError::Validation(
                "SKETCH_K must be a positive integer".to_string(),
            ));
        }

        let bloom_fp_rate = parse_f64("BLOOM_FP_RATE", 0.01)?;
        if !(0.0..1.0).contains(&bloom_fp_rate) || bloom_fp_rate == 0.0 {
            return Err(CountveilError::Validation(
                "BLOOM_FP_RATE must be between 0 and 1".to_string(),
            ));
        }

        let mau_window_days = parse_u32("MAU_WINDOW_DAYS", 30)?;
        if mau_window_days == 0 {
            return Err(CountveilError::Validation(
                "MAU_WINDOW_DAYS must be at least 1".to_string(),
            ));
        }

        let hash_salt_rotation_days = parse_u32("HASH_SALT_ROTATION_DAYS", 30)?;
        if hash_salt_rotation_days < mau_window_days {
            // Keys must stay stable across the whole window; a shorter
            // cadence would re-hash active users mid-window and inflate MAU.
            return Err(CountveilError::Validation(format!(
                "HASH_SALT_ROTATION_DAYS ({hash_salt_rotation_days}) must be >= MAU_WINDOW_DAYS ({mau_window_days})"
            )));
        }

        let timezone = env_var("TIMEZONE").unwrap_or_else(|| "UTC".to_string());
        if timezone != "UTC" {
            return Err(CountveilError::Validation(format!(
                "TIMEZONE '{timezone}' is not supported; only UTC is available"
            )));
        }

        let default_seed = match env_var("DEFAULT_SEED") {
            None => None,
            Some(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
                CountveilError::Validation(format!("DEFAULT_SEED must be an integer, got '{raw}'"))
            })?),
        };

        Ok(Self {
            data_dir,
            dp: DpSettings {
                epsilon_dau,
                epsilon_mau,
                delta,
                advanced_delta,
                w_bound,
                dau_budget_total: parse_f64("DAU_BUDGET_TOTAL", 3.0)?,
                mau_budget_total: parse_f64("MAU_BUDGET_TOTAL", 3.5)?,
                rdp_orders: parse_orders("RDP_ORDERS", &Self::DEFAULT_RDP_ORDERS)?,
                default_seed,
            },
            sketch: SketchSettings {
                kind,
                k,
                use_bloom_for_diff: parse_bool("USE_BLOOM_FOR_DIFF", true)?,
                bloom_fp_rate,
                mau_window_days,
            },
            security: SecuritySettings {
                hash_salt_secret,
                hash_salt_rotation_days,
                api_key: env_var("SERVICE_API_KEY"),
                timezone,
            },
        })
    }

    /// Directory holding the ledger database.
    #[must_use]
    pub fn ledgers_dir(&self) -> PathBuf {
        self.data_dir.join("ledgers")
    }

    /// Directory for dated ledger backups.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Directory for generated event streams.
    #[must_use]
    pub fn streams_dir(&self) -> PathBuf {
        self.data_dir.join("streams")
    }

    /// Directory for budget snapshot reports.
    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join("reports")
    }

    /// Build a configuration suitable for tests, bypassing the environment.
    #[must_use]
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            dp: DpSettings {
                epsilon_dau: 0.3,
                epsilon_mau: 0.5,
                delta: 1e-6,
                advanced_delta: 1e-7,
                w_bound: 2,
                dau_budget_total: 3.0,
                mau_budget_total: 3.5,
                rdp_orders: Self::DEFAULT_RDP_ORDERS.to_vec(),
                default_seed: Some(20251009),
            },
            sketch: SketchSettings {
                kind: SketchKind::Kmv,
                k: 4096,
                use_bloom_for_diff: true,
                bloom_fp_rate: 0.01,
                mau_window_days: 30,
            },
            security: SecuritySettings {
                hash_salt_secret: "test-secret-for-unit-tests-only".to_string(),
                hash_salt_rotation_days: 30,
                api_key: None,
                timezone: "UTC".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_filter_and_sort() {
        std::env::set_var("RDP_ORDERS", "8, 2, 0.5, 4");
        let orders = parse_orders("RDP_ORDERS", &AppConfig::DEFAULT_RDP_ORDERS)
            .expect("Should parse orders");
        std::env::remove_var("RDP_ORDERS");
        assert_eq!(orders, vec![2.0, 4.0, 8.0]);
    }

    #[test]
    fn test_bool_parsing() {
        std::env::set_var("TEST_BOOL_FLAG", "off");
        assert!(!parse_bool("TEST_BOOL_FLAG", true).expect("Should parse"));
        std::env::set_var("TEST_BOOL_FLAG", "definitely");
        assert!(parse_bool("TEST_BOOL_FLAG", true).is_err());
        std::env::remove_var("TEST_BOOL_FLAG");
    }

    #[test]
    fn test_defaults_via_test_config() {
        let cfg = AppConfig::for_tests(PathBuf::from("/tmp/countveil-test"));
        assert_eq!(cfg.dp.epsilon_dau, 0.3);
        assert_eq!(cfg.sketch.k, 4096);
        assert!(cfg.sketch.use_bloom_for_diff);
        assert_eq!(cfg.security.hash_salt_rotation_days, 30);
    }
}
