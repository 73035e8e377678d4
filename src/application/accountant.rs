//! Privacy accountant: composition bookkeeping over recorded releases.
//!
//! State lives in the ledger (`releases` / `rdp_releases`); this service
//! is pure arithmetic over it, so a snapshot is always consistent with
//! what was actually released. Three views are maintained per
//! `(metric, month)`:
//! - naive composition: the running epsilon sum, enforced against the
//!   monthly cap at admission time;
//! - Renyi composition: per-order terms that add across releases, with
//!   the standard conversion back to `(epsilon, delta)` minimized over
//!   orders;
//! - advanced composition: the sqrt-form bound over the recorded
//!   release sequence.
//!
//! Admission uses the naive sum only; the other two are reported so
//! operators can see how much slack the tighter analyses would give.

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::domain::event::Metric;
use crate::domain::release::{gaussian_sigma, MechanismKind};
use crate::ports::ledger::Ledger;
use crate::Result;

/// Slack absorbing accumulated float error at the cap boundary.
const CAP_EPSILON_SLACK: f64 = 1e-9;

/// Monthly epsilon caps per metric.
#[derive(Debug, Clone, Copy)]
pub struct BudgetCaps {
    pub dau: f64,
    pub mau: f64,
}

/// `YYYY-MM` key for a day.
#[must_use]
pub fn month_key(day: NaiveDate) -> String {
    day.format("%Y-%m").to_string()
}

/// `YYYY-MM` of the month after the one containing `day`.
#[must_use]
pub fn next_month_key(day: NaiveDate) -> String {
    let (year, month) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    format!("{year:04}-{month:02}")
}

/// One point on the accumulated Renyi curve.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RdpPoint {
    pub order: f64,
    pub epsilon: f64,
}

/// Best `(epsilon, delta)` pair derived from the Renyi curve.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RdpBest {
    pub alpha: f64,
    pub epsilon: f64,
    pub delta: f64,
}

/// Advanced composition bound over the recorded releases.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdvancedBound {
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetPolicy {
    pub monthly_cap: f64,
    pub delta: f64,
    pub advanced_delta: f64,
}

/// Point-in-time accountant state for one `(metric, month)`.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub metric: Metric,
    pub period: String,
    pub epsilon_cap: f64,
    pub epsilon_spent: f64,
    pub epsilon_remaining: f64,
    pub delta: f64,
    pub release_count: u64,
    pub rdp_orders: Vec<f64>,
    pub rdp_curve: Vec<RdpPoint>,
    pub rdp_best: Option<RdpBest>,
    pub advanced: Option<AdvancedBound>,
    pub policy: BudgetPolicy,
}

/// Structured admission failure handed back to callers.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetExhausted {
    pub metric: Metric,
    pub cap: f64,
    pub spent: f64,
    pub remaining: f64,
    pub reset_month: String,
    pub snapshot: BudgetSnapshot,
}

pub struct PrivacyAccountant {
    caps: BudgetCaps,
    delta: f64,
    advanced_delta: f64,
    orders: Vec<f64>,
}

impl PrivacyAccountant {
    #[must_use]
    pub fn new(caps: BudgetCaps, delta: f64, advanced_delta: f64, orders: Vec<f64>) -> Self {
        Self {
            caps,
            delta,
            advanced_delta,
            orders,
        }
    }

    #[must_use]
    pub fn cap(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Dau => self.caps.dau,
            Metric::Mau => self.caps.mau,
        }
    }

    /// Naive epsilon spent on a metric this month.
    pub fn spent<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
        metric: Metric,
        day: NaiveDate,
    ) -> Result<f64> {
        Ok(ledger.spent_epsilon(metric, &month_key(day))?)
    }

    pub fn remaining<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
        metric: Metric,
        day: NaiveDate,
    ) -> Result<f64> {
        Ok((self.cap(metric) - self.spent(ledger, metric, day)?).max(0.0))
    }

    /// Admission check: the naive sum after this release must stay under
    /// the monthly cap.
    pub fn can_release<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
        metric: Metric,
        epsilon: f64,
        day: NaiveDate,
    ) -> Result<bool> {
        let spent = self.spent(ledger, metric, day)?;
        Ok(spent + epsilon <= self.cap(metric) + CAP_EPSILON_SLACK)
    }

    /// The structured failure for a rejected admission.
    pub fn exhausted<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
        metric: Metric,
        day: NaiveDate,
    ) -> Result<BudgetExhausted> {
        let snapshot = self.snapshot(ledger, metric, day)?;
        Ok(BudgetExhausted {
            metric,
            cap: snapshot.epsilon_cap,
            spent: snapshot.epsilon_spent,
            remaining: snapshot.epsilon_remaining,
            reset_month: next_month_key(day),
            snapshot,
        })
    }

    /// Per-order Renyi terms contributed by one release.
    ///
    /// Gaussian: `eps(a) = a * W^2 / (2 sigma^2)`. Laplace uses Mironov's
    /// closed form for Laplace(sensitivity / epsilon) noise at
    /// `lambda = 1 / epsilon` scale units; both add across releases,
    /// which is all the composition bookkeeping relies on.
    #[must_use]
    pub fn rdp_contributions(
        &self,
        mechanism: MechanismKind,
        epsilon: f64,
        delta: f64,
        sensitivity: f64,
    ) -> Vec<(f64, f64)> {
        self.orders
            .iter()
            .map(|&order| {
                let term = match mechanism {
                    MechanismKind::Gaussian => {
                        let sigma = gaussian_sigma(sensitivity, epsilon, delta);
                        order * sensitivity * sensitivity / (2.0 * sigma * sigma)
                    }
                    MechanismKind::Laplace => {
                        let lambda = 1.0 / epsilon;
                        let a = order;
                        let first = (a / (2.0 * a - 1.0)) * ((a - 1.0) / lambda).exp();
                        let second = ((a - 1.0) / (2.0 * a - 1.0)) * (-a / lambda).exp();
                        (first + second).ln() / (a - 1.0)
                    }
                };
                (order, term)
            })
            .collect()
    }

    fn rdp_curve<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
        metric: Metric,
        period: &str,
    ) -> Result<Vec<RdpPoint>> {
        let recorded = ledger.rdp_totals(metric, period)?;
        let mut curve: Vec<RdpPoint> = self
            .orders
            .iter()
            .map(|&order| RdpPoint {
                order,
                epsilon: recorded
                    .iter()
                    .find(|(o, _)| (*o - order).abs() < f64::EPSILON)
                    .map_or(0.0, |(_, total)| *total),
            })
            .collect();
        // Orders recorded under an earlier configuration still count.
        for (order, total) in recorded {
            if !curve.iter().any(|p| (p.order - order).abs() < f64::EPSILON) {
                curve.push(RdpPoint {
                    order,
                    epsilon: total,
                });
            }
        }
        curve.sort_by(|a, b| a.order.total_cmp(&b.order));
        Ok(curve)
    }

    fn best_rdp(&self, curve: &[RdpPoint]) -> Option<RdpBest> {
        if self.delta <= 0.0 {
            return None;
        }
        let log_term = (1.0 / self.delta).ln();
        curve
            .iter()
            .filter(|p| p.order > 1.0)
            .map(|p| RdpBest {
                alpha: p.order,
                epsilon: p.epsilon + log_term / (p.order - 1.0),
                delta: self.delta,
            })
            .min_by(|a, b| a.epsilon.total_cmp(&b.epsilon))
    }

    fn advanced_bound(&self, releases: &[(f64, f64)]) -> Option<AdvancedBound> {
        if releases.is_empty() || self.advanced_delta <= 0.0 || self.advanced_delta >= 1.0 {
            return None;
        }
        let sum_eps_sq: f64 = releases.iter().map(|(e, _)| e * e).sum();
        let sum_exp: f64 = releases.iter().map(|(e, _)| e * (e.exp() - 1.0)).sum();
        let epsilon = (2.0 * (1.0 / self.advanced_delta).ln() * sum_eps_sq).sqrt() + sum_exp;
        let delta = releases.iter().map(|(_, d)| d).sum::<f64>() + self.advanced_delta;
        Some(AdvancedBound { epsilon, delta })
    }

    /// Side-effect-free view of the accountant state for one month.
    pub fn snapshot<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
        metric: Metric,
        day: NaiveDate,
    ) -> Result<BudgetSnapshot> {
        let period = month_key(day);
        let cap = self.cap(metric);
        let spent = ledger.spent_epsilon(metric, &period)?;
        let curve = self.rdp_curve(ledger, metric, &period)?;
        let releases = ledger.releases_for(metric, &period)?;

        Ok(BudgetSnapshot {
            metric,
            period,
            epsilon_cap: cap,
            epsilon_spent: spent,
            epsilon_remaining: (cap - spent).max(0.0),
            delta: self.delta,
            release_count: releases.len() as u64,
            rdp_orders: self.orders.clone(),
            rdp_best: self.best_rdp(&curve),
            rdp_curve: curve,
            advanced: self.advanced_bound(&releases),
            policy: BudgetPolicy {
                monthly_cap: cap,
                delta: self.delta,
                advanced_delta: self.advanced_delta,
            },
        })
    }

    /// Zero the month: every recorded release and Renyi row is removed.
    /// Idempotent, meant for operator use.
    pub fn reset_month<L: Ledger + ?Sized>(
        &self,
        ledger: &L,
        metric: Metric,
        period: &str,
    ) -> Result<()> {
        ledger.reset_budget(metric, period)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteLedger;
    use crate::domain::release::ReleaseRecord;

    fn day(s: &str) -> NaiveDate {
        s.parse().expect("Valid date")
    }

    fn accountant() -> PrivacyAccountant {
        PrivacyAccountant::new(
            BudgetCaps { dau: 3.0, mau: 3.5 },
            1e-6,
            1e-7,
            vec![2.0, 4.0, 8.0, 16.0, 32.0],
        )
    }

    fn record(
        ledger: &SqliteLedger,
        acct: &PrivacyAccountant,
        metric: Metric,
        d: &str,
        epsilon: f64,
        delta: f64,
        mechanism: MechanismKind,
    ) {
        let rdp = acct.rdp_contributions(mechanism, epsilon, delta, 2.0);
        ledger
            .record_release(
                &ReleaseRecord {
                    metric,
                    day: day(d),
                    epsilon,
                    delta,
                    mechanism,
                    raw: 10.0,
                    estimate: 12.0,
                    ci_low: 2.0,
                    ci_high: 22.0,
                    seed: 1,
                },
                &rdp,
            )
            .expect("Should record");
    }

    #[test]
    fn test_month_keys() {
        assert_eq!(month_key(day("2025-10-15")), "2025-10");
        assert_eq!(next_month_key(day("2025-10-15")), "2025-11");
        assert_eq!(next_month_key(day("2025-12-31")), "2026-01");
    }

    #[test]
    fn test_naive_cap_enforced() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        let acct = accountant();
        let d = day("2025-10-01");

        // 10 releases at 0.3 fill the 3.0 cap exactly.
        for _ in 0..10 {
            assert!(acct
                .can_release(&ledger, Metric::Dau, 0.3, d)
                .expect("Should check"));
            record(&ledger, &acct, Metric::Dau, "2025-10-01", 0.3, 0.0, MechanismKind::Laplace);
        }
        assert!(!acct
            .can_release(&ledger, Metric::Dau, 0.3, d)
            .expect("Should check"));
        let spent = acct.spent(&ledger, Metric::Dau, d).expect("Should query");
        assert!(spent <= 3.0 + 1e-9);
        assert_eq!(acct.remaining(&ledger, Metric::Dau, d).expect("left"), 0.0);

        // The other metric and the next month are unaffected.
        assert!(acct
            .can_release(&ledger, Metric::Mau, 0.5, d)
            .expect("Should check"));
        assert!(acct
            .can_release(&ledger, Metric::Dau, 0.3, day("2025-11-01"))
            .expect("Should check"));
    }

    #[test]
    fn test_gaussian_rdp_formula() {
        let acct = accountant();
        let contributions =
            acct.rdp_contributions(MechanismKind::Gaussian, 0.5, 1e-6, 2.0);
        let sigma = gaussian_sigma(2.0, 0.5, 1e-6);
        for (order, term) in contributions {
            let expected = order * 4.0 / (2.0 * sigma * sigma);
            assert!((term - expected).abs() < 1e-12, "order {order}");
            assert!(term >= 0.0);
        }
    }

    #[test]
    fn test_laplace_rdp_positive_and_bounded_by_epsilon() {
        let acct = accountant();
        let contributions = acct.rdp_contributions(MechanismKind::Laplace, 0.3, 0.0, 1.0);
        for (order, term) in contributions {
            assert!(term > 0.0, "order {order} gave {term}");
            // Renyi divergence of an epsilon-DP mechanism never exceeds epsilon.
            assert!(term <= 0.3 + 1e-9, "order {order} gave {term}");
        }
    }

    #[test]
    fn test_rdp_totals_monotone_across_releases() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        let acct = accountant();
        let d = day("2025-10-01");

        let mut previous = vec![0.0; 5];
        for i in 0..5 {
            record(
                &ledger,
                &acct,
                Metric::Mau,
                "2025-10-01",
                0.5,
                1e-6,
                MechanismKind::Gaussian,
            );
            let snapshot = acct.snapshot(&ledger, Metric::Mau, d).expect("Should snapshot");
            let current: Vec<f64> = snapshot.rdp_curve.iter().map(|p| p.epsilon).collect();
            for (prev, cur) in previous.iter().zip(&current) {
                assert!(cur >= prev, "release {i} decreased an RDP total");
            }
            previous = current;
        }
    }

    #[test]
    fn test_snapshot_shape_and_best_order() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        let acct = accountant();
        let d = day("2025-10-01");
        for _ in 0..3 {
            record(&ledger, &acct, Metric::Mau, "2025-10-01", 0.5, 1e-6, MechanismKind::Gaussian);
        }

        let snapshot = acct.snapshot(&ledger, Metric::Mau, d).expect("Should snapshot");
        assert_eq!(snapshot.release_count, 3);
        assert!((snapshot.epsilon_spent - 1.5).abs() < 1e-9);
        assert_eq!(snapshot.rdp_curve.len(), 5);

        let best = snapshot.rdp_best.expect("Should have best order");
        assert!(best.alpha > 1.0);
        // Best conversion is no worse than any single point on the curve.
        let log_term = (1.0f64 / 1e-6).ln();
        for point in &snapshot.rdp_curve {
            let candidate = point.epsilon + log_term / (point.order - 1.0);
            assert!(best.epsilon <= candidate + 1e-12);
        }

        let advanced = snapshot.advanced.expect("Should have advanced bound");
        assert!(advanced.epsilon > 0.0);
        assert!((advanced.delta - (3.0 * 1e-6 + 1e-7)).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_is_side_effect_free() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        let acct = accountant();
        let d = day("2025-10-01");
        record(&ledger, &acct, Metric::Dau, "2025-10-01", 0.3, 0.0, MechanismKind::Laplace);

        let first = acct.snapshot(&ledger, Metric::Dau, d).expect("snapshot");
        let second = acct.snapshot(&ledger, Metric::Dau, d).expect("snapshot");
        assert_eq!(first.epsilon_spent, second.epsilon_spent);
        assert_eq!(first.release_count, second.release_count);
    }

    #[test]
    fn test_exhausted_payload() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        let acct = accountant();
        let d = day("2025-10-01");
        for _ in 0..10 {
            record(&ledger, &acct, Metric::Dau, "2025-10-01", 0.3, 0.0, MechanismKind::Laplace);
        }
        let failure = acct.exhausted(&ledger, Metric::Dau, d).expect("Should build");
        assert_eq!(failure.metric, Metric::Dau);
        assert_eq!(failure.cap, 3.0);
        assert_eq!(failure.remaining, 0.0);
        assert_eq!(failure.reset_month, "2025-11");
    }

    #[test]
    fn test_reset_restores_admission() {
        let ledger = SqliteLedger::in_memory().expect("Should create db");
        let acct = accountant();
        let d = day("2025-10-01");
        for _ in 0..10 {
            record(&ledger, &acct, Metric::Dau, "2025-10-01", 0.3, 0.0, MechanismKind::Laplace);
        }
        assert!(!acct.can_release(&ledger, Metric::Dau, 0.3, d).expect("check"));

        acct.reset_month(&ledger, Metric::Dau, "2025-10").expect("Should reset");
        assert!(acct.can_release(&ledger, Metric::Dau, 0.3, d).expect("check"));
        let snapshot = acct.snapshot(&ledger, Metric::Dau, d).expect("snapshot");
        assert_eq!(snapshot.release_count, 0);
    }
}
