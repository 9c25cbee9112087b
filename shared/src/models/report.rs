//! Stock reporting, forecasting and alert models
//!
//! Pure calculations only: the backend feeds them sums and movement flows
//! read from storage.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::movement::MovementFlow;

const SECONDS_PER_DAY: i64 = 86_400;

/// Consolidated stock figures under one filter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockSummary {
    pub physical: Decimal,
    pub reserved: Decimal,
    pub available: Decimal,
    pub consumed: Decimal,
}

impl StockSummary {
    pub fn new(physical: Decimal, reserved: Decimal, consumed: Decimal) -> Self {
        Self {
            physical,
            reserved,
            available: physical - reserved,
            consumed,
        }
    }
}

/// One point of a replayed stock history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockPoint {
    pub date: DateTime<Utc>,
    pub balance: Decimal,
}

/// Movement flows ordered by `occurred_at`, replayed into running balances.
///
/// Iteration is lazy and can be restarted any number of times.
#[derive(Debug, Clone, Default)]
pub struct StockHistory {
    flows: Vec<MovementFlow>,
    location_id: Option<Uuid>,
}

impl StockHistory {
    pub fn new(mut flows: Vec<MovementFlow>, location_id: Option<Uuid>) -> Self {
        flows.sort_by_key(|f| f.occurred_at);
        Self { flows, location_id }
    }

    pub fn points(&self) -> HistoryPoints<'_> {
        HistoryPoints {
            flows: self.flows.iter(),
            location_id: self.location_id,
            balance: Decimal::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

impl<'a> IntoIterator for &'a StockHistory {
    type Item = StockPoint;
    type IntoIter = HistoryPoints<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.points()
    }
}

/// Iterator over [`StockHistory`] balances
#[derive(Debug, Clone)]
pub struct HistoryPoints<'a> {
    flows: std::slice::Iter<'a, MovementFlow>,
    location_id: Option<Uuid>,
    balance: Decimal,
}

impl Iterator for HistoryPoints<'_> {
    type Item = StockPoint;

    fn next(&mut self) -> Option<Self::Item> {
        let flow = self.flows.next()?;
        match self.location_id {
            Some(location) => {
                if flow.from_location_id == Some(location) {
                    self.balance -= flow.quantity;
                } else if flow.to_location_id == Some(location) {
                    self.balance += flow.quantity;
                }
            }
            None => {
                if flow.from_location_id.is_some() {
                    self.balance -= flow.quantity;
                }
                if flow.to_location_id.is_some() {
                    self.balance += flow.quantity;
                }
            }
        }
        Some(StockPoint {
            date: flow.occurred_at,
            balance: self.balance,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.flows.size_hint()
    }
}

/// Depletion forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub stock: Decimal,
    pub avg_daily_consumption: Decimal,
    pub coverage_days: Option<Decimal>,
    pub depletion_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForecastError {
    #[error("no stock available for forecast")]
    NoStock,
    #[error("lookback window must be at least one day")]
    InvalidLookback,
}

impl Forecast {
    /// Project depletion from current stock and consumption over `lookback_days`.
    pub fn project(
        stock: Decimal,
        consumed: Decimal,
        lookback_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, ForecastError> {
        if lookback_days == 0 {
            return Err(ForecastError::InvalidLookback);
        }
        if stock <= Decimal::ZERO {
            return Err(ForecastError::NoStock);
        }

        let avg = average_daily_consumption(consumed, lookback_days);
        let coverage = coverage_days(stock, avg);
        let depletion_date = coverage.and_then(|days| add_days(now, days));

        Ok(Self {
            stock,
            avg_daily_consumption: avg.round_dp(2),
            coverage_days: coverage.map(|d| d.round_dp(1)),
            depletion_date,
        })
    }
}

/// Consumed quantity spread over the lookback window
pub fn average_daily_consumption(consumed: Decimal, lookback_days: u32) -> Decimal {
    if lookback_days == 0 || consumed <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    consumed / Decimal::from(lookback_days)
}

/// Days of stock left at the given daily consumption; `None` when nothing is
/// consumed or the ratio does not fit a `Decimal`
pub fn coverage_days(stock: Decimal, avg_daily_consumption: Decimal) -> Option<Decimal> {
    if avg_daily_consumption <= Decimal::ZERO {
        return None;
    }
    stock.checked_div(avg_daily_consumption)
}

/// `None` once the offset leaves the representable date range
fn add_days(now: DateTime<Utc>, days: Decimal) -> Option<DateTime<Utc>> {
    let seconds = days
        .checked_mul(Decimal::from(SECONDS_PER_DAY))?
        .trunc()
        .to_i64()?;
    Duration::try_seconds(seconds).and_then(|d| now.checked_add_signed(d))
}

/// Alert type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowStock,
    LowCoverage,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::LowStock => "low_stock",
            AlertKind::LowCoverage => "low_coverage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A threshold alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub severity: AlertSeverity,
}

/// Alert thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub min_stock: Decimal,
    pub min_coverage_days: u32,
    pub lookback_days: u32,
}

/// Alerts for a stock level and its consumption over the lookback window.
///
/// Empty stock is critical; coverage is only judged when something was consumed.
pub fn evaluate_alerts(stock: Decimal, consumed: Decimal, thresholds: &AlertThresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if stock < thresholds.min_stock {
        let severity = if stock <= Decimal::ZERO {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        alerts.push(Alert {
            kind: AlertKind::LowStock,
            message: format!("Stock {} below minimum {}", stock, thresholds.min_stock),
            severity,
        });
    }

    let avg = average_daily_consumption(consumed, thresholds.lookback_days);
    if let Some(coverage) = coverage_days(stock.max(Decimal::ZERO), avg) {
        if coverage < Decimal::from(thresholds.min_coverage_days) {
            alerts.push(Alert {
                kind: AlertKind::LowCoverage,
                message: format!(
                    "Coverage {} days below minimum {}",
                    coverage.round_dp(1),
                    thresholds.min_coverage_days
                ),
                severity: AlertSeverity::Warning,
            });
        }
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn flow(day: u32, qty: i64, from: Option<Uuid>, to: Option<Uuid>) -> MovementFlow {
        MovementFlow {
            occurred_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            quantity: Decimal::from(qty),
            from_location_id: from,
            to_location_id: to,
        }
    }

    #[test]
    fn test_history_is_restartable() {
        let a = Uuid::new_v4();
        let history = StockHistory::new(vec![flow(2, 30, Some(a), None), flow(1, 100, None, Some(a))], None);

        let first: Vec<_> = history.points().map(|p| p.balance).collect();
        let second: Vec<_> = history.points().map(|p| p.balance).collect();

        assert_eq!(first, vec![Decimal::from(100), Decimal::from(70)]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_history_transfer_nets_zero_globally() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let history = StockHistory::new(
            vec![flow(1, 50, None, Some(a)), flow(2, 20, Some(a), Some(b))],
            None,
        );
        let last = history.points().last().unwrap();
        assert_eq!(last.balance, Decimal::from(50));

        let at_b = StockHistory::new(
            vec![flow(1, 50, None, Some(a)), flow(2, 20, Some(a), Some(b))],
            Some(b),
        );
        let balances: Vec<_> = at_b.points().map(|p| p.balance).collect();
        assert_eq!(balances, vec![Decimal::ZERO, Decimal::from(20)]);
    }

    #[test]
    fn test_forecast_without_consumption_has_no_depletion() {
        let f = Forecast::project(Decimal::from(10), Decimal::ZERO, 30, Utc::now()).unwrap();
        assert_eq!(f.avg_daily_consumption, Decimal::ZERO);
        assert_eq!(f.coverage_days, None);
        assert_eq!(f.depletion_date, None);
    }

    #[test]
    fn test_forecast_coverage_and_depletion() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        // 300 consumed over 30 days = 10/day; 50 in stock = 5 days
        let f = Forecast::project(Decimal::from(50), Decimal::from(300), 30, now).unwrap();

        assert_eq!(f.avg_daily_consumption, Decimal::from(10));
        assert_eq!(f.coverage_days, Some(Decimal::from(5)));
        assert_eq!(f.depletion_date, Some(now + Duration::days(5)));
    }

    #[test]
    fn test_forecast_with_trickle_consumption_has_no_date() {
        // Coverage far beyond any representable date
        let f = Forecast::project(Decimal::from(1_000_000), Decimal::new(1, 18), 30, Utc::now())
            .unwrap();

        assert!(f.coverage_days.is_some());
        assert_eq!(f.depletion_date, None);
        assert_eq!(f.avg_daily_consumption, Decimal::ZERO);
    }

    #[test]
    fn test_coverage_overflow_is_undefined() {
        assert_eq!(coverage_days(Decimal::MAX, Decimal::new(1, 20)), None);
        let alerts = evaluate_alerts(
            Decimal::MAX,
            Decimal::new(1, 20),
            &AlertThresholds {
                min_stock: Decimal::ONE,
                min_coverage_days: 7,
                lookback_days: 1,
            },
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_forecast_rejects_empty_stock() {
        assert_eq!(
            Forecast::project(Decimal::ZERO, Decimal::ONE, 30, Utc::now()),
            Err(ForecastError::NoStock)
        );
    }

    #[test]
    fn test_alerts_for_low_stock_and_coverage() {
        let thresholds = AlertThresholds {
            min_stock: Decimal::from(10),
            min_coverage_days: 7,
            lookback_days: 30,
        };

        // 5 units left, 30 consumed in 30 days: 5 days of cover
        let alerts = evaluate_alerts(Decimal::from(5), Decimal::from(30), &thresholds);
        let kinds: Vec<_> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::LowStock, AlertKind::LowCoverage]);

        assert!(evaluate_alerts(Decimal::from(100), Decimal::ZERO, &thresholds).is_empty());
    }
}
