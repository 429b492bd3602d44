use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no valuation history recorded for the requested range")]
pub struct NoHistoryAvailable;

/// Net worth per valuation date, append-only across cycles. Re-running a
/// cycle on the same date overwrites that date's entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValuationHistory {
    entries: BTreeMap<NaiveDate, f64>,
}

impl ValuationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<NaiveDate, f64>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &BTreeMap<NaiveDate, f64> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, on: NaiveDate, net_worth: f64) {
        self.entries.insert(on, net_worth);
    }

    pub fn latest(&self) -> Option<(NaiveDate, f64)> {
        self.entries.iter().next_back().map(|(d, v)| (*d, *v))
    }

    /// Portfolio return over `[from, to]`.
    ///
    /// Bounds without an exact entry snap to the nearest recorded date:
    /// forward for `from`, backward for `to` (weekends and skipped cycles
    /// leave gaps). Values are never interpolated; a bound that walks off
    /// the recorded range is an error.
    pub fn range_profitability(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<f64, NoHistoryAvailable> {
        let (_, start) = self.entries.range(from..).next().ok_or(NoHistoryAvailable)?;
        let (_, end) = self
            .entries
            .range(..=to)
            .next_back()
            .ok_or(NoHistoryAvailable)?;
        Ok(end / start - 1.0)
    }

    /// Return since inception, against the funds the ledger started with.
    pub fn total_profitability(&self, initial_funds: f64) -> Result<f64, NoHistoryAvailable> {
        let (_, latest) = self.latest().ok_or(NoHistoryAvailable)?;
        Ok(latest / initial_funds - 1.0)
    }
}
