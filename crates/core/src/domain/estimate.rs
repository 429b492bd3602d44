use crate::domain::ranking::CompositeRow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Analyst point estimates for one ticker, as served by the quote provider.
///
/// `rating` is the analyst consensus on a 1..=5 scale (lower reads "stronger
/// buy"). All five fields come out of one response; a failed fetch yields no
/// `PointEstimate` at all rather than zeroed fields.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointEstimate {
    pub rating: f64,
    pub low_target: f64,
    pub current_price: f64,
    pub avg_target: f64,
    pub high_target: f64,
}

/// A composite ranking row with its point estimates attached, when available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateRow {
    pub composite: CompositeRow,
    pub estimate: Option<PointEstimate>,
}

impl EstimateRow {
    pub fn ticker(&self) -> &str {
        &self.composite.ticker
    }
}

/// Attach estimates to composite rows.
///
/// Tickers whose estimate fetch failed (or was never attempted) are retained
/// with `estimate: None` so selection can filter them out explicitly; "no
/// data yet" stays distinguishable from "data says don't buy". The output is
/// ordered ascending by `(summary_rank, ticker)`.
pub fn merge(
    composite: &BTreeMap<String, CompositeRow>,
    estimates: &BTreeMap<String, Option<PointEstimate>>,
) -> Vec<EstimateRow> {
    let mut out: Vec<EstimateRow> = composite
        .values()
        .map(|row| EstimateRow {
            composite: row.clone(),
            estimate: estimates.get(&row.ticker).copied().flatten(),
        })
        .collect();

    out.sort_by(|x, y| {
        x.composite
            .summary_rank
            .cmp(&y.composite.summary_rank)
            .then_with(|| x.composite.ticker.cmp(&y.composite.ticker))
    });

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(ticker: &str, summary_rank: i32) -> CompositeRow {
        CompositeRow {
            ticker: ticker.to_string(),
            metric_a_rank: summary_rank / 2,
            metric_a_value: None,
            metric_b_rank: summary_rank - summary_rank / 2,
            metric_b_value: None,
            summary_rank,
        }
    }

    fn estimate(rating: f64, current: f64, avg: f64) -> PointEstimate {
        PointEstimate {
            rating,
            low_target: current * 0.8,
            current_price: current,
            avg_target: avg,
            high_target: avg * 1.2,
        }
    }

    #[test]
    fn orders_by_summary_rank_then_ticker() {
        let composite = BTreeMap::from([
            ("CCC".to_string(), row("CCC", 4)),
            ("AAA".to_string(), row("AAA", 9)),
            ("BBB".to_string(), row("BBB", 4)),
        ]);

        let rows = merge(&composite, &BTreeMap::new());

        let order: Vec<&str> = rows.iter().map(|r| r.ticker()).collect();
        assert_eq!(order, vec!["BBB", "CCC", "AAA"]);
    }

    #[test]
    fn keeps_fetch_failures_with_empty_estimates() {
        let composite = BTreeMap::from([
            ("AAA".to_string(), row("AAA", 2)),
            ("BBB".to_string(), row("BBB", 5)),
        ]);
        let estimates = BTreeMap::from([
            ("AAA".to_string(), Some(estimate(1.8, 10.0, 14.0))),
            // BBB's fetch failed this cycle.
            ("BBB".to_string(), None),
        ]);

        let rows = merge(&composite, &estimates);

        assert_eq!(rows.len(), 2);
        assert!(rows[0].estimate.is_some());
        assert!(rows[1].estimate.is_none());
    }
}
