use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One row parsed from a single metric's external ranking table.
///
/// `rank` is the 1-based position in that metric's ordering. `raw_value` is
/// the metric reading itself and may be missing when the source prints a
/// placeholder for the cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub ticker: String,
    pub rank: i32,
    pub raw_value: Option<f64>,
}

/// Composite ranking row for one ticker: both metric ranks plus their sum.
/// Lower `summary_rank` is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeRow {
    pub ticker: String,
    pub metric_a_rank: i32,
    pub metric_a_value: Option<f64>,
    pub metric_b_rank: i32,
    pub metric_b_value: Option<f64>,
    pub summary_rank: i32,
}

/// Combine two metric rank tables into a composite ranking over `universe`.
///
/// A ticker missing from one table this cycle inherits that side's rank and
/// value from `previous`. A ticker with no data on either side and no prior
/// row is dropped from the cycle (logged, never invented).
///
/// Pure with respect to its inputs; re-running with its own output as
/// `previous` is a no-op while the tables are unchanged.
pub fn fuse(
    metric_a: &[MetricSample],
    metric_b: &[MetricSample],
    universe: &BTreeSet<String>,
    previous: &BTreeMap<String, CompositeRow>,
) -> BTreeMap<String, CompositeRow> {
    let a = first_seen_by_ticker(metric_a, universe);
    let b = first_seen_by_ticker(metric_b, universe);

    let mut out = BTreeMap::new();
    let mut dropped: usize = 0;

    for ticker in universe {
        let prev = previous.get(ticker);

        let side_a = a
            .get(ticker.as_str())
            .map(|s| (s.rank, s.raw_value))
            .or_else(|| prev.map(|p| (p.metric_a_rank, p.metric_a_value)));
        let side_b = b
            .get(ticker.as_str())
            .map(|s| (s.rank, s.raw_value))
            .or_else(|| prev.map(|p| (p.metric_b_rank, p.metric_b_value)));

        match (side_a, side_b) {
            (Some((a_rank, a_value)), Some((b_rank, b_value))) => {
                out.insert(
                    ticker.clone(),
                    CompositeRow {
                        ticker: ticker.clone(),
                        metric_a_rank: a_rank,
                        metric_a_value: a_value,
                        metric_b_rank: b_rank,
                        metric_b_value: b_value,
                        summary_rank: a_rank + b_rank,
                    },
                );
            }
            _ => {
                dropped += 1;
                tracing::debug!(%ticker, "incomplete metric data and no prior row; dropped for this cycle");
            }
        }
    }

    if dropped > 0 {
        tracing::info!(dropped, universe = universe.len(), "tickers without usable metric data this cycle");
    }

    out
}

// Source pagination can repeat rows at page boundaries; the first occurrence
// in scan order wins.
fn first_seen_by_ticker<'a>(
    samples: &'a [MetricSample],
    universe: &BTreeSet<String>,
) -> BTreeMap<&'a str, &'a MetricSample> {
    let mut out: BTreeMap<&str, &MetricSample> = BTreeMap::new();
    for sample in samples {
        if !universe.contains(&sample.ticker) {
            continue;
        }
        out.entry(sample.ticker.as_str()).or_insert(sample);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ticker: &str, rank: i32, value: f64) -> MetricSample {
        MetricSample {
            ticker: ticker.to_string(),
            rank,
            raw_value: Some(value),
        }
    }

    fn universe(tickers: &[&str]) -> BTreeSet<String> {
        tickers.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn sums_ranks_and_keeps_ties_orderable_by_ticker() {
        let a = vec![sample("AAA", 1, 5.0), sample("BBB", 2, 4.0)];
        let b = vec![sample("AAA", 2, 10.0), sample("BBB", 1, 12.0)];

        let out = fuse(&a, &b, &universe(&["AAA", "BBB"]), &BTreeMap::new());

        assert_eq!(out.len(), 2);
        assert_eq!(out["AAA"].summary_rank, 3);
        assert_eq!(out["BBB"].summary_rank, 3);
        // BTreeMap iteration breaks the tie lexically.
        let order: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(order, vec!["AAA", "BBB"]);
    }

    #[test]
    fn restricts_to_universe() {
        let a = vec![sample("AAA", 1, 5.0), sample("ZZZ", 2, 4.0)];
        let b = vec![sample("AAA", 1, 9.0), sample("ZZZ", 2, 8.0)];

        let out = fuse(&a, &b, &universe(&["AAA"]), &BTreeMap::new());

        assert_eq!(out.len(), 1);
        assert!(out.contains_key("AAA"));
    }

    #[test]
    fn first_occurrence_wins_on_page_boundary_duplicates() {
        let a = vec![sample("AAA", 20, 3.0), sample("AAA", 21, 2.9)];
        let b = vec![sample("AAA", 1, 9.0)];

        let out = fuse(&a, &b, &universe(&["AAA"]), &BTreeMap::new());

        assert_eq!(out["AAA"].metric_a_rank, 20);
        assert_eq!(out["AAA"].metric_a_value, Some(3.0));
    }

    #[test]
    fn carries_missing_side_forward_from_previous_cycle() {
        let prev_row = CompositeRow {
            ticker: "AAA".to_string(),
            metric_a_rank: 7,
            metric_a_value: Some(6.5),
            metric_b_rank: 9,
            metric_b_value: Some(14.0),
            summary_rank: 16,
        };
        let previous = BTreeMap::from([("AAA".to_string(), prev_row)]);

        // Metric A dropped AAA this cycle; metric B still ranks it.
        let a = vec![];
        let b = vec![sample("AAA", 4, 15.0)];

        let out = fuse(&a, &b, &universe(&["AAA"]), &previous);

        assert_eq!(out["AAA"].metric_a_rank, 7);
        assert_eq!(out["AAA"].metric_a_value, Some(6.5));
        assert_eq!(out["AAA"].metric_b_rank, 4);
        assert_eq!(out["AAA"].summary_rank, 11);
    }

    #[test]
    fn drops_ticker_without_data_or_history() {
        let a = vec![sample("AAA", 1, 5.0)];
        let b = vec![sample("AAA", 2, 9.0)];

        let out = fuse(&a, &b, &universe(&["AAA", "BBB"]), &BTreeMap::new());

        assert_eq!(out.len(), 1);
        assert!(!out.contains_key("BBB"));
    }

    #[test]
    fn second_fuse_with_own_output_as_history_is_a_no_op() {
        let a = vec![sample("AAA", 1, 5.0), sample("BBB", 3, 2.0)];
        let b = vec![sample("BBB", 1, 12.0)];
        let prev_row = CompositeRow {
            ticker: "AAA".to_string(),
            metric_a_rank: 2,
            metric_a_value: Some(4.0),
            metric_b_rank: 2,
            metric_b_value: Some(11.0),
            summary_rank: 4,
        };
        let previous = BTreeMap::from([("AAA".to_string(), prev_row)]);
        let u = universe(&["AAA", "BBB"]);

        let once = fuse(&a, &b, &u, &previous);
        let twice = fuse(&a, &b, &u, &once);

        assert_eq!(once, twice);
    }
}
