use crate::domain::estimate::EstimateRow;
use std::collections::BTreeSet;

/// Pick the `n` best candidates out of merged ranking rows.
///
/// `rows` must already be in composite order (ascending summary rank), as
/// produced by [`crate::domain::estimate::merge`]. Rows with missing
/// estimates or with `current_price >= avg_target` are filtered out, the
/// first `6n` survivors form the working window (wide enough to absorb
/// estimate drop-outs), and that window is re-sorted ascending by analyst
/// rating before truncating to `n`.
///
/// `changed` is true when the selected ticker set differs from
/// `previous_selection`, compared as sets.
pub fn select(
    rows: &[EstimateRow],
    n: usize,
    previous_selection: &BTreeSet<String>,
) -> anyhow::Result<(Vec<EstimateRow>, bool)> {
    anyhow::ensure!(n > 0, "selection size must be positive");

    let mut window: Vec<&EstimateRow> = rows
        .iter()
        .filter(|row| {
            row.estimate
                .as_ref()
                .is_some_and(|e| e.current_price < e.avg_target)
        })
        .take(6 * n)
        .collect();

    window.sort_by(|x, y| {
        let rx = x.estimate.as_ref().map(|e| e.rating);
        let ry = y.estimate.as_ref().map(|e| e.rating);
        rx.partial_cmp(&ry)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| x.ticker().cmp(y.ticker()))
    });

    let selected: Vec<EstimateRow> = window.into_iter().take(n).cloned().collect();

    let current: BTreeSet<String> = selected.iter().map(|r| r.ticker().to_string()).collect();
    let changed = current != *previous_selection;

    Ok((selected, changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::estimate::PointEstimate;
    use crate::domain::ranking::CompositeRow;

    fn row(ticker: &str, summary_rank: i32, estimate: Option<PointEstimate>) -> EstimateRow {
        EstimateRow {
            composite: CompositeRow {
                ticker: ticker.to_string(),
                metric_a_rank: summary_rank / 2,
                metric_a_value: None,
                metric_b_rank: summary_rank - summary_rank / 2,
                metric_b_value: None,
                summary_rank,
            },
            estimate,
        }
    }

    fn undervalued(rating: f64) -> Option<PointEstimate> {
        Some(PointEstimate {
            rating,
            low_target: 8.0,
            current_price: 10.0,
            avg_target: 15.0,
            high_target: 20.0,
        })
    }

    fn overvalued(rating: f64) -> Option<PointEstimate> {
        Some(PointEstimate {
            rating,
            low_target: 8.0,
            current_price: 15.0,
            avg_target: 10.0,
            high_target: 20.0,
        })
    }

    #[test]
    fn filters_incomplete_and_overvalued_rows() {
        let rows = vec![
            row("AAA", 1, None),
            row("BBB", 2, overvalued(1.0)),
            row("CCC", 3, undervalued(2.5)),
        ];

        let (selected, _) = select(&rows, 2, &BTreeSet::new()).unwrap();

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].ticker(), "CCC");
    }

    #[test]
    fn reorders_window_by_rating() {
        let rows = vec![
            row("AAA", 1, undervalued(3.0)),
            row("BBB", 2, undervalued(1.2)),
            row("CCC", 3, undervalued(2.1)),
        ];

        let (selected, _) = select(&rows, 2, &BTreeSet::new()).unwrap();

        let order: Vec<&str> = selected.iter().map(|r| r.ticker()).collect();
        assert_eq!(order, vec!["BBB", "CCC"]);
    }

    #[test]
    fn window_is_limited_to_six_times_n() {
        // 7 undervalued rows, n=1: the 7th has the best rating but sits
        // outside the 6-row window.
        let mut rows = Vec::new();
        for (i, ticker) in ["AAA", "BBB", "CCC", "DDD", "EEE", "FFF"].iter().enumerate() {
            rows.push(row(ticker, i as i32 + 1, undervalued(3.0)));
        }
        rows.push(row("GGG", 7, undervalued(1.0)));

        let (selected, _) = select(&rows, 1, &BTreeSet::new()).unwrap();

        assert_ne!(selected[0].ticker(), "GGG");
    }

    #[test]
    fn change_detection_is_set_based() {
        let rows = vec![
            row("AAA", 1, undervalued(1.0)),
            row("BBB", 2, undervalued(2.0)),
        ];

        let same: BTreeSet<String> = ["AAA", "BBB"].iter().map(|s| s.to_string()).collect();
        let (_, changed) = select(&rows, 2, &same).unwrap();
        assert!(!changed);

        let other: BTreeSet<String> = ["AAA", "ZZZ"].iter().map(|s| s.to_string()).collect();
        let (_, changed) = select(&rows, 2, &other).unwrap();
        assert!(changed);
    }

    #[test]
    fn empty_selection_changes_only_against_non_empty_previous() {
        let rows = vec![row("AAA", 1, overvalued(1.0))];

        let (selected, changed) = select(&rows, 1, &BTreeSet::new()).unwrap();
        assert!(selected.is_empty());
        assert!(!changed);

        let previous: BTreeSet<String> = ["AAA".to_string()].into_iter().collect();
        let (_, changed) = select(&rows, 1, &previous).unwrap();
        assert!(changed);
    }
}
