use crate::domain::estimate::{self, EstimateRow, PointEstimate};
use crate::domain::ranking::{self, CompositeRow, MetricSample};
use crate::domain::selection;
use crate::portfolio::history::ValuationHistory;
use crate::portfolio::ledger::{Ledger, RebalanceSummary};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

/// One external ranking table (one metric), fetched page by page by the
/// collaborator. Retry policy lives behind this trait, not in the engine.
#[async_trait::async_trait]
pub trait MetricRankSource: Send + Sync {
    fn metric_name(&self) -> &'static str;

    async fn fetch_ranks(&self) -> Result<Vec<MetricSample>>;
}

/// Analyst point estimates for one ticker. An `Err` means the fetch failed;
/// the engine records the ticker as estimate-less rather than aborting.
#[async_trait::async_trait]
pub trait EstimateSource: Send + Sync {
    async fn fetch_estimate(&self, ticker: &str) -> Result<PointEstimate>;
}

/// Current market price for one ticker.
#[async_trait::async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_price(&self, ticker: &str) -> Result<f64>;
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Number of candidates the portfolio tracks.
    pub selection_size: usize,

    /// Estimates are fetched for the top `factor * 6 * selection_size`
    /// composite rows; rows below that depth never survive selection.
    pub estimate_depth_factor: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            selection_size: 5,
            estimate_depth_factor: 4,
        }
    }
}

impl EngineOptions {
    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Ok(s) = std::env::var("SELECTION_SIZE") {
            if let Ok(n) = s.parse::<usize>() {
                out.selection_size = n;
            }
        }

        if let Ok(s) = std::env::var("ESTIMATE_DEPTH_FACTOR") {
            if let Ok(n) = s.parse::<usize>() {
                out.estimate_depth_factor = n;
            }
        }

        out
    }

    fn estimate_depth(&self) -> usize {
        self.estimate_depth_factor * 6 * self.selection_size
    }
}

/// Yesterday's persisted composite ranking and candidate set.
#[derive(Debug, Clone, Default)]
pub struct PreviousState {
    pub ranking: BTreeMap<String, CompositeRow>,
    pub selected: BTreeSet<String>,
}

/// Everything one cycle produced. Callers persist this atomically after the
/// cycle has fully succeeded.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub as_of_date: NaiveDate,
    /// Full merged ranking in composite order.
    pub rows: Vec<EstimateRow>,
    /// Candidate set in selection order (best rated first).
    pub selected: Vec<EstimateRow>,
    pub changed: bool,
    /// Universe tickers without metric data or carry-forward this cycle.
    pub dropped_tickers: usize,
    pub rebalance: RebalanceSummary,
    pub net_worth: f64,
}

impl CycleOutcome {
    pub fn selected_tickers(&self) -> BTreeSet<String> {
        self.selected
            .iter()
            .map(|r| r.ticker().to_string())
            .collect()
    }
}

/// The sequential per-cycle pipeline: fuse the two metric rankings, attach
/// estimates, select candidates, rebalance the ledger, record the valuation.
///
/// All collaborators are injected; the engine holds no ambient state and
/// performs no retries of its own.
pub struct Engine<A, B, E, P> {
    metric_a: A,
    metric_b: B,
    estimates: E,
    prices: P,
    options: EngineOptions,
}

impl<A, B, E, P> Engine<A, B, E, P>
where
    A: MetricRankSource,
    B: MetricRankSource,
    E: EstimateSource,
    P: PriceSource,
{
    pub fn new(metric_a: A, metric_b: B, estimates: E, prices: P, options: EngineOptions) -> Self {
        Self {
            metric_a,
            metric_b,
            estimates,
            prices,
            options,
        }
    }

    pub async fn run_cycle(
        &self,
        as_of_date: NaiveDate,
        universe: &BTreeSet<String>,
        previous: &PreviousState,
        ledger: &mut Ledger,
        history: &mut ValuationHistory,
    ) -> Result<CycleOutcome> {
        anyhow::ensure!(!universe.is_empty(), "ticker universe must be non-empty");

        // The two metric walks are independent pure inputs.
        let (samples_a, samples_b) = tokio::try_join!(
            self.metric_a.fetch_ranks(),
            self.metric_b.fetch_ranks()
        )
        .context("metric rank fetch failed")?;

        tracing::info!(
            metric_a = self.metric_a.metric_name(),
            rows_a = samples_a.len(),
            metric_b = self.metric_b.metric_name(),
            rows_b = samples_b.len(),
            "metric rank tables fetched"
        );

        let composite = ranking::fuse(&samples_a, &samples_b, universe, &previous.ranking);
        let dropped_tickers = universe.len() - composite.len();

        let estimates = self.fetch_estimates(&composite).await;
        let rows = estimate::merge(&composite, &estimates);

        let (selected, changed) =
            selection::select(&rows, self.options.selection_size, &previous.selected)?;
        tracing::info!(
            selected = selected.len(),
            changed,
            "candidate selection complete"
        );

        let targets: Vec<String> = selected.iter().map(|r| r.ticker().to_string()).collect();
        let prices = self.resolve_prices(ledger, &targets, &rows).await?;
        let lookup = |ticker: &str| prices.get(ticker).copied();

        let rebalance = ledger
            .rebalance(&targets, lookup, as_of_date)
            .context("portfolio rebalance failed")?;
        let net_worth = ledger.net_worth(lookup).context("valuation failed")?;
        history.record(as_of_date, net_worth);

        Ok(CycleOutcome {
            as_of_date,
            rows,
            selected,
            changed,
            dropped_tickers,
            rebalance,
            net_worth,
        })
    }

    // Estimates are only fetched down to the depth selection can reach; a
    // per-ticker failure leaves the row estimate-less instead of failing the
    // cycle.
    async fn fetch_estimates(
        &self,
        composite: &BTreeMap<String, CompositeRow>,
    ) -> BTreeMap<String, Option<PointEstimate>> {
        let mut ordered: Vec<&CompositeRow> = composite.values().collect();
        ordered.sort_by(|x, y| {
            x.summary_rank
                .cmp(&y.summary_rank)
                .then_with(|| x.ticker.cmp(&y.ticker))
        });

        let mut out = BTreeMap::new();
        let mut failures: usize = 0;
        for row in ordered.into_iter().take(self.options.estimate_depth()) {
            let estimate = match self.estimates.fetch_estimate(&row.ticker).await {
                Ok(e) => Some(e),
                Err(err) => {
                    failures += 1;
                    tracing::warn!(ticker = %row.ticker, error = %err, "estimate fetch failed; row kept without estimates");
                    None
                }
            };
            out.insert(row.ticker.clone(), estimate);
        }

        if failures > 0 {
            tracing::info!(failures, fetched = out.len(), "estimate fetch finished with failures");
        }

        out
    }

    // One price per ticker the ledger update will touch (currently held or
    // about to be bought). Estimate rows already carry a current price; only
    // the rest go to the price source. Any gap aborts the cycle before the
    // ledger is mutated.
    async fn resolve_prices(
        &self,
        ledger: &Ledger,
        targets: &[String],
        rows: &[EstimateRow],
    ) -> Result<BTreeMap<String, f64>> {
        let mut needed: BTreeSet<String> = ledger.positions().into_keys().collect();
        needed.extend(targets.iter().cloned());

        let known: BTreeMap<&str, f64> = rows
            .iter()
            .filter_map(|r| r.estimate.as_ref().map(|e| (r.ticker(), e.current_price)))
            .collect();

        let mut out = BTreeMap::new();
        for ticker in needed {
            let price = match known.get(ticker.as_str()) {
                Some(p) => *p,
                None => self
                    .prices
                    .fetch_price(&ticker)
                    .await
                    .with_context(|| format!("no price available for {ticker}"))?,
            };
            out.insert(ticker, price);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRanks {
        name: &'static str,
        samples: Vec<MetricSample>,
    }

    #[async_trait::async_trait]
    impl MetricRankSource for FixedRanks {
        fn metric_name(&self) -> &'static str {
            self.name
        }

        async fn fetch_ranks(&self) -> Result<Vec<MetricSample>> {
            Ok(self.samples.clone())
        }
    }

    struct FixedEstimates(BTreeMap<String, PointEstimate>);

    #[async_trait::async_trait]
    impl EstimateSource for FixedEstimates {
        async fn fetch_estimate(&self, ticker: &str) -> Result<PointEstimate> {
            self.0
                .get(ticker)
                .copied()
                .with_context(|| format!("estimate unavailable for {ticker}"))
        }
    }

    struct FixedPrices(BTreeMap<String, f64>);

    #[async_trait::async_trait]
    impl PriceSource for FixedPrices {
        async fn fetch_price(&self, ticker: &str) -> Result<f64> {
            self.0
                .get(ticker)
                .copied()
                .with_context(|| format!("price unavailable for {ticker}"))
        }
    }

    fn sample(ticker: &str, rank: i32) -> MetricSample {
        MetricSample {
            ticker: ticker.to_string(),
            rank,
            raw_value: Some(rank as f64),
        }
    }

    fn undervalued(rating: f64, current_price: f64) -> PointEstimate {
        PointEstimate {
            rating,
            low_target: current_price * 0.9,
            current_price,
            avg_target: current_price * 1.5,
            high_target: current_price * 2.0,
        }
    }

    fn engine(
        estimates: BTreeMap<String, PointEstimate>,
        prices: BTreeMap<String, f64>,
        selection_size: usize,
    ) -> Engine<FixedRanks, FixedRanks, FixedEstimates, FixedPrices> {
        let metric_a = FixedRanks {
            name: "ep",
            samples: vec![sample("AAA", 1), sample("BBB", 2), sample("CCC", 3)],
        };
        let metric_b = FixedRanks {
            name: "roe",
            samples: vec![sample("AAA", 2), sample("BBB", 1), sample("CCC", 3)],
        };
        let options = EngineOptions {
            selection_size,
            ..EngineOptions::default()
        };
        Engine::new(metric_a, metric_b, FixedEstimates(estimates), FixedPrices(prices), options)
    }

    fn universe() -> BTreeSet<String> {
        ["AAA", "BBB", "CCC"].iter().map(|s| s.to_string()).collect()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, d).unwrap()
    }

    #[tokio::test]
    async fn cycle_selects_rebalances_and_records_valuation() {
        let estimates = BTreeMap::from([
            ("AAA".to_string(), undervalued(1.5, 10.0)),
            ("BBB".to_string(), undervalued(2.5, 20.0)),
            ("CCC".to_string(), undervalued(3.5, 5.0)),
        ]);
        let engine = engine(estimates, BTreeMap::new(), 2);

        let mut ledger = Ledger::new(1000.0);
        let mut history = ValuationHistory::new();
        let outcome = engine
            .run_cycle(day(1), &universe(), &PreviousState::default(), &mut ledger, &mut history)
            .await
            .unwrap();

        assert_eq!(outcome.rows.len(), 3);
        // Best two ratings out of the undervalued window.
        assert_eq!(
            outcome.selected_tickers(),
            ["AAA", "BBB"].iter().map(|s| s.to_string()).collect()
        );
        assert!(outcome.changed);
        // 500 allocated to AAA at 10, then the rest to BBB at 20.
        assert_eq!(
            outcome.rebalance.bought,
            vec![("AAA".to_string(), 50), ("BBB".to_string(), 25)]
        );
        assert_eq!(outcome.net_worth, 1000.0);
        assert_eq!(history.latest(), Some((day(1), 1000.0)));
    }

    #[tokio::test]
    async fn estimate_failures_keep_rows_and_narrow_selection() {
        // No estimate for CCC at all; its row must survive with None.
        let estimates = BTreeMap::from([
            ("AAA".to_string(), undervalued(1.5, 10.0)),
            ("BBB".to_string(), undervalued(2.5, 20.0)),
        ]);
        let engine = engine(estimates, BTreeMap::new(), 3);

        let mut ledger = Ledger::new(1000.0);
        let mut history = ValuationHistory::new();
        let outcome = engine
            .run_cycle(day(1), &universe(), &PreviousState::default(), &mut ledger, &mut history)
            .await
            .unwrap();

        let ccc = outcome.rows.iter().find(|r| r.ticker() == "CCC").unwrap();
        assert!(ccc.estimate.is_none());
        assert_eq!(outcome.selected.len(), 2);
    }

    #[tokio::test]
    async fn unchanged_selection_is_reported_as_such() {
        let estimates = BTreeMap::from([
            ("AAA".to_string(), undervalued(1.5, 10.0)),
            ("BBB".to_string(), undervalued(2.5, 20.0)),
            ("CCC".to_string(), undervalued(3.5, 5.0)),
        ]);
        let engine = engine(estimates, BTreeMap::new(), 2);

        let previous = PreviousState {
            ranking: BTreeMap::new(),
            selected: ["AAA", "BBB"].iter().map(|s| s.to_string()).collect(),
        };
        let mut ledger = Ledger::new(1000.0);
        let mut history = ValuationHistory::new();
        let outcome = engine
            .run_cycle(day(2), &universe(), &previous, &mut ledger, &mut history)
            .await
            .unwrap();

        assert!(!outcome.changed);
    }

    #[tokio::test]
    async fn held_ticker_without_any_price_fails_the_cycle() {
        // ZZZ is held but ranks nowhere and the price source is empty.
        let estimates = BTreeMap::from([
            ("AAA".to_string(), undervalued(1.5, 10.0)),
            ("BBB".to_string(), undervalued(2.5, 20.0)),
            ("CCC".to_string(), undervalued(3.5, 5.0)),
        ]);
        let engine = engine(estimates, BTreeMap::new(), 2);

        let mut ledger = Ledger::new(1000.0);
        ledger.buy("ZZZ", 10, 10.0, day(1)).unwrap();
        let mut history = ValuationHistory::new();

        let err = engine
            .run_cycle(day(2), &universe(), &PreviousState::default(), &mut ledger, &mut history)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("ZZZ"));
        assert!(history.is_empty());
    }
}
