use crate::domain::ranking::MetricSample;
use crate::engine::MetricRankSource;
use anyhow::{Context, Result};
use scraper::{Html, Selector};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://finviz.com/screener.ashx";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_REQ_DELAY_MS: u64 = 250;
// The screener lists ~7500 equities at 20 rows per page.
const DEFAULT_MAX_ROWS: usize = 7530;
const PAGE_SIZE: usize = 20;
const PROGRESS_EVERY_PAGES: usize = 40;

// The site rejects default client UAs.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// One metric's walk over the screener: which ordering to request, which
/// view carries the raw value, and how to read it.
#[derive(Debug, Clone)]
pub struct MetricSpec {
    pub name: &'static str,
    /// Screener ordering key; a leading `-` means descending.
    pub order: &'static str,
    /// Screener view id whose table carries the metric column.
    pub view: &'static str,
    /// 0-based index of the raw-value cell within a row.
    pub value_column: usize,
    /// Report `100 / cell` instead of the cell itself (P/E → E/P %).
    pub reciprocal_pct: bool,
}

impl MetricSpec {
    /// Earnings yield, ranked by ascending P/E on the overview view.
    pub fn earnings_yield() -> Self {
        Self {
            name: "ep",
            order: "pe",
            view: "111",
            value_column: 7,
            reciprocal_pct: true,
        }
    }

    /// Return on equity, ranked descending on the financial view.
    pub fn return_on_equity() -> Self {
        Self {
            name: "roe",
            order: "-roe",
            view: "161",
            value_column: 5,
            reciprocal_pct: false,
        }
    }
}

/// Paginated rank-table scraper for one metric.
///
/// Walks the screener page by page collecting `(rank, ticker, value)` rows.
/// A page that keeps failing after retries is skipped, not fatal; rank
/// fusion carries missing tickers forward from the previous cycle.
#[derive(Debug)]
pub struct ScreenerClient {
    http: reqwest::Client,
    base_url: String,
    spec: MetricSpec,
    max_rows: usize,
    retries: u32,
    req_delay: Duration,
}

impl ScreenerClient {
    pub fn new(spec: MetricSpec) -> Result<Self> {
        let base_url =
            std::env::var("SCREENER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let timeout_secs = std::env::var("SCREENER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("SCREENER_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES);

        let req_delay_ms = std::env::var("SCREENER_REQ_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REQ_DELAY_MS);

        let max_rows = std::env::var("SCREENER_MAX_ROWS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_ROWS);

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build screener http client")?;

        Ok(Self {
            http,
            base_url,
            spec,
            max_rows,
            retries,
            req_delay: Duration::from_millis(req_delay_ms),
        })
    }

    async fn fetch_page(&self, offset: usize) -> Result<String> {
        let res = self
            .http
            .get(&self.base_url)
            .query(&[
                ("v", self.spec.view),
                ("ft", "3"),
                ("o", self.spec.order),
                ("r", &offset.to_string()),
            ])
            .send()
            .await
            .context("screener request failed")?;

        let status = res.status();
        let body = res
            .text()
            .await
            .context("failed to read screener response")?;
        anyhow::ensure!(status.is_success(), "screener HTTP {status}");
        Ok(body)
    }

    async fn fetch_page_with_retries(&self, offset: usize) -> Result<Vec<MetricSample>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let res = self.fetch_page(offset).await;
            match res.and_then(|body| parse_page(&body, &self.spec)) {
                Ok(samples) => return Ok(samples),
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        metric = self.spec.name,
                        offset,
                        attempt,
                        ?backoff,
                        error = %err,
                        "screener page fetch failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn fetch_all(&self) -> Result<Vec<MetricSample>> {
        let mut out = Vec::new();
        let mut skipped_pages: usize = 0;
        let total_pages = self.max_rows.div_ceil(PAGE_SIZE);

        for page in 0..total_pages {
            if page != 0 {
                tokio::time::sleep(self.req_delay).await;
            }

            // The screener addresses pages by 1-based row offset.
            let offset = page * PAGE_SIZE + 1;
            match self.fetch_page_with_retries(offset).await {
                Ok(samples) if samples.is_empty() => break,
                Ok(samples) => out.extend(samples),
                Err(err) => {
                    skipped_pages += 1;
                    tracing::warn!(
                        metric = self.spec.name,
                        offset,
                        error = %err,
                        "screener page skipped"
                    );
                }
            }

            let n = page + 1;
            if n == total_pages || n % PROGRESS_EVERY_PAGES == 0 {
                tracing::info!(
                    metric = self.spec.name,
                    pages = n,
                    total_pages,
                    rows = out.len(),
                    skipped_pages,
                    "screener walk progress"
                );
            }
        }

        anyhow::ensure!(
            !out.is_empty(),
            "screener walk for {} produced no rows",
            self.spec.name
        );
        Ok(out)
    }
}

#[async_trait::async_trait]
impl MetricRankSource for ScreenerClient {
    fn metric_name(&self) -> &'static str {
        self.spec.name
    }

    async fn fetch_ranks(&self) -> Result<Vec<MetricSample>> {
        self.fetch_all().await
    }
}

// Rows sit in the results table as `tr[valign=top]`: cell 0 is the global
// 1-based rank, cell 1 the ticker, and the raw value at a view-specific
// column. Header rows fail the rank parse and are skipped.
fn parse_page(html: &str, spec: &MetricSpec) -> Result<Vec<MetricSample>> {
    let document = Html::parse_document(html);
    let row_selector = Selector::parse(r##"table[bgcolor="#d3d3d3"] tr[valign="top"]"##)
        .map_err(|e| anyhow::anyhow!("invalid row selector: {e}"))?;
    let cell_selector =
        Selector::parse("td").map_err(|e| anyhow::anyhow!("invalid cell selector: {e}"))?;

    let mut out = Vec::new();
    for row in document.select(&row_selector) {
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|c| c.text().collect::<String>().trim().to_string())
            .collect();

        if cells.len() <= spec.value_column.max(1) {
            continue;
        }
        let Ok(rank) = cells[0].parse::<i32>() else {
            continue;
        };
        let ticker = cells[1].clone();
        if ticker.is_empty() {
            continue;
        }

        out.push(MetricSample {
            ticker,
            rank,
            raw_value: parse_cell_value(&cells[spec.value_column], spec.reciprocal_pct),
        });
    }

    Ok(out)
}

// Cells read like "12.34", "5.67%" or "-" for no data.
fn parse_cell_value(cell: &str, reciprocal_pct: bool) -> Option<f64> {
    let cleaned = cell.trim().trim_end_matches('%');
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    let value = cleaned.parse::<f64>().ok()?;
    if reciprocal_pct {
        if value == 0.0 {
            return None;
        }
        Some(100.0 / value)
    } else {
        Some(value)
    }
}
