use crate::domain::estimate::PointEstimate;
use crate::engine::{EstimateSource, PriceSource};
use crate::ingest::types::{FinancialData, QuoteSummaryEnvelope};
use anyhow::{Context, Result};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com/v10/finance/quoteSummary";
const DEFAULT_TIMEOUT_SECS: u64 = 15;
// The provider drops requests sporadically; the original client retried
// each ticker up to five times.
const DEFAULT_RETRIES: u32 = 5;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Per-ticker analyst-estimate and price client over the quote provider's
/// `financialData` module.
#[derive(Debug, Clone)]
pub struct QuoteClient {
    http: reqwest::Client,
    base_url: String,
    retries: u32,
}

impl QuoteClient {
    pub fn new() -> Result<Self> {
        let base_url =
            std::env::var("QUOTE_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let timeout_secs = std::env::var("QUOTE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        let retries = std::env::var("QUOTE_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRIES);

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build quote http client")?;

        Ok(Self {
            http,
            base_url,
            retries,
        })
    }

    async fn fetch_financial_data(&self, ticker: &str) -> Result<FinancialData> {
        let symbol = normalize_ticker(ticker);
        let url = format!("{}/{symbol}", self.base_url.trim_end_matches('/'));

        let res = self
            .http
            .get(url)
            .query(&[("modules", "financialData")])
            .send()
            .await
            .context("quote request failed")?;

        let status = res.status();
        let text = res.text().await.context("failed to read quote response")?;
        anyhow::ensure!(status.is_success(), "quote HTTP {status} for {ticker}: {text}");

        let envelope: QuoteSummaryEnvelope = serde_json::from_str(&text)
            .with_context(|| format!("quote response for {ticker} is not the expected JSON"))?;

        if let Some(err) = envelope.quote_summary.error {
            if !err.is_null() {
                anyhow::bail!("quote provider error for {ticker}: {err}");
            }
        }

        envelope
            .quote_summary
            .result
            .and_then(|mut results| {
                if results.is_empty() {
                    None
                } else {
                    results.swap_remove(0).financial_data
                }
            })
            .with_context(|| format!("no financialData module for {ticker}"))
    }

    async fn fetch_with_retries(&self, ticker: &str) -> Result<FinancialData> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_financial_data(ticker).await {
                Ok(data) => return Ok(data),
                Err(err) => {
                    if attempt >= self.retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_millis(200 * (1u64 << (attempt - 1)));
                    tracing::debug!(ticker, attempt, ?backoff, error = %err, "quote fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl EstimateSource for QuoteClient {
    async fn fetch_estimate(&self, ticker: &str) -> Result<PointEstimate> {
        self.fetch_with_retries(ticker)
            .await?
            .into_point_estimate()
            .with_context(|| format!("incomplete estimate for {ticker}"))
    }
}

#[async_trait::async_trait]
impl PriceSource for QuoteClient {
    async fn fetch_price(&self, ticker: &str) -> Result<f64> {
        self.fetch_with_retries(ticker)
            .await?
            .current_price()
            .with_context(|| format!("no current price for {ticker}"))
    }
}

// Exchange listings use `@` for share classes where the quote provider
// expects a dot (BRK@B → BRK.B).
fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().replace('@', ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_class_share_tickers() {
        assert_eq!(normalize_ticker("BRK@B"), "BRK.B");
        assert_eq!(normalize_ticker(" AAA "), "AAA");
    }
}
