use crate::domain::estimate::PointEstimate;
use anyhow::Context;
use serde::Deserialize;

/// Quote provider response envelope for
/// `quoteSummary/{ticker}?modules=financialData`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuoteSummaryEnvelope {
    #[serde(rename = "quoteSummary")]
    pub quote_summary: QuoteSummaryBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteSummaryBody {
    #[serde(default)]
    pub result: Option<Vec<QuoteSummaryResult>>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteSummaryResult {
    #[serde(rename = "financialData")]
    pub financial_data: Option<FinancialData>,
}

/// The provider wraps every number as `{"raw": ..., "fmt": ...}`; empty cells
/// arrive as `{}`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RawNumber {
    #[serde(default)]
    pub raw: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FinancialData {
    #[serde(rename = "recommendationMean", default)]
    pub recommendation_mean: Option<RawNumber>,
    #[serde(rename = "targetLowPrice", default)]
    pub target_low_price: Option<RawNumber>,
    #[serde(rename = "currentPrice", default)]
    pub current_price: Option<RawNumber>,
    #[serde(rename = "targetMeanPrice", default)]
    pub target_mean_price: Option<RawNumber>,
    #[serde(rename = "targetHighPrice", default)]
    pub target_high_price: Option<RawNumber>,
}

impl FinancialData {
    /// All five fields must be present; a sparse response is a fetch failure,
    /// not a zeroed estimate.
    pub fn into_point_estimate(self) -> anyhow::Result<PointEstimate> {
        Ok(PointEstimate {
            rating: raw(self.recommendation_mean).context("recommendationMean missing")?,
            low_target: raw(self.target_low_price).context("targetLowPrice missing")?,
            current_price: raw(self.current_price).context("currentPrice missing")?,
            avg_target: raw(self.target_mean_price).context("targetMeanPrice missing")?,
            high_target: raw(self.target_high_price).context("targetHighPrice missing")?,
        })
    }

    pub fn current_price(&self) -> anyhow::Result<f64> {
        raw(self.current_price).context("currentPrice missing")
    }
}

fn raw(n: Option<RawNumber>) -> Option<f64> {
    n.and_then(|v| v.raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_financial_data_module() {
        let v = json!({
            "quoteSummary": {
                "result": [{
                    "financialData": {
                        "recommendationMean": {"raw": 1.8, "fmt": "1.80"},
                        "targetLowPrice": {"raw": 90.0},
                        "currentPrice": {"raw": 100.5},
                        "targetMeanPrice": {"raw": 120.0},
                        "targetHighPrice": {"raw": 150.0}
                    }
                }],
                "error": null
            }
        });

        let envelope: QuoteSummaryEnvelope = serde_json::from_value(v).unwrap();
        let data = envelope.quote_summary.result.unwrap()[0]
            .financial_data
            .clone()
            .unwrap();
        let estimate = data.into_point_estimate().unwrap();

        assert_eq!(estimate.rating, 1.8);
        assert_eq!(estimate.current_price, 100.5);
        assert_eq!(estimate.avg_target, 120.0);
    }

    #[test]
    fn sparse_financial_data_is_a_fetch_failure() {
        let v = json!({
            "quoteSummary": {
                "result": [{
                    "financialData": {
                        "currentPrice": {"raw": 100.5},
                        "targetMeanPrice": {}
                    }
                }],
                "error": null
            }
        });

        let envelope: QuoteSummaryEnvelope = serde_json::from_value(v).unwrap();
        let data = envelope.quote_summary.result.unwrap()[0]
            .financial_data
            .clone()
            .unwrap();

        assert_eq!(data.current_price().unwrap(), 100.5);
        assert!(data.into_point_estimate().is_err());
    }
}
