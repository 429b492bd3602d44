use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("insufficient funds: order costs {needed:.2}, {available:.2} available")]
    InsufficientFunds { needed: f64, available: f64 },

    #[error("insufficient shares of {ticker}: requested {requested}, holding {held}")]
    InsufficientShares {
        ticker: String,
        requested: i64,
        held: i64,
    },

    #[error("no price available for {ticker}")]
    MissingPrice { ticker: String },

    #[error("order quantity and price must be positive")]
    InvalidOrder,
}

/// A quantity of one ticker bought together at one price and date.
///
/// A lot is split on a partial sell: the sold piece becomes a closed lot and
/// the remainder stays open. Closed lots are immutable and are kept for
/// historical profitability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharesLot {
    pub ticker: String,
    pub number: i64,
    pub open_price: f64,
    pub open_date: NaiveDate,
    pub close_price: Option<f64>,
    pub close_date: Option<NaiveDate>,
    pub is_closed: bool,
}

/// Trades performed by one [`Ledger::rebalance`] pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceSummary {
    pub sold: Vec<(String, i64)>,
    pub bought: Vec<(String, i64)>,
}

/// FIFO lot-based accounting of the simulated portfolio.
///
/// Owns the cash balance and every lot ever opened. Failed operations leave
/// the ledger untouched; callers decide whether to skip and continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    initial_funds: f64,
    free_funds: f64,
    lots: Vec<SharesLot>,
}

impl Ledger {
    pub fn new(initial_funds: f64) -> Self {
        Self {
            initial_funds,
            free_funds: initial_funds,
            lots: Vec::new(),
        }
    }

    /// Rebuild a ledger from persisted state. Lot order must be the original
    /// insertion order; it is the FIFO tie-break for equal open dates.
    pub fn from_parts(
        initial_funds: f64,
        free_funds: f64,
        lots: Vec<SharesLot>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(initial_funds > 0.0, "initial funds must be positive");
        anyhow::ensure!(free_funds >= 0.0, "free funds must be non-negative");
        for lot in &lots {
            anyhow::ensure!(lot.number > 0, "lot quantity must be positive");
            anyhow::ensure!(
                lot.is_closed == (lot.close_price.is_some() && lot.close_date.is_some()),
                "closed flag inconsistent with close fields for {}",
                lot.ticker
            );
        }
        Ok(Self {
            initial_funds,
            free_funds,
            lots,
        })
    }

    pub fn initial_funds(&self) -> f64 {
        self.initial_funds
    }

    pub fn free_funds(&self) -> f64 {
        self.free_funds
    }

    pub fn lots(&self) -> &[SharesLot] {
        &self.lots
    }

    /// Open share count per ticker. Tickers with no open lots are absent.
    pub fn positions(&self) -> BTreeMap<String, i64> {
        let mut out = BTreeMap::new();
        for lot in self.lots.iter().filter(|l| !l.is_closed) {
            *out.entry(lot.ticker.clone()).or_insert(0) += lot.number;
        }
        out
    }

    fn open_shares(&self, ticker: &str) -> i64 {
        self.lots
            .iter()
            .filter(|l| !l.is_closed && l.ticker == ticker)
            .map(|l| l.number)
            .sum()
    }

    /// Buy `number` shares at `price`, opening one new lot.
    pub fn buy(
        &mut self,
        ticker: &str,
        number: i64,
        price: f64,
        on: NaiveDate,
    ) -> Result<(), LedgerError> {
        if number <= 0 || price <= 0.0 {
            return Err(LedgerError::InvalidOrder);
        }

        let cost = number as f64 * price;
        if cost > self.free_funds {
            return Err(LedgerError::InsufficientFunds {
                needed: cost,
                available: self.free_funds,
            });
        }

        self.lots.push(SharesLot {
            ticker: ticker.to_string(),
            number,
            open_price: price,
            open_date: on,
            close_price: None,
            close_date: None,
            is_closed: false,
        });
        self.free_funds -= cost;
        Ok(())
    }

    /// Sell `number` shares at `price`, liquidating the oldest open lots
    /// first. The last touched lot is split when the order ends inside it.
    ///
    /// The whole order settles at `price` regardless of each lot's cost
    /// basis; lot prices only matter for historical profitability.
    pub fn sell(
        &mut self,
        ticker: &str,
        number: i64,
        price: f64,
        on: NaiveDate,
    ) -> Result<(), LedgerError> {
        if number <= 0 || price <= 0.0 {
            return Err(LedgerError::InvalidOrder);
        }

        let held = self.open_shares(ticker);
        if held < number {
            return Err(LedgerError::InsufficientShares {
                ticker: ticker.to_string(),
                requested: number,
                held,
            });
        }

        // FIFO by open date; the stable sort keeps insertion order for lots
        // opened on the same date.
        let mut open_idx: Vec<usize> = (0..self.lots.len())
            .filter(|&i| !self.lots[i].is_closed && self.lots[i].ticker == ticker)
            .collect();
        open_idx.sort_by_key(|&i| self.lots[i].open_date);

        let mut remaining = number;
        for i in open_idx {
            if remaining == 0 {
                break;
            }
            if self.lots[i].number <= remaining {
                let lot = &mut self.lots[i];
                remaining -= lot.number;
                lot.close_price = Some(price);
                lot.close_date = Some(on);
                lot.is_closed = true;
            } else {
                // Split: the sold piece closes, the remainder stays open.
                let mut sold_piece = self.lots[i].clone();
                sold_piece.number = remaining;
                sold_piece.close_price = Some(price);
                sold_piece.close_date = Some(on);
                sold_piece.is_closed = true;

                self.lots[i].number -= remaining;
                self.lots.push(sold_piece);
                remaining = 0;
            }
        }

        self.free_funds += number as f64 * price;
        Ok(())
    }

    /// Cash plus mark-to-market value of every open lot.
    ///
    /// A missing price for any held ticker fails the whole valuation; a
    /// partially priced net worth is never produced.
    pub fn net_worth<F>(&self, price: F) -> Result<f64, LedgerError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let mut total = self.free_funds;
        for lot in self.lots.iter().filter(|l| !l.is_closed) {
            let p = price(&lot.ticker).ok_or_else(|| LedgerError::MissingPrice {
                ticker: lot.ticker.clone(),
            })?;
            total += lot.number as f64 * p;
        }
        Ok(total)
    }

    /// Re-align holdings with `targets`: liquidate every held ticker that
    /// fell out of the target set, then spread the freed cash over targets
    /// not yet held.
    ///
    /// Targets are processed in the given order (selection order). Each new
    /// target is allocated `free_funds / targets_left`, so cash a ticker
    /// cannot spend on whole shares rolls into the allocations of the
    /// tickers after it; the iteration order therefore affects final share
    /// counts and must stay deterministic.
    pub fn rebalance<F>(
        &mut self,
        targets: &[String],
        price: F,
        on: NaiveDate,
    ) -> Result<RebalanceSummary, LedgerError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let target_set: BTreeSet<&str> = targets.iter().map(String::as_str).collect();
        let positions = self.positions();
        let mut summary = RebalanceSummary::default();

        for (ticker, number) in &positions {
            if target_set.contains(ticker.as_str()) {
                continue;
            }
            let p = price(ticker).ok_or_else(|| LedgerError::MissingPrice {
                ticker: ticker.clone(),
            })?;
            self.sell(ticker, *number, p, on)?;
            summary.sold.push((ticker.clone(), *number));
        }

        let new_targets: Vec<&String> = targets
            .iter()
            .filter(|t| !positions.contains_key(t.as_str()))
            .collect();

        let mut targets_left = new_targets.len() as i64;
        for ticker in new_targets {
            let p = price(ticker).ok_or_else(|| LedgerError::MissingPrice {
                ticker: ticker.clone(),
            })?;
            let allocation = self.free_funds / targets_left as f64;
            targets_left -= 1;

            let quantity = (allocation / p).floor() as i64;
            if quantity == 0 {
                continue;
            }
            self.buy(ticker, quantity, p, on)?;
            summary.bought.push((ticker.clone(), quantity));
        }

        Ok(summary)
    }
}
