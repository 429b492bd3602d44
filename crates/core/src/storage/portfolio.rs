use crate::portfolio::history::ValuationHistory;
use crate::portfolio::ledger::{Ledger, SharesLot};
use anyhow::Context;
use chrono::NaiveDate;
use std::collections::BTreeMap;

// The application tracks exactly one simulated portfolio.
const PORTFOLIO_ID: i32 = 1;

/// Load the persisted ledger, or start a fresh one with
/// `default_initial_funds` on first run.
pub async fn load_ledger(
    pool: &sqlx::PgPool,
    default_initial_funds: f64,
) -> anyhow::Result<Ledger> {
    let funds: Option<(f64, f64)> =
        sqlx::query_as("SELECT initial_funds, free_funds FROM portfolio WHERE id = $1")
            .persistent(false)
            .bind(PORTFOLIO_ID)
            .fetch_optional(pool)
            .await
            .context("select portfolio failed")?;

    let Some((initial_funds, free_funds)) = funds else {
        tracing::info!(initial_funds = default_initial_funds, "no persisted portfolio; starting fresh");
        return Ok(Ledger::new(default_initial_funds));
    };

    let rows = sqlx::query_as::<
        _,
        (
            String,
            i64,
            f64,
            NaiveDate,
            Option<f64>,
            Option<NaiveDate>,
            bool,
        ),
    >(
        "SELECT ticker, number, open_price, open_date, close_price, close_date, is_closed \
         FROM portfolio_lots \
         ORDER BY seq ASC",
    )
    .persistent(false)
    .fetch_all(pool)
    .await
    .context("select portfolio lots failed")?;

    let lots: Vec<SharesLot> = rows
        .into_iter()
        .map(
            |(ticker, number, open_price, open_date, close_price, close_date, is_closed)| {
                SharesLot {
                    ticker,
                    number,
                    open_price,
                    open_date,
                    close_price,
                    close_date,
                    is_closed,
                }
            },
        )
        .collect();

    Ledger::from_parts(initial_funds, free_funds, lots).context("persisted ledger is inconsistent")
}

/// Rewrite the ledger's persisted state. Lots are few and closed ones never
/// change again, so a whole-state rewrite inside the cycle transaction beats
/// per-lot diffing.
pub async fn save_ledger(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ledger: &Ledger,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO portfolio (id, initial_funds, free_funds) VALUES ($1, $2, $3) \
         ON CONFLICT (id) DO UPDATE \
         SET initial_funds = EXCLUDED.initial_funds, free_funds = EXCLUDED.free_funds",
    )
    .persistent(false)
    .bind(PORTFOLIO_ID)
    .bind(ledger.initial_funds())
    .bind(ledger.free_funds())
    .execute(&mut **tx)
    .await
    .context("upsert portfolio failed")?;

    sqlx::query("DELETE FROM portfolio_lots")
        .persistent(false)
        .execute(&mut **tx)
        .await
        .context("clear portfolio_lots failed")?;

    if ledger.lots().is_empty() {
        return Ok(());
    }

    let mut qb = sqlx::QueryBuilder::new(
        "INSERT INTO portfolio_lots (seq, ticker, number, open_price, open_date, close_price, \
         close_date, is_closed) ",
    );
    qb.push_values(ledger.lots().iter().enumerate(), |mut b, (seq, lot)| {
        b.push_bind(seq as i64)
            .push_bind(&lot.ticker)
            .push_bind(lot.number)
            .push_bind(lot.open_price)
            .push_bind(lot.open_date)
            .push_bind(lot.close_price)
            .push_bind(lot.close_date)
            .push_bind(lot.is_closed);
    });

    qb.build()
        .persistent(false)
        .execute(&mut **tx)
        .await
        .context("insert portfolio_lots failed")?;

    Ok(())
}

pub async fn load_history(pool: &sqlx::PgPool) -> anyhow::Result<ValuationHistory> {
    let rows: Vec<(NaiveDate, f64)> =
        sqlx::query_as("SELECT valued_on, net_worth FROM valuation_history ORDER BY valued_on ASC")
            .persistent(false)
            .fetch_all(pool)
            .await
            .context("select valuation_history failed")?;

    let entries: BTreeMap<NaiveDate, f64> = rows.into_iter().collect();
    Ok(ValuationHistory::from_entries(entries))
}

/// Upsert every in-memory entry; existing dates are overwritten, none are
/// deleted (the history never shrinks).
pub async fn save_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    history: &ValuationHistory,
) -> anyhow::Result<()> {
    if history.is_empty() {
        return Ok(());
    }

    let entries: Vec<(NaiveDate, f64)> = history.entries().iter().map(|(d, v)| (*d, *v)).collect();
    for chunk in entries.chunks(200) {
        let mut qb = sqlx::QueryBuilder::new("INSERT INTO valuation_history (valued_on, net_worth) ");
        qb.push_values(chunk, |mut b, (valued_on, net_worth)| {
            b.push_bind(*valued_on).push_bind(*net_worth);
        });
        qb.push(" ON CONFLICT (valued_on) DO UPDATE SET net_worth = EXCLUDED.net_worth");

        qb.build()
            .persistent(false)
            .execute(&mut **tx)
            .await
            .context("batch upsert valuation_history failed")?;
    }

    Ok(())
}
