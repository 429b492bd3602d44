use crate::engine::CycleOutcome;
use crate::portfolio::history::ValuationHistory;
use crate::portfolio::ledger::Ledger;
use crate::storage::{portfolio, rankings};
use anyhow::Context;
use chrono::NaiveDate;
use uuid::Uuid;

/// Persist everything one successful cycle produced in a single
/// transaction: run record, ranking rows, share info, ledger, valuation
/// history. Either all of it lands or none of it does.
pub async fn persist_cycle_success(
    pool: &sqlx::PgPool,
    outcome: &CycleOutcome,
    ledger: &Ledger,
    history: &ValuationHistory,
) -> anyhow::Result<Uuid> {
    let mut tx = pool.begin().await.context("begin transaction failed")?;

    let run_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO cycle_runs (id, as_of_date, generated_at, status, error, selection_changed, net_worth) \
         VALUES ($1, $2, $3, 'success', NULL, $4, $5)",
    )
    .persistent(false)
    .bind(run_id)
    .bind(outcome.as_of_date)
    .bind(chrono::Utc::now())
    .bind(outcome.changed)
    .bind(outcome.net_worth)
    .execute(&mut *tx)
    .await
    .context("insert cycle_runs failed")?;

    let selected = outcome.selected_tickers();
    rankings::persist_ranking_rows(&mut tx, outcome.as_of_date, &outcome.rows, &selected).await?;
    rankings::upsert_share_info(&mut tx, outcome.as_of_date, &outcome.rows).await?;
    portfolio::save_ledger(&mut tx, ledger).await?;
    portfolio::save_history(&mut tx, history).await?;

    tx.commit().await.context("commit transaction failed")?;
    Ok(run_id)
}

/// Record a failed cycle. Nothing else is written; the previously persisted
/// ranking, ledger and history stay authoritative.
pub async fn persist_cycle_failure(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
    error: &str,
) -> anyhow::Result<Uuid> {
    let run_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO cycle_runs (id, as_of_date, generated_at, status, error, selection_changed, net_worth) \
         VALUES ($1, $2, $3, 'error', $4, NULL, NULL)",
    )
    .persistent(false)
    .bind(run_id)
    .bind(as_of_date)
    .bind(chrono::Utc::now())
    .bind(error)
    .execute(pool)
    .await
    .context("insert error cycle_runs failed")?;

    Ok(run_id)
}
