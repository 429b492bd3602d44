use crate::domain::estimate::EstimateRow;
use crate::domain::ranking::CompositeRow;
use crate::engine::PreviousState;
use anyhow::Context;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

fn upsert_batch_size() -> anyhow::Result<usize> {
    let chunk_size: usize = std::env::var("RANKING_UPSERT_BATCH")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(200);
    anyhow::ensure!(chunk_size >= 1, "RANKING_UPSERT_BATCH must be >= 1");
    Ok(chunk_size)
}

/// Write one cycle's merged ranking. Re-running a cycle for the same date
/// overwrites its rows.
pub async fn persist_ranking_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    as_of_date: NaiveDate,
    rows: &[EstimateRow],
    selected: &BTreeSet<String>,
) -> anyhow::Result<u64> {
    anyhow::ensure!(!rows.is_empty(), "ranking rows must be non-empty");

    let mut affected: u64 = 0;
    for chunk in rows.chunks(upsert_batch_size()?) {
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO ranking_rows (as_of_date, ticker, ep_rank, ep_value, roe_rank, roe_value, \
             summary_rank, rating, low_target, current_price, avg_target, high_target, selected) ",
        );
        qb.push_values(chunk, |mut b, row| {
            let c = &row.composite;
            let e = row.estimate.as_ref();
            b.push_bind(as_of_date)
                .push_bind(&c.ticker)
                .push_bind(c.metric_a_rank)
                .push_bind(c.metric_a_value)
                .push_bind(c.metric_b_rank)
                .push_bind(c.metric_b_value)
                .push_bind(c.summary_rank)
                .push_bind(e.map(|e| e.rating))
                .push_bind(e.map(|e| e.low_target))
                .push_bind(e.map(|e| e.current_price))
                .push_bind(e.map(|e| e.avg_target))
                .push_bind(e.map(|e| e.high_target))
                .push_bind(selected.contains(&c.ticker));
        });
        qb.push(
            " ON CONFLICT (as_of_date, ticker) DO UPDATE \
               SET ep_rank = EXCLUDED.ep_rank, ep_value = EXCLUDED.ep_value, \
                   roe_rank = EXCLUDED.roe_rank, roe_value = EXCLUDED.roe_value, \
                   summary_rank = EXCLUDED.summary_rank, rating = EXCLUDED.rating, \
                   low_target = EXCLUDED.low_target, current_price = EXCLUDED.current_price, \
                   avg_target = EXCLUDED.avg_target, high_target = EXCLUDED.high_target, \
                   selected = EXCLUDED.selected",
        );

        let res = qb
            .build()
            .persistent(false)
            .execute(&mut **tx)
            .await
            .context("batch upsert ranking_rows failed")?;
        affected += res.rows_affected();
    }

    Ok(affected)
}

/// Refresh the latest-known per-ticker snapshot behind the share-info API.
/// Only rows that actually carry estimates touch the table.
pub async fn upsert_share_info(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    as_of_date: NaiveDate,
    rows: &[EstimateRow],
) -> anyhow::Result<u64> {
    let priced: Vec<&EstimateRow> = rows.iter().filter(|r| r.estimate.is_some()).collect();
    if priced.is_empty() {
        return Ok(0);
    }

    let mut affected: u64 = 0;
    for chunk in priced.chunks(upsert_batch_size()?) {
        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO share_info (ticker, price, ep, roe, rating, low_target, avg_target, \
             high_target, as_of_date) ",
        );
        qb.push_values(chunk, |mut b, row| {
            // Filtered to estimate-bearing rows above.
            let e = row.estimate.as_ref().expect("estimate present");
            b.push_bind(row.ticker())
                .push_bind(e.current_price)
                .push_bind(row.composite.metric_a_value)
                .push_bind(row.composite.metric_b_value)
                .push_bind(e.rating)
                .push_bind(e.low_target)
                .push_bind(e.avg_target)
                .push_bind(e.high_target)
                .push_bind(as_of_date);
        });
        qb.push(
            " ON CONFLICT (ticker) DO UPDATE \
               SET price = EXCLUDED.price, ep = EXCLUDED.ep, roe = EXCLUDED.roe, \
                   rating = EXCLUDED.rating, low_target = EXCLUDED.low_target, \
                   avg_target = EXCLUDED.avg_target, high_target = EXCLUDED.high_target, \
                   as_of_date = EXCLUDED.as_of_date",
        );

        let res = qb
            .build()
            .persistent(false)
            .execute(&mut **tx)
            .await
            .context("batch upsert share_info failed")?;
        affected += res.rows_affected();
    }

    Ok(affected)
}

/// Load the most recent persisted cycle strictly before `as_of_date`: its
/// composite ranking (carry-forward input) and its candidate set (change
/// detection input). First ever cycle gets an empty state.
pub async fn load_previous_state(
    pool: &sqlx::PgPool,
    as_of_date: NaiveDate,
) -> anyhow::Result<PreviousState> {
    let prev_date: Option<(Option<NaiveDate>,)> =
        sqlx::query_as("SELECT MAX(as_of_date) FROM ranking_rows WHERE as_of_date < $1")
            .persistent(false)
            .bind(as_of_date)
            .fetch_optional(pool)
            .await
            .context("select previous ranking date failed")?;

    let Some((Some(prev_date),)) = prev_date else {
        return Ok(PreviousState::default());
    };

    let rows = sqlx::query_as::<
        _,
        (String, i32, Option<f64>, i32, Option<f64>, i32, bool),
    >(
        "SELECT ticker, ep_rank, ep_value, roe_rank, roe_value, summary_rank, selected \
         FROM ranking_rows \
         WHERE as_of_date = $1",
    )
    .persistent(false)
    .bind(prev_date)
    .fetch_all(pool)
    .await
    .context("select previous ranking rows failed")?;

    let mut ranking = BTreeMap::new();
    let mut selected = BTreeSet::new();
    for (ticker, ep_rank, ep_value, roe_rank, roe_value, summary_rank, was_selected) in rows {
        if was_selected {
            selected.insert(ticker.clone());
        }
        ranking.insert(
            ticker.clone(),
            CompositeRow {
                ticker,
                metric_a_rank: ep_rank,
                metric_a_value: ep_value,
                metric_b_rank: roe_rank,
                metric_b_value: roe_value,
                summary_rank,
            },
        );
    }

    tracing::debug!(
        %prev_date,
        rows = ranking.len(),
        selected = selected.len(),
        "previous cycle state loaded"
    );

    Ok(PreviousState { ranking, selected })
}
