use anyhow::Context;
use std::collections::BTreeSet;

/// Load the whitelist of tickers eligible for ranking and selection.
///
/// `WHITELIST_PATH` (one ticker per line, `#` comments) takes precedence;
/// otherwise the `universe_tickers` table is authoritative.
pub async fn load_universe(pool: &sqlx::PgPool) -> anyhow::Result<BTreeSet<String>> {
    if let Ok(path) = std::env::var("WHITELIST_PATH") {
        let universe = load_universe_file(&path)?;
        tracing::info!(%path, size = universe.len(), "universe loaded from whitelist file");
        return Ok(universe);
    }

    let universe = load_universe_db(pool).await?;
    tracing::info!(size = universe.len(), "universe loaded from database");
    Ok(universe)
}

pub async fn load_universe_db(pool: &sqlx::PgPool) -> anyhow::Result<BTreeSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT ticker FROM universe_tickers")
        .persistent(false)
        .fetch_all(pool)
        .await
        .context("select universe_tickers failed")?;

    let universe = normalize(rows.into_iter().map(|(t,)| t));
    anyhow::ensure!(
        !universe.is_empty(),
        "universe_tickers is empty; seed it or set WHITELIST_PATH"
    );
    Ok(universe)
}

pub fn load_universe_file(path: &str) -> anyhow::Result<BTreeSet<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read whitelist file {path}"))?;

    let universe = normalize(content.lines().map(str::to_string));
    anyhow::ensure!(!universe.is_empty(), "whitelist file {path} has no tickers");
    Ok(universe)
}

fn normalize(tickers: impl Iterator<Item = String>) -> BTreeSet<String> {
    tickers
        .map(|t| t.trim().to_ascii_uppercase())
        .filter(|t| !t.is_empty() && !t.starts_with('#'))
        .collect()
}
