use anyhow::Context;
use clap::Parser;
use finrank_core::engine::{Engine, EngineOptions};
use finrank_core::ingest::quotes::QuoteClient;
use finrank_core::ingest::screener::{MetricSpec, ScreenerClient};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod universe;

#[derive(Debug, Parser)]
#[command(name = "finrank_worker")]
struct Args {
    /// Market as-of date (YYYY-MM-DD). Defaults to the latest closed US session.
    #[arg(long)]
    as_of_date: Option<String>,

    /// Run the full cycle against live sources but skip all database writes.
    #[arg(long)]
    dry_run: bool,

    /// Number of candidates the portfolio tracks.
    #[arg(long)]
    selection_size: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = finrank_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let as_of_date =
        finrank_core::time::us_market::resolve_as_of_date(args.as_of_date.as_deref(), chrono::Utc::now())?;

    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    finrank_core::storage::migrate(&pool).await?;

    let acquired = finrank_core::storage::lock::try_acquire_as_of_date_lock(&pool, as_of_date).await?;
    if !acquired {
        tracing::warn!(%as_of_date, "as_of_date lock not acquired; another run in progress");
        return Ok(());
    }

    let result = run_cycle(&pool, as_of_date, &args).await;

    let _ = finrank_core::storage::lock::release_as_of_date_lock(&pool, as_of_date).await;
    result
}

async fn run_cycle(pool: &sqlx::PgPool, as_of_date: chrono::NaiveDate, args: &Args) -> anyhow::Result<()> {
    let universe = universe::load_universe(pool).await?;

    let mut options = EngineOptions::from_env();
    if let Some(n) = args.selection_size {
        options.selection_size = n;
    }

    let previous = finrank_core::storage::rankings::load_previous_state(pool, as_of_date).await?;

    let initial_funds = std::env::var("PORTFOLIO_INITIAL_FUNDS")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(100_000.0);
    let mut ledger = finrank_core::storage::portfolio::load_ledger(pool, initial_funds).await?;
    let mut history = finrank_core::storage::portfolio::load_history(pool).await?;

    let engine = Engine::new(
        ScreenerClient::new(MetricSpec::earnings_yield())?,
        ScreenerClient::new(MetricSpec::return_on_equity())?,
        QuoteClient::new()?,
        QuoteClient::new()?,
        options,
    );

    let cycle = engine
        .run_cycle(as_of_date, &universe, &previous, &mut ledger, &mut history)
        .await;

    match cycle {
        Ok(outcome) => {
            if args.dry_run {
                tracing::info!(
                    %as_of_date,
                    dry_run = true,
                    rows = outcome.rows.len(),
                    selected = ?outcome.selected_tickers(),
                    changed = outcome.changed,
                    net_worth = outcome.net_worth,
                    "cycle complete (not persisted)"
                );
                return Ok(());
            }

            let run_id =
                finrank_core::storage::cycles::persist_cycle_success(pool, &outcome, &ledger, &history)
                    .await?;
            tracing::info!(
                %as_of_date,
                %run_id,
                rows = outcome.rows.len(),
                dropped = outcome.dropped_tickers,
                selected = ?outcome.selected_tickers(),
                changed = outcome.changed,
                sold = outcome.rebalance.sold.len(),
                bought = outcome.rebalance.bought.len(),
                net_worth = outcome.net_worth,
                "cycle persisted"
            );
        }
        Err(err) => {
            sentry_anyhow::capture_anyhow(&err);
            if args.dry_run {
                tracing::error!(%as_of_date, error = %err, "cycle failed (dry-run)");
                return Err(err);
            }

            let run_id = finrank_core::storage::cycles::persist_cycle_failure(
                pool,
                as_of_date,
                &format!("{:#}", err),
            )
            .await?;
            tracing::error!(%as_of_date, %run_id, error = %err, "cycle failed; previous state stays effective");
        }
    }

    Ok(())
}

fn init_sentry(settings: &finrank_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
