use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

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

    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match finrank_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let state = AppState { pool };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/rankings/latest", get(get_latest_ranking))
        .route("/rankings/:as_of_date", get(get_ranking_by_date))
        .route("/shares/:ticker", get(get_share_info))
        .route("/portfolio", get(get_portfolio))
        .route("/portfolio/profitability", get(get_profitability))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Clone)]
struct AppState {
    pool: Option<PgPool>,
}

impl AppState {
    fn pool(&self) -> Result<&PgPool, StatusCode> {
        self.pool.as_ref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

fn internal(e: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&e);
    StatusCode::INTERNAL_SERVER_ERROR
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct ApiRankingRow {
    ticker: String,
    ep_rank: i32,
    ep_value: Option<f64>,
    roe_rank: i32,
    roe_value: Option<f64>,
    summary_rank: i32,
    rating: Option<f64>,
    low_target: Option<f64>,
    current_price: Option<f64>,
    avg_target: Option<f64>,
    high_target: Option<f64>,
    selected: bool,
}

#[derive(Debug, Serialize)]
struct ApiRanking {
    as_of_date: NaiveDate,
    rows: Vec<ApiRankingRow>,
}

async fn get_latest_ranking(State(state): State<AppState>) -> Result<Json<ApiRanking>, StatusCode> {
    let pool = state.pool()?;

    let as_of_date = latest_success_date(pool)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let rows = fetch_ranking_rows(pool, as_of_date).await.map_err(internal)?;
    Ok(Json(ApiRanking { as_of_date, rows }))
}

async fn get_ranking_by_date(
    State(state): State<AppState>,
    Path(as_of_date): Path<String>,
) -> Result<Json<ApiRanking>, StatusCode> {
    let pool = state.pool()?;

    let as_of_date =
        NaiveDate::parse_from_str(&as_of_date, "%Y-%m-%d").map_err(|_| StatusCode::BAD_REQUEST)?;

    let rows = fetch_ranking_rows(pool, as_of_date).await.map_err(internal)?;
    if rows.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(ApiRanking { as_of_date, rows }))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct ApiShareInfo {
    ticker: String,
    price: f64,
    ep: Option<f64>,
    roe: Option<f64>,
    rating: f64,
    low_target: f64,
    avg_target: f64,
    high_target: f64,
    as_of_date: NaiveDate,
}

async fn get_share_info(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<ApiShareInfo>, StatusCode> {
    let pool = state.pool()?;
    let ticker = ticker.trim().to_ascii_uppercase();

    let info = sqlx::query_as::<_, ApiShareInfo>(
        "SELECT ticker, price, ep, roe, rating, low_target, avg_target, high_target, as_of_date \
         FROM share_info \
         WHERE ticker = $1",
    )
    .bind(&ticker)
    .fetch_optional(pool)
    .await
    .map_err(|e| internal(anyhow::Error::new(e)))?
    .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(info))
}

#[derive(Debug, Serialize)]
struct ApiValuation {
    valued_on: NaiveDate,
    net_worth: f64,
}

#[derive(Debug, Serialize)]
struct ApiPortfolio {
    initial_funds: f64,
    free_funds: f64,
    positions: BTreeMap<String, i64>,
    open_lots: usize,
    closed_lots: usize,
    latest_valuation: Option<ApiValuation>,
    total_profitability: Option<f64>,
}

async fn get_portfolio(State(state): State<AppState>) -> Result<Json<ApiPortfolio>, StatusCode> {
    let pool = state.pool()?;

    let initial_funds = default_initial_funds();
    let ledger = finrank_core::storage::portfolio::load_ledger(pool, initial_funds)
        .await
        .map_err(internal)?;
    let history = finrank_core::storage::portfolio::load_history(pool)
        .await
        .map_err(internal)?;

    let open_lots = ledger.lots().iter().filter(|l| !l.is_closed).count();
    let closed_lots = ledger.lots().len() - open_lots;

    Ok(Json(ApiPortfolio {
        initial_funds: ledger.initial_funds(),
        free_funds: ledger.free_funds(),
        positions: ledger.positions(),
        open_lots,
        closed_lots,
        latest_valuation: history
            .latest()
            .map(|(valued_on, net_worth)| ApiValuation { valued_on, net_worth }),
        total_profitability: history.total_profitability(ledger.initial_funds()).ok(),
    }))
}

#[derive(Debug, Deserialize)]
struct ProfitabilityParams {
    from: String,
    to: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiProfitability {
    from: NaiveDate,
    to: NaiveDate,
    profitability: f64,
}

async fn get_profitability(
    State(state): State<AppState>,
    Query(params): Query<ProfitabilityParams>,
) -> Result<Json<ApiProfitability>, StatusCode> {
    let pool = state.pool()?;

    let from = NaiveDate::parse_from_str(&params.from, "%Y-%m-%d")
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let history = finrank_core::storage::portfolio::load_history(pool)
        .await
        .map_err(internal)?;

    let to = match &params.to {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| StatusCode::BAD_REQUEST)?,
        None => history.latest().ok_or(StatusCode::NOT_FOUND)?.0,
    };

    let profitability = history
        .range_profitability(from, to)
        .map_err(|_| StatusCode::NOT_FOUND)?;

    Ok(Json(ApiProfitability {
        from,
        to,
        profitability,
    }))
}

async fn latest_success_date(pool: &PgPool) -> anyhow::Result<Option<NaiveDate>> {
    let row: Option<(NaiveDate,)> = sqlx::query_as(
        "SELECT as_of_date \
         FROM cycle_runs \
         WHERE status = 'success' \
         ORDER BY as_of_date DESC, generated_at DESC \
         LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(d,)| d))
}

async fn fetch_ranking_rows(
    pool: &PgPool,
    as_of_date: NaiveDate,
) -> anyhow::Result<Vec<ApiRankingRow>> {
    let rows = sqlx::query_as::<_, ApiRankingRow>(
        "SELECT ticker, ep_rank, ep_value, roe_rank, roe_value, summary_rank, \
                rating, low_target, current_price, avg_target, high_target, selected \
         FROM ranking_rows \
         WHERE as_of_date = $1 \
         ORDER BY summary_rank ASC, ticker ASC",
    )
    .bind(as_of_date)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

fn default_initial_funds() -> f64 {
    std::env::var("PORTFOLIO_INITIAL_FUNDS")
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(100_000.0)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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
