use anyhow::Context;

pub mod cycles;
pub mod lock;
pub mod portfolio;
pub mod rankings;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}
