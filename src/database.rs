// Database connection pool and schema management
use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;

/// Create a connection pool sized from configuration.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    info!(
        max = config.max_connections,
        min = config.min_connections,
        "connecting to PostgreSQL"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;

    Ok(pool)
}

/// Create the wallet tables and indexes if they do not exist.
///
/// The CHECK constraints on the balance tiers are load-bearing: balance
/// updates use unclamped server-side arithmetic and rely on the database to
/// turn underflow into a commit-time failure.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS v2_players (
            id UUID PRIMARY KEY,
            balance NUMERIC(15,0) NOT NULL DEFAULT 0 CHECK (balance >= 0),
            bonus_balance NUMERIC(15,0) NOT NULL DEFAULT 0 CHECK (bonus_balance >= 0),
            reserved_balance NUMERIC(15,0) NOT NULL DEFAULT 0 CHECK (reserved_balance >= 0),
            currency TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS v2_transactions (
            id UUID PRIMARY KEY,
            player_id UUID NOT NULL REFERENCES v2_players(id),
            type TEXT NOT NULL,
            amount NUMERIC(15,0) NOT NULL,
            balance_after NUMERIC(15,0) NOT NULL,
            bonus_balance_after NUMERIC(15,0) NOT NULL,
            reserved_balance_after NUMERIC(15,0) NOT NULL,
            external_transaction_id TEXT,
            manufacturer_id TEXT NOT NULL DEFAULT '',
            sub_transaction_id TEXT NOT NULL DEFAULT '',
            target_transaction_id UUID,
            game_round_id TEXT,
            metadata JSONB NOT NULL DEFAULT '{}',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // The idempotency safety net: a lost race past the probe fails here.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_idempotency_key
        ON v2_transactions(player_id, manufacturer_id, external_transaction_id, sub_transaction_id)
        WHERE external_transaction_id IS NOT NULL
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Keyset pagination for player history.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_transactions_player_created
        ON v2_transactions(player_id, created_at DESC, id DESC)
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_transactions_game_round
        ON v2_transactions(player_id, game_round_id)
        WHERE game_round_id IS NOT NULL
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_outbox (
            id BIGSERIAL PRIMARY KEY,
            event_id UUID NOT NULL UNIQUE,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            headers JSONB NOT NULL DEFAULT '{}',
            payload JSONB NOT NULL,
            occurred_at TIMESTAMPTZ NOT NULL,
            published_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_event_outbox_unpublished
        ON event_outbox(id)
        WHERE published_at IS NULL
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!("wallet schema ready");
    Ok(())
}
