//! Binary entry point for the replay harness.
//! Run with: cargo run --bin replay
//!
//! Seeds a player, executes a deterministic command sequence (including
//! idempotent replays and a cancellation), and prints the invariant report.

use anyhow::Result;
use uuid::Uuid;
use wallet_engine::config::{Config, DatabaseConfig};
use wallet_engine::database;
use wallet_engine::money::format_cents;
use wallet_engine::replay::{ReplayCommand, ReplayRunner};
use wallet_engine::repo::PlayerRepo;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("info,wallet_engine=debug")
        .init();

    println!("Wallet Engine Replay Harness");
    println!("============================\n");

    let db_config = DatabaseConfig {
        url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| DatabaseConfig::default().url),
        ..DatabaseConfig::default()
    };
    let policy = Config::default().policy;

    println!("Connecting to database: {}", db_config.url);
    let pool = database::create_pool(&db_config).await?;
    database::init_schema(&pool).await?;

    let player = PlayerRepo::create(&pool, Uuid::new_v4(), "EUR").await?;
    println!("Seeded player {}\n", player.id);

    let commands = vec![
        ReplayCommand::Deposit { amount: 100_000, external_id: Some("seed".into()) },
        ReplayCommand::Deposit { amount: 50_000, external_id: Some("d1".into()) },
        // replayed: must hit the cached entry, not post a second one
        ReplayCommand::Deposit { amount: 50_000, external_id: Some("d1".into()) },
        ReplayCommand::BonusCredit { amount: 10_000, external_id: Some("bc1".into()) },
        ReplayCommand::PlaceBet {
            amount: 30_000,
            external_id: Some("b1".into()),
            game_round_id: Some("round-1".into()),
        },
        ReplayCommand::CreditWin {
            amount: 45_000,
            external_id: Some("w1".into()),
            split: None,
            game_round_id: Some("round-1".into()),
        },
        ReplayCommand::Withdraw { amount: 40_000, external_id: Some("wd1".into()) },
        ReplayCommand::CompleteWithdrawal { amount: 40_000, external_id: Some("wdc1".into()) },
        // reverse the bet (index 4 in the success list): restores the split
        ReplayCommand::CancelTransaction { target_index: 4, external_id: Some("cx1".into()) },
        // rejected: zero amount
        ReplayCommand::Deposit { amount: 0, external_id: None },
    ];

    let runner = ReplayRunner::new(pool.clone(), policy.daily_withdrawal_cap);
    let report = runner.run(player.id, &commands).await?;

    println!("Executed:        {}", report.executed);
    println!("Succeeded:       {}", report.succeeded);
    println!("Idempotent hits: {}", report.idempotent_hits);
    for failure in &report.failures {
        println!("  command {} failed: {}", failure.index, failure.error);
    }
    println!();
    println!("Final balances for {}:", report.player.id);
    println!("  balance:  {}", format_cents(report.player.balance));
    println!("  bonus:    {}", format_cents(report.player.bonus_balance));
    println!("  reserved: {}", format_cents(report.player.reserved_balance));
    println!();
    println!("Invariant checks:");
    println!("  balances non-negative: {}", report.checks.balances_non_negative);
    println!("  ledger parity:         {}", report.checks.ledger_parity);
    println!("  transaction count:     {}", report.checks.transaction_count);
    println!("  outbox parity:         {}", report.checks.outbox_parity);

    if report.checks.all_hold() {
        println!("\nAll invariants hold.");
        Ok(())
    } else {
        anyhow::bail!("invariant violation detected")
    }
}
