//! Deterministic replay harness: executes an ordered command sequence, each
//! command in its own DB transaction, then verifies the four ledger
//! invariants against the final state. Per-command failures are aggregated
//! without masking.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::WalletResult;
use crate::ledger::{self, TierSplit, WinType};
use crate::repo::{ExternalRef, LedgerTransaction, Player, TransactionRepo};
use crate::with_wallet_tx;

pub const MANUFACTURER_REPLAY: &str = "replay";

/// One step of a replay sequence. `CancelTransaction` targets the entry
/// produced by an earlier successful step, by its position in the sequence of
/// successes, so sequences stay self-contained.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayCommand {
    Deposit {
        amount: i64,
        external_id: Option<String>,
    },
    PlaceBet {
        amount: i64,
        external_id: Option<String>,
        game_round_id: Option<String>,
    },
    CreditWin {
        amount: i64,
        external_id: Option<String>,
        split: Option<TierSplit>,
        game_round_id: Option<String>,
    },
    Withdraw {
        amount: i64,
        external_id: Option<String>,
    },
    CompleteWithdrawal {
        amount: i64,
        external_id: Option<String>,
    },
    BonusCredit {
        amount: i64,
        external_id: Option<String>,
    },
    TurnBonusToReal {
        amount: i64,
        external_id: Option<String>,
    },
    ForfeitBonus {
        amount: i64,
        is_bonus_lost: bool,
        external_id: Option<String>,
    },
    CancelTransaction {
        target_index: usize,
        external_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct ReplayFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct InvariantChecks {
    pub balances_non_negative: bool,
    pub ledger_parity: bool,
    pub transaction_count: bool,
    pub outbox_parity: bool,
}

impl InvariantChecks {
    pub fn all_hold(&self) -> bool {
        self.balances_non_negative
            && self.ledger_parity
            && self.transaction_count
            && self.outbox_parity
    }
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub executed: usize,
    pub succeeded: usize,
    pub idempotent_hits: usize,
    pub failures: Vec<ReplayFailure>,
    pub checks: InvariantChecks,
    pub player: Player,
}

pub struct ReplayRunner {
    pool: PgPool,
    daily_withdrawal_cap: i64,
}

impl ReplayRunner {
    pub fn new(pool: PgPool, daily_withdrawal_cap: i64) -> Self {
        Self { pool, daily_withdrawal_cap }
    }

    pub async fn run(
        &self,
        player_id: Uuid,
        commands: &[ReplayCommand],
    ) -> WalletResult<ReplayReport> {
        let transactions_before = count_transactions(&self.pool, player_id).await?;
        let outbox_before = count_outbox_events(&self.pool, player_id).await?;

        let mut posted: Vec<LedgerTransaction> = Vec::new();
        let mut new_entries: i64 = 0;
        let mut idempotent_hits = 0;
        let mut failures = Vec::new();

        for (index, command) in commands.iter().enumerate() {
            let pool = self.pool.clone();
            let result = with_wallet_tx!(&pool, tx, {
                self.execute(&mut tx, player_id, command, &posted).await
            });

            match result {
                Ok(outcome) => {
                    if outcome.idempotent {
                        idempotent_hits += 1;
                    } else {
                        new_entries += 1;
                    }
                    posted.push(outcome.transaction);
                }
                Err(e) => failures.push(ReplayFailure {
                    index,
                    error: e.to_string(),
                }),
            }
        }

        // Final verification: re-lock the player and read the latest entry.
        let pool = self.pool.clone();
        let (player, latest) = with_wallet_tx!(&pool, tx, {
            let player = ledger::lock_player(&mut tx, player_id).await?;
            let latest = TransactionRepo::find_latest(&mut tx, player_id).await?;
            Ok((player, latest))
        })?;

        let transactions_after = count_transactions(&self.pool, player_id).await?;
        let outbox_after = count_outbox_events(&self.pool, player_id).await?;

        let balances_non_negative =
            player.balance >= 0 && player.bonus_balance >= 0 && player.reserved_balance >= 0;
        let ledger_parity = match &latest {
            Some(entry) => {
                entry.balance_after == player.balance
                    && entry.bonus_balance_after == player.bonus_balance
                    && entry.reserved_balance_after == player.reserved_balance
            }
            None => transactions_after == 0,
        };
        let transaction_count = transactions_after - transactions_before == new_entries;
        let outbox_parity = outbox_after - outbox_before == new_entries;

        Ok(ReplayReport {
            executed: commands.len(),
            succeeded: posted.len(),
            idempotent_hits,
            failures,
            checks: InvariantChecks {
                balances_non_negative,
                ledger_parity,
                transaction_count,
                outbox_parity,
            },
            player,
        })
    }

    async fn execute(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        player_id: Uuid,
        command: &ReplayCommand,
        posted: &[LedgerTransaction],
    ) -> WalletResult<ledger::CommandOutcome> {
        let external = |id: &Option<String>| {
            id.as_ref()
                .map(|ext| ExternalRef::new(MANUFACTURER_REPLAY, ext.clone()))
        };

        match command {
            ReplayCommand::Deposit { amount, external_id } => {
                ledger::deposit(tx, player_id, *amount, external(external_id)).await
            }
            ReplayCommand::PlaceBet {
                amount,
                external_id,
                game_round_id,
            } => {
                ledger::place_bet(
                    tx,
                    player_id,
                    *amount,
                    external(external_id),
                    game_round_id.clone(),
                    None,
                )
                .await
            }
            ReplayCommand::CreditWin {
                amount,
                external_id,
                split,
                game_round_id,
            } => {
                ledger::credit_win(
                    tx,
                    player_id,
                    *amount,
                    *split,
                    WinType::Normal,
                    external(external_id),
                    game_round_id.clone(),
                    None,
                )
                .await
            }
            ReplayCommand::Withdraw { amount, external_id } => {
                ledger::withdraw(
                    tx,
                    player_id,
                    *amount,
                    external(external_id),
                    self.daily_withdrawal_cap,
                )
                .await
            }
            ReplayCommand::CompleteWithdrawal { amount, external_id } => {
                ledger::complete_withdrawal(tx, player_id, *amount, external(external_id)).await
            }
            ReplayCommand::BonusCredit { amount, external_id } => {
                ledger::bonus_credit(tx, player_id, *amount, external(external_id), None).await
            }
            ReplayCommand::TurnBonusToReal { amount, external_id } => {
                ledger::turn_bonus_to_real(tx, player_id, *amount, external(external_id)).await
            }
            ReplayCommand::ForfeitBonus {
                amount,
                is_bonus_lost,
                external_id,
            } => {
                ledger::forfeit_bonus(
                    tx,
                    player_id,
                    *amount,
                    *is_bonus_lost,
                    external(external_id),
                )
                .await
            }
            ReplayCommand::CancelTransaction {
                target_index,
                external_id,
            } => {
                let target = posted.get(*target_index).ok_or_else(|| {
                    crate::error::WalletError::validation(format!(
                        "cancel target index {target_index} out of range"
                    ))
                })?;
                ledger::cancel_transaction(tx, player_id, target.id, external(external_id)).await
            }
        }
    }
}

async fn count_transactions(pool: &PgPool, player_id: Uuid) -> WalletResult<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM v2_transactions WHERE player_id = $1")
            .bind(player_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

async fn count_outbox_events(pool: &PgPool, player_id: Uuid) -> WalletResult<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM event_outbox WHERE partition_key = $1")
            .bind(player_id.to_string())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_through_serde() {
        let commands = vec![
            ReplayCommand::Deposit {
                amount: 50_000,
                external_id: Some("d1".to_string()),
            },
            ReplayCommand::PlaceBet {
                amount: 20_000,
                external_id: Some("b1".to_string()),
                game_round_id: Some("round-1".to_string()),
            },
            ReplayCommand::CancelTransaction {
                target_index: 1,
                external_id: None,
            },
        ];
        let json = serde_json::to_string(&commands).unwrap();
        let parsed: Vec<ReplayCommand> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 3);
        assert!(json.contains(r#""type":"deposit""#));
        assert!(json.contains(r#""type":"cancel_transaction""#));
    }

    #[test]
    fn empty_checks_hold() {
        let checks = InvariantChecks {
            balances_non_negative: true,
            ledger_parity: true,
            transaction_count: true,
            outbox_parity: true,
        };
        assert!(checks.all_hold());
    }
}
