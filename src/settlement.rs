//! Settlement composers: thin orchestrators that translate casino-round,
//! sportsbook, prediction-market and gamification events into ledger
//! commands, each flow inside a single DB transaction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::config::RewardConfig;
use crate::error::{WalletError, WalletResult};
use crate::ledger::{self, CommandOutcome, TierSplit, TransactionType, WinType};
use crate::repo::{BalanceDelta, ExternalRef, NewTransaction, TransactionRepo};

pub const MANUFACTURER_CASINO: &str = "casino";
pub const MANUFACTURER_SPORTSBOOK: &str = "sportsbook";
pub const MANUFACTURER_PREDICTION: &str = "prediction";
pub const MANUFACTURER_GAMIFICATION: &str = "gamification";

// ---------------------------------------------------------------------------
// Shared: zero-amount settlement markers
// ---------------------------------------------------------------------------

/// Post a zero-amount `settlement_loss` marker through the engine primitives.
/// The nine public commands all require a positive amount, so markers take
/// this path.
async fn post_settlement_marker(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    external: ExternalRef,
    game_round_id: Option<String>,
    metadata: Value,
) -> WalletResult<CommandOutcome> {
    let player = ledger::lock_player(tx, player_id).await?;
    if let Some(prior) = ledger::find_existing(tx, player_id, &external).await? {
        return Ok(CommandOutcome {
            transaction: prior,
            player,
            events: vec![],
            idempotent: true,
        });
    }

    let (transaction, player, draft) = ledger::post_entry(
        tx,
        BalanceDelta::default(),
        NewTransaction {
            player_id,
            kind: TransactionType::SettlementLoss,
            amount: 0,
            external: Some(external),
            target_transaction_id: None,
            game_round_id,
            metadata,
        },
    )
    .await?;

    Ok(CommandOutcome {
        transaction,
        player,
        events: vec![draft],
        idempotent: false,
    })
}

// ---------------------------------------------------------------------------
// Casino rounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RoundSummary {
    pub game_round_id: String,
    pub bets_total: i64,
    pub wins_total: i64,
    pub net: i64,
    pub entry_count: usize,
}

/// Aggregate every bet/win entry of a game round.
pub async fn get_round_summary(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    game_round_id: &str,
) -> WalletResult<RoundSummary> {
    let entries = TransactionRepo::list_by_game_round(tx, player_id, game_round_id).await?;

    let mut bets_total = 0;
    let mut wins_total = 0;
    let mut entry_count = 0;
    for entry in &entries {
        match entry.kind {
            TransactionType::Bet => {
                bets_total += entry.amount;
                entry_count += 1;
            }
            TransactionType::Win => {
                wins_total += entry.amount;
                entry_count += 1;
            }
            _ => {}
        }
    }

    Ok(RoundSummary {
        game_round_id: game_round_id.to_string(),
        bets_total,
        wins_total,
        net: wins_total - bets_total,
        entry_count,
    })
}

/// Record that a round settled as a loss (no payout); a zero-amount marker.
pub async fn settle_round_loss(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    game_round_id: &str,
) -> WalletResult<CommandOutcome> {
    post_settlement_marker(
        tx,
        player_id,
        ExternalRef::new(MANUFACTURER_CASINO, format!("round-loss-{game_round_id}")),
        Some(game_round_id.to_string()),
        json!({"game_round_id": game_round_id}),
    )
    .await
}

/// Reverse every bet and win of a round. External ids are synthesized from
/// the round id so a repeated call replays idempotently.
pub async fn cancel_casino_round(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    game_round_id: &str,
) -> WalletResult<Vec<CommandOutcome>> {
    let entries = TransactionRepo::list_by_game_round(tx, player_id, game_round_id).await?;

    let mut outcomes = Vec::new();
    let mut idx = 0;
    for entry in entries {
        if !matches!(entry.kind, TransactionType::Bet | TransactionType::Win) {
            continue;
        }
        let external = ExternalRef::new(
            MANUFACTURER_CASINO,
            format!("cancel-round-{game_round_id}-{idx}"),
        );
        outcomes.push(ledger::cancel_transaction(tx, player_id, entry.id, Some(external)).await?);
        idx += 1;
    }

    Ok(outcomes)
}

// ---------------------------------------------------------------------------
// Sportsbook bets
// ---------------------------------------------------------------------------

pub async fn settle_bet_win(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    bet_transaction_id: Uuid,
    payout: i64,
    split: Option<TierSplit>,
) -> WalletResult<CommandOutcome> {
    ledger::credit_win(
        tx,
        player_id,
        payout,
        split,
        WinType::Normal,
        Some(ExternalRef::new(
            MANUFACTURER_SPORTSBOOK,
            format!("settle-win-{bet_transaction_id}"),
        )),
        None,
        Some(json!({"bet_transaction_id": bet_transaction_id})),
    )
    .await
}

pub async fn settle_bet_loss(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    bet_transaction_id: Uuid,
) -> WalletResult<CommandOutcome> {
    post_settlement_marker(
        tx,
        player_id,
        ExternalRef::new(
            MANUFACTURER_SPORTSBOOK,
            format!("settle-loss-{bet_transaction_id}"),
        ),
        None,
        json!({"bet_transaction_id": bet_transaction_id}),
    )
    .await
}

/// Void a bet before settlement: reverse the stake exactly.
pub async fn settle_bet_void(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    bet_transaction_id: Uuid,
) -> WalletResult<CommandOutcome> {
    ledger::cancel_transaction(
        tx,
        player_id,
        bet_transaction_id,
        Some(ExternalRef::new(
            MANUFACTURER_SPORTSBOOK,
            format!("void-{bet_transaction_id}"),
        )),
    )
    .await
}

/// Reverse a prior settlement entry (a resettlement is then issued fresh).
pub async fn rollback_settlement(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    settlement_transaction_id: Uuid,
) -> WalletResult<CommandOutcome> {
    ledger::cancel_transaction(
        tx,
        player_id,
        settlement_transaction_id,
        Some(ExternalRef::new(
            MANUFACTURER_SPORTSBOOK,
            format!("rollback-settle-{settlement_transaction_id}"),
        )),
    )
    .await
}

// ---------------------------------------------------------------------------
// Prediction markets
// ---------------------------------------------------------------------------

/// Oracle-issued proof required to settle a prediction market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    pub provider: String,
    pub attestation_id: String,
    pub digest: String,
    pub issued_at: DateTime<Utc>,
}

/// Valid iff provider and id are non-empty, the digest is hex of length
/// 32..=128, and issued_at is within the accepted skew in either direction.
pub fn validate_attestation(attestation: &Attestation, max_skew: Duration) -> WalletResult<()> {
    if attestation.provider.is_empty() {
        return Err(WalletError::validation("attestation provider is empty"));
    }
    if attestation.attestation_id.is_empty() {
        return Err(WalletError::validation("attestation id is empty"));
    }
    let digest_len = attestation.digest.len();
    if !(32..=128).contains(&digest_len)
        || !attestation.digest.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(WalletError::validation("attestation digest is not valid hex"));
    }
    let age = Utc::now().signed_duration_since(attestation.issued_at);
    if age > max_skew || age < -max_skew {
        return Err(WalletError::validation("attestation issued outside the accepted window"));
    }
    Ok(())
}

/// Stake on a market outcome; a bet tagged with the market and outcome.
pub async fn place_stake(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    market_id: &str,
    outcome: &str,
    external: Option<ExternalRef>,
) -> WalletResult<CommandOutcome> {
    ledger::place_bet(
        tx,
        player_id,
        amount,
        external,
        None,
        Some(json!({"market_id": market_id, "outcome": outcome})),
    )
    .await
}

pub async fn settle_outcome_win(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    market_id: &str,
    attestation: &Attestation,
    max_skew: Duration,
) -> WalletResult<CommandOutcome> {
    validate_attestation(attestation, max_skew)?;
    ledger::credit_win(
        tx,
        player_id,
        amount,
        None,
        WinType::Normal,
        Some(ExternalRef::new(
            MANUFACTURER_PREDICTION,
            format!("market-win-{market_id}"),
        )),
        None,
        Some(json!({
            "market_id": market_id,
            "attestation_id": attestation.attestation_id,
        })),
    )
    .await
}

pub async fn settle_outcome_loss(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    market_id: &str,
    attestation: &Attestation,
    max_skew: Duration,
) -> WalletResult<CommandOutcome> {
    validate_attestation(attestation, max_skew)?;
    post_settlement_marker(
        tx,
        player_id,
        ExternalRef::new(MANUFACTURER_PREDICTION, format!("market-loss-{market_id}")),
        None,
        json!({
            "market_id": market_id,
            "attestation_id": attestation.attestation_id,
        }),
    )
    .await
}

/// Void a market: reverse the player's stake.
pub async fn void_market(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    stake_transaction_id: Uuid,
    market_id: &str,
) -> WalletResult<CommandOutcome> {
    ledger::cancel_transaction(
        tx,
        player_id,
        stake_transaction_id,
        Some(ExternalRef::new(
            MANUFACTURER_PREDICTION,
            format!("void-market-{market_id}"),
        )),
    )
    .await
}

// ---------------------------------------------------------------------------
// Gamification: the 3-gate engagement reward
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EngagementActivity {
    pub video_minutes: i64,
    pub social_interactions: i64,
    pub prediction_actions: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardGate {
    Score,
    Cooldown,
    Budget,
}

#[derive(Debug)]
pub struct RewardDecision {
    pub score: i64,
    pub granted: bool,
    pub failed_gates: Vec<RewardGate>,
    pub outcome: Option<CommandOutcome>,
}

pub fn engagement_score(activity: &EngagementActivity, config: &RewardConfig) -> i64 {
    activity.video_minutes * config.video_weight
        + activity.social_interactions * config.social_weight
        + activity.prediction_actions * config.prediction_weight
}

/// Gate A: score; Gate B: cooldown; Gate C: daily budget. All must pass.
#[allow(clippy::too_many_arguments)]
fn evaluate_gates(
    score: i64,
    min_score: i64,
    last_reward_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
    daily_spent: i64,
    amount: i64,
    daily_budget: i64,
) -> Vec<RewardGate> {
    let mut failed = Vec::new();
    if score < min_score {
        failed.push(RewardGate::Score);
    }
    if let Some(last) = last_reward_at {
        if now <= last + cooldown {
            failed.push(RewardGate::Cooldown);
        }
    }
    if daily_spent + amount > daily_budget {
        failed.push(RewardGate::Budget);
    }
    failed
}

/// Credit an engagement reward when all three gates pass; otherwise report
/// the failed gates with no side effect.
pub async fn grant_engagement_reward(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    activity: &EngagementActivity,
    config: &RewardConfig,
    external: Option<ExternalRef>,
) -> WalletResult<RewardDecision> {
    if amount <= 0 {
        return Err(WalletError::validation("amount must be positive"));
    }

    let score = engagement_score(activity, config);
    let now = Utc::now();

    let last_reward_at: Option<DateTime<Utc>> = sqlx::query_scalar(
        "SELECT MAX(created_at) FROM v2_transactions
         WHERE player_id = $1 AND type = 'bonus_credit'
           AND metadata->>'source' = 'engagement_reward'",
    )
    .bind(player_id)
    .fetch_one(tx.as_mut())
    .await?;

    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    let daily_spent: Option<rust_decimal::Decimal> = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM v2_transactions
         WHERE player_id = $1 AND type = 'bonus_credit'
           AND metadata->>'source' = 'engagement_reward'
           AND created_at >= $2",
    )
    .bind(player_id)
    .bind(day_start)
    .fetch_one(tx.as_mut())
    .await?;
    let daily_spent = crate::money::from_storage(daily_spent)
        .map_err(|e| WalletError::Internal(anyhow::anyhow!("reward daily sum: {e}")))?;

    let failed_gates = evaluate_gates(
        score,
        config.min_score,
        last_reward_at,
        now,
        Duration::minutes(config.cooldown_minutes),
        daily_spent,
        amount,
        config.daily_budget,
    );

    if !failed_gates.is_empty() {
        return Ok(RewardDecision {
            score,
            granted: false,
            failed_gates,
            outcome: None,
        });
    }

    let outcome = ledger::bonus_credit(
        tx,
        player_id,
        amount,
        external,
        Some(json!({"source": "engagement_reward", "score": score})),
    )
    .await?;

    Ok(RewardDecision {
        score,
        granted: true,
        failed_gates: vec![],
        outcome: Some(outcome),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attestation(digest: &str) -> Attestation {
        Attestation {
            provider: "chainlink".to_string(),
            attestation_id: "att-1".to_string(),
            digest: digest.to_string(),
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn attestation_accepts_a_sha256_digest() {
        let att = attestation(&"ab".repeat(32)); // 64 hex chars
        assert!(validate_attestation(&att, Duration::minutes(10)).is_ok());
    }

    #[test]
    fn attestation_digest_length_bounds() {
        assert!(validate_attestation(&attestation(&"a".repeat(31)), Duration::minutes(10)).is_err());
        assert!(validate_attestation(&attestation(&"a".repeat(32)), Duration::minutes(10)).is_ok());
        assert!(validate_attestation(&attestation(&"a".repeat(128)), Duration::minutes(10)).is_ok());
        assert!(validate_attestation(&attestation(&"a".repeat(129)), Duration::minutes(10)).is_err());
    }

    #[test]
    fn attestation_rejects_non_hex_and_empty_fields() {
        assert!(validate_attestation(&attestation(&"g".repeat(64)), Duration::minutes(10)).is_err());

        let mut att = attestation(&"a".repeat(64));
        att.provider.clear();
        assert!(validate_attestation(&att, Duration::minutes(10)).is_err());

        let mut att = attestation(&"a".repeat(64));
        att.attestation_id.clear();
        assert!(validate_attestation(&att, Duration::minutes(10)).is_err());
    }

    #[test]
    fn attestation_rejects_skewed_timestamps_in_both_directions() {
        let mut att = attestation(&"a".repeat(64));
        att.issued_at = Utc::now() - Duration::minutes(30);
        assert!(validate_attestation(&att, Duration::minutes(10)).is_err());

        att.issued_at = Utc::now() + Duration::minutes(30);
        assert!(validate_attestation(&att, Duration::minutes(10)).is_err());
    }

    #[test]
    fn engagement_score_uses_the_configured_weights() {
        let config = RewardConfig::default();
        let activity = EngagementActivity {
            video_minutes: 10,
            social_interactions: 4,
            prediction_actions: 2,
        };
        // 10*2 + 4*3 + 2*5
        assert_eq!(engagement_score(&activity, &config), 42);
    }

    #[test]
    fn gates_report_every_failure() {
        let now = Utc::now();
        let failed = evaluate_gates(
            50,                         // score below min
            100,
            Some(now),                  // rewarded just now: cooldown active
            now,
            Duration::minutes(60),
            9_500,                      // budget nearly spent
            1_000,
            10_000,
        );
        assert_eq!(
            failed,
            vec![RewardGate::Score, RewardGate::Cooldown, RewardGate::Budget]
        );
    }

    #[test]
    fn gates_pass_when_all_conditions_hold() {
        let now = Utc::now();
        let failed = evaluate_gates(
            150,
            100,
            Some(now - Duration::minutes(120)),
            now,
            Duration::minutes(60),
            0,
            1_000,
            10_000,
        );
        assert!(failed.is_empty());
    }

    #[test]
    fn cooldown_gate_passes_with_no_prior_reward() {
        let failed = evaluate_gates(
            150,
            100,
            None,
            Utc::now(),
            Duration::minutes(60),
            0,
            1_000,
            10_000,
        );
        assert!(failed.is_empty());
    }
}
