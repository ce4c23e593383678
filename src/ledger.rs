//! The ledger engine: three primitives (lock, idempotency probe, post entry)
//! and the nine balance-mutating commands built on them.
//!
//! Every command runs inside the caller's DB transaction. A successful
//! command mutates the player row via server-side arithmetic, appends an
//! immutable entry carrying the post-update snapshot, and stages a
//! `TransactionPosted` outbox draft — all or nothing.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::{WalletError, WalletResult};
use crate::outbox::{OutboxDraft, OutboxRepo};
use crate::repo::{
    BalanceDelta, ExternalRef, LedgerTransaction, NewTransaction, Player, PlayerRepo,
    TransactionRepo,
};

/// Ledger entry types. Reversible types have a `*_cancelled` counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    WithdrawalCompleted,
    Bet,
    Win,
    BonusCredit,
    BonusForfeit,
    BonusLost,
    BonusConverted,
    SettlementLoss,
    DepositCancelled,
    WithdrawalCancelled,
    BetCancelled,
    WinCancelled,
    BonusCreditCancelled,
    BonusConvertedCancelled,
    SettlementLossCancelled,
}

impl TransactionType {
    pub const ALL: [TransactionType; 17] = [
        TransactionType::Deposit,
        TransactionType::Withdrawal,
        TransactionType::WithdrawalCompleted,
        TransactionType::Bet,
        TransactionType::Win,
        TransactionType::BonusCredit,
        TransactionType::BonusForfeit,
        TransactionType::BonusLost,
        TransactionType::BonusConverted,
        TransactionType::SettlementLoss,
        TransactionType::DepositCancelled,
        TransactionType::WithdrawalCancelled,
        TransactionType::BetCancelled,
        TransactionType::WinCancelled,
        TransactionType::BonusCreditCancelled,
        TransactionType::BonusConvertedCancelled,
        TransactionType::SettlementLossCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::WithdrawalCompleted => "withdrawal_completed",
            TransactionType::Bet => "bet",
            TransactionType::Win => "win",
            TransactionType::BonusCredit => "bonus_credit",
            TransactionType::BonusForfeit => "bonus_forfeit",
            TransactionType::BonusLost => "bonus_lost",
            TransactionType::BonusConverted => "bonus_converted",
            TransactionType::SettlementLoss => "settlement_loss",
            TransactionType::DepositCancelled => "deposit_cancelled",
            TransactionType::WithdrawalCancelled => "withdrawal_cancelled",
            TransactionType::BetCancelled => "bet_cancelled",
            TransactionType::WinCancelled => "win_cancelled",
            TransactionType::BonusCreditCancelled => "bonus_credit_cancelled",
            TransactionType::BonusConvertedCancelled => "bonus_converted_cancelled",
            TransactionType::SettlementLossCancelled => "settlement_loss_cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// The static original -> cancellation map. Adding a reversible type
    /// means extending this map and the reversal delta switch below.
    pub fn cancelled(&self) -> Option<TransactionType> {
        match self {
            TransactionType::Deposit => Some(TransactionType::DepositCancelled),
            TransactionType::Withdrawal => Some(TransactionType::WithdrawalCancelled),
            TransactionType::Bet => Some(TransactionType::BetCancelled),
            TransactionType::Win => Some(TransactionType::WinCancelled),
            TransactionType::BonusCredit => Some(TransactionType::BonusCreditCancelled),
            TransactionType::BonusConverted => Some(TransactionType::BonusConvertedCancelled),
            TransactionType::SettlementLoss => Some(TransactionType::SettlementLossCancelled),
            _ => None,
        }
    }

    pub fn is_cancellable(&self) -> bool {
        self.cancelled().is_some()
    }
}

/// How a bet debit or win credit was divided between the real and bonus
/// tiers. Recorded in entry metadata so cancellation can restore the exact
/// split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSplit {
    pub real_amount: i64,
    pub bonus_amount: i64,
}

impl TierSplit {
    pub fn all_real(amount: i64) -> Self {
        Self { real_amount: amount, bonus_amount: 0 }
    }

    pub fn total(&self) -> i64 {
        self.real_amount + self.bonus_amount
    }
}

/// Bonus funds are spent first; the remainder comes from the real tier.
pub fn compute_bet_split(amount: i64, bonus_balance: i64) -> TierSplit {
    let bonus_amount = amount.min(bonus_balance.max(0));
    TierSplit {
        real_amount: amount - bonus_amount,
        bonus_amount,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WinType {
    #[default]
    Normal,
    Jackpot,
    Freespin,
}

impl WinType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WinType::Normal => "normal",
            WinType::Jackpot => "jackpot",
            WinType::Freespin => "freespin",
        }
    }
}

/// Result of a ledger command. `idempotent = true` means the entry was
/// created by an earlier invocation and nothing was mutated or emitted now.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub transaction: LedgerTransaction,
    pub player: Player,
    pub events: Vec<OutboxDraft>,
    pub idempotent: bool,
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// P1: pessimistic row lock for the duration of the enclosing transaction.
pub async fn lock_player(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
) -> WalletResult<Player> {
    PlayerRepo::lock_for_update(tx, player_id).await
}

/// P2: idempotency probe. Always call after P1 so the probe and the
/// subsequent write are serialized.
pub async fn find_existing(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    external: &ExternalRef,
) -> WalletResult<Option<LedgerTransaction>> {
    TransactionRepo::find_existing(tx, player_id, external).await
}

/// P3: apply the delta, append the entry with its post-update snapshot, and
/// stage the outbox draft. Any failure fails the whole transaction.
pub async fn post_entry(
    tx: &mut Transaction<'_, Postgres>,
    delta: BalanceDelta,
    params: NewTransaction,
) -> WalletResult<(LedgerTransaction, Player, OutboxDraft)> {
    let updated = PlayerRepo::update_balances(tx, params.player_id, delta).await?;
    let entry = TransactionRepo::insert(tx, &params, &updated).await?;
    let draft = OutboxDraft::transaction_posted(&entry)?;
    OutboxRepo::insert(tx, &draft).await?;
    Ok((entry, updated, draft))
}

// ---------------------------------------------------------------------------
// Command skeleton helpers
// ---------------------------------------------------------------------------

fn ensure_positive(amount: i64) -> WalletResult<()> {
    if amount <= 0 {
        return Err(WalletError::validation("amount must be positive"));
    }
    Ok(())
}

/// Early-return value for a replayed external operation.
async fn cached_outcome(
    tx: &mut Transaction<'_, Postgres>,
    player: &Player,
    external: Option<&ExternalRef>,
) -> WalletResult<Option<CommandOutcome>> {
    if let Some(ext) = external {
        if let Some(prior) = TransactionRepo::find_existing(tx, player.id, ext).await? {
            return Ok(Some(CommandOutcome {
                transaction: prior,
                player: player.clone(),
                events: vec![],
                idempotent: true,
            }));
        }
    }
    Ok(None)
}

async fn post_command(
    tx: &mut Transaction<'_, Postgres>,
    delta: BalanceDelta,
    params: NewTransaction,
) -> WalletResult<CommandOutcome> {
    let (transaction, player, draft) = post_entry(tx, delta, params).await?;
    Ok(CommandOutcome {
        transaction,
        player,
        events: vec![draft],
        idempotent: false,
    })
}

fn metadata_object(extra: Option<Value>) -> serde_json::Map<String, Value> {
    match extra {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

// ---------------------------------------------------------------------------
// The nine commands
// ---------------------------------------------------------------------------

pub async fn deposit(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    external: Option<ExternalRef>,
) -> WalletResult<CommandOutcome> {
    ensure_positive(amount)?;
    let player = lock_player(tx, player_id).await?;
    if let Some(outcome) = cached_outcome(tx, &player, external.as_ref()).await? {
        return Ok(outcome);
    }

    post_command(
        tx,
        BalanceDelta::new(amount, 0, 0),
        NewTransaction {
            player_id,
            kind: TransactionType::Deposit,
            amount,
            external,
            target_transaction_id: None,
            game_round_id: None,
            metadata: json!({}),
        },
    )
    .await
}

/// Debit a stake, spending bonus funds first. The split is computed against
/// the locked snapshot and recorded in metadata.
pub async fn place_bet(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    external: Option<ExternalRef>,
    game_round_id: Option<String>,
    extra_metadata: Option<Value>,
) -> WalletResult<CommandOutcome> {
    ensure_positive(amount)?;
    let player = lock_player(tx, player_id).await?;
    if let Some(outcome) = cached_outcome(tx, &player, external.as_ref()).await? {
        return Ok(outcome);
    }

    let split = compute_bet_split(amount, player.bonus_balance);
    let mut metadata = metadata_object(extra_metadata);
    metadata.insert("real_amount".to_string(), json!(split.real_amount));
    metadata.insert("bonus_amount".to_string(), json!(split.bonus_amount));

    post_command(
        tx,
        BalanceDelta::new(-split.real_amount, -split.bonus_amount, 0),
        NewTransaction {
            player_id,
            kind: TransactionType::Bet,
            amount,
            external,
            target_transaction_id: None,
            game_round_id,
            metadata: Value::Object(metadata),
        },
    )
    .await
}

/// Credit a win. The caller may supply an explicit tier split; the default
/// credits the real tier.
#[allow(clippy::too_many_arguments)]
pub async fn credit_win(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    split: Option<TierSplit>,
    win_type: WinType,
    external: Option<ExternalRef>,
    game_round_id: Option<String>,
    extra_metadata: Option<Value>,
) -> WalletResult<CommandOutcome> {
    ensure_positive(amount)?;
    let split = split.unwrap_or_else(|| TierSplit::all_real(amount));
    if split.real_amount < 0 || split.bonus_amount < 0 || split.total() != amount {
        return Err(WalletError::validation("win split does not add up to the amount"));
    }

    let player = lock_player(tx, player_id).await?;
    if let Some(outcome) = cached_outcome(tx, &player, external.as_ref()).await? {
        return Ok(outcome);
    }

    let mut metadata = metadata_object(extra_metadata);
    metadata.insert("real_amount".to_string(), json!(split.real_amount));
    metadata.insert("bonus_amount".to_string(), json!(split.bonus_amount));
    metadata.insert("win_type".to_string(), json!(win_type.as_str()));

    post_command(
        tx,
        BalanceDelta::new(split.real_amount, split.bonus_amount, 0),
        NewTransaction {
            player_id,
            kind: TransactionType::Win,
            amount,
            external,
            target_transaction_id: None,
            game_round_id,
            metadata: Value::Object(metadata),
        },
    )
    .await
}

/// Move funds from the withdrawable tier to the reservation tier, subject to
/// the daily cap (0 disables the cap).
pub async fn withdraw(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    external: Option<ExternalRef>,
    daily_cap: i64,
) -> WalletResult<CommandOutcome> {
    ensure_positive(amount)?;
    let player = lock_player(tx, player_id).await?;
    if let Some(outcome) = cached_outcome(tx, &player, external.as_ref()).await? {
        return Ok(outcome);
    }

    if daily_cap > 0 {
        let withdrawn_today = TransactionRepo::daily_sum_by_type(
            tx,
            player_id,
            TransactionType::Withdrawal,
            chrono::Utc::now(),
        )
        .await?;
        if withdrawn_today + amount > daily_cap {
            return Err(WalletError::validation(format!(
                "daily withdrawal cap exceeded: {withdrawn_today} + {amount} > {daily_cap}"
            )));
        }
    }

    post_command(
        tx,
        BalanceDelta::new(-amount, 0, amount),
        NewTransaction {
            player_id,
            kind: TransactionType::Withdrawal,
            amount,
            external,
            target_transaction_id: None,
            game_round_id: None,
            metadata: json!({}),
        },
    )
    .await
}

/// Clear a withdrawal reservation after the payment provider settles.
pub async fn complete_withdrawal(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    external: Option<ExternalRef>,
) -> WalletResult<CommandOutcome> {
    ensure_positive(amount)?;
    let player = lock_player(tx, player_id).await?;
    if let Some(outcome) = cached_outcome(tx, &player, external.as_ref()).await? {
        return Ok(outcome);
    }

    post_command(
        tx,
        BalanceDelta::new(0, 0, -amount),
        NewTransaction {
            player_id,
            kind: TransactionType::WithdrawalCompleted,
            amount,
            external,
            target_transaction_id: None,
            game_round_id: None,
            metadata: json!({}),
        },
    )
    .await
}

pub async fn bonus_credit(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    external: Option<ExternalRef>,
    extra_metadata: Option<Value>,
) -> WalletResult<CommandOutcome> {
    ensure_positive(amount)?;
    let player = lock_player(tx, player_id).await?;
    if let Some(outcome) = cached_outcome(tx, &player, external.as_ref()).await? {
        return Ok(outcome);
    }

    post_command(
        tx,
        BalanceDelta::new(0, amount, 0),
        NewTransaction {
            player_id,
            kind: TransactionType::BonusCredit,
            amount,
            external,
            target_transaction_id: None,
            game_round_id: None,
            metadata: Value::Object(metadata_object(extra_metadata)),
        },
    )
    .await
}

/// Convert bonus funds into withdrawable funds.
pub async fn turn_bonus_to_real(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    external: Option<ExternalRef>,
) -> WalletResult<CommandOutcome> {
    ensure_positive(amount)?;
    let player = lock_player(tx, player_id).await?;
    if let Some(outcome) = cached_outcome(tx, &player, external.as_ref()).await? {
        return Ok(outcome);
    }

    if player.bonus_balance < amount {
        return Err(WalletError::validation("insufficient bonus balance"));
    }

    post_command(
        tx,
        BalanceDelta::new(amount, -amount, 0),
        NewTransaction {
            player_id,
            kind: TransactionType::BonusConverted,
            amount,
            external,
            target_transaction_id: None,
            game_round_id: None,
            metadata: json!({}),
        },
    )
    .await
}

/// Remove bonus funds. `is_bonus_lost` distinguishes wagering-requirement
/// losses from administrative forfeits.
pub async fn forfeit_bonus(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    amount: i64,
    is_bonus_lost: bool,
    external: Option<ExternalRef>,
) -> WalletResult<CommandOutcome> {
    ensure_positive(amount)?;
    let player = lock_player(tx, player_id).await?;
    if let Some(outcome) = cached_outcome(tx, &player, external.as_ref()).await? {
        return Ok(outcome);
    }

    if player.bonus_balance < amount {
        return Err(WalletError::validation("insufficient bonus balance"));
    }

    let kind = if is_bonus_lost {
        TransactionType::BonusLost
    } else {
        TransactionType::BonusForfeit
    };

    post_command(
        tx,
        BalanceDelta::new(0, -amount, 0),
        NewTransaction {
            player_id,
            kind,
            amount,
            external,
            target_transaction_id: None,
            game_round_id: None,
            metadata: json!({}),
        },
    )
    .await
}

/// Reverse a prior entry. The reversal uses the tier split recorded in the
/// original's metadata, so exactly what was taken or given is restored.
pub async fn cancel_transaction(
    tx: &mut Transaction<'_, Postgres>,
    player_id: Uuid,
    target_transaction_id: Uuid,
    external: Option<ExternalRef>,
) -> WalletResult<CommandOutcome> {
    let player = lock_player(tx, player_id).await?;
    if let Some(outcome) = cached_outcome(tx, &player, external.as_ref()).await? {
        return Ok(outcome);
    }

    let target = TransactionRepo::find_by_id(tx, target_transaction_id)
        .await?
        .filter(|t| t.player_id == player_id)
        .ok_or_else(|| WalletError::not_found("target transaction"))?;

    let cancelled_kind = target.kind.cancelled().ok_or_else(|| {
        WalletError::validation(format!(
            "transaction type {} cannot be cancelled",
            target.kind.as_str()
        ))
    })?;

    let delta = reversal_delta(&target);
    let metadata = json!({
        "original_type": target.kind.as_str(),
        "reversed_balance": delta.balance,
        "reversed_bonus": delta.bonus,
        "reversed_reserved": delta.reserved,
    });

    post_command(
        tx,
        delta,
        NewTransaction {
            player_id,
            kind: cancelled_kind,
            amount: target.amount,
            external,
            target_transaction_id: Some(target.id),
            game_round_id: target.game_round_id.clone(),
            metadata,
        },
    )
    .await
}

/// Inverse of the delta the original entry applied. Bets and wins read the
/// recorded split and fall back to the nominal amount on the real tier when
/// the split is absent or unreadable (historical rows).
pub fn reversal_delta(target: &LedgerTransaction) -> BalanceDelta {
    let nominal = target.amount;
    match target.kind {
        TransactionType::Deposit => BalanceDelta::new(-nominal, 0, 0),
        TransactionType::Withdrawal => BalanceDelta::new(nominal, 0, -nominal),
        TransactionType::Bet => {
            let split = recorded_split(&target.metadata).unwrap_or_else(|| TierSplit::all_real(nominal));
            BalanceDelta::new(split.real_amount, split.bonus_amount, 0)
        }
        TransactionType::Win => {
            let split = recorded_split(&target.metadata).unwrap_or_else(|| TierSplit::all_real(nominal));
            BalanceDelta::new(-split.real_amount, -split.bonus_amount, 0)
        }
        TransactionType::BonusCredit => BalanceDelta::new(0, -nominal, 0),
        TransactionType::BonusConverted => BalanceDelta::new(-nominal, nominal, 0),
        TransactionType::SettlementLoss => BalanceDelta::default(),
        // Unreachable for entries produced through cancel_transaction: the
        // cancellation map rejects these kinds first.
        _ => BalanceDelta::default(),
    }
}

fn recorded_split(metadata: &Value) -> Option<TierSplit> {
    serde_json::from_value(metadata.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    fn entry(kind: TransactionType, amount: i64, metadata: Value) -> LedgerTransaction {
        LedgerTransaction {
            id: Uuid::new_v4(),
            player_id: Uuid::new_v4(),
            kind,
            amount,
            balance_after: 0,
            bonus_balance_after: 0,
            reserved_balance_after: 0,
            external_transaction_id: None,
            manufacturer_id: String::new(),
            sub_transaction_id: String::new(),
            target_transaction_id: None,
            game_round_id: None,
            metadata,
            created_at: Utc::now(),
        }
    }

    proptest! {
        #[test]
        fn bet_split_spends_bonus_first(
            amount in 1i64..1_000_000_000,
            bonus in 0i64..1_000_000_000,
        ) {
            let split = compute_bet_split(amount, bonus);
            prop_assert_eq!(split.total(), amount);
            prop_assert!(split.real_amount >= 0 && split.bonus_amount >= 0);
            prop_assert_eq!(split.bonus_amount, amount.min(bonus));
            // the real tier is only touched once the bonus tier is exhausted
            if split.real_amount > 0 {
                prop_assert_eq!(split.bonus_amount, bonus);
            }
        }

        #[test]
        fn cancelling_a_bet_restores_the_exact_split(
            amount in 1i64..1_000_000,
            bonus in 0i64..1_000_000,
        ) {
            let split = compute_bet_split(amount, bonus);
            let forward = BalanceDelta::new(-split.real_amount, -split.bonus_amount, 0);
            let target = entry(
                TransactionType::Bet,
                amount,
                json!({"real_amount": split.real_amount, "bonus_amount": split.bonus_amount}),
            );
            prop_assert_eq!(reversal_delta(&target), forward.inverse());
        }
    }

    #[test]
    fn type_strings_round_trip() {
        for kind in TransactionType::ALL {
            assert_eq!(TransactionType::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn cancellation_map_is_exactly_the_reversible_types() {
        let reversible = [
            TransactionType::Deposit,
            TransactionType::Withdrawal,
            TransactionType::Bet,
            TransactionType::Win,
            TransactionType::BonusCredit,
            TransactionType::BonusConverted,
            TransactionType::SettlementLoss,
        ];
        for kind in TransactionType::ALL {
            assert_eq!(kind.is_cancellable(), reversible.contains(&kind), "{kind:?}");
        }
    }

    #[test]
    fn a_cancel_entry_is_never_cancellable() {
        for kind in TransactionType::ALL {
            if let Some(cancelled) = kind.cancelled() {
                assert!(cancelled.cancelled().is_none(), "{cancelled:?}");
            }
        }
    }

    #[test]
    fn reversal_inverts_the_forward_delta_for_every_reversible_type() {
        let amount = 500;
        let cases = [
            (TransactionType::Deposit, BalanceDelta::new(amount, 0, 0), json!({})),
            (
                TransactionType::Withdrawal,
                BalanceDelta::new(-amount, 0, amount),
                json!({}),
            ),
            (
                TransactionType::Bet,
                BalanceDelta::new(-300, -200, 0),
                json!({"real_amount": 300, "bonus_amount": 200}),
            ),
            (
                TransactionType::Win,
                BalanceDelta::new(300, 200, 0),
                json!({"real_amount": 300, "bonus_amount": 200}),
            ),
            (TransactionType::BonusCredit, BalanceDelta::new(0, amount, 0), json!({})),
            (
                TransactionType::BonusConverted,
                BalanceDelta::new(amount, -amount, 0),
                json!({}),
            ),
            (TransactionType::SettlementLoss, BalanceDelta::default(), json!({})),
        ];
        for (kind, forward, metadata) in cases {
            let target = entry(kind, amount, metadata);
            assert_eq!(reversal_delta(&target), forward.inverse(), "{kind:?}");
        }
    }

    #[test]
    fn missing_split_falls_back_to_the_nominal_amount() {
        let target = entry(TransactionType::Bet, 700, json!({}));
        assert_eq!(reversal_delta(&target), BalanceDelta::new(700, 0, 0));

        let unreadable = entry(TransactionType::Win, 700, json!({"real_amount": "oops"}));
        assert_eq!(reversal_delta(&unreadable), BalanceDelta::new(-700, 0, 0));
    }
}
