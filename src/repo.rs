//! Row-level data access for players, ledger entries and their storage
//! representation. All money columns are NUMERIC(15,0); the i64 <-> Decimal
//! bridge in `money` is the only conversion boundary.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{WalletError, WalletResult};
use crate::ledger::TransactionType;
use crate::money::{from_storage, to_storage};

/// A player wallet row. The three balance tiers are cents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: Uuid,
    pub balance: i64,
    pub bonus_balance: i64,
    pub reserved_balance: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An immutable ledger entry with its post-update balance snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub player_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: i64,
    pub balance_after: i64,
    pub bonus_balance_after: i64,
    pub reserved_balance_after: i64,
    pub external_transaction_id: Option<String>,
    pub manufacturer_id: String,
    pub sub_transaction_id: String,
    pub target_transaction_id: Option<Uuid>,
    pub game_round_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Reference to the external operation that produced an entry. Together with
/// the player id this forms the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalRef {
    pub manufacturer_id: String,
    pub external_id: String,
    pub sub_id: String,
}

impl ExternalRef {
    pub fn new(manufacturer_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            manufacturer_id: manufacturer_id.into(),
            external_id: external_id.into(),
            sub_id: String::new(),
        }
    }

    pub fn with_sub(mut self, sub_id: impl Into<String>) -> Self {
        self.sub_id = sub_id.into();
        self
    }
}

/// Signed per-tier balance change, cents. Applied with unclamped server-side
/// arithmetic; the CHECK constraints reject underflow at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BalanceDelta {
    pub balance: i64,
    pub bonus: i64,
    pub reserved: i64,
}

impl BalanceDelta {
    pub fn new(balance: i64, bonus: i64, reserved: i64) -> Self {
        Self { balance, bonus, reserved }
    }

    pub fn is_zero(&self) -> bool {
        self.balance == 0 && self.bonus == 0 && self.reserved == 0
    }

    pub fn inverse(&self) -> Self {
        Self {
            balance: -self.balance,
            bonus: -self.bonus,
            reserved: -self.reserved,
        }
    }
}

/// Parameters for appending a ledger entry.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub player_id: Uuid,
    pub kind: TransactionType,
    pub amount: i64,
    pub external: Option<ExternalRef>,
    pub target_transaction_id: Option<Uuid>,
    pub game_round_id: Option<String>,
    pub metadata: serde_json::Value,
}

const PLAYER_COLUMNS: &str =
    "id, balance, bonus_balance, reserved_balance, currency, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, player_id, type, amount, balance_after, \
     bonus_balance_after, reserved_balance_after, external_transaction_id, \
     manufacturer_id, sub_transaction_id, target_transaction_id, game_round_id, \
     metadata, created_at";

fn cents(row: &PgRow, column: &str) -> WalletResult<i64> {
    let value: Option<Decimal> = row.try_get(column).map_err(WalletError::from)?;
    from_storage(value).map_err(|e| WalletError::Internal(anyhow!("{column}: {e}")))
}

fn player_from_row(row: &PgRow) -> WalletResult<Player> {
    Ok(Player {
        id: row.try_get("id").map_err(WalletError::from)?,
        balance: cents(row, "balance")?,
        bonus_balance: cents(row, "bonus_balance")?,
        reserved_balance: cents(row, "reserved_balance")?,
        currency: row.try_get("currency").map_err(WalletError::from)?,
        created_at: row.try_get("created_at").map_err(WalletError::from)?,
        updated_at: row.try_get("updated_at").map_err(WalletError::from)?,
    })
}

fn transaction_from_row(row: &PgRow) -> WalletResult<LedgerTransaction> {
    let kind: String = row.try_get("type").map_err(WalletError::from)?;
    Ok(LedgerTransaction {
        id: row.try_get("id").map_err(WalletError::from)?,
        player_id: row.try_get("player_id").map_err(WalletError::from)?,
        kind: TransactionType::from_str(&kind)
            .ok_or_else(|| WalletError::Internal(anyhow!("unknown transaction type {kind:?}")))?,
        amount: cents(row, "amount")?,
        balance_after: cents(row, "balance_after")?,
        bonus_balance_after: cents(row, "bonus_balance_after")?,
        reserved_balance_after: cents(row, "reserved_balance_after")?,
        external_transaction_id: row
            .try_get("external_transaction_id")
            .map_err(WalletError::from)?,
        manufacturer_id: row.try_get("manufacturer_id").map_err(WalletError::from)?,
        sub_transaction_id: row.try_get("sub_transaction_id").map_err(WalletError::from)?,
        target_transaction_id: row
            .try_get("target_transaction_id")
            .map_err(WalletError::from)?,
        game_round_id: row.try_get("game_round_id").map_err(WalletError::from)?,
        metadata: row.try_get("metadata").map_err(WalletError::from)?,
        created_at: row.try_get("created_at").map_err(WalletError::from)?,
    })
}

pub struct PlayerRepo;

impl PlayerRepo {
    pub async fn create(pool: &PgPool, id: Uuid, currency: &str) -> WalletResult<Player> {
        let sql = format!(
            "INSERT INTO v2_players (id, balance, bonus_balance, reserved_balance, currency)
             VALUES ($1, 0, 0, 0, $2)
             RETURNING {PLAYER_COLUMNS}"
        );
        let row = sqlx::query(&sql).bind(id).bind(currency).fetch_one(pool).await?;
        player_from_row(&row)
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> WalletResult<Option<Player>> {
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM v2_players WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
        row.as_ref().map(player_from_row).transpose()
    }

    /// `SELECT ... FOR UPDATE`: serializes every concurrent command against
    /// this player for the remainder of the enclosing transaction.
    pub async fn lock_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> WalletResult<Player> {
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM v2_players WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| WalletError::not_found("player"))?;
        player_from_row(&row)
    }

    /// Dynamic UPDATE including SET clauses only for nonzero tiers, with the
    /// post-update row returned. A zero delta reads the row back unchanged.
    pub async fn update_balances(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        delta: BalanceDelta,
    ) -> WalletResult<Player> {
        if delta.is_zero() {
            let sql = format!("SELECT {PLAYER_COLUMNS} FROM v2_players WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(tx.as_mut())
                .await?
                .ok_or_else(|| WalletError::not_found("player"))?;
            return player_from_row(&row);
        }

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Decimal> = Vec::new();
        let mut next_arg = 2;
        for (column, tier) in [
            ("balance", delta.balance),
            ("bonus_balance", delta.bonus),
            ("reserved_balance", delta.reserved),
        ] {
            if tier != 0 {
                sets.push(format!("{column} = {column} + ${next_arg}"));
                values.push(to_storage(tier));
                next_arg += 1;
            }
        }
        sets.push("updated_at = NOW()".to_string());

        let sql = format!(
            "UPDATE v2_players SET {} WHERE id = $1 RETURNING {PLAYER_COLUMNS}",
            sets.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(id);
        for value in values {
            query = query.bind(value);
        }
        let row = query
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| WalletError::not_found("player"))?;
        player_from_row(&row)
    }
}

pub struct TransactionRepo;

impl TransactionRepo {
    /// Idempotency probe by the 4-tuple key. Returns None on miss.
    pub async fn find_existing(
        tx: &mut Transaction<'_, Postgres>,
        player_id: Uuid,
        external: &ExternalRef,
    ) -> WalletResult<Option<LedgerTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM v2_transactions
             WHERE player_id = $1 AND manufacturer_id = $2
               AND external_transaction_id = $3 AND sub_transaction_id = $4"
        );
        let row = sqlx::query(&sql)
            .bind(player_id)
            .bind(&external.manufacturer_id)
            .bind(&external.external_id)
            .bind(&external.sub_id)
            .fetch_optional(tx.as_mut())
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    /// Append an entry carrying the post-update snapshot of `balances`.
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        params: &NewTransaction,
        balances: &Player,
    ) -> WalletResult<LedgerTransaction> {
        let (manufacturer_id, external_id, sub_id) = match &params.external {
            Some(ext) => (
                ext.manufacturer_id.as_str(),
                Some(ext.external_id.as_str()),
                ext.sub_id.as_str(),
            ),
            None => ("", None, ""),
        };

        let sql = format!(
            "INSERT INTO v2_transactions
                (id, player_id, type, amount, balance_after, bonus_balance_after,
                 reserved_balance_after, external_transaction_id, manufacturer_id,
                 sub_transaction_id, target_transaction_id, game_round_id, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             RETURNING {TRANSACTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(params.player_id)
            .bind(params.kind.as_str())
            .bind(to_storage(params.amount))
            .bind(to_storage(balances.balance))
            .bind(to_storage(balances.bonus_balance))
            .bind(to_storage(balances.reserved_balance))
            .bind(external_id)
            .bind(manufacturer_id)
            .bind(sub_id)
            .bind(params.target_transaction_id)
            .bind(&params.game_round_id)
            .bind(&params.metadata)
            .fetch_one(tx.as_mut())
            .await?;
        transaction_from_row(&row)
    }

    pub async fn find_by_id(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> WalletResult<Option<LedgerTransaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM v2_transactions WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(tx.as_mut()).await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    /// The most recent entry for a player, by `(created_at, id)`.
    pub async fn find_latest(
        tx: &mut Transaction<'_, Postgres>,
        player_id: Uuid,
    ) -> WalletResult<Option<LedgerTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM v2_transactions
             WHERE player_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(player_id)
            .fetch_optional(tx.as_mut())
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    /// Keyset pagination over a player's history, newest first. The cursor is
    /// the `(created_at, id)` of the last row of the previous page.
    pub async fn list_by_player(
        pool: &PgPool,
        player_id: Uuid,
        cursor: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> WalletResult<Vec<LedgerTransaction>> {
        let rows = match cursor {
            Some((created_at, id)) => {
                let sql = format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM v2_transactions
                     WHERE player_id = $1 AND (created_at, id) < ($2, $3)
                     ORDER BY created_at DESC, id DESC
                     LIMIT $4"
                );
                sqlx::query(&sql)
                    .bind(player_id)
                    .bind(created_at)
                    .bind(id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM v2_transactions
                     WHERE player_id = $1
                     ORDER BY created_at DESC, id DESC
                     LIMIT $2"
                );
                sqlx::query(&sql)
                    .bind(player_id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?
            }
        };
        rows.iter().map(transaction_from_row).collect()
    }

    /// Every entry of a casino game round, oldest first.
    pub async fn list_by_game_round(
        tx: &mut Transaction<'_, Postgres>,
        player_id: Uuid,
        game_round_id: &str,
    ) -> WalletResult<Vec<LedgerTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM v2_transactions
             WHERE player_id = $1 AND game_round_id = $2
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(player_id)
            .bind(game_round_id)
            .fetch_all(tx.as_mut())
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    /// Sum of entry amounts of one type for the UTC day containing `now`.
    pub async fn daily_sum_by_type(
        tx: &mut Transaction<'_, Postgres>,
        player_id: Uuid,
        kind: TransactionType,
        now: DateTime<Utc>,
    ) -> WalletResult<i64> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc();
        let sum: Option<Decimal> = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM v2_transactions
             WHERE player_id = $1 AND type = $2 AND created_at >= $3",
        )
        .bind(player_id)
        .bind(kind.as_str())
        .bind(day_start)
        .fetch_one(tx.as_mut())
        .await?;
        from_storage(sum).map_err(|e| WalletError::Internal(anyhow!("daily sum: {e}")))
    }
}
