//! Provider-callback dispatcher: verifies signatures, normalizes the
//! heterogeneous wallet protocols into a unified callback, runs the matching
//! ledger command in a fresh transaction, and shapes the provider-native
//! response. Providers never see raw errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ErrorKind, WalletError, WalletResult};
use crate::ledger::{self, WinType};
use crate::money::{format_cents, parse_decimal_to_cents};
use crate::repo::{ExternalRef, Player};
use crate::with_wallet_tx;

pub const MANUFACTURER_BETSOLUTIONS: &str = "betsolutions";
pub const MANUFACTURER_PRAGMATIC: &str = "pragmatic";

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

/// Hex HMAC-SHA256 of the provider's canonical signing string.
pub fn sign(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a provider signature.
pub fn verify_signature(secret: &str, message: &str, provided_hex: &str) -> WalletResult<()> {
    let provided = hex::decode(provided_hex)
        .map_err(|_| WalletError::ProviderProtocol("signature is not hex".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| WalletError::ProviderProtocol("signature mismatch".to_string()))
}

// ---------------------------------------------------------------------------
// Unified callback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Balance,
    Bet,
    Win,
    Rollback,
}

/// A provider request normalized to the engine's terms; amounts are cents.
#[derive(Debug, Clone)]
pub struct WalletCallback {
    pub action: CallbackAction,
    pub manufacturer_id: &'static str,
    pub player_id: Uuid,
    pub amount: i64,
    pub currency: Option<String>,
    pub tx_id: String,
    pub round_id: Option<String>,
    pub game_id: Option<String>,
}

/// Counters for absorbed anomalies, surfaced through /health.
#[derive(Debug, Default)]
pub struct DispatchStats {
    rollback_no_target: AtomicU64,
}

impl DispatchStats {
    pub fn rollback_no_target(&self) -> u64 {
        self.rollback_no_target.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// BetSolutions wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetSolutionsEndpoint {
    Balance,
    Bet,
    Win,
    Rollback,
}

impl BetSolutionsEndpoint {
    fn action(&self) -> CallbackAction {
        match self {
            BetSolutionsEndpoint::Balance => CallbackAction::Balance,
            BetSolutionsEndpoint::Bet => CallbackAction::Bet,
            BetSolutionsEndpoint::Win => CallbackAction::Win,
            BetSolutionsEndpoint::Rollback => CallbackAction::Rollback,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetSolutionsRequest {
    pub player_id: Uuid,
    /// Integer cents.
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub round_id: Option<String>,
    #[serde(default)]
    pub game_id: Option<String>,
    pub hash: String,
}

impl BetSolutionsRequest {
    /// Significant fields in wire order; the hash signs this string.
    pub fn signing_string(&self) -> String {
        format!(
            "{}{}{}{}",
            self.player_id,
            self.amount,
            self.transaction_id,
            self.round_id.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetSolutionsResponse {
    pub status_code: u16,
    /// Integer cents.
    pub balance: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BetSolutionsResponse {
    fn ok(balance: i64) -> Self {
        Self { status_code: 200, balance, error: None }
    }

    fn failure(status_code: u16, error: &str) -> Self {
        Self {
            status_code,
            balance: 0,
            error: Some(error.to_string()),
        }
    }
}

fn betsolutions_status(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Conflict => 400,
        ErrorKind::ProviderProtocol => 401,
        ErrorKind::Transient | ErrorKind::Internal => 500,
    }
}

// ---------------------------------------------------------------------------
// Pragmatic Play wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PragmaticRequest {
    pub user_id: Uuid,
    /// Decimal string in currency units ("10.50").
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub currency: Option<String>,
    /// balance | bet | result | refund
    pub action: String,
    #[serde(default)]
    pub round_id: Option<String>,
    #[serde(default)]
    pub game_id: Option<String>,
    pub hash: String,
}

impl PragmaticRequest {
    pub fn signing_string(&self) -> String {
        format!(
            "{}{}{}{}",
            self.user_id,
            self.amount.as_deref().unwrap_or(""),
            self.reference,
            self.action
        )
    }
}

/// Pragmatic responses are always HTTP 200; `error` carries the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PragmaticResponse {
    pub cash: String,
    pub bonus: String,
    pub currency: String,
    pub error: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PragmaticResponse {
    fn ok(player: &Player) -> Self {
        Self {
            cash: format_cents(player.balance),
            bonus: format_cents(player.bonus_balance),
            currency: player.currency.clone(),
            error: 0,
            description: None,
        }
    }

    fn failure(kind: ErrorKind) -> Self {
        Self {
            cash: format_cents(0),
            bonus: format_cents(0),
            currency: String::new(),
            error: 1,
            description: Some(kind.as_str().to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct ProviderDispatcher {
    pool: PgPool,
    config: Arc<Config>,
    stats: Arc<DispatchStats>,
}

impl ProviderDispatcher {
    pub fn new(pool: PgPool, config: Arc<Config>, stats: Arc<DispatchStats>) -> Self {
        Self { pool, config, stats }
    }

    /// Full BetSolutions request cycle: parse, verify, dispatch, shape.
    pub async fn handle_betsolutions(
        &self,
        endpoint: BetSolutionsEndpoint,
        body: &[u8],
    ) -> BetSolutionsResponse {
        let request: BetSolutionsRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => return BetSolutionsResponse::failure(400, &format!("malformed body: {e}")),
        };

        if verify_signature(
            &self.config.providers.betsolutions_secret,
            &request.signing_string(),
            &request.hash,
        )
        .is_err()
        {
            return BetSolutionsResponse::failure(401, "invalid signature");
        }

        let callback = WalletCallback {
            action: endpoint.action(),
            manufacturer_id: MANUFACTURER_BETSOLUTIONS,
            player_id: request.player_id,
            amount: request.amount,
            currency: None,
            tx_id: request.transaction_id,
            round_id: request.round_id,
            game_id: request.game_id,
        };

        match self.dispatch(callback).await {
            Ok(player) => BetSolutionsResponse::ok(player.balance),
            Err(e) => {
                let kind = e.kind();
                warn!(error = %e, kind = %kind, "betsolutions dispatch failed");
                BetSolutionsResponse::failure(betsolutions_status(kind), kind.as_str())
            }
        }
    }

    /// Full Pragmatic request cycle. The HTTP layer always answers 200.
    pub async fn handle_pragmatic(&self, body: &[u8]) -> PragmaticResponse {
        let request: PragmaticRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(_) => return PragmaticResponse::failure(ErrorKind::ProviderProtocol),
        };

        if verify_signature(
            &self.config.providers.pragmatic_secret,
            &request.signing_string(),
            &request.hash,
        )
        .is_err()
        {
            return PragmaticResponse::failure(ErrorKind::ProviderProtocol);
        }

        let callback = match self.normalize_pragmatic(request) {
            Ok(callback) => callback,
            Err(e) => return PragmaticResponse::failure(e.kind()),
        };

        match self.dispatch(callback).await {
            Ok(player) => PragmaticResponse::ok(&player),
            Err(e) => {
                let kind = e.kind();
                warn!(error = %e, kind = %kind, "pragmatic dispatch failed");
                PragmaticResponse::failure(kind)
            }
        }
    }

    fn normalize_pragmatic(&self, request: PragmaticRequest) -> WalletResult<WalletCallback> {
        let action = match request.action.as_str() {
            "balance" => CallbackAction::Balance,
            "bet" => CallbackAction::Bet,
            "result" => CallbackAction::Win,
            "refund" => CallbackAction::Rollback,
            other => {
                return Err(WalletError::ProviderProtocol(format!("unknown action {other:?}")))
            }
        };

        let amount = match (&request.amount, action) {
            (_, CallbackAction::Balance) => 0,
            (Some(raw), _) => parse_decimal_to_cents(raw)
                .map_err(|e| WalletError::ProviderProtocol(format!("bad amount: {e}")))?,
            (None, CallbackAction::Rollback) => 0,
            (None, _) => {
                return Err(WalletError::ProviderProtocol("missing amount".to_string()))
            }
        };

        Ok(WalletCallback {
            action,
            manufacturer_id: MANUFACTURER_PRAGMATIC,
            player_id: request.user_id,
            amount,
            currency: request.currency,
            tx_id: request.reference,
            round_id: request.round_id,
            game_id: request.game_id,
        })
    }

    /// Run the matching ledger command inside a fresh retrying transaction
    /// and return the resulting player snapshot.
    pub async fn dispatch(&self, callback: WalletCallback) -> WalletResult<Player> {
        let pool = self.pool.clone();
        let stats = Arc::clone(&self.stats);

        with_wallet_tx!(&pool, tx, {
            let cb = &callback;
            match cb.action {
                CallbackAction::Balance => ledger::lock_player(&mut tx, cb.player_id).await,
                CallbackAction::Bet => {
                    let external = ExternalRef::new(cb.manufacturer_id, cb.tx_id.clone());
                    let metadata = cb
                        .game_id
                        .as_ref()
                        .map(|game_id| serde_json::json!({"game_id": game_id}));
                    ledger::place_bet(
                        &mut tx,
                        cb.player_id,
                        cb.amount,
                        Some(external),
                        cb.round_id.clone(),
                        metadata,
                    )
                    .await
                    .map(|outcome| outcome.player)
                }
                CallbackAction::Win => {
                    let external = ExternalRef::new(cb.manufacturer_id, cb.tx_id.clone());
                    let metadata = cb
                        .game_id
                        .as_ref()
                        .map(|game_id| serde_json::json!({"game_id": game_id}));
                    ledger::credit_win(
                        &mut tx,
                        cb.player_id,
                        cb.amount,
                        None,
                        WinType::Normal,
                        Some(external),
                        cb.round_id.clone(),
                        metadata,
                    )
                    .await
                    .map(|outcome| outcome.player)
                }
                CallbackAction::Rollback => {
                    let player = ledger::lock_player(&mut tx, cb.player_id).await?;
                    let key = ExternalRef::new(cb.manufacturer_id, cb.tx_id.clone());
                    match ledger::find_existing(&mut tx, cb.player_id, &key).await? {
                        // Never saw the original: absorb as an idempotent
                        // success, but keep it observable.
                        None => {
                            stats.rollback_no_target.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                player_id = %cb.player_id,
                                tx_id = %cb.tx_id,
                                manufacturer = cb.manufacturer_id,
                                "rollback with no target"
                            );
                            Ok(player)
                        }
                        Some(original) => {
                            let external = ExternalRef::new(
                                cb.manufacturer_id,
                                format!("rollback_{}", cb.tx_id),
                            );
                            ledger::cancel_transaction(
                                &mut tx,
                                cb.player_id,
                                original.id,
                                Some(external),
                            )
                            .await
                            .map(|outcome| outcome.player)
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_round_trip() {
        let message = "p-1100tx-9round-3";
        let hash = sign("secret", message);
        assert!(verify_signature("secret", message, &hash).is_ok());
    }

    #[test]
    fn tampered_message_or_wrong_secret_fails() {
        let hash = sign("secret", "amount=100");
        assert!(verify_signature("secret", "amount=900", &hash).is_err());
        assert!(verify_signature("other", "amount=100", &hash).is_err());
        assert!(verify_signature("secret", "amount=100", "zz-not-hex").is_err());
    }

    #[test]
    fn betsolutions_signing_string_is_field_order() {
        let player_id = Uuid::new_v4();
        let request = BetSolutionsRequest {
            player_id,
            amount: 2500,
            transaction_id: "t-77".to_string(),
            round_id: Some("r-9".to_string()),
            game_id: None,
            hash: String::new(),
        };
        assert_eq!(request.signing_string(), format!("{player_id}2500t-77r-9"));
    }

    #[test]
    fn betsolutions_response_codes_by_kind() {
        assert_eq!(betsolutions_status(ErrorKind::Validation), 400);
        assert_eq!(betsolutions_status(ErrorKind::NotFound), 400);
        assert_eq!(betsolutions_status(ErrorKind::Conflict), 400);
        assert_eq!(betsolutions_status(ErrorKind::ProviderProtocol), 401);
        assert_eq!(betsolutions_status(ErrorKind::Transient), 500);
        assert_eq!(betsolutions_status(ErrorKind::Internal), 500);
    }

    #[test]
    fn pragmatic_failure_is_error_one_with_description() {
        let response = PragmaticResponse::failure(ErrorKind::Validation);
        assert_eq!(response.error, 1);
        assert_eq!(response.description.as_deref(), Some("validation"));
        assert_eq!(response.cash, "0.00");
    }

    #[test]
    fn pragmatic_request_parses_wire_names() {
        let body = serde_json::json!({
            "userId": Uuid::new_v4(),
            "amount": "10.5",
            "reference": "ref-1",
            "currency": "EUR",
            "action": "bet",
            "hash": "00",
        });
        let request: PragmaticRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.action, "bet");
        assert_eq!(parse_decimal_to_cents(request.amount.as_deref().unwrap()).unwrap(), 1050);
    }
}
