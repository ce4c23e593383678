//! Error taxonomy for the wallet engine.
//!
//! Command-level errors surface directly to the caller, which rolls back the
//! enclosing DB transaction. Classification is by PostgreSQL SQLSTATE code
//! rather than message text.

use std::fmt;

use tracing::debug;

// Configuration constants for concurrency control
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_DELAY_MS: u64 = 10;

/// PostgreSQL SQLSTATE codes the engine cares about.
/// Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
pub mod pg_error_codes {
    // Class 40 — Transaction Rollback
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";

    // Class 23 — Integrity Constraint Violation
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHECK_VIOLATION: &str = "23514";
}

/// Coarse error kind exposed to callers and mapped onto wire responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    ProviderProtocol,
    Transient,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ProviderProtocol => "provider_protocol",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {message}")]
    Conflict {
        /// SQLSTATE when the conflict came from the database.
        code: Option<String>,
        message: String,
    },

    #[error("provider protocol violation: {0}")]
    ProviderProtocol(String),

    #[error("transient database error")]
    Transient(#[source] sqlx::Error),

    #[error("database error")]
    Database(#[source] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WalletError {
    pub fn validation(msg: impl Into<String>) -> Self {
        WalletError::Validation(msg.into())
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        WalletError::NotFound(entity.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WalletError::Validation(_) => ErrorKind::Validation,
            WalletError::NotFound(_) => ErrorKind::NotFound,
            WalletError::Conflict { .. } => ErrorKind::Conflict,
            WalletError::ProviderProtocol(_) => ErrorKind::ProviderProtocol,
            WalletError::Transient(_) => ErrorKind::Transient,
            WalletError::Database(_) | WalletError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether re-running the whole transaction may succeed. Serialization
    /// failures, deadlocks and idempotency-key races qualify; a CHECK
    /// violation (balance underflow) is deterministic and does not.
    pub fn is_retryable(&self) -> bool {
        let retryable = match self {
            WalletError::Transient(_) => true,
            WalletError::Conflict { code: Some(code), .. } => matches!(
                code.as_str(),
                pg_error_codes::SERIALIZATION_FAILURE
                    | pg_error_codes::DEADLOCK_DETECTED
                    | pg_error_codes::UNIQUE_VIOLATION
            ),
            _ => false,
        };

        if retryable {
            debug!(error = %self, "detected retryable error");
        }

        retryable
    }
}

impl From<sqlx::Error> for WalletError {
    fn from(e: sqlx::Error) -> Self {
        // Pull the SQLSTATE out first so `e` can move into a variant below.
        let conflict = match &e {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(
                    code @ (pg_error_codes::UNIQUE_VIOLATION
                    | pg_error_codes::CHECK_VIOLATION
                    | pg_error_codes::SERIALIZATION_FAILURE
                    | pg_error_codes::DEADLOCK_DETECTED),
                ) => Some((code.to_string(), db.message().to_string())),
                _ => None,
            },
            _ => None,
        };

        if let Some((code, message)) = conflict {
            return WalletError::Conflict {
                code: Some(code),
                message,
            };
        }

        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => WalletError::Transient(e),
            sqlx::Error::RowNotFound => WalletError::NotFound("row".to_string()),
            _ => WalletError::Database(e),
        }
    }
}

pub type WalletResult<T> = Result<T, WalletError>;

/// Run `$body` inside a fresh READ COMMITTED transaction bound to `$tx_var`,
/// retrying retryable failures with exponential backoff and jitter.
#[macro_export]
macro_rules! with_wallet_tx {
    ($pool:expr, $tx_var:ident, $body:block) => {{
        let mut attempt: u32 = 1;
        loop {
            let mut $tx_var = match $pool.begin().await {
                Ok(tx) => tx,
                Err(e) => break Err($crate::error::WalletError::from(e)),
            };

            let result: Result<_, $crate::error::WalletError> = async { $body }.await;

            let outcome = match result {
                Ok(value) => match $tx_var.commit().await {
                    Ok(()) => Ok(value),
                    Err(e) => Err($crate::error::WalletError::from(e)),
                },
                Err(e) => {
                    $tx_var.rollback().await.ok();
                    Err(e)
                }
            };

            match outcome {
                Ok(value) => break Ok(value),
                Err(e) => {
                    if e.is_retryable() && attempt < $crate::error::MAX_RETRY_ATTEMPTS {
                        let jitter = {
                            use rand::Rng;
                            rand::thread_rng().gen_range(0..10)
                        };
                        let delay_ms =
                            $crate::error::BASE_RETRY_DELAY_MS * (attempt as u64) + jitter;
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        continue;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_wire_names() {
        assert_eq!(WalletError::validation("x").kind().as_str(), "validation");
        assert_eq!(WalletError::not_found("player").kind().as_str(), "not_found");
        assert_eq!(
            WalletError::ProviderProtocol("bad hash".into()).kind().as_str(),
            "provider_protocol"
        );
    }

    #[test]
    fn check_violation_is_conflict_but_not_retryable() {
        let err = WalletError::Conflict {
            code: Some(pg_error_codes::CHECK_VIOLATION.to_string()),
            message: "balance underflow".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_retryable());
    }

    #[test]
    fn idempotency_race_is_retryable() {
        let err = WalletError::Conflict {
            code: Some(pg_error_codes::UNIQUE_VIOLATION.to_string()),
            message: "duplicate key".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn row_not_found_classifies_as_not_found() {
        let err = WalletError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
