//! Transactional outbox: drafts are written in the same DB transaction as the
//! ledger entry they describe; a polling relay drains them to the message bus
//! afterwards. Delivery is at-least-once; consumers dedupe by event id.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::{WalletError, WalletResult};
use crate::repo::LedgerTransaction;

pub const AGGREGATE_WALLET: &str = "wallet";
pub const EVENT_TRANSACTION_POSTED: &str = "TransactionPosted";

/// An event staged for publication, not yet assigned a sequence id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxDraft {
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub partition_key: String,
    pub headers: serde_json::Value,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl OutboxDraft {
    /// Draft for a freshly appended ledger entry.
    pub fn transaction_posted(entry: &LedgerTransaction) -> WalletResult<Self> {
        let payload = serde_json::to_value(entry)
            .map_err(|e| WalletError::Internal(anyhow::anyhow!("event payload: {e}")))?;
        Ok(Self {
            event_id: Uuid::new_v4(),
            aggregate_type: AGGREGATE_WALLET.to_string(),
            aggregate_id: entry.player_id.to_string(),
            event_type: EVENT_TRANSACTION_POSTED.to_string(),
            partition_key: entry.player_id.to_string(),
            headers: serde_json::json!({}),
            payload,
            occurred_at: entry.created_at,
        })
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub partition_key: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// The wire envelope handed to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl From<&OutboxEvent> for EventEnvelope {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            event_id: event.event_id,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            occurred_at: event.occurred_at,
        }
    }
}

pub fn topic(prefix: &str, aggregate_type: &str, event_type: &str) -> String {
    format!("{prefix}.{aggregate_type}.{event_type}")
}

fn event_from_row(row: &PgRow) -> WalletResult<OutboxEvent> {
    Ok(OutboxEvent {
        id: row.try_get("id").map_err(WalletError::from)?,
        event_id: row.try_get("event_id").map_err(WalletError::from)?,
        aggregate_type: row.try_get("aggregate_type").map_err(WalletError::from)?,
        aggregate_id: row.try_get("aggregate_id").map_err(WalletError::from)?,
        event_type: row.try_get("event_type").map_err(WalletError::from)?,
        partition_key: row.try_get("partition_key").map_err(WalletError::from)?,
        payload: row.try_get("payload").map_err(WalletError::from)?,
        occurred_at: row.try_get("occurred_at").map_err(WalletError::from)?,
        published_at: row.try_get("published_at").map_err(WalletError::from)?,
    })
}

pub struct OutboxRepo;

impl OutboxRepo {
    /// Must run inside the same transaction as the ledger entry it describes.
    pub async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        draft: &OutboxDraft,
    ) -> WalletResult<()> {
        sqlx::query(
            "INSERT INTO event_outbox
                (event_id, aggregate_type, aggregate_id, event_type, partition_key,
                 headers, payload, occurred_at, published_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL)",
        )
        .bind(draft.event_id)
        .bind(&draft.aggregate_type)
        .bind(&draft.aggregate_id)
        .bind(&draft.event_type)
        .bind(&draft.partition_key)
        .bind(&draft.headers)
        .bind(&draft.payload)
        .bind(draft.occurred_at)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Oldest unpublished events first, by sequence id (not occurred_at, to
    /// stay correct under clock skew).
    pub async fn fetch_unpublished(pool: &PgPool, limit: i64) -> WalletResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            "SELECT id, event_id, aggregate_type, aggregate_id, event_type,
                    partition_key, payload, occurred_at, published_at
             FROM event_outbox
             WHERE published_at IS NULL
             ORDER BY id ASC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn mark_published(pool: &PgPool, id: i64) -> WalletResult<()> {
        sqlx::query("UPDATE event_outbox SET published_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

/// The bus behind the relay. Swap the implementation (Kafka, NATS, SQS)
/// without touching the engine.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> anyhow::Result<()>;
}

/// Default in-process bus: fans envelopes out on a tokio broadcast channel.
pub struct BroadcastBus {
    tx: broadcast::Sender<String>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> anyhow::Result<()> {
        let message = serde_json::json!({
            "topic": topic,
            "partition_key": partition_key,
            "value": envelope,
        })
        .to_string();
        // No subscribers is not a delivery failure for an in-process bus.
        let _ = self.tx.send(message);
        Ok(())
    }
}

/// Poller that drains the outbox to the bus. Multiple relays against the same
/// table are safe but waste work; run a single instance.
pub struct OutboxRelay {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: OutboxConfig,
}

impl OutboxRelay {
    pub fn new(pool: PgPool, bus: Arc<dyn EventBus>, config: OutboxConfig) -> Self {
        Self { pool, bus, config }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.config.poll_interval_ms,
            batch = self.config.batch_size,
            "outbox relay started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_once().await {
                        error!(error = %e, "outbox poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("outbox relay stopped");
    }

    /// Publish one batch. Each event is marked published individually so a
    /// bus failure never advances the cursor past an undelivered event.
    pub async fn drain_once(&self) -> WalletResult<usize> {
        let events = OutboxRepo::fetch_unpublished(&self.pool, self.config.batch_size).await?;
        let mut published = 0;

        for event in &events {
            let topic = topic(
                &self.config.topic_prefix,
                &event.aggregate_type,
                &event.event_type,
            );
            let envelope = EventEnvelope::from(event);

            match self.bus.publish(&topic, &event.partition_key, &envelope).await {
                Ok(()) => {
                    OutboxRepo::mark_published(&self.pool, event.id).await?;
                    published += 1;
                    debug!(event_id = %event.event_id, %topic, "event published");
                }
                Err(e) => {
                    // Leave this and every later event unpublished; the next
                    // poll re-attempts in sequence order.
                    error!(event_id = %event.event_id, error = %e, "publish failed");
                    break;
                }
            }
        }

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_prefix_aggregate_event() {
        assert_eq!(
            topic("wallet", AGGREGATE_WALLET, EVENT_TRANSACTION_POSTED),
            "wallet.wallet.TransactionPosted"
        );
    }

    #[test]
    fn envelope_carries_the_event_identity() {
        let event = OutboxEvent {
            id: 7,
            event_id: Uuid::new_v4(),
            aggregate_type: AGGREGATE_WALLET.to_string(),
            aggregate_id: "p1".to_string(),
            event_type: EVENT_TRANSACTION_POSTED.to_string(),
            partition_key: "p1".to_string(),
            payload: serde_json::json!({"amount": 100}),
            occurred_at: Utc::now(),
            published_at: None,
        };
        let envelope = EventEnvelope::from(&event);
        assert_eq!(envelope.event_id, event.event_id);
        assert_eq!(envelope.aggregate_id, "p1");
        assert_eq!(envelope.payload["amount"], 100);
    }

    #[tokio::test]
    async fn broadcast_bus_delivers_to_subscribers() {
        let bus = BroadcastBus::new(16);
        let mut rx = bus.subscribe();
        let event = OutboxEvent {
            id: 1,
            event_id: Uuid::new_v4(),
            aggregate_type: AGGREGATE_WALLET.to_string(),
            aggregate_id: "p1".to_string(),
            event_type: EVENT_TRANSACTION_POSTED.to_string(),
            partition_key: "p1".to_string(),
            payload: serde_json::json!({}),
            occurred_at: Utc::now(),
            published_at: None,
        };
        bus.publish("wallet.wallet.TransactionPosted", "p1", &EventEnvelope::from(&event))
            .await
            .unwrap();
        let message = rx.recv().await.unwrap();
        assert!(message.contains("wallet.wallet.TransactionPosted"));
    }
}
