// Wallet server: provider callback endpoints, a small admin surface, and the
// embedded outbox relay.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::watch;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use wallet_engine::config::Config;
use wallet_engine::database;
use wallet_engine::error::ErrorKind;
use wallet_engine::outbox::{BroadcastBus, EventBus, OutboxRelay};
use wallet_engine::providers::{
    BetSolutionsEndpoint, BetSolutionsResponse, DispatchStats, PragmaticResponse,
    ProviderDispatcher,
};
use wallet_engine::repo::{PlayerRepo, TransactionRepo};

#[derive(Clone)]
struct AppState {
    db: PgPool,
    dispatcher: Arc<ProviderDispatcher>,
    stats: Arc<DispatchStats>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;

fn error_response(kind: ErrorKind, message: &str) -> (StatusCode, Json<Value>) {
    let status = match kind {
        ErrorKind::Validation | ErrorKind::ProviderProtocol => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Transient | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    // Internal detail stays in the logs, not on the wire.
    let body = match kind {
        ErrorKind::Transient | ErrorKind::Internal => json!({"error": kind.as_str()}),
        _ => json!({"error": kind.as_str(), "message": message}),
    };
    (status, Json(body))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,wallet_engine=debug".to_string()),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    let pool = database::create_pool(&config.database).await?;
    database::init_schema(&pool).await?;

    // Outbox relay runs embedded; a standalone process against the same
    // table works just as well.
    let bus: Arc<dyn EventBus> = Arc::new(BroadcastBus::new(1024));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = OutboxRelay::new(pool.clone(), bus, config.outbox.clone());
    let relay_handle = tokio::spawn(relay.run(shutdown_rx));

    let stats = Arc::new(DispatchStats::default());
    let dispatcher = Arc::new(ProviderDispatcher::new(
        pool.clone(),
        Arc::clone(&config),
        Arc::clone(&stats),
    ));

    let app_state = AppState {
        db: pool.clone(),
        dispatcher,
        stats,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/players", post(create_player))
        .route("/players/:player_id", get(get_player))
        .route("/players/:player_id/transactions", get(list_transactions))
        .route("/betsolutions/balance", post(betsolutions_balance))
        .route("/betsolutions/bet", post(betsolutions_bet))
        .route("/betsolutions/win", post(betsolutions_win))
        .route("/betsolutions/rollback", post(betsolutions_rollback))
        .route("/pragmatic/wallet", post(pragmatic_wallet))
        .layer(RequestBodyLimitLayer::new(config.server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.server.bind).await?;
    info!(bind = %config.server.bind, "wallet server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the relay and give in-flight publishes a bounded drain.
    shutdown_tx.send(true).ok();
    let _ = tokio::time::timeout(Duration::from_secs(5), relay_handle).await;
    info!("wallet server stopped");

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "wallet-engine",
        "rollback_no_target": state.stats.rollback_no_target(),
    }))
}

async fn create_player(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<Value> {
    let currency = payload
        .get("currency")
        .and_then(|v| v.as_str())
        .unwrap_or("EUR");
    match PlayerRepo::create(&state.db, Uuid::new_v4(), currency).await {
        Ok(player) => Ok(Json(json!(player))),
        Err(e) => Err(error_response(e.kind(), &e.to_string())),
    }
}

async fn get_player(
    State(state): State<AppState>,
    Path(player_id): Path<Uuid>,
) -> ApiResult<Value> {
    match PlayerRepo::find_by_id(&state.db, player_id).await {
        Ok(Some(player)) => Ok(Json(json!(player))),
        Ok(None) => Err(error_response(ErrorKind::NotFound, "player not found")),
        Err(e) => Err(error_response(e.kind(), &e.to_string())),
    }
}

async fn list_transactions(
    State(state): State<AppState>,
    Path(player_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Value> {
    let limit: i64 = params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(50)
        .clamp(1, 500);

    let cursor = match (params.get("before_created_at"), params.get("before_id")) {
        (Some(created_at), Some(id)) => {
            let created_at = created_at
                .parse()
                .map_err(|_| error_response(ErrorKind::Validation, "bad before_created_at"))?;
            let id = id
                .parse()
                .map_err(|_| error_response(ErrorKind::Validation, "bad before_id"))?;
            Some((created_at, id))
        }
        _ => None,
    };

    match TransactionRepo::list_by_player(&state.db, player_id, cursor, limit).await {
        Ok(transactions) => Ok(Json(json!({
            "player_id": player_id,
            "transactions": transactions,
            "count": transactions.len(),
        }))),
        Err(e) => Err(error_response(e.kind(), &e.to_string())),
    }
}

async fn betsolutions(
    state: AppState,
    endpoint: BetSolutionsEndpoint,
    body: Bytes,
) -> (StatusCode, Json<BetSolutionsResponse>) {
    let response = state.dispatcher.handle_betsolutions(endpoint, &body).await;
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response))
}

async fn betsolutions_balance(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<BetSolutionsResponse>) {
    betsolutions(state, BetSolutionsEndpoint::Balance, body).await
}

async fn betsolutions_bet(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<BetSolutionsResponse>) {
    betsolutions(state, BetSolutionsEndpoint::Bet, body).await
}

async fn betsolutions_win(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<BetSolutionsResponse>) {
    betsolutions(state, BetSolutionsEndpoint::Win, body).await
}

async fn betsolutions_rollback(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<BetSolutionsResponse>) {
    betsolutions(state, BetSolutionsEndpoint::Rollback, body).await
}

async fn pragmatic_wallet(State(state): State<AppState>, body: Bytes) -> Json<PragmaticResponse> {
    Json(state.dispatcher.handle_pragmatic(&body).await)
}
