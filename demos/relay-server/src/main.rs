//! Demo relay: routes simulated agent executions to WebSocket surfaces.
//!
//! Run with: cargo run -p relay-server-demo
//!
//! Connect a surface to `ws://127.0.0.1:3000/ws`, send a handshake such as
//! `{"type":"HANDSHAKE","payload":{"kind":"surface","windowId":1}}`, then
//! drive the host and engine over HTTP:
//!
//! ```text
//! POST   /windows/1/tabs/10/run       {"prompt":"hello"}
//! POST   /windows/1/tabs/10/activate
//! DELETE /tabs/10
//! ```

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use agent_relay_core::{
    ChannelRegistry, ExecutionId, MemoryTabHost, Message, MessageRole, RelayConfig, StreamEvent,
    TabHost, TabId, WindowId, WorkflowStatus,
};
use agent_relay_router::ConnectionRegistry;
use agent_relay_transport::websocket::create_ws_router;
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    host: Arc<MemoryTabHost>,
    channels: Arc<ChannelRegistry>,
    registry: Arc<ConnectionRegistry>,
}

#[derive(Deserialize)]
struct RunRequest {
    prompt: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::load()?;
    tracing::debug!(?config, "Loaded configuration");

    let host = Arc::new(MemoryTabHost::new());
    let channels = Arc::new(ChannelRegistry::new());
    let registry = Arc::new(ConnectionRegistry::new(
        Arc::clone(&channels),
        Arc::clone(&host) as Arc<dyn TabHost>,
    ));
    let state = AppState {
        host,
        channels: Arc::clone(&channels),
        registry: Arc::clone(&registry),
    };

    // Drop channels nobody listens to or produces for
    let sweep_interval = config.sweep_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let pruned = channels.prune();
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned idle channels");
            }
        }
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/windows/{window_id}/tabs/{tab_id}/run", post(run_handler))
        .route(
            "/windows/{window_id}/tabs/{tab_id}/activate",
            post(activate_handler),
        )
        .route("/tabs/{tab_id}", delete(close_handler))
        .with_state(state)
        .merge(create_ws_router(registry))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Relay listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "connections": state.registry.connection_count(),
        "channels": state.channels.len(),
    }))
}

async fn activate_handler(
    State(state): State<AppState>,
    Path((window_id, tab_id)): Path<(WindowId, TabId)>,
) -> Json<Value> {
    state.host.activate_tab(window_id, tab_id);
    let notified = state.registry.on_tab_activated(window_id, tab_id);
    Json(json!({ "notified": notified }))
}

async fn close_handler(State(state): State<AppState>, Path(tab_id): Path<TabId>) -> Json<Value> {
    state.host.close_tab(tab_id);
    let disconnected = state.registry.on_tab_removed(tab_id);
    Json(json!({ "disconnected": disconnected }))
}

async fn run_handler(
    State(state): State<AppState>,
    Path((window_id, tab_id)): Path<(WindowId, TabId)>,
    Json(request): Json<RunRequest>,
) -> Json<Value> {
    state.host.open_tab(window_id, tab_id);

    let provisional = ExecutionId::new(format!("pending-{}", Uuid::new_v4()));
    state.registry.bind_tab_execution(tab_id, provisional.clone());
    tokio::spawn(simulate_execution(state, provisional.clone(), request.prompt));

    Json(json!({ "executionId": provisional }))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Stand-in for an agent engine: echoes the prompt, streams a reply word by
/// word under one message id, and swaps its provisional id for a durable one
/// partway through.
async fn simulate_execution(state: AppState, provisional: ExecutionId, prompt: String) {
    let AppState {
        channels, registry, ..
    } = state;

    channels.publish(&provisional, WorkflowStatus::Running);
    channels.publish(
        &provisional,
        StreamEvent::Message {
            message: Message::new(
                Uuid::new_v4().to_string(),
                MessageRole::User,
                prompt.clone(),
                now_millis(),
            ),
        },
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    let execution_id = ExecutionId::new(Uuid::new_v4().to_string());
    registry.migrate_execution(&provisional, &execution_id);
    tracing::info!(%provisional, %execution_id, "Execution accepted");

    let reply_id = Uuid::new_v4().to_string();
    let mut reply = String::new();
    for word in format!("You said: {prompt}").split_whitespace() {
        if !reply.is_empty() {
            reply.push(' ');
        }
        reply.push_str(word);
        channels.publish(
            &execution_id,
            StreamEvent::Message {
                message: Message::new(
                    reply_id.clone(),
                    MessageRole::Assistant,
                    reply.clone(),
                    now_millis(),
                ),
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    channels.publish(&execution_id, WorkflowStatus::Success);
    channels.release(&execution_id);
}
