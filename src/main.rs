use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use spx_setup_engine::api;
use spx_setup_engine::scheduler::run_scheduler;
use spx_setup_engine::setup_core::cache::MemoryKvStore;
use spx_setup_engine::sources::snapshot_dir::SnapshotDir;
use spx_setup_engine::{AppState, SetupEngine, WsMessage};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory the upstream engines write their JSON snapshots to
    #[arg(short, long, env = "SPX_SNAPSHOT_DIR", default_value = "data/live")]
    snapshot_dir: PathBuf,

    /// Port to run the web server on
    #[arg(short, long, env = "SPX_SETUP_PORT", default_value = "3000")]
    port: u16,

    /// Seconds between scheduled detection cycles
    #[arg(long, env = "SPX_SETUP_POLL_SECS", default_value = "15")]
    poll_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("spx_setup_engine=info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("Starting SPX setup engine");
    info!("Snapshot dir: {}", args.snapshot_dir.display());
    info!("Port: {}", args.port);
    info!("Poll interval: {}s", args.poll_secs);

    let (tx, _rx) = broadcast::channel::<WsMessage>(1000);
    let sources = SnapshotDir::new(&args.snapshot_dir).into_sources();
    let engine = SetupEngine::new(Some(sources), Arc::new(MemoryKvStore::new()));
    let state = Arc::new(AppState::new(engine, tx));

    tokio::spawn(run_scheduler(state.clone(), Duration::from_secs(args.poll_secs.max(1))));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/setups", get(api::get_setups))
        .route("/api/setups/{id}", get(api::get_setup_by_id))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    info!("Server running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.tx.subscribe();

    let active_setups = state.last_setups.read().await.len();
    let welcome = WsMessage::Connected { active_setups };
    if let Ok(json) = serde_json::to_string(&welcome) {
        let _ = sender.send(Message::Text(json.into())).await;
    }

    // Forward trigger notifications to this client
    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Clients only listen; drain until they close
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("WebSocket client disconnected");
}
