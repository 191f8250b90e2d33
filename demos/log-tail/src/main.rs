//! Demo: attach to a running execution and tail its log.
//!
//! Run with: cargo run -p log-tail-demo
//!
//! Starts an in-process mock console server, attaches a live view to one
//! execution, prints the replayed and live log lines as they arrive, and
//! shows the one-time switch to static mode when the execution completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use exec_console_events::{
    ClientCommand, LogStream, ReplayEntry, RunStatus, ServerEvent,
};
use exec_console_link::{Link, LinkConfig, StaticToken, WsConnector};
use exec_console_views::{
    ApiError, AttachOptions, ExecutionApi, ExecutionResult, ExecutionSnapshot, OutputFile,
    ViewMode, attach,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct ServerState {
    completed: Arc<AtomicBool>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let completed = Arc::new(AtomicBool::new(false));

    // Mock console server.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(ServerState {
            completed: Arc::clone(&completed),
        });
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("mock server failed: {e}");
        }
    });
    tracing::info!("mock console listening on {addr}");

    // The link is owned here, the root context; views only borrow it.
    let link = Link::new(
        LinkConfig::new(format!("ws://{addr}/ws")),
        Arc::new(WsConnector::new()),
        Arc::new(StaticToken::new("demo-token")),
    );
    let api: Arc<dyn ExecutionApi> = Arc::new(DemoApi { completed });

    let attachment = attach(link.clone(), api, "exec-demo", AttachOptions::default()).await?;
    tracing::info!("attached to exec-demo");

    let mut changes = attachment.changes();
    let mut printed = 0u64;
    loop {
        let state = attachment.snapshot();
        for entry in state.log.entries().iter() {
            if entry.seq < printed {
                continue;
            }
            let stream = match entry.stream {
                LogStream::Stdout => "out",
                LogStream::Stderr => "err",
                LogStream::System => "sys",
            };
            println!("[{stream}] {}", entry.text);
            printed = entry.seq + 1;
        }
        if state.mode == ViewMode::Static {
            println!("execution finished: {:?}", state.status);
            if let Some(result) = &state.result {
                println!("exit code: {:?}", result.exit_code);
            }
            for file in &state.outputs {
                println!("output file: {} ({} bytes)", file.name, file.size);
            }
            break;
        }
        if changes.changed().await.is_err() {
            break;
        }
    }

    attachment.detach();
    link.disconnect();
    Ok(())
}

struct DemoApi {
    completed: Arc<AtomicBool>,
}

#[async_trait]
impl ExecutionApi for DemoApi {
    async fn fetch_execution(&self, id: &str) -> Result<ExecutionSnapshot, ApiError> {
        let done = self.completed.load(Ordering::SeqCst);
        Ok(ExecutionSnapshot {
            id: id.to_string(),
            status: if done {
                RunStatus::Completed
            } else {
                RunStatus::Running
            },
            started_at: Some(now_millis()),
            completed_at: done.then(now_millis),
            result: done.then(|| ExecutionResult {
                exit_code: Some(0),
                output: Some("3 steps completed".into()),
                error: None,
            }),
        })
    }

    async fn fetch_log_snapshot(
        &self,
        _id: &str,
        _limit: usize,
    ) -> Result<Vec<ReplayEntry>, ApiError> {
        Ok(vec![ReplayEntry {
            stream: LogStream::System,
            text: "archived log".into(),
        }])
    }

    async fn fetch_output_listing(&self, _id: &str) -> Result<Vec<OutputFile>, ApiError> {
        Ok(vec![OutputFile {
            name: "result.json".into(),
            size: 512,
        }])
    }

    async fn stop_execution(&self, _id: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("failed to serialize event: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("websocket error: {e}");
                break;
            }
        };

        let cmd: ClientCommand = match serde_json::from_str(&text) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("invalid command: {e}");
                continue;
            }
        };

        match cmd {
            ClientCommand::Join { channel_id } => {
                tracing::info!(channel = %channel_id, "client joined");
                tokio::spawn(run_execution(
                    tx.clone(),
                    channel_id,
                    Arc::clone(&state.completed),
                ));
            }
            ClientCommand::Leave { channel_id } => {
                tracing::info!(channel = %channel_id, "client left");
            }
        }
    }

    send_task.abort();
}

/// Scripted execution: ack, replay, three live steps, completion.
async fn run_execution(
    tx: mpsc::UnboundedSender<ServerEvent>,
    channel_id: String,
    completed: Arc<AtomicBool>,
) {
    let _ = tx.send(ServerEvent::MembershipAck {
        channel_id: channel_id.clone(),
    });
    let _ = tx.send(ServerEvent::InitialReplay {
        channel_id: channel_id.clone(),
        entries: vec![
            ReplayEntry {
                stream: LogStream::System,
                text: "preparing workspace".into(),
            },
            ReplayEntry {
                stream: LogStream::Stdout,
                text: "resolving inputs".into(),
            },
        ],
    });

    for step in 1..=3 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tx.send(ServerEvent::Output {
            channel_id: channel_id.clone(),
            text: format!("step {step} of 3 done"),
            timestamp: Some(now_millis()),
        });
    }

    completed.store(true, Ordering::SeqCst);
    let _ = tx.send(ServerEvent::Completed {
        channel_id,
        status: RunStatus::Completed,
        exit_code: Some(0),
        error_message: None,
        completed_at: now_millis(),
    });
}
