//! Transport front ends.
//!
//! Two ways in: `POST /run` on the HTTP port, and a WebSocket listener on
//! its own port where every text frame is a task document. Both build one
//! session per task, run it to completion, and reply with the result
//! payload; an uncaught run error becomes a `failure` result, never a dead
//! serving process. The HTTP port also serves `/stat`, `/healthz` and
//! `/metrics`.

use crate::command::{TaskRequest, TaskResult};
use crate::config::Config;
use crate::metrics;
use crate::session::{self, Session};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use warp::Filter;

const MAX_BODY_BYTES: u64 = 50 * 1024 * 1024;

/// Run both front ends until the process is stopped.
pub async fn run(config: Config) -> Result<()> {
    let ws_config = config.clone();
    let ws = tokio::spawn(async move {
        if let Err(e) = run_ws(ws_config).await {
            warn!("websocket listener failed: {e}");
        }
    });
    run_http(config).await;
    ws.abort();
    Ok(())
}

/// Execute one task document in a fresh session.
pub async fn run_task(request: TaskRequest, config: &Config) -> TaskResult {
    // The echo in the result reflects the document as received, before the
    // default time budget is filled in.
    let mut bounded = request.clone();
    if bounded.timeout_millis.is_none() {
        bounded.timeout_millis = Some(config.request_timeout_ms);
    }
    let mut session = Session::new(config);
    let outcome = session.start(&bounded).await;
    if let Err(e) = &outcome {
        warn!("task failed: {e}");
    }
    let result = session.result(&outcome, &request);
    session.close().await;
    result
}

// ── HTTP ────────────────────────────────────────────────────────────────────

async fn run_http(config: Config) {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));

    let run_config = config.clone();
    let run_route = warp::path("run")
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and_then(move |request: TaskRequest| {
            let config = run_config.clone();
            async move {
                let result = run_task(request, &config).await;
                Ok::<_, warp::Rejection>(warp::reply::json(&result))
            }
        });

    let stat_route = warp::path("stat").and(warp::get()).map(|| {
        warp::reply::json(&json!({
            "activeSessions": session::active_sessions(),
        }))
    });

    let healthz_route = warp::path("healthz").and(warp::get()).map(|| "ok");

    let version_route = warp::path("version")
        .and(warp::get())
        .map(|| env!("CARGO_PKG_VERSION"));

    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .map(metrics::render);

    let routes = run_route
        .or(stat_route)
        .or(healthz_route)
        .or(version_route)
        .or(metrics_route);

    info!("http listening on {addr}");
    warp::serve(routes).run(addr).await;
}

// ── WebSocket ───────────────────────────────────────────────────────────────

async fn run_ws(config: Config) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind websocket listener to {addr}"))?;
    info!("websocket listening on {addr}");

    loop {
        let (stream, peer) = listener.accept().await?;
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, config).await {
                warn!(%peer, "connection error: {e}");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, config: Config) -> Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut writer, mut reader) = ws_stream.split();

    writer.send(Message::Text("hello".into())).await?;

    while let Some(message) = reader.next().await {
        match message? {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<TaskRequest>(text.as_str()) {
                    Ok(request) => run_task(request, &config).await,
                    Err(e) => {
                        TaskResult::rejected(format!("invalid task document: {e}"), text.as_str())
                    }
                };
                let frame = serde_json::to_string(&reply)?;
                writer.send(Message::Text(frame.into())).await?;
            }
            Message::Ping(payload) => writer.send(Message::Pong(payload)).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(())
}
