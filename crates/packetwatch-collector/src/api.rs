// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface: the dashboard REST endpoints and the websocket feed.
//!
//! REST reads are plain aggregations over the store; the websocket path
//! upgrades the connection and parks it on the broadcast feed. Store access
//! happens on the blocking pool because SQLite calls block.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{header, http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::http_utils::{
    json_response, log_and_create_http_response, preflight_response, HttpResponse,
};
use crate::CollectorContext;

const AGENTS_ENDPOINT_PATH: &str = "/api/agents";
const STATS_ENDPOINT_PREFIX: &str = "/api/stats/";
const RESET_ENDPOINT_PATH: &str = "/api/admin/reset-db";
const WEBSOCKET_ENDPOINT_PATH: &str = "/ws";

/// Path selector for the stats endpoint: one agent id, or the literal
/// `all` for the whole fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentSelector {
    All,
    One(i64),
}

impl AgentSelector {
    fn parse(raw: &str) -> Option<Self> {
        if raw == "all" {
            return Some(Self::All);
        }
        raw.parse().ok().map(Self::One)
    }

    fn agent_id(self) -> Option<i64> {
        match self {
            Self::All => None,
            Self::One(id) => Some(id),
        }
    }
}

/// Maps a timeframe token to the inclusive lower bound it stands for.
/// `all` and unrecognized tokens disable the time filter.
fn timeframe_cutoff(timeframe: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let offset = match timeframe {
        "15m" => Duration::minutes(15),
        "30m" => Duration::minutes(30),
        "1h" => Duration::hours(1),
        "2h" => Duration::hours(2),
        "5h" => Duration::hours(5),
        "24h" => Duration::hours(24),
        "36h" => Duration::hours(36),
        "48h" => Duration::hours(48),
        "1w" => Duration::weeks(1),
        "2w" => Duration::weeks(2),
        "1M" => Duration::days(30),
        "3M" => Duration::days(90),
        "1y" => Duration::days(365),
        _ => return None,
    };
    Some(now - offset)
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

async fn handle_request(
    req: Request<Incoming>,
    context: CollectorContext,
) -> http::Result<HttpResponse> {
    if req.method() == Method::OPTIONS {
        return preflight_response();
    }
    if req.method() == Method::GET && req.uri().path() == WEBSOCKET_ENDPOINT_PATH {
        return upgrade_observer(req, &context);
    }
    let path = req.uri().path().to_string();
    match (req.method(), path.as_str()) {
        (&Method::GET, AGENTS_ENDPOINT_PATH) => list_agents(&context).await,
        (&Method::GET, stats_path) if stats_path.starts_with(STATS_ENDPOINT_PREFIX) => {
            let selector = stats_path[STATS_ENDPOINT_PREFIX.len()..].to_string();
            let timeframe = query_param(req.uri().query(), "timeframe")
                .unwrap_or("all")
                .to_string();
            agent_stats(&context, &selector, &timeframe).await
        }
        (&Method::POST, RESET_ENDPOINT_PATH) => reset_database(&context).await,
        _ => log_and_create_http_response(
            &format!("No handler for {} {path}", req.method()),
            StatusCode::NOT_FOUND,
        ),
    }
}

async fn list_agents(context: &CollectorContext) -> http::Result<HttpResponse> {
    let store = context.store.clone();
    let agents = tokio::task::spawn_blocking(move || {
        let store = store.lock().unwrap_or_else(|e| e.into_inner());
        store.agents()
    })
    .await;
    match agents {
        Ok(Ok(agents)) => json_response(&agents, StatusCode::OK),
        Ok(Err(e)) => log_and_create_http_response(
            &format!("Failed to list agents: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
        Err(e) => log_and_create_http_response(
            &format!("Agent listing task failed: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

async fn agent_stats(
    context: &CollectorContext,
    selector: &str,
    timeframe: &str,
) -> http::Result<HttpResponse> {
    let agent = match AgentSelector::parse(selector) {
        Some(agent) => agent.agent_id(),
        None => {
            return log_and_create_http_response(
                &format!("Invalid agent id: {selector}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };
    let cutoff = timeframe_cutoff(timeframe, Utc::now());
    let store = context.store.clone();
    let stats = tokio::task::spawn_blocking(move || {
        let store = store.lock().unwrap_or_else(|e| e.into_inner());
        store.traffic_stats(agent, cutoff)
    })
    .await;
    match stats {
        Ok(Ok(stats)) => json_response(&stats, StatusCode::OK),
        Ok(Err(e)) => log_and_create_http_response(
            &format!("Failed to compute stats: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
        Err(e) => log_and_create_http_response(
            &format!("Stats task failed: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

/// Empties the database and the volatile scan tracking. Mirrors the
/// dashboard's expectation of a 200 with a status field either way.
async fn reset_database(context: &CollectorContext) -> http::Result<HttpResponse> {
    let store = context.store.clone();
    let detector = context.detector.clone();
    let result = tokio::task::spawn_blocking(move || {
        let mut store = store.lock().unwrap_or_else(|e| e.into_inner());
        let result = store.reset();
        if result.is_ok() {
            // Same lock as ingest, so a scan sequence in flight cannot span
            // the reset.
            detector.reset();
        }
        result
    })
    .await;
    match result {
        Ok(Ok(())) => json_response(
            &json!({"status": "success", "message": "Database has been completely reset."}),
            StatusCode::OK,
        ),
        Ok(Err(e)) => {
            error!("Failed to reset database: {e}");
            json_response(
                &json!({"status": "error", "message": e.to_string()}),
                StatusCode::OK,
            )
        }
        Err(e) => {
            error!("Reset task failed: {e}");
            json_response(
                &json!({"status": "error", "message": e.to_string()}),
                StatusCode::OK,
            )
        }
    }
}

/// Completes the websocket handshake and parks the connection on the
/// broadcast feed. The feed is attached before the upgrade resolves so no
/// record published in between is missed.
fn upgrade_observer(
    mut req: Request<Incoming>,
    context: &CollectorContext,
) -> http::Result<HttpResponse> {
    let accept_key = match req.headers().get(header::SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => {
            return log_and_create_http_response(
                "Missing Sec-WebSocket-Key header",
                StatusCode::BAD_REQUEST,
            );
        }
    };
    let feed = context.broadcast.attach();
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let stream =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                serve_observer(stream, feed).await;
            }
            Err(e) => error!("Websocket upgrade failed: {e}"),
        }
    });
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(Full::new(Bytes::new()))
}

/// Pushes broadcast payloads to one observer until either side goes away.
/// Observers never send application messages; anything inbound besides a
/// close is ignored.
async fn serve_observer(
    stream: WebSocketStream<TokioIo<Upgraded>>,
    mut feed: mpsc::UnboundedReceiver<Arc<str>>,
) {
    debug!("Observer connected");
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            payload = feed.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = sink.send(Message::text(payload.to_string())).await {
                        debug!("Observer send failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Observer connection errored: {e}");
                    break;
                }
            },
        }
    }
    debug!("Observer disconnected");
}

/// Bound REST/websocket listener, not yet serving.
pub struct ApiServer {
    listener: TcpListener,
}

impl ApiServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Each connection is served on its own task; a panic in
    /// one handler never takes the server down.
    pub async fn run(
        self,
        context: CollectorContext,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let server = http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                con_res = self.listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        // Don't kill server on panic - log and continue
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                _ = shutdown.cancelled() => {
                    debug!("API server stopping");
                    joinset.shutdown().await;
                    return Ok(());
                },
            };
            let conn = TokioIo::new(conn);
            let server = server.clone();
            let context = context.clone();
            let service = service_fn(move |req| handle_request(req, context.clone()));
            joinset.spawn(async move {
                if let Err(e) = server
                    .serve_connection(conn, service)
                    .with_upgrades()
                    .await
                {
                    debug!("Connection error: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_accepts_all_and_numeric_ids() {
        assert_eq!(AgentSelector::parse("all"), Some(AgentSelector::All));
        assert_eq!(AgentSelector::parse("3"), Some(AgentSelector::One(3)));
        assert_eq!(AgentSelector::parse("bogus"), None);
        assert_eq!(AgentSelector::parse(""), None);
        assert_eq!(AgentSelector::All.agent_id(), None);
        assert_eq!(AgentSelector::One(3).agent_id(), Some(3));
    }

    #[test]
    fn timeframe_tokens_map_to_offsets() {
        let now = Utc::now();
        assert_eq!(timeframe_cutoff("15m", now), Some(now - Duration::minutes(15)));
        assert_eq!(timeframe_cutoff("24h", now), Some(now - Duration::hours(24)));
        assert_eq!(timeframe_cutoff("1w", now), Some(now - Duration::weeks(1)));
        assert_eq!(timeframe_cutoff("1M", now), Some(now - Duration::days(30)));
        assert_eq!(timeframe_cutoff("1y", now), Some(now - Duration::days(365)));
    }

    #[test]
    fn unknown_timeframes_disable_the_filter() {
        let now = Utc::now();
        assert_eq!(timeframe_cutoff("all", now), None);
        assert_eq!(timeframe_cutoff("yesterday", now), None);
        assert_eq!(timeframe_cutoff("", now), None);
    }

    #[test]
    fn query_param_picks_the_right_pair() {
        assert_eq!(
            query_param(Some("timeframe=24h&foo=bar"), "timeframe"),
            Some("24h")
        );
        assert_eq!(query_param(Some("foo=bar"), "timeframe"), None);
        assert_eq!(query_param(None, "timeframe"), None);
    }
}
