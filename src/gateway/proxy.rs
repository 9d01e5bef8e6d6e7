//! Bidirectional byte relay between an attached client and the worker's
//! terminal server.
//!
//! Bytes pass through unmodified in both directions. The relay owns the
//! keepalive discipline: a ping to each side every `ping_interval`, a dead
//! side declared after `pong_deadline` without proof of life, a hard idle
//! cutoff, and a backpressure cutoff for a side that stops accepting
//! writes.

use std::time::Instant;

use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WorkerCloseFrame;
use tokio_tungstenite::tungstenite::Message as WorkerMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;

pub type WorkerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type ClientSink = SplitSink<WebSocket, ClientMessage>;
type WorkerSink = SplitSink<WorkerStream, WorkerMessage>;

/// Why the relay ended; surfaced in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEnd {
    /// The client closed or dropped; the worker was closed with 1000.
    ClientClosed,
    /// The worker closed; the client was closed with the worker's code.
    WorkerClosed(u16),
    /// No data either way for the idle timeout; both closed with 1001.
    Idle,
    /// A side went silent past the pong deadline; both closed with 1011.
    KeepaliveTimeout,
    /// A side refused writes past the stall budget; both closed with 1011.
    Backpressure(&'static str),
    /// The gateway is shutting down; both closed with 1001.
    Shutdown,
}

/// Runs the proxy until either side terminates. Consumes both sockets;
/// both are closed (best effort) before returning.
pub async fn relay(
    client: WebSocket,
    worker: WorkerStream,
    settings: &GatewayConfig,
    cancel: CancellationToken,
) -> ProxyEnd {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut worker_tx, mut worker_rx) = worker.split();

    let mut ping = tokio::time::interval(settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await; // Discard the immediate first tick.

    let mut last_activity = Instant::now();
    let mut client_alive = Instant::now();
    let mut worker_alive = Instant::now();

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                match msg {
                    Some(Ok(ClientMessage::Binary(data))) => {
                        last_activity = Instant::now();
                        client_alive = last_activity;
                        if send_worker(&mut worker_tx, WorkerMessage::Binary(data), settings)
                            .await
                            .is_err()
                        {
                            close_both(&mut client_tx, &mut worker_tx, 1011, "worker write stalled").await;
                            return ProxyEnd::Backpressure("worker");
                        }
                    }
                    Some(Ok(ClientMessage::Text(text))) => {
                        last_activity = Instant::now();
                        client_alive = last_activity;
                        if send_worker(
                            &mut worker_tx,
                            WorkerMessage::Text(text.as_str().into()),
                            settings,
                        )
                        .await
                        .is_err()
                        {
                            close_both(&mut client_tx, &mut worker_tx, 1011, "worker write stalled").await;
                            return ProxyEnd::Backpressure("worker");
                        }
                    }
                    Some(Ok(ClientMessage::Pong(_))) | Some(Ok(ClientMessage::Ping(_))) => {
                        // Pings from the client are answered by the server
                        // implementation; both count as proof of life.
                        client_alive = Instant::now();
                    }
                    Some(Ok(ClientMessage::Close(_))) | Some(Err(_)) | None => {
                        let _ = worker_tx
                            .send(WorkerMessage::Close(Some(WorkerCloseFrame {
                                code: CloseCode::Normal,
                                reason: "client disconnected".into(),
                            })))
                            .await;
                        return ProxyEnd::ClientClosed;
                    }
                }
            }

            msg = worker_rx.next() => {
                match msg {
                    Some(Ok(WorkerMessage::Binary(data))) => {
                        last_activity = Instant::now();
                        worker_alive = last_activity;
                        if send_client(&mut client_tx, ClientMessage::Binary(data), settings)
                            .await
                            .is_err()
                        {
                            close_both(&mut client_tx, &mut worker_tx, 1011, "client write stalled").await;
                            return ProxyEnd::Backpressure("client");
                        }
                    }
                    Some(Ok(WorkerMessage::Text(text))) => {
                        last_activity = Instant::now();
                        worker_alive = last_activity;
                        if send_client(
                            &mut client_tx,
                            ClientMessage::Text(text.as_str().into()),
                            settings,
                        )
                        .await
                        .is_err()
                        {
                            close_both(&mut client_tx, &mut worker_tx, 1011, "client write stalled").await;
                            return ProxyEnd::Backpressure("client");
                        }
                    }
                    Some(Ok(WorkerMessage::Pong(_))) | Some(Ok(WorkerMessage::Ping(_))) => {
                        // tungstenite answers worker pings on flush.
                        worker_alive = Instant::now();
                    }
                    Some(Ok(WorkerMessage::Close(frame))) => {
                        let code: u16 = frame
                            .as_ref()
                            .map(|f| f.code.into())
                            .unwrap_or(1000);
                        let reason = frame
                            .as_ref()
                            .map(|f| f.reason.to_string())
                            .unwrap_or_default();
                        let _ = client_tx
                            .send(ClientMessage::Close(Some(ClientCloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        return ProxyEnd::WorkerClosed(code);
                    }
                    Some(Ok(WorkerMessage::Frame(_))) => {}
                    Some(Err(_)) | None => {
                        let _ = client_tx
                            .send(ClientMessage::Close(Some(ClientCloseFrame {
                                code: 1011,
                                reason: "worker connection lost".into(),
                            })))
                            .await;
                        return ProxyEnd::WorkerClosed(1011);
                    }
                }
            }

            _ = ping.tick() => {
                let now = Instant::now();
                if now.duration_since(last_activity) >= settings.idle_timeout {
                    close_both(&mut client_tx, &mut worker_tx, 1001, "idle timeout").await;
                    return ProxyEnd::Idle;
                }
                if now.duration_since(client_alive) > settings.pong_deadline {
                    tracing::debug!("client missed pong deadline");
                    close_both(&mut client_tx, &mut worker_tx, 1011, "keepalive timeout").await;
                    return ProxyEnd::KeepaliveTimeout;
                }
                if now.duration_since(worker_alive) > settings.pong_deadline {
                    tracing::debug!("worker missed pong deadline");
                    close_both(&mut client_tx, &mut worker_tx, 1011, "keepalive timeout").await;
                    return ProxyEnd::KeepaliveTimeout;
                }
                if send_client(&mut client_tx, ClientMessage::Ping(Vec::new().into()), settings)
                    .await
                    .is_err()
                {
                    close_both(&mut client_tx, &mut worker_tx, 1011, "client write stalled").await;
                    return ProxyEnd::Backpressure("client");
                }
                if send_worker(&mut worker_tx, WorkerMessage::Ping(Vec::new().into()), settings)
                    .await
                    .is_err()
                {
                    close_both(&mut client_tx, &mut worker_tx, 1011, "worker write stalled").await;
                    return ProxyEnd::Backpressure("worker");
                }
            }

            _ = cancel.cancelled() => {
                close_both(&mut client_tx, &mut worker_tx, 1001, "server shutting down").await;
                return ProxyEnd::Shutdown;
            }
        }
    }
}

async fn send_client(
    sink: &mut ClientSink,
    message: ClientMessage,
    settings: &GatewayConfig,
) -> Result<(), ()> {
    match timeout(settings.write_stall, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

async fn send_worker(
    sink: &mut WorkerSink,
    message: WorkerMessage,
    settings: &GatewayConfig,
) -> Result<(), ()> {
    match timeout(settings.write_stall, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

async fn close_both(
    client_tx: &mut ClientSink,
    worker_tx: &mut WorkerSink,
    code: u16,
    reason: &'static str,
) {
    let _ = client_tx
        .send(ClientMessage::Close(Some(ClientCloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
    let _ = worker_tx
        .send(WorkerMessage::Close(Some(WorkerCloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })))
        .await;
}
