use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::auth::Identity;
use crate::config::WsConfig;
use crate::state::AppState;
use crate::ws::protocol::{self, ConnectionContext};
use crate::ws::{Client, OutboundReceiver};

/// Run one authenticated WebSocket connection.
///
/// Splits the socket into two pumps:
/// - Writer task: owns the sink, drains the outbound queue and sends pings
/// - Reader (this task): enforces the read deadline, decodes frames and
///   dispatches them to the hub
///
/// Whichever pump stops first ends the connection. The hub owns the outbound
/// queue, so unregistering is what finally stops the writer.
pub async fn run_connection(socket: WebSocket, state: AppState, identity: Identity) {
    let (ws_sender, ws_receiver) = socket.split();
    let ws_config = state.ws.clone();

    let (client, rx) = Client::new(
        identity.user_id,
        identity.username.clone(),
        ws_config.send_buffer,
    );
    let connection_id = client.connection_id;
    let ctx = ConnectionContext {
        user_id: identity.user_id,
        hub: state.hub.clone(),
        outbound: client.weak_sender(),
        max_message_size: ws_config.max_message_size,
    };

    state.hub.register(client).await;

    tracing::info!(
        user_id = %identity.user_id,
        connection_id = %connection_id,
        "WebSocket actor started"
    );

    let mut writer_handle = tokio::spawn(write_pump(ws_sender, rx, ws_config.clone()));

    tokio::select! {
        _ = read_pump(ws_receiver, &ctx, ws_config.pong_wait()) => {}
        _ = &mut writer_handle => {
            tracing::debug!(user_id = %identity.user_id, "Writer stopped first");
        }
    }

    state.hub.unregister(identity.user_id, connection_id).await;

    // Once the hub drops the queue the writer flushes, sends Close and exits.
    if !writer_handle.is_finished() {
        let grace = ws_config.write_wait() * 2;
        if timeout(grace, &mut writer_handle).await.is_err() {
            writer_handle.abort();
        }
    }

    tracing::info!(
        user_id = %identity.user_id,
        connection_id = %connection_id,
        "WebSocket actor stopped"
    );
}

/// Read pump: returns when the connection should be torn down.
async fn read_pump(
    mut ws_receiver: SplitStream<WebSocket>,
    ctx: &ConnectionContext,
    pong_wait: Duration,
) {
    loop {
        // Every frame, pongs included, restarts the idle deadline.
        let next = match timeout(pong_wait, ws_receiver.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::info!(user_id = %ctx.user_id, "Read deadline expired");
                break;
            }
        };

        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    if let Err(e) = protocol::handle_text_frame(text.as_str(), ctx).await {
                        tracing::warn!(
                            user_id = %ctx.user_id,
                            error = %e,
                            "Rejecting frame, closing connection"
                        );
                        break;
                    }
                }
                Message::Binary(data) => {
                    if data.len() > ctx.max_message_size {
                        tracing::warn!(
                            user_id = %ctx.user_id,
                            size = data.len(),
                            "Oversized binary frame, closing connection"
                        );
                        break;
                    }
                    tracing::debug!(
                        user_id = %ctx.user_id,
                        "Received binary frame (expected JSON text), dropped"
                    );
                }
                // Pings are answered by the transport itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %ctx.user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %ctx.user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(user_id = %ctx.user_id, "WebSocket stream ended");
                break;
            }
        }
    }
}

/// Write pump: drains the outbound queue and keeps the peer alive with pings.
async fn write_pump(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: OutboundReceiver,
    ws_config: WsConfig,
) {
    let write_wait = ws_config.write_wait();
    let mut ping_timer = interval(ws_config.ping_period());
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the first immediate tick
    ping_timer.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    // The hub closed the queue.
                    let _ = timeout(write_wait, ws_sender.send(Message::Close(None))).await;
                    break;
                };
                let batch = coalesce(frame, &mut rx);
                if !write_frame(&mut ws_sender, Message::Text(batch.into()), write_wait).await {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if !write_frame(&mut ws_sender, Message::Ping(Default::default()), write_wait).await {
                    break;
                }
            }
        }
    }
}

/// Send one frame within the write deadline. Returns false if the
/// connection is broken.
async fn write_frame(
    ws_sender: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    write_wait: Duration,
) -> bool {
    match timeout(write_wait, ws_sender.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "WebSocket send failed");
            false
        }
        Err(_) => {
            tracing::warn!("WebSocket write deadline exceeded");
            false
        }
    }
}

/// Join `first` with whatever else is already queued, newline separated,
/// so a burst goes out as one transport write.
fn coalesce(first: String, rx: &mut OutboundReceiver) -> String {
    let queued = rx.len();
    let mut batch = first;
    for _ in 0..queued {
        match rx.try_recv() {
            Ok(next) => {
                batch.push('\n');
                batch.push_str(&next);
            }
            Err(_) => break,
        }
    }
    batch
}
