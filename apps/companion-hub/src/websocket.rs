use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::channel::{DeviceChannel, Outbound};
use crate::protocol::{generate_connection_id, DeviceCommand, DeviceMessage};
use crate::registry::{BindOutcome, SharedRegistry};

/// State shared by the WebSocket routes
#[derive(Clone)]
pub struct WsState {
    pub registry: SharedRegistry,
    /// How long an unidentified connection may sit before it is closed;
    /// `None` keeps it forever.
    pub handshake_timeout: Option<Duration>,
}

/// Upgrade handler for device connections
pub async fn device_ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_device_socket(socket, state))
}

/// Upgrade handler for observers (UI, tooling)
pub async fn observer_ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_observer_socket(socket, state.registry))
}

/// Drive one device connection: pending until `clientInfo`, then bound until
/// the socket goes away.
async fn handle_device_socket(socket: WebSocket, state: WsState) {
    let connection_id = generate_connection_id();
    let registry = state.registry;
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let channel = DeviceChannel::new(connection_id.clone(), tx);

    // Writer task: serializes frames onto the socket, closes it on demand.
    let writer_connection = connection_id.clone();
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => error!("failed to serialize device frame: {err}"),
                },
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!(connection = %writer_connection, "device writer task ended");
    });

    registry.add_pending(channel.clone());
    debug!(connection = %connection_id, "device connected, awaiting clientInfo");

    // Phase 1: the identity handshake.
    let bound = match state.handshake_timeout {
        Some(limit) => {
            match timeout(limit, await_client_info(&mut receiver, &registry, &channel)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        connection = %connection_id,
                        "closing connection: no clientInfo within {:?}", limit
                    );
                    channel.close();
                    None
                }
            }
        }
        None => await_client_info(&mut receiver, &registry, &channel).await,
    };

    let Some(BindOutcome { identity, is_new }) = bound else {
        registry.remove_pending(&connection_id);
        debug!(connection = %connection_id, "connection ended before identifying");
        return;
    };
    info!(
        %identity,
        connection = %connection_id,
        "run target {}", if is_new { "registered" } else { "reconnected" }
    );

    // Phase 2: bound. Commands flow outward through the channel; inbound we
    // only expect keep-alives until the socket closes.
    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(err) => {
                error!(%identity, "websocket error: {err}");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<DeviceMessage>(&text) {
                Ok(DeviceMessage::Ping) => channel.send(DeviceCommand::Pong),
                Ok(DeviceMessage::ClientInfo { .. }) => {
                    warn!(%identity, "ignoring repeated clientInfo on bound connection");
                }
                Err(err) => {
                    debug!(%identity, "unreadable frame from device: {err}");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    registry.mark_disconnected(&identity, &connection_id);
}

/// Read frames until the device identifies itself. Returns `None` when the
/// handshake fails fatally or the socket closes first; fatal failures are
/// reported to the device before the connection is torn down.
async fn await_client_info(
    receiver: &mut SplitStream<WebSocket>,
    registry: &SharedRegistry,
    channel: &DeviceChannel,
) -> Option<BindOutcome> {
    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(err) => {
                error!(connection = %channel.connection_id(), "websocket error: {err}");
                return None;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return None,
            _ => continue,
        };
        match serde_json::from_str::<DeviceMessage>(&text) {
            Ok(DeviceMessage::ClientInfo {
                identity,
                display_name,
            }) => match registry.bind(channel.clone(), identity, display_name) {
                Ok(outcome) => return Some(outcome),
                Err(err) => {
                    error!(
                        connection = %channel.connection_id(),
                        "handshake failed: {err}"
                    );
                    channel.send(DeviceCommand::Error {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                    channel.close();
                    return None;
                }
            },
            Ok(DeviceMessage::Ping) => channel.send(DeviceCommand::Pong),
            Err(err) => {
                warn!(
                    connection = %channel.connection_id(),
                    "invalid frame before handshake: {err}"
                );
                channel.send(DeviceCommand::Error {
                    code: "invalid_message".to_string(),
                    message: format!("invalid message format: {err}"),
                });
            }
        }
    }
    None
}

/// Stream registry events to one observer until either side hangs up.
async fn handle_observer_socket(socket: WebSocket, registry: SharedRegistry) {
    let (observer_id, mut events) = registry.subscribe();
    let (mut sender, mut receiver) = socket.split();
    debug!(observer = %observer_id, "observer connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Observers only listen; inbound frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    registry.unsubscribe(&observer_id);
    debug!(observer = %observer_id, "observer disconnected");
}
