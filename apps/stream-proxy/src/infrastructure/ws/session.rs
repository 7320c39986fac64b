//! Client Session
//!
//! Per-connection loop: registers the client with the subscription manager,
//! forwards its outbox to the socket, and maps inbound control frames onto
//! manager operations. Every request gets an explicit acknowledgement or
//! error frame; a transport failure is converted into a disconnect and never
//! escapes the session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::sync::mpsc;

use crate::application::services::fanout::{Outbound, SubscriptionManager, SubscribeOutcome};
use crate::domain::subscription::{ClientId, Symbol};
use crate::infrastructure::ws::protocol::{
    ClientMessage, ProtocolError, ServerMessage, parse_client_message,
};
use crate::infrastructure::ws::server::WsState;

/// Error code sent when streaming is disabled by configuration.
const STREAMING_DISABLED: &str = "STREAMING_DISABLED";

/// Error code sent when the bus refused a subscribe.
const BUS_UNAVAILABLE: &str = "BUS_UNAVAILABLE";

/// Drive one client connection to completion.
pub async fn run(socket: WebSocket, state: Arc<WsState>, initial_symbols: Vec<Symbol>) {
    let (mut sink, mut stream) = socket.split();

    // Streaming off: accept, send one error frame, close.
    if !state.enabled {
        let _ = send_frame(
            &mut sink,
            &ServerMessage::Error {
                code: STREAMING_DISABLED.to_string(),
                message: "live price streaming is disabled".to_string(),
            },
        )
        .await;
        let _ = sink.close().await;
        return;
    }

    let (outbox_tx, mut outbox_rx) = state.manager.make_outbox();

    let initial = if initial_symbols.is_empty() {
        state.default_symbols.clone()
    } else {
        initial_symbols
    };

    let (client, outcome) = state.manager.connect(outbox_tx.clone(), &initial).await;
    send_subscribe_ack(&outbox_tx, outcome).await;

    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => break,
            outbound = outbox_rx.recv() => match outbound {
                Some(frame) => {
                    if send_frame(&mut sink, &ServerMessage::from(frame)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_client_text(&state.manager, client, &outbox_tx, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(client, error = %e, "client socket error");
                    break;
                }
            }
        }
    }

    state.manager.disconnect(client).await;
}

/// Map one inbound control frame onto a manager operation and queue the ack.
async fn handle_client_text(
    manager: &Arc<SubscriptionManager>,
    client: ClientId,
    outbox: &mpsc::Sender<Outbound>,
    text: &str,
) {
    match parse_client_message(text) {
        Ok(ClientMessage::Subscribe { symbols }) => {
            let outcome = manager.subscribe(client, &symbols).await;
            send_subscribe_ack(outbox, outcome).await;
        }
        Ok(ClientMessage::Unsubscribe { symbols }) => {
            let removed = manager.unsubscribe(client, &symbols).await;
            let _ = outbox.send(Outbound::Unsubscribed(removed)).await;
        }
        Ok(ClientMessage::Ping) => {
            let _ = outbox.send(Outbound::Pong).await;
        }
        Err(ProtocolError::UnknownType(msg_type)) => {
            tracing::debug!(client, msg_type, "ignoring unknown message type");
        }
        Err(e) => {
            let _ = outbox
                .send(Outbound::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                })
                .await;
        }
    }
}

async fn send_subscribe_ack(outbox: &mpsc::Sender<Outbound>, outcome: SubscribeOutcome) {
    let _ = outbox.send(Outbound::Subscribed(outcome.accepted)).await;
    if outcome.bus_unavailable {
        let _ = outbox
            .send(Outbound::Error {
                code: BUS_UNAVAILABLE.to_string(),
                message: "live price streaming is degraded, retry later".to_string(),
            })
            .await;
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "server frame serialization failed");
            Ok(())
        }
    }
}
