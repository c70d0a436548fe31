//! Runner WebSocket endpoint: all connected runners multiplex through
//! `/ws/runner`. Registration is the first frame and must arrive within the
//! register deadline or the socket is closed.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use lazyaf_core::ResourceId;
use lazyaf_core::protocol::RunnerMessage;

use crate::AppState;

pub async fn runner_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_runner_socket(socket, state))
}

async fn handle_runner_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let websocket_id = ResourceId::new().to_string();

    // First frame: register, within the deadline.
    let register = tokio::time::timeout(state.settings.register_ack_timeout, receiver.next()).await;
    let frame = match register {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            warn!("runner socket closed before registration");
            return;
        }
        Err(_) => {
            warn!("runner registration deadline expired, closing socket");
            let _ = sender.close().await;
            return;
        }
    };
    let (runner_id, name, runner_type, labels) =
        match serde_json::from_str::<RunnerMessage>(&frame) {
            Ok(RunnerMessage::Register {
                runner_id,
                name,
                runner_type,
                labels,
            }) => (runner_id, name, runner_type, labels),
            Ok(other) => {
                warn!(?other, "first runner frame was not register, closing");
                let _ = sender.close().await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "unparseable register frame, closing");
                let _ = sender.close().await;
                return;
            }
        };

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Err(e) = state
        .gateway
        .handle_register(
            runner_id,
            name.as_deref(),
            &runner_type,
            &labels,
            &websocket_id,
            tx,
        )
        .await
    {
        warn!(runner = %runner_id, error = %e, "registration failed");
        let _ = sender.close().await;
        return;
    }

    loop {
        tokio::select! {
            // Backend → runner pushes.
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let Ok(json) = serde_json::to_string(&msg) else { continue };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Runner → backend frames.
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let msg = match serde_json::from_str::<RunnerMessage>(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!(runner = %runner_id, error = %e, "bad runner frame");
                                continue;
                            }
                        };
                        if let Err(e) = state.gateway.handle_message(runner_id, msg).await {
                            warn!(runner = %runner_id, error = %e, "runner frame rejected, closing");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_)))
                    | Some(Ok(Message::Pong(_)))
                    | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!(runner = %runner_id, "runner socket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(runner = %runner_id, error = %e, "runner socket error");
                        break;
                    }
                }
            }
        }
    }

    state.gateway.on_disconnect(runner_id).await;
}
