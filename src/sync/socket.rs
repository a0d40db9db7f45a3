//! WebSocket transport for the sync protocol

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

use super::connection::ConnectionHandler;
use super::error::SyncError;
use super::protocol::ServerMessage;
use crate::state::AppState;

/// Router for the sync listener. Devices may dial the bare host or `/ws`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (kick_tx, mut kick_rx) = oneshot::channel();
    let mut handler = ConnectionHandler::new(state, kick_tx);
    let (mut sender, mut receiver) = socket.split();

    tracing::debug!("Sync connection {} opened", handler.id());

    loop {
        let outcome = tokio::select! {
            _ = &mut kick_rx => {
                tracing::info!("Sync connection {} closed by revocation", handler.id());
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handler.handle_text(&text).await,
                Some(Ok(Message::Binary(_))) => handler.handle_unreadable("binary frame"),
                Some(Ok(Message::Close(_))) | None => break,
                // Control frames are answered by the transport.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    let e = SyncError::from(e);
                    tracing::warn!("Sync connection {} dropped: {}", handler.id(), e);
                    break;
                }
            },
        };

        if let Err(e) = send_all(&mut sender, &outcome.replies).await {
            tracing::warn!("Sync connection {} dropped: {}", handler.id(), e);
            break;
        }
        if outcome.close {
            let _ = sender.send(Message::Close(None)).await;
            break;
        }
    }

    handler.close();
    tracing::debug!("Sync connection {} closed", handler.id());
}

async fn send_all(
    sender: &mut SplitSink<WebSocket, Message>,
    replies: &[ServerMessage],
) -> Result<(), SyncError> {
    for reply in replies {
        let text = match reply.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode reply: {}", e);
                continue;
            }
        };
        sender.send(Message::Text(text)).await?;
    }
    Ok(())
}
