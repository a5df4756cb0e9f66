//! WebSocket transport glue.
//!
//! Owns framing only: the write half is adapted into the engine's
//! [`EventSink`] seam and the read loop feeds raw text frames to the
//! core [`Dispatcher`], which handles decoding, routing, and replies.
use crate::app::AppState;
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_core::{Dispatcher, EventSink};
use murmur_wire::ServerFrame;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    if state.manager.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (writer, reader) = socket.split();
    let sink: Arc<dyn EventSink> = Arc::new(WsSink {
        writer: Mutex::new(writer),
    });
    let dispatcher = Dispatcher::new(state.manager.clone());
    let sub = dispatcher.connect(sink).await;
    receive_loop(&dispatcher, &sub, reader).await;
    dispatcher.disconnect(&sub);
}

async fn receive_loop(
    dispatcher: &Dispatcher,
    sub: &Arc<murmur_core::Subscriber>,
    mut reader: SplitStream<WebSocket>,
) {
    while let Some(incoming) = reader.next().await {
        match incoming {
            Ok(WsMessage::Text(text)) => dispatcher.dispatch(sub, &text).await,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            // Pings and pongs are handled at the protocol layer.
            Ok(_) => {}
        }
        if sub.is_closed() {
            break;
        }
    }
}

/// Write half of one connection behind the engine's sink seam. Frames
/// are serialised to JSON text, one WebSocket message per frame.
struct WsSink {
    writer: Mutex<SplitSink<WebSocket, WsMessage>>,
}

impl fmt::Debug for WsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WsSink")
    }
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&self, frames: Vec<ServerFrame>) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        for frame in frames {
            let text = serde_json::to_string(&frame).map_err(io::Error::other)?;
            writer
                .send(WsMessage::Text(text))
                .await
                .map_err(io::Error::other)?;
        }
        Ok(())
    }
}
