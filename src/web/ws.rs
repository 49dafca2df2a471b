//! WebSocket push channel.
//!
//! Each client gets a snapshot of every controller and tag, then the live
//! event stream. Clients may send `{"tag_id": .., "value": ..}` to write a tag.

use super::{actor_from_headers, AppState};
use crate::admin::Actor;
use crate::events::{ACK_SUBJECT, FAULT_SUBJECT, STATUS_SUBJECT, TAG_SUBJECT};
use crate::fleet::ControllerSnapshot;
use crate::protocol::Value;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Messages the server sends besides domain events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { subjects: Vec<String> },
    Snapshot { controllers: Vec<ControllerSnapshot> },
    WriteResult {
        tag_id: i64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error { message: String },
}

#[derive(Debug, Deserialize)]
pub struct WriteCommand {
    pub tag_id: i64,
    pub value: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Comma-separated subject patterns; everything when absent.
    pub subjects: Option<String>,
}

fn subjects(query: &WsQuery) -> Vec<String> {
    let requested: Vec<String> = query
        .subjects
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if requested.is_empty() {
        [STATUS_SUBJECT, TAG_SUBJECT, FAULT_SUBJECT, ACK_SUBJECT]
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        requested
    }
}

pub async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let actor = actor_from_headers(&headers);
    let subjects = subjects(&query);
    ws.on_upgrade(move |socket| handle_socket(socket, state, actor, subjects))
}

fn encode<T: Serialize>(msg: &T) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!("Failed to encode WebSocket message: {}", e);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, actor: Actor, subjects: Vec<String>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so nothing between the two is missed
    let mut sub = state.events.subscribe(&subjects);
    let sub_id = sub.id;
    tracing::info!("WebSocket client connected (subscription {})", sub_id);

    let welcome = ServerMessage::Welcome { subjects };
    let snapshot = ServerMessage::Snapshot {
        controllers: state.admin.fleet().snapshot().await,
    };
    for msg in [welcome, snapshot].iter().filter_map(encode) {
        if sender.send(msg).await.is_err() {
            state.events.unsubscribe(sub_id);
            return;
        }
    }

    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(16);

    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                event = sub.recv() => match event {
                    Some(event) => encode(event.as_ref()),
                    // dropped by the bus for falling behind
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => encode(&reply),
                    None => break,
                },
            };
            let Some(msg) = msg else {
                continue;
            };
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let admin = state.admin.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = match serde_json::from_str::<WriteCommand>(text.as_str()) {
                        Ok(cmd) => match admin.write_tag_value(&actor, cmd.tag_id, &cmd.value).await {
                            Ok(value) => ServerMessage::WriteResult {
                                tag_id: cmd.tag_id,
                                success: true,
                                value: Some(value),
                                error: None,
                            },
                            Err(e) => ServerMessage::WriteResult {
                                tag_id: cmd.tag_id,
                                success: false,
                                value: None,
                                error: Some(e.to_string()),
                            },
                        },
                        Err(e) => ServerMessage::Error {
                            message: format!("unrecognised message: {}", e),
                        },
                    };
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    state.events.unsubscribe(sub_id);
    tracing::info!("WebSocket client disconnected (subscription {})", sub_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_subjects() {
        assert_eq!(subjects(&WsQuery::default()).len(), 4);
        let picked = subjects(&WsQuery {
            subjects: Some("faults.updates.3, plc.status".to_string()),
        });
        assert_eq!(picked, vec!["faults.updates.3", "plc.status"]);
    }

    #[test]
    fn test_write_result_shape() {
        let msg = ServerMessage::WriteResult {
            tag_id: 4,
            success: true,
            value: Some(Value::Real(1.5)),
            error: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "write_result");
        assert_eq!(json["data"]["value"], 1.5);
        assert!(json["data"].get("error").is_none());

        let cmd: WriteCommand = serde_json::from_str(r#"{"tag_id": 4, "value": true}"#).unwrap();
        assert_eq!(cmd.tag_id, 4);
    }
}
