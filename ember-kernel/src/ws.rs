/**
 * WEBSOCKET CONSOLE - Canal temps réel logs + commandes
 *
 * RÔLE :
 * Une connexion WebSocket = un observateur. Le client s'abonne aux
 * consoles des serveurs qui l'intéressent et reçoit les lignes au fil de
 * l'eau ; il peut aussi pousser des commandes vers le stdin du conteneur.
 *
 * PROTOCOLE (JSON, champ "type") :
 *   entrant : subscribe { server_id }, unsubscribe { server_id },
 *             command { server_id, command }
 *   sortant : log { server_id, log }, command_error { server_id, reason }
 *
 * Un subscribe vers un serveur inconnu, arrêté ou hors droits est un
 * no-op silencieux. À la déconnexion, tous les abonnements de la
 * connexion sont purgés.
 */

use crate::http::AppState;
use crate::models::{Actor, ConsoleLog};
use crate::streamer::StreamEvent;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsInbound {
    Subscribe { server_id: String },
    Unsubscribe { server_id: String },
    Command { server_id: String, command: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsOutbound {
    Log { server_id: String, log: ConsoleLog },
    CommandError { server_id: String, reason: String },
}

impl From<StreamEvent> for WsOutbound {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Log { server_id, log } => WsOutbound::Log { server_id, log },
            StreamEvent::Error { server_id, reason } => {
                WsOutbound::CommandError { server_id, reason }
            }
        }
    }
}

pub async fn ws_handler(
    State(app): State<AppState>,
    Extension(actor): Extension<Actor>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app, actor))
}

async fn handle_socket(socket: WebSocket, app: AppState, actor: Actor) {
    let conn_id = Uuid::new_v4();
    println!("[ws] connection {conn_id} opened for {}", actor.name);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();

    // Pompe sortante : évènements du streamer -> frames texte
    let forward = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let outbound = WsOutbound::from(event);
            let Ok(text) = serde_json::to_string(&outbound) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut subscribed: HashSet<String> = HashSet::new();

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let inbound: WsInbound = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("[ws] {conn_id}: unparseable frame ignored: {e}");
                continue;
            }
        };

        match inbound {
            WsInbound::Subscribe { server_id } => {
                // hors droits = même silence qu'un serveur inexistant
                if !actor.can_access(&server_id) {
                    continue;
                }
                if let Err(e) = app.streamer.subscribe(&server_id, conn_id, tx.clone()).await {
                    eprintln!("[ws] {conn_id}: subscribe to {server_id} failed: {e}");
                    continue;
                }
                subscribed.insert(server_id);
            }
            WsInbound::Unsubscribe { server_id } => {
                app.streamer.unsubscribe(&server_id, &conn_id);
                subscribed.remove(&server_id);
            }
            WsInbound::Command { server_id, command } => {
                if let Err(e) = app.streamer.send_command(&server_id, &command, &actor).await {
                    let _ = tx.send(StreamEvent::Error {
                        server_id: server_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    // purge des abonnements de la connexion
    for server_id in &subscribed {
        app.streamer.unsubscribe(server_id, &conn_id);
    }
    drop(tx);
    forward.abort();
    println!("[ws] connection {conn_id} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_unix_ms, LogKind};

    #[test]
    fn inbound_frames_parse() {
        let m: WsInbound = serde_json::from_str(r#"{"type":"subscribe","server_id":"s1"}"#).unwrap();
        assert!(matches!(m, WsInbound::Subscribe { ref server_id } if server_id == "s1"));

        let m: WsInbound =
            serde_json::from_str(r#"{"type":"command","server_id":"s1","command":"say hi"}"#)
                .unwrap();
        assert!(matches!(m, WsInbound::Command { ref command, .. } if command == "say hi"));

        assert!(serde_json::from_str::<WsInbound>(r#"{"type":"nope"}"#).is_err());
    }

    #[test]
    fn outbound_log_frame_shape() {
        let out = WsOutbound::from(StreamEvent::Log {
            server_id: "s1".into(),
            log: ConsoleLog {
                timestamp: now_unix_ms(),
                message: "[Server] started".into(),
                kind: LogKind::System,
            },
        });
        let v: serde_json::Value = serde_json::to_value(&out).unwrap();
        assert_eq!(v["type"], "log");
        assert_eq!(v["server_id"], "s1");
        assert_eq!(v["log"]["kind"], "system");
    }

    #[test]
    fn outbound_error_frame_shape() {
        let out = WsOutbound::from(StreamEvent::Error {
            server_id: "s1".into(),
            reason: "server is not running".into(),
        });
        let v: serde_json::Value = serde_json::to_value(&out).unwrap();
        assert_eq!(v["type"], "command_error");
        assert_eq!(v["reason"], "server is not running");
    }
}
