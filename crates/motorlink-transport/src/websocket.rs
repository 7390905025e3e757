//! WebSocket transport for motor observers.

use std::fmt::Display;

use axum::{
    extract::{Query, State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use motorlink_control::{Connection, ErrorKind, Outbound, Reply};
use motorlink_core::UserId;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
    protocol::{Inbound, ServerMessage, parse_client_message},
    state::AppState,
};

/// Query string of the websocket route. Identity is vouched for by the
/// authentication layer in front of this server.
#[derive(Debug, Deserialize)]
pub struct ObserverParams {
    pub user: String,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ObserverParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user = UserId::new(params.user);
    ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        serve(sender, receiver, state, user).await;
    })
}

/// Drive one observer over an already-upgraded socket.
///
/// Returns once the observer disconnects or the device link is lost, after
/// the observer has left the device.
pub async fn serve<Si, St, E>(mut sender: Si, mut receiver: St, state: AppState, user: UserId)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.outbound_capacity);

    let connection = match Connection::accept(&state.hub, &state.config, user.clone(), state.store(), tx.clone()).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(%user, "Connection rejected: {e}");
            send_json(&mut sender, &ServerMessage::error(e.kind().as_str(), e.to_string())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    // Forward queued messages to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let last = matches!(outbound, Outbound::ConnectionLost { .. });
            if !send_json(&mut sender, &ServerMessage::from(outbound)).await {
                break;
            }
            if last {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    });

    // The writer stops on its own once the device link is lost
    let mut writer_result = None;
    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            result = &mut send_task => {
                writer_result = Some(result);
                break;
            }
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text.as_str().to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::error!(%user, "WebSocket error: {e}");
                break;
            }
        };

        let reply = match parse_client_message(&text) {
            Inbound::Message(message) => state.dispatcher.dispatch(&connection, message.into()).await,
            Inbound::Unknown(kind) => {
                tracing::info!(%user, "Ignoring message of unknown type `{kind}`");
                continue;
            }
            Inbound::Invalid(reason) => {
                tracing::debug!(%user, "Invalid client message: {reason}");
                Reply::Error {
                    kind: ErrorKind::Validation,
                    message: reason,
                }
            }
        };
        if tx.send(Outbound::Reply(reply)).await.is_err() {
            break;
        }
    }

    connection.close(&state.hub).await;
    drop(tx);
    let result = match writer_result {
        Some(result) => result,
        None => send_task.await,
    };
    if let Err(e) = result {
        tracing::warn!(%user, "Socket writer ended abnormally: {e}");
    }
}

async fn send_json<Si>(sender: &mut Si, message: &ServerMessage) -> bool
where
    Si: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize message: {e}");
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, sync::Arc};

    use futures::channel::mpsc as channel;
    use motorlink_control::DeviceHub;
    use motorlink_core::{LinkConfig, ProtocolDriver};
    use motorlink_driver::{LineCodec, RecordingDriver};
    use motorlink_session::storage::MemoryStore;
    use serde_json::{Value, json};
    use tokio::task::JoinHandle;

    use super::*;

    struct Observer {
        input: channel::UnboundedSender<Result<Message, Infallible>>,
        output: channel::UnboundedReceiver<Message>,
        task: JoinHandle<()>,
    }

    impl Observer {
        fn send(&self, value: &Value) {
            self.input
                .unbounded_send(Ok(Message::Text(value.to_string().into())))
                .unwrap();
        }

        async fn recv(&mut self) -> Value {
            match self.output.next().await {
                Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("expected a text frame, got {other:?}"),
            }
        }

        async fn disconnect(self) {
            drop(self.input);
            self.task.await.unwrap();
        }
    }

    fn setup() -> (Arc<RecordingDriver>, AppState) {
        let driver = Arc::new(RecordingDriver::new());
        let shared = Arc::clone(&driver);
        let factory = move || Arc::clone(&shared) as Arc<dyn ProtocolDriver>;
        let hub = Arc::new(DeviceHub::new(Arc::new(factory), Arc::new(LineCodec)));
        let config = LinkConfig {
            address: "127.0.0.1".to_string(),
            ..LinkConfig::default()
        };
        (driver, AppState::new(hub, Arc::new(MemoryStore::new()), config))
    }

    fn connect(state: &AppState, user: &str) -> Observer {
        let (input, receiver) = channel::unbounded();
        let (sender, output) = channel::unbounded();
        let task = tokio::spawn(serve(sender, receiver, state.clone(), UserId::new(user)));
        Observer { input, output, task }
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_velocity_is_acknowledged_to_sender_only() {
        let (driver, state) = setup();
        let mut ada = connect(&state, "ada");
        let mut bob = connect(&state, "bob");

        ada.send(&json!({"type": "set_velocity", "velocity": 500}));
        assert_eq!(ada.recv().await, json!({"type": "ack", "command": "set_velocity"}));
        assert_eq!(driver.count_writes("SET velocity 500"), 1);

        driver.push_frame("actual_velocity=498");
        assert_eq!(bob.recv().await, json!({"type": "actual_velocity", "value": 498}));
        assert_eq!(ada.recv().await, json!({"type": "actual_velocity", "value": 498}));

        ada.disconnect().await;
        bob.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_kind_is_ignored_and_malformed_is_rejected() {
        let (_driver, state) = setup();
        let mut ada = connect(&state, "ada");

        ada.send(&json!({"type": "self_destruct"}));
        ada.send(&json!({"type": "set_current", "current": "lots"}));
        let reply = ada.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["kind"], "validation");

        ada.send(&json!({"type": "stop_logging"}));
        assert_eq!(ada.recv().await, json!({"type": "ack", "command": "stop_logging"}));

        ada.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_logging_without_session() {
        let (_driver, state) = setup();
        let mut ada = connect(&state, "ada");

        ada.send(&json!({"type": "start_logging"}));
        assert_eq!(
            ada.recv().await,
            json!({"type": "logging_status", "status": "failed", "reason": "No active session"})
        );

        let session = state.sessions.start_session(&UserId::new("ada")).await.unwrap();
        ada.send(&json!({"type": "start_logging"}));
        assert_eq!(
            ada.recv().await,
            json!({"type": "logging_status", "status": "started", "session_id": session.id})
        );

        ada.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_disconnect_closes_device() {
        let (driver, state) = setup();
        let ada = connect(&state, "ada");
        let bob = connect(&state, "bob");
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        ada.disconnect().await;
        assert_eq!(state.hub.device_count().await, 1);
        assert!(!driver.is_closed());

        bob.disconnect().await;
        assert_eq!(state.hub.device_count().await, 0);
        assert!(driver.is_closed());
        assert_eq!(driver.writes_after_close(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_closes_socket() {
        let (driver, state) = setup();
        let mut ada = connect(&state, "ada");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        driver.fail_sends(usize::MAX);
        let lost = ada.recv().await;
        assert_eq!(lost["type"], "connection_lost");
        assert!(matches!(ada.output.next().await, Some(Message::Close(None))));

        ada.task.await.unwrap();
        assert_eq!(state.hub.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_device_reports_and_closes() {
        let (driver, state) = setup();
        driver.refuse_connections();
        let mut ada = connect(&state, "ada");

        let reply = ada.recv().await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["kind"], "connection");
        assert!(matches!(ada.output.next().await, Some(Message::Close(None))));
        ada.task.await.unwrap();
    }
}
