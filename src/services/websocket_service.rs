//! Actor WebSocket handling: identification, buzz/vote messages, and
//! connection-flag bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{ActionFeedback, ActorAck, ActorInboundMessage},
    engine::Engine,
    error::{EngineError, ServiceError},
    services::room_service,
    state::SharedState,
};

const IDENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Internal error type for socket message handling, distinct from
/// `ServiceError` which is used for HTTP responses.
#[derive(Debug, Error)]
enum SocketError {
    /// Writer channel closed - connection should be terminated immediately.
    #[error("connection closed")]
    ConnectionClosed,
    /// Participant id in a message doesn't match the connection's identity.
    #[error("message ignored: mismatched participant (expected {expected}, got {got})")]
    MismatchedId {
        /// Identity bound at identification time.
        expected: Uuid,
        /// Identity carried by the offending message.
        got: Uuid,
    },
}

/// Handle the full lifecycle for an individual actor WebSocket connection.
pub async fn handle_socket(state: SharedState, code: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let Some(engine) = state.room(&code).map(|(engine, _)| engine) else {
        warn!(room = %code, "websocket opened for an unknown room");
        let _ = outbound_tx.send(Message::Close(None));
        finalize(writer_task, outbound_tx).await;
        return;
    };

    let initial_message = match tokio::time::timeout(IDENT_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(room = %code, error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!(room = %code, "websocket identification timed out");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let inbound: ActorInboundMessage = match serde_json::from_str(&initial_message) {
        Ok(message) => message,
        Err(err) => {
            warn!(room = %code, error = %err, "failed to parse actor message");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let ActorInboundMessage::Identification { participant_id } = inbound else {
        warn!(room = %code, "first message was not identification");
        let _ = outbound_tx.send(Message::Close(None));
        finalize(writer_task, outbound_tx).await;
        return;
    };

    if !engine.roster().contains_key(&participant_id) {
        warn!(room = %code, participant = %participant_id, "identification for unknown participant");
        let _ = outbound_tx.send(Message::Close(None));
        finalize(writer_task, outbound_tx).await;
        return;
    }

    if let Err(err) = room_service::set_connected(&state, &code, participant_id, true).await {
        warn!(room = %code, error = %err, "failed to mark participant connected");
    }
    info!(room = %code, participant = %participant_id, "actor connected");

    let _ = send_message(
        &outbound_tx,
        &ActorAck {
            participant_id,
            status: "identified".into(),
        },
    );

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<ActorInboundMessage>(&text) {
                    Ok(msg) => {
                        let result =
                            handle_actor_message(&code, &engine, participant_id, msg, &outbound_tx)
                                .await;
                        if let Err(err) = result {
                            warn!(
                                room = %code,
                                participant = %participant_id,
                                error = %err,
                                "error while handling actor message",
                            );
                            if matches!(err, SocketError::ConnectionClosed) {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(room = %code, error = %err, "failed to parse actor message");
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                info!(room = %code, participant = %participant_id, "actor closed");
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(room = %code, error = %err, "websocket error");
                break;
            }
        }
    }

    if let Err(err) = room_service::set_connected(&state, &code, participant_id, false).await {
        warn!(room = %code, error = %err, "failed to mark participant disconnected");
    }
    info!(room = %code, participant = %participant_id, "actor disconnected");

    finalize(writer_task, outbound_tx).await;
}

/// Dispatch one parsed actor message, replying with feedback.
async fn handle_actor_message(
    code: &str,
    engine: &Arc<Engine>,
    bound_id: Uuid,
    message: ActorInboundMessage,
    outbound_tx: &mpsc::UnboundedSender<Message>,
) -> Result<(), SocketError> {
    match message {
        ActorInboundMessage::Buzz { participant_id } => {
            check_identity(bound_id, participant_id)?;
            let result = engine.emit_action(participant_id).await;
            send_feedback(outbound_tx, result)
        }
        ActorInboundMessage::Vote {
            participant_id,
            choice,
        } => {
            check_identity(bound_id, participant_id)?;
            let result = engine.cast_vote(participant_id, &choice).await;
            send_feedback(outbound_tx, result)
        }
        ActorInboundMessage::Identification { .. } => {
            warn!(room = %code, participant = %bound_id, "ignoring duplicate identification");
            Ok(())
        }
        ActorInboundMessage::Unknown => {
            warn!(room = %code, participant = %bound_id, "ignoring unknown actor message");
            Ok(())
        }
    }
}

fn check_identity(expected: Uuid, got: Uuid) -> Result<(), SocketError> {
    if expected == got {
        Ok(())
    } else {
        Err(SocketError::MismatchedId { expected, got })
    }
}

/// Map an engine result onto accept/refuse feedback. Engine refusals are
/// legitimate game states (lock held, penalty, wrong phase), not errors.
fn send_feedback(
    tx: &mpsc::UnboundedSender<Message>,
    result: Result<(), EngineError>,
) -> Result<(), SocketError> {
    let feedback = match result {
        Ok(()) => ActionFeedback {
            accepted: true,
            detail: None,
        },
        Err(err) => ActionFeedback {
            accepted: false,
            detail: Some(ServiceError::from(err).to_string()),
        },
    };
    send_message(tx, &feedback)
}

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// Returns `Ok(())` if the message was successfully queued for sending or if
/// serialization failed (permanent error, no point retrying).
/// Returns `Err(SocketError::ConnectionClosed)` if the writer channel is
/// closed.
fn send_message<T>(tx: &mpsc::UnboundedSender<Message>, value: &T) -> Result<(), SocketError>
where
    T: ?Sized + serde::Serialize + std::fmt::Debug,
{
    let payload = match serde_json::to_string(value) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}` (permanent error, not retrying)");
            return Ok(());
        }
    };

    tx.send(Message::Text(payload.into()))
        .map_err(|_| SocketError::ConnectionClosed)
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}
