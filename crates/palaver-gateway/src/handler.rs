use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use palaver_core::registry::SessionHandle;
use palaver_core::session::{SessionInfo, SessionPhase};
use palaver_core::AppState;
use palaver_models::close_codes::*;
use palaver_models::{AckPayload, DeliveryState, Envelope, EnvelopeKind};
use tokio::time::Instant;

use crate::ConnectParams;

/// Normal closure, sent when the connection winds down without a
/// protocol-level reason.
const CLOSE_NORMAL: u16 = 1000;

pub async fn handle_connection(socket: WebSocket, state: AppState, params: ConnectParams) {
    let mut phase = SessionPhase::Connecting;
    let (mut sender, mut receiver) = socket.split();

    // Handshake: one token validation per connection. No session is ever
    // registered unauthenticated.
    let user_id = match state.auth.validate(&params.token).await {
        Ok(user_id) => user_id,
        Err(err) => {
            tracing::info!(error = %err, "gateway handshake rejected");
            let _ = send_close(&mut sender, CLOSE_AUTH_FAILED, "authentication failed").await;
            return;
        }
    };

    let info = SessionInfo::new(user_id, params.device);
    let session_id = info.session_id;
    let (handle, mut outbound) = SessionHandle::new(info, state.config.send_queue_capacity);
    if state.registry.register(handle.clone()).is_err() {
        let _ = send_close(
            &mut sender,
            CLOSE_SESSION_LIMIT,
            "too many concurrent sessions for this user",
        )
        .await;
        return;
    }
    advance(&mut phase, SessionPhase::Active, session_id);
    tracing::info!(
        %session_id,
        user_id,
        device = handle.device_id(),
        active_sessions = state.registry.active_sessions(),
        "session active"
    );

    // Greet the session with its ID and the ping cadence this gateway
    // expects; clients adopt the advertised cadence.
    let hello = Envelope::hello(
        session_id,
        state.config.heartbeat_interval.as_millis() as u64,
    );
    let (close_code, close_reason) = if send_envelope(&mut sender, &hello).await.is_err() {
        (CLOSE_NORMAL, "hello write failed".to_string())
    } else {
        run_session(&mut receiver, &mut sender, &mut outbound, &handle, &state, user_id).await
    };

    // Teardown always runs: unregister before the socket is released so
    // no session can stay registered without a live socket.
    advance(&mut phase, SessionPhase::Closing, session_id);
    state.registry.unregister(session_id);
    let _ = send_close(&mut sender, close_code, &close_reason).await;
    advance(&mut phase, SessionPhase::Closed, session_id);
    if close_code == CLOSE_HEARTBEAT_TIMEOUT || close_code == CLOSE_SLOW_CONSUMER {
        tracing::warn!(%session_id, user_id, close_code, reason = %close_reason, "session closed");
    } else {
        tracing::info!(%session_id, user_id, close_code, reason = %close_reason, "session closed");
    }
}

/// One loop owns both directions of the socket: inbound client frames, the
/// session's outbound queue, the heartbeat deadline, and forced closure
/// (slow consumer). Returns the close code and reason for teardown.
async fn run_session(
    receiver: &mut SplitStream<WebSocket>,
    sender: &mut (impl SinkExt<Message> + Unpin),
    outbound: &mut tokio::sync::mpsc::Receiver<Envelope>,
    handle: &SessionHandle,
    state: &AppState,
    user_id: i64,
) -> (u16, String) {
    let session_id = handle.session_id();
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) if envelope.kind == EnvelopeKind::Ping => {
                                handle.touch_heartbeat();
                                heartbeat_sleep
                                    .as_mut()
                                    .reset(Instant::now() + heartbeat_timeout);
                                if send_envelope(sender, &Envelope::pong()).await.is_err() {
                                    break (CLOSE_NORMAL, "pong write failed".to_string());
                                }
                            }
                            Ok(envelope) => {
                                if let Err(reason) =
                                    handle_client_envelope(envelope, sender, user_id, state)
                                        .await
                                {
                                    break (CLOSE_NORMAL, reason);
                                }
                            }
                            Err(err) => {
                                // Protocol error: notify the sender and keep
                                // the connection open.
                                tracing::debug!(%session_id, error = %err, "undecodable envelope");
                                let error = Envelope::error(
                                    CLOSE_PROTOCOL_ERROR,
                                    format!("malformed envelope: {err}"),
                                );
                                if send_envelope(sender, &error).await.is_err() {
                                    break (CLOSE_NORMAL, "error write failed".to_string());
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("client close (code={}, reason={})", f.code, f.reason))
                            .unwrap_or_else(|| "client close".to_string());
                        break (CLOSE_NORMAL, reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        break (CLOSE_NORMAL, format!("websocket receive error: {err}"));
                    }
                    None => {
                        break (CLOSE_NORMAL, "websocket stream ended".to_string());
                    }
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(envelope) => {
                        if send_envelope(sender, &envelope).await.is_err() {
                            break (CLOSE_NORMAL, "websocket send error".to_string());
                        }
                    }
                    None => {
                        break (CLOSE_NORMAL, "outbound queue closed".to_string());
                    }
                }
            }
            () = handle.closed() => {
                let code = handle.close_code().unwrap_or(CLOSE_NORMAL);
                let reason = if code == CLOSE_SLOW_CONSUMER {
                    "outbound queue overflow".to_string()
                } else {
                    "session closed by server".to_string()
                };
                break (code, reason);
            }
            () = &mut heartbeat_sleep => {
                break (
                    CLOSE_HEARTBEAT_TIMEOUT,
                    format!("no ping within {}ms", heartbeat_timeout.as_millis()),
                );
            }
        }
    }
}

/// Stamp, route and acknowledge one client envelope. Returns `Err` with a
/// reason only when the socket write side is broken.
async fn handle_client_envelope(
    envelope: Envelope,
    sender: &mut (impl SinkExt<Message> + Unpin),
    user_id: i64,
    state: &AppState,
) -> Result<(), String> {
    if !envelope.kind.client_originated() {
        let error = Envelope::error(
            CLOSE_PROTOCOL_ERROR,
            format!("{:?} is not a client envelope", envelope.kind),
        );
        return send_envelope(sender, &error)
            .await
            .map_err(|()| "error write failed".to_string());
    }

    // The sender identity and receipt time are the server's to assign;
    // whatever the client put there is discarded.
    let kind = envelope.kind;
    let stamped =
        Envelope::new(kind, user_id, envelope.target, envelope.payload).stamped(Utc::now());
    let message_id = stamped.message_id();

    match state.router.route(stamped).await {
        Ok(receipt) => {
            if kind == EnvelopeKind::ChatMessage {
                if let Some(message_id) = message_id {
                    // Explicit acknowledgement to the originating session
                    // only; the sender's other devices see nothing.
                    let ack = Envelope::ack(
                        user_id,
                        AckPayload {
                            message_id,
                            state: DeliveryState::Sent,
                        },
                    );
                    send_envelope(sender, &ack)
                        .await
                        .map_err(|()| "ack write failed".to_string())?;
                    if receipt.any_delivered() {
                        let delivered = Envelope::ack(
                            user_id,
                            AckPayload {
                                message_id,
                                state: DeliveryState::Delivered,
                            },
                        );
                        send_envelope(sender, &delivered)
                            .await
                            .map_err(|()| "ack write failed".to_string())?;
                    }
                }
            }
            Ok(())
        }
        Err(err) => {
            tracing::debug!(user_id, error = %err, "envelope rejected at ingress");
            let error = Envelope::error(CLOSE_PROTOCOL_ERROR, err.to_string());
            send_envelope(sender, &error)
                .await
                .map_err(|()| "error write failed".to_string())
        }
    }
}

async fn send_envelope(
    sender: &mut (impl SinkExt<Message> + Unpin),
    envelope: &Envelope,
) -> Result<(), ()> {
    let payload = serde_json::to_string(envelope).map_err(|_| ())?;
    sender
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

fn advance(phase: &mut SessionPhase, to: SessionPhase, session_id: uuid::Uuid) {
    match phase.advance(to) {
        Ok(next) => *phase = next,
        Err(err) => {
            tracing::error!(%session_id, error = %err, "session lifecycle violation");
        }
    }
}
