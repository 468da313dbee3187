//! One task per socket: a reader loop feeding the relay and a writer task draining
//! the connection's outbound queue.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{OutboundFrame, ServerEvent, Target, TypingState, UserId};
use parley_relay::{ConnectionId, Inbound, RelayError};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::typing::TypingDebounce;
use crate::state::GatewayState;

/// How long the writer may keep flushing after the connection is unregistered.
const WRITER_GRACE: Duration = Duration::from_secs(1);

pub(super) async fn handle_socket(
    socket: WebSocket,
    state: Arc<GatewayState>,
    token: Option<String>,
) {
    let id = ConnectionId::generate();
    let (mut ws_sender, mut receiver) = socket.split();

    let (out_tx, mut out_rx) =
        mpsc::channel::<OutboundFrame>(state.relay_config.outbound_buffer.max(1));
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(err) = ws_sender.send(Message::Text(frame.to_text())).await {
                debug!(error = %err, "socket write failed");
                return;
            }
        }
        let _ = ws_sender.close().await;
    });

    if let Err(err) = state.relay.on_connect(&id, out_tx).await {
        warn!(connection_id = %id, error = %err, "could not attach connection");
        writer.abort();
        return;
    }
    info!(connection_id = %id, "connection opened");

    match token {
        Some(token) => match state.relay.authenticate(&id, &token).await {
            Ok(user) => replay_pending(&state, &id, &user).await,
            Err(err) => state.relay.report_error(&id, &err).await,
        },
        None => {
            if let Err(err) = state
                .relay
                .registry()
                .send_to(&id, ServerEvent::AuthRequired.into())
                .await
            {
                debug!(connection_id = %id, error = %err, "could not send auth challenge");
            }
        }
    }

    let idle = state.relay_config.idle_timeout();
    let mut typing = TypingDebounce::new(state.relay_config.typing_quiescence());
    let mut idle_deadline = Instant::now() + idle;
    let mut writer_finished = false;

    loop {
        let typing_deadline = typing.next_deadline();

        tokio::select! {
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if handle_text(&state, &id, &text, &mut typing).await.is_break() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        state.relay.registry().touch(&id).await;
                        let err = RelayError::malformed("binary frames are not supported");
                        state.relay.report_error(&id, &err).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection_id = %id, "client closed the socket");
                        break;
                    }
                    Some(Ok(_)) => state.relay.registry().touch(&id).await,
                    Some(Err(err)) => {
                        debug!(connection_id = %id, error = %err, "socket read failed");
                        break;
                    }
                }
            }
            _ = time::sleep_until(idle_deadline) => {
                match state.relay.registry().last_seen(&id).await {
                    Some(seen) if seen + idle > Instant::now() => idle_deadline = seen + idle,
                    _ => {
                        info!(connection_id = %id, idle_seconds = idle.as_secs(), "closing idle connection");
                        break;
                    }
                }
            }
            _ = time::sleep_until(typing_deadline.unwrap_or(idle_deadline)), if typing_deadline.is_some() => {
                let expired = typing.take_expired(Instant::now());
                stop_typing(&state, &id, expired).await;
            }
            _ = &mut writer => {
                writer_finished = true;
                break;
            }
        }
    }

    stop_typing(&state, &id, typing.drain()).await;
    if let Some(departed) = state.relay.on_disconnect(&id).await {
        info!(
            connection_id = %id,
            user_id = ?departed.identity,
            last_for_user = departed.last_for_user,
            "connection closed"
        );
    }

    if !writer_finished && time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn handle_text(
    state: &GatewayState,
    id: &ConnectionId,
    text: &str,
    typing: &mut TypingDebounce,
) -> ControlFlow<()> {
    match state.relay.on_message(id, text).await {
        Ok(Inbound::Authenticated(user)) => replay_pending(state, id, &user).await,
        Ok(Inbound::Typing {
            target,
            state: typing_state,
        }) => typing.observe(target, typing_state, Instant::now()),
        Ok(Inbound::Delivered(result)) if result.partial_failure() => {
            debug!(
                connection_id = %id,
                delivered = result.delivered(),
                failed = result.failed().count(),
                "envelope partially delivered"
            );
        }
        Ok(_) => {}
        Err(err) => {
            debug!(connection_id = %id, code = err.code(), error = %err, "frame rejected");
            state.relay.report_error(id, &err).await;
            if !err.is_recoverable() {
                return ControlFlow::Break(());
            }
        }
    }
    ControlFlow::Continue(())
}

/// Send whatever was held for `user` while they were offline, oldest first.
///
/// Rows are marked delivered only once their frame is queued, so anything left over
/// when the connection goes away is replayed on the next login.
async fn replay_pending(state: &GatewayState, id: &ConnectionId, user: &UserId) {
    let Some(pending) = &state.pending else {
        return;
    };

    let mut replayed = 0usize;
    loop {
        let batch = match pending
            .next_pending(user, state.relay_config.pending_batch.max(1))
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                warn!(user_id = %user, error = %err, "could not load pending envelopes");
                return;
            }
        };
        if batch.is_empty() {
            break;
        }

        let mut queued = Vec::with_capacity(batch.len());
        let mut interrupted = None;
        for (row, envelope) in batch {
            match state
                .relay
                .registry()
                .send_to(id, OutboundFrame::envelope(envelope))
                .await
            {
                Ok(()) => queued.push(row),
                Err(err) => {
                    interrupted = Some(err);
                    break;
                }
            }
        }

        replayed += queued.len();
        if let Err(err) = pending.mark_delivered(&queued).await {
            warn!(user_id = %user, error = %err, "could not mark replayed envelopes delivered");
            return;
        }
        if let Some(err) = interrupted {
            warn!(
                connection_id = %id,
                user_id = %user,
                replayed,
                error = %err,
                "pending replay interrupted, the rest stays stored"
            );
            return;
        }
    }

    if replayed > 0 {
        info!(connection_id = %id, user_id = %user, replayed, "pending envelopes replayed");
    }
}

async fn stop_typing(state: &GatewayState, id: &ConnectionId, targets: Vec<Target>) {
    if targets.is_empty() {
        return;
    }
    let Some(user) = state.relay.registry().identity_of(id).await else {
        return;
    };
    for target in targets {
        state
            .relay
            .presence()
            .notify_typing(&user, &target, TypingState::Stopped)
            .await;
    }
}
