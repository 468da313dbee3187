//! WebSocket endpoint for the relay

mod connection;
mod typing;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::state::GatewayState;

pub use typing::TypingDebounce;

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

pub fn create_websocket_routes() -> Router<Arc<GatewayState>> {
    Router::new().route("/ws", get(websocket_handler))
}

/// Upgrade the request. A token in the query string is checked before the upgrade so a
/// bad one is refused with a plain HTTP status; without one the client authenticates
/// in-band.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<WebSocketQuery>,
) -> GatewayResult<Response> {
    let token = match query.token {
        Some(token) if token.trim().is_empty() => {
            return Err(GatewayError::InvalidRequest(
                "token must not be empty".to_string(),
            ))
        }
        Some(token) => {
            let user = state.relay.verify_token(&token).await?;
            debug!(user_id = %user, "query token accepted");
            Some(token)
        }
        None => None,
    };

    Ok(ws.on_upgrade(move |socket| connection::handle_socket(socket, state, token)))
}
