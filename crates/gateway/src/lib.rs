//! # Parley Gateway Crate
//!
//! The transport in front of the relay core: an axum router exposing the WebSocket
//! endpoint and a health probe.
//!
//! ## Architecture
//!
//! - **WebSocket**: one reader loop per socket plus a writer task draining the
//!   connection's bounded outbound queue; idle timeout and typing debounce live here
//! - **REST**: `/health`
//! - **State**: the shared [`parley_relay::Relay`] and the offline envelope store
//! - **Middleware**: request tracing and CORS
//!
//! ## Usage
//!
//! ```rust,ignore
//! use parley_gateway::{create_router, GatewayState};
//!
//! let state = GatewayState::new(relay, config.relay.clone());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:7070").await?;
//! axum::serve(listener, create_router(state)).await?;
//! ```

pub mod error;
pub mod middleware;
pub mod rest;
pub mod state;
pub mod websocket;

pub use error::{GatewayError, GatewayResult};
pub use state::GatewayState;

use axum::Router;
use std::sync::Arc;

/// Create the main application router with all routes
pub fn create_router(state: GatewayState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .merge(rest::create_rest_routes().with_state(state.clone()))
        .merge(websocket::create_websocket_routes().with_state(state))
        .layer(middleware::create_cors_middleware())
        .layer(middleware::create_trace_middleware())
}
