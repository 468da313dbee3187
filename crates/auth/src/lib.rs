//! Identity tokens for relay connections.
//!
//! Tokens are HS256 JWTs whose subject is the user identifier. The relay only ever
//! verifies them (through [`parley_relay::TokenVerifier`]); issuance exists for the
//! server CLI and for tests.

mod jwt;

pub use jwt::{Claims, JwtAuthority};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token creation failed: {0}")]
    TokenCreationFailed(String),
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
    #[error("token has an empty subject")]
    EmptySubject,
}
