//! JWT issue and validation.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parley_config::AuthConfig;
use parley_protocol::UserId;
use parley_relay::{CollaboratorError, TokenVerifier};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::AuthError;

const DEFAULT_SECRET: &str = "default_secret_change_in_production";
const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // user id
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub iss: String,
    pub aud: String,
    pub jti: String,
}

/// Issues and validates relay access tokens.
pub struct JwtAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    token_ttl: Duration,
}

impl JwtAuthority {
    pub fn new(secret: &str, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            audience: audience.into(),
            token_ttl: Duration::hours(24),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        if config.jwt_secret == DEFAULT_SECRET {
            warn!("auth.jwt_secret is the built-in default; set PARLEY__AUTH__JWT_SECRET");
        }

        let ttl_seconds = config.token_ttl_seconds.min(MAX_TTL_SECONDS) as i64;
        Self::new(&config.jwt_secret, &config.issuer, &config.audience)
            .with_ttl(Duration::seconds(ttl_seconds))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn issue_token(&self, user: &UserId) -> Result<String, AuthError> {
        if user.as_str().is_empty() {
            return Err(AuthError::EmptySubject);
        }

        let now = Utc::now();
        let expires = now
            .checked_add_signed(self.token_ttl)
            .ok_or_else(|| AuthError::TokenCreationFailed("ttl out of range".to_string()))?;

        let claims = Claims {
            sub: user.to_string(),
            exp: expires.timestamp(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: uuid::Uuid::new_v4().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| AuthError::TokenCreationFailed(err.to_string()))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(err.to_string()),
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::EmptySubject);
        }
        Ok(data.claims)
    }
}

#[async_trait]
impl TokenVerifier for JwtAuthority {
    async fn verify_token(&self, token: &str) -> Result<UserId, CollaboratorError> {
        match self.validate_token(token) {
            Ok(claims) => Ok(UserId::new(claims.sub)),
            Err(err) => {
                debug!(error = %err, "token rejected");
                Err(CollaboratorError::TokenRejected(err.to_string()))
            }
        }
    }
}
