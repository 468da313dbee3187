//! Deterministic nonce sequences.
//!
//! Random nonces are the default. Some callers (long-lived sessions that must not
//! depend on the RNG, or test fixtures) need a counter instead; a counter must never
//! wrap under the same key, so the sequence refuses to continue once its limit is hit.

use crate::{CryptoError, NONCE_LEN};

/// Nonce = 4-byte prefix || 8-byte big-endian counter.
#[derive(Debug, Clone)]
pub struct CounterNonces {
    prefix: [u8; 4],
    next: u64,
    limit: u64,
}

impl CounterNonces {
    pub fn new(prefix: [u8; 4]) -> Self {
        Self::with_limit(prefix, u64::MAX)
    }

    /// At most `limit` nonces will be issued.
    pub fn with_limit(prefix: [u8; 4], limit: u64) -> Self {
        Self {
            prefix,
            next: 0,
            limit,
        }
    }

    /// Continue a sequence persisted elsewhere.
    pub fn resume(prefix: [u8; 4], next: u64, limit: u64) -> Self {
        Self {
            prefix,
            next,
            limit,
        }
    }

    pub fn issued(&self) -> u64 {
        self.next
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.next)
    }

    pub fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], CryptoError> {
        if self.next >= self.limit {
            return Err(CryptoError::KeyExhausted);
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&self.next.to_be_bytes());
        self.next += 1;
        Ok(nonce)
    }
}
