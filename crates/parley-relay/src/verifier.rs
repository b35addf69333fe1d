//! Identity Verifier contract.
//!
//! The relay only consumes the verdict: an [`Identity`] or a classified
//! [`AuthFailure`]. Signature checks, expiry and user lookup live behind the
//! trait.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::AuthFailure;
use crate::types::Identity;

/// Turns a signed credential into a participant identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Verify `token`. Implementations must not retry.
    async fn verify(&self, token: &str) -> Result<Identity, AuthFailure>;
}

/// Fixed token table. Unknown tokens are [`AuthFailure::Malformed`].
#[derive(Debug, Default, Clone)]
pub struct StaticVerifier {
    tokens: HashMap<String, Result<Identity, AuthFailure>>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `identity`.
    pub fn allow(mut self, token: impl Into<String>, identity: impl Into<Identity>) -> Self {
        self.tokens.insert(token.into(), Ok(identity.into()));
        self
    }

    /// Reject `token` with `failure`.
    pub fn deny(mut self, token: impl Into<String>, failure: AuthFailure) -> Self {
        self.tokens.insert(token.into(), Err(failure));
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthFailure> {
        self.tokens
            .get(token)
            .cloned()
            .unwrap_or(Err(AuthFailure::Malformed))
    }
}
