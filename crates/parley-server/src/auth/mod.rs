//! Authentication Module
//!
//! Turns the `Authorization` cookie of an upgrade request into a chat
//! identity:
//!
//! 1. `jwt` checks the token's algorithm, signature and expiry
//! 2. `users` resolves the token subject to a registered user
//! 3. The user's name becomes the participant identity
//!
//! Tokens are issued elsewhere; this server only verifies them.

pub mod jwt;
pub mod users;

use async_trait::async_trait;
use parley_relay::{AuthFailure, Identity, IdentityVerifier};
use thiserror::Error;
use tracing::{debug, error, warn};

pub use jwt::TokenValidator;
pub use users::{LibSqlUserDirectory, UserDirectory};

/// Authentication setup errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// [`IdentityVerifier`] backed by signed tokens and the user directory.
pub struct JwtIdentityVerifier<D> {
    validator: TokenValidator,
    directory: D,
}

impl<D: UserDirectory> JwtIdentityVerifier<D> {
    pub fn new(validator: TokenValidator, directory: D) -> Self {
        Self {
            validator,
            directory,
        }
    }
}

#[async_trait]
impl<D: UserDirectory> IdentityVerifier for JwtIdentityVerifier<D> {
    async fn verify(&self, token: &str) -> Result<Identity, AuthFailure> {
        let username_hint =
            jwt::unverified_username(token).unwrap_or_else(|| "unknown".to_string());

        let claims = match self.validator.validate(token) {
            Ok(claims) => claims,
            Err(failure @ AuthFailure::Expired) => {
                warn!(username = %username_hint, "Authentication failed: token expired");
                return Err(failure);
            }
            Err(failure) => {
                error!(username = %username_hint, reason = %failure, "Authentication failed: invalid token");
                return Err(failure);
            }
        };

        let subject = claims.sub.to_string();
        match self.directory.find_by_subject(&subject).await {
            Ok(Some(user)) => {
                debug!(
                    user_id = user.id,
                    username = %user.username,
                    expires_at = claims.exp,
                    "Token verified"
                );
                Ok(Identity::new(user.username))
            }
            Ok(None) => {
                warn!(username = %username_hint, subject = %subject, "Authentication failed: user not found");
                Err(AuthFailure::UnknownSubject)
            }
            Err(e) => {
                error!(subject = %subject, error = %e, "Authentication failed: user lookup error");
                Err(AuthFailure::UnknownSubject)
            }
        }
    }
}
