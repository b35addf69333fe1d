//! Credential token validation.
//!
//! Tokens are HMAC-signed JWTs carrying `sub` (user id) and `exp`. The
//! header's `alg` is checked against the configured allow-list before any
//! signature work, so `none` and unlisted algorithms are reported as
//! untrusted rather than malformed.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parley_relay::AuthFailure;
use serde::Deserialize;

use super::AuthError;

/// The `sub` claim. Issuers write the user id as a number, some as a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SubjectRef {
    Id(i64),
    Name(String),
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectRef::Id(id) => write!(f, "{}", id),
            SubjectRef::Name(name) => f.write_str(name),
        }
    }
}

/// Claims the relay reads from a credential token.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: SubjectRef,
    pub exp: u64,
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
}

/// Verifies signature and expiry of credential tokens.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Build a validator for an HMAC `secret` accepting `allowed_algorithms`.
    ///
    /// Only `HS256`, `HS384` and `HS512` can be verified with a shared secret.
    pub fn new(secret: &[u8], allowed_algorithms: &[String]) -> Result<Self, AuthError> {
        let mut algorithms = Vec::with_capacity(allowed_algorithms.len());
        for name in allowed_algorithms {
            let algorithm = Algorithm::from_str(name)
                .map_err(|_| AuthError::UnsupportedAlgorithm(name.clone()))?;
            if !matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
                return Err(AuthError::UnsupportedAlgorithm(name.clone()));
            }
            algorithms.push(algorithm);
        }
        if algorithms.is_empty() {
            return Err(AuthError::UnsupportedAlgorithm("<none configured>".to_string()));
        }

        let mut validation = Validation::new(algorithms[0]);
        validation.algorithms = algorithms;
        validation.leeway = 0;
        validation.validate_aud = false;
        // `sub` is enforced by `Claims` itself; the built-in check only
        // accepts string subjects.
        validation.set_required_spec_claims(&["exp"]);

        Ok(Self {
            key: DecodingKey::from_secret(secret),
            validation,
        })
    }

    fn allows(&self, alg: &str) -> bool {
        Algorithm::from_str(alg)
            .map(|algorithm| self.validation.algorithms.contains(&algorithm))
            .unwrap_or(false)
    }

    /// Validate `token` and return its claims.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthFailure> {
        let header = token.split('.').next().ok_or(AuthFailure::Malformed)?;
        let header: RawHeader = decode_segment(header).ok_or(AuthFailure::Malformed)?;
        if !self.allows(&header.alg) {
            return Err(AuthFailure::UntrustedAlgorithm);
        }

        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthFailure::Expired,
                ErrorKind::InvalidAlgorithm => AuthFailure::UntrustedAlgorithm,
                _ => AuthFailure::Malformed,
            })
    }
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Option<T> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Read the `username` claim without checking the signature.
///
/// Only for labelling log lines about rejected tokens.
pub fn unverified_username(token: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Payload {
        username: Option<String>,
    }

    let payload = token.split('.').nth(1)?;
    decode_segment::<Payload>(payload)?.username
}
