//! Shared-secret validation for push requests
//!
//! Cameras authenticate with a pre-agreed token carried somewhere in the
//! payload. Both sides are hashed before comparison so the comparison runs
//! over fixed-size digests and leaks neither length nor prefix matches.

use sha2::{Digest, Sha256};

/// Pre-shared token checked against the resolved `token` field
#[derive(Clone)]
pub struct SharedSecret {
    digest: [u8; 32],
}

impl SharedSecret {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    /// Validate a token resolved from the payload
    ///
    /// # Errors
    /// * `AuthError::MissingToken` - No token was resolved
    /// * `AuthError::Mismatch` - Token does not match the secret
    pub fn verify(&self, token: Option<&str>) -> Result<(), AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let candidate: [u8; 32] = Sha256::digest(token.as_bytes()).into();

        if constant_time_eq(&self.digest, &candidate) {
            Ok(())
        } else {
            Err(AuthError::Mismatch)
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Compare two digests without short-circuiting
fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let diff = a
        .iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    std::hint::black_box(diff) == 0
}

/// Shared-secret errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuthError {
    #[error("Token missing from payload")]
    MissingToken,

    #[error("Token does not match shared secret")]
    Mismatch,
}
