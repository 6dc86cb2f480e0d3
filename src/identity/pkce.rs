//! Proof Key for Code Exchange (RFC 7636), S256 method only.
//! The verifier stays with the browser in an HttpOnly cookie; only its challenge is sent
//! to the authorization endpoint.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// Value of the `code_challenge_method` parameter.
pub const PKCE_METHOD: &str = "s256";

#[derive(Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair").field("verifier", &"<redacted>").field("challenge", &self.challenge).finish()
    }
}

impl PkcePair {
    /// 32 random bytes encode to a 43-character verifier, the minimum length allowed.
    pub fn generate() -> AppResult<Self> {
        let mut buf = [0u8; 32];
        getrandom::getrandom(&mut buf).map_err(|e| AppError::transport(format!("random source unavailable: {}", e)))?;
        let verifier = URL_SAFE_NO_PAD.encode(buf);
        let challenge = challenge_s256(&verifier);
        Ok(Self { verifier, challenge })
    }
}

/// BASE64URL(SHA256(verifier)) without padding.
pub fn challenge_s256(verifier: &str) -> String { URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())) }
