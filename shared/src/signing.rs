//! Timestamped HMAC-SHA256 tokens.
//!
//! A token is `payload.timestamp.signature`, each part base64url encoded
//! without padding. The salt namespaces tokens so a session cookie can never
//! be replayed as a student status link and vice versa.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("token is malformed")]
    Malformed,
    #[error("signature does not match")]
    BadSignature,
    #[error("token has expired")]
    Expired,
}

#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn sign<T: Serialize>(
        &self,
        salt: &str,
        payload: &T,
        now: DateTime<Utc>,
    ) -> Result<String, serde_json::Error> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?);
        let timestamp = URL_SAFE_NO_PAD.encode(now.timestamp().to_be_bytes());
        let signature = URL_SAFE_NO_PAD.encode(self.mac(salt, &payload, &timestamp).finalize().into_bytes());
        Ok(format!("{payload}.{timestamp}.{signature}"))
    }

    /// Verifies the signature, then the age (when `max_age` is given), then decodes.
    pub fn unsign<T: DeserializeOwned>(
        &self,
        salt: &str,
        token: &str,
        max_age: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<T, SignatureError> {
        let mut parts = token.split('.');
        let (Some(payload), Some(timestamp), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SignatureError::Malformed);
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Malformed)?;
        self.mac(salt, payload, timestamp)
            .verify_slice(&signature)
            .map_err(|_| SignatureError::BadSignature)?;

        if let Some(max_age) = max_age {
            let raw: [u8; 8] = URL_SAFE_NO_PAD
                .decode(timestamp)
                .map_err(|_| SignatureError::Malformed)?
                .try_into()
                .map_err(|_| SignatureError::Malformed)?;
            let signed_at = DateTime::<Utc>::from_timestamp(i64::from_be_bytes(raw), 0)
                .ok_or(SignatureError::Malformed)?;
            if now - signed_at > max_age {
                return Err(SignatureError::Expired);
            }
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| SignatureError::Malformed)?;
        serde_json::from_slice(&payload).map_err(|_| SignatureError::Malformed)
    }

    fn mac(&self, salt: &str, payload: &str, timestamp: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(salt.as_bytes());
        mac.update(b":");
        mac.update(payload.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac
    }
}
