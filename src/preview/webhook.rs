//! HMAC-SHA256 verification of inbound GitHub webhook deliveries.
//!
//! GitHub signs each payload with the shared webhook secret and sends the
//! result in `X-Hub-Signature-256` as `sha256=<hex>`. Comparison is
//! constant-time via `subtle`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::errors::WebhookError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

/// Holds the shared secret. Never logged.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into().into_bytes(),
        }
    }

    /// Check `signature_header` against the HMAC of `payload`.
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<(), WebhookError> {
        let signature_hex = signature_header
            .strip_prefix("sha256=")
            .ok_or_else(|| WebhookError::InvalidSignatureFormat("missing sha256= prefix".into()))?;
        let expected = hex::decode(signature_hex)
            .map_err(|e| WebhookError::InvalidSignatureFormat(format!("invalid hex: {e}")))?;

        let computed = self.sign(payload)?;
        if computed.ct_eq(&expected).into() {
            Ok(())
        } else {
            tracing::warn!("webhook signature verification failed");
            Err(WebhookError::SignatureMismatch)
        }
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, WebhookError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| WebhookError::InvalidSignatureFormat(e.to_string()))?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Header value GitHub would send for `payload`.
    pub fn signature_for(&self, payload: &[u8]) -> Result<String, WebhookError> {
        Ok(format!("sha256={}", hex::encode(self.sign(payload)?)))
    }
}
