//! Razorpay webhook signature verification
//!
//! Razorpay signs the exact request body with HMAC-SHA256 using the webhook
//! secret configured in the dashboard, and sends the lowercase hex digest in
//! `x-razorpay-signature`. Verification must run over the raw bytes before any
//! JSON parsing; a re-serialized body does not hash to the same digest.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> BillingResult<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(BillingError::Configuration(
                "webhook secret must not be empty".into(),
            ));
        }
        Ok(Self { secret })
    }

    /// Hex digest Razorpay would send for `body`
    pub fn sign(&self, body: &[u8]) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Configuration("invalid webhook secret".into()))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify `signature` (the header value, if any) against `body`
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> BillingResult<()> {
        let provided = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(BillingError::SignatureMissing)?;

        let computed = self.sign(body)?;
        let provided = provided.to_ascii_lowercase();

        // Length mismatch short-circuits inside ct_eq, which only leaks length.
        if computed.as_bytes().ct_eq(provided.as_bytes()).into() {
            Ok(())
        } else {
            tracing::warn!(
                body_len = body.len(),
                signature_len = provided.len(),
                "Razorpay webhook signature mismatch"
            );
            Err(BillingError::SignatureInvalid)
        }
    }
}
