use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Lowercase hex HMAC-SHA256 of `body` keyed with `secret`. `None` if the
/// key is rejected.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return None,
    };
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify an `X-Hook-Signature` value against the exact bytes received.
///
/// `body` must be the raw request body, never a re-encoded JSON value.
/// Comparison is constant-time over the hex digests.
pub fn verify_signature(body: &[u8], signature_hex: &str, secret: &str) -> bool {
    match sign(secret, body) {
        Some(computed) => computed.as_bytes().ct_eq(signature_hex.as_bytes()).into(),
        None => false,
    }
}

/// Why a batch was accepted without verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnverifiedReason {
    /// The sender did not sign the request.
    NoSignature,
    /// Signed, but no handshake has bound a secret yet.
    NoSecretBound,
}

/// Result of the signature policy for one inbound batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified,
    Unverified(UnverifiedReason),
    Rejected,
}

impl SignatureCheck {
    /// Apply the acceptance policy. Verification is only attempted when
    /// both a signature and a bound secret are present.
    pub fn evaluate(body: &[u8], signature: Option<&str>, secret: Option<&str>) -> Self {
        match (signature, secret) {
            (None, _) => SignatureCheck::Unverified(UnverifiedReason::NoSignature),
            (Some(_), None) => SignatureCheck::Unverified(UnverifiedReason::NoSecretBound),
            (Some(sig), Some(secret)) => {
                if verify_signature(body, sig, secret) {
                    SignatureCheck::Verified
                } else {
                    SignatureCheck::Rejected
                }
            }
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, SignatureCheck::Verified)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SignatureCheck::Verified => "verified",
            SignatureCheck::Unverified(_) => "unverified",
            SignatureCheck::Rejected => "rejected",
        }
    }
}
