//! HS256 JSON Web Tokens for service authentication
//!
//! Tokens are `base64url(header).base64url(claims).base64url(signature)` where
//! the signature is HMAC-SHA256 over the first two segments. Minting and
//! verification both go through [`signature`].

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use packet_classifier::ServiceId;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::auth::constant_time_eq;

/// Lifetime used when a service does not configure one
pub const DEFAULT_JWT_TTL: Duration = Duration::from_secs(3600);

const ALGORITHM: &str = "HS256";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Header {
    typ: String,
    alg: String,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            typ: "JWT".to_string(),
            alg: ALGORITHM.to_string(),
        }
    }
}

/// Payload carried by service tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub service_id: ServiceId,
    #[serde(default)]
    pub service_name: String,
    /// Issued-at, seconds since the epoch
    #[serde(default)]
    pub iat: i64,
    /// Expiry, seconds since the epoch; 0 means no expiry
    #[serde(default)]
    pub exp: i64,
}

impl Claims {
    pub fn new(service_id: ServiceId, service_name: &str, issued_at: i64, ttl: Duration) -> Self {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Claims {
            service_id,
            service_name: service_name.to_string(),
            iat: issued_at,
            exp: issued_at.saturating_add(ttl),
        }
    }
}

/// Current wall clock in whole seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// HMAC-SHA256 of `signing_input` under `secret`
pub fn signature(secret: &[u8], signing_input: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::sign(&key, signing_input).as_ref().to_vec()
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, JwtError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| JwtError::Malformed)
}

pub fn encode(claims: &Claims, secret: &[u8]) -> Result<String, JwtError> {
    let header = serde_json::to_vec(&Header::default())?;
    let payload = serde_json::to_vec(claims)?;

    let mut token = URL_SAFE_NO_PAD.encode(header);
    token.push('.');
    token.push_str(&URL_SAFE_NO_PAD.encode(payload));

    let sig = signature(secret, token.as_bytes());
    token.push('.');
    token.push_str(&URL_SAFE_NO_PAD.encode(sig));
    Ok(token)
}

/// Check signature, expiry and subject; `now` is seconds since the epoch
pub fn verify(
    token: &str,
    secret: &[u8],
    expected_service: ServiceId,
    now: i64,
) -> Result<Claims, JwtError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(JwtError::Malformed);
    };

    let header: Header = serde_json::from_slice(&decode_segment(header_b64)?)?;
    if header.alg != ALGORITHM {
        return Err(JwtError::UnsupportedAlgorithm(header.alg));
    }

    let signing_input_len = header_b64.len() + 1 + payload_b64.len();
    let expected = signature(secret, &token.as_bytes()[..signing_input_len]);
    let presented = decode_segment(sig_b64)?;
    if !constant_time_eq(&expected, &presented) {
        return Err(JwtError::BadSignature);
    }

    let claims: Claims = serde_json::from_slice(&decode_segment(payload_b64)?)?;
    if claims.exp > 0 && now > claims.exp {
        return Err(JwtError::Expired);
    }
    if claims.service_id != expected_service {
        return Err(JwtError::ServiceMismatch {
            expected: expected_service,
            claimed: claims.service_id,
        });
    }
    Ok(claims)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum JwtError {
    /// Not three base64url segments
    Malformed,
    /// Header or payload is not the expected JSON
    Json(serde_json::Error),
    UnsupportedAlgorithm(String),
    BadSignature,
    Expired,
    ServiceMismatch { expected: ServiceId, claimed: ServiceId },
}

impl fmt::Display for JwtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JwtError::Malformed => write!(f, "malformed token"),
            JwtError::Json(e) => write!(f, "invalid token JSON: {}", e),
            JwtError::UnsupportedAlgorithm(alg) => write!(f, "unsupported algorithm {}", alg),
            JwtError::BadSignature => write!(f, "signature mismatch"),
            JwtError::Expired => write!(f, "token expired"),
            JwtError::ServiceMismatch { expected, claimed } => write!(
                f,
                "token issued for service {} presented as service {}",
                claimed, expected
            ),
        }
    }
}

impl std::error::Error for JwtError {}

impl From<serde_json::Error> for JwtError {
    fn from(e: serde_json::Error) -> Self {
        JwtError::Json(e)
    }
}
