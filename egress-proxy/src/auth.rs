//! Service authentication
//!
//! Validates the credential a caller presents for a service ID against that
//! service's configured policy. Each `AuthType` maps to one
//! [`CredentialCheck`] strategy; adding a type means adding a variant and a
//! strategy, nothing else.
//!
//! Failure reasons are returned for logging only. Callers must not echo them
//! to the unauthenticated peer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use packet_classifier::{AuthType, Service, ServiceId, TokenCache};
use ring::hmac;

use crate::jwt::{self, Claims, JwtError, DEFAULT_JWT_TTL};
use crate::metrics::Metrics;
use crate::tls::PeerIdentity;

/// Fixed key used to blind both sides of a token comparison
const COMPARISON_KEY: &[u8] = b"comparison";

// ============================================================================
// Constant-time Comparison
// ============================================================================

/// Compare two secrets without a data-dependent early exit.
///
/// Both inputs are run through HMAC-SHA256 under a fixed key and the tags are
/// compared in constant time, so inputs of different lengths cost the same
/// as inputs that differ in their last byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, COMPARISON_KEY);
    let tag = hmac::sign(&key, a);
    hmac::verify(&key, b, tag.as_ref()).is_ok()
}

// ============================================================================
// Credentials and Strategies
// ============================================================================

/// What a caller presented
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials<'a> {
    /// Shared token or JWT from the in-band handshake
    pub token: &'a str,
    /// Verified client certificate, if the connection came in over mTLS
    pub peer: Option<&'a PeerIdentity>,
}

impl<'a> Credentials<'a> {
    pub fn token(token: &'a str) -> Self {
        Credentials { token, peer: None }
    }
}

trait CredentialCheck: Sync {
    fn check(&self, service: &Service, credentials: &Credentials<'_>) -> Result<(), AuthError>;
}

struct NoAuth;
struct SharedToken;
struct JwtToken;
struct PeerCertificate;

impl CredentialCheck for NoAuth {
    fn check(&self, _: &Service, _: &Credentials<'_>) -> Result<(), AuthError> {
        Ok(())
    }
}

impl CredentialCheck for SharedToken {
    fn check(&self, service: &Service, credentials: &Credentials<'_>) -> Result<(), AuthError> {
        if service.auth_token.is_empty() {
            return Err(AuthError::NotConfigured(service.id));
        }
        if constant_time_eq(credentials.token.as_bytes(), service.auth_token.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

impl CredentialCheck for JwtToken {
    fn check(&self, service: &Service, credentials: &Credentials<'_>) -> Result<(), AuthError> {
        if service.jwt_secret.is_empty() {
            return Err(AuthError::NotConfigured(service.id));
        }
        jwt::verify(
            credentials.token,
            service.jwt_secret.as_bytes(),
            service.id,
            jwt::unix_now(),
        )?;
        Ok(())
    }
}

impl CredentialCheck for PeerCertificate {
    fn check(&self, service: &Service, credentials: &Credentials<'_>) -> Result<(), AuthError> {
        let peer = credentials.peer.ok_or(AuthError::MissingPeerCertificate)?;
        if peer.names_service(&service.name) || peer.names_service(&service.address) {
            Ok(())
        } else {
            Err(AuthError::PeerMismatch {
                common_name: peer.common_name.clone(),
            })
        }
    }
}

fn strategy(auth_type: AuthType) -> Option<&'static dyn CredentialCheck> {
    match auth_type {
        AuthType::None => Some(&NoAuth),
        AuthType::Base64Token => Some(&SharedToken),
        AuthType::Jwt => Some(&JwtToken),
        AuthType::Tls => Some(&PeerCertificate),
        AuthType::Complex => None,
    }
}

// ============================================================================
// Authenticator
// ============================================================================

pub struct Authenticator {
    services: RwLock<HashMap<ServiceId, Service>>,
    metrics: Arc<Metrics>,
    token_cache: Option<(Arc<dyn TokenCache>, Duration)>,
}

impl Authenticator {
    pub fn new(services: &[Service], metrics: Arc<Metrics>) -> Self {
        let auth = Authenticator {
            services: RwLock::new(HashMap::new()),
            metrics,
            token_cache: None,
        };
        auth.update_services(services);
        auth
    }

    /// Remember successfully checked shared tokens for the fast path
    pub fn with_token_cache(mut self, cache: Arc<dyn TokenCache>, ttl: Duration) -> Self {
        self.token_cache = Some((cache, ttl));
        self
    }

    pub fn update_services(&self, services: &[Service]) {
        let map: HashMap<ServiceId, Service> =
            services.iter().map(|s| (s.id, s.clone())).collect();
        match self.services.write() {
            Ok(mut guard) => *guard = map,
            Err(poisoned) => *poisoned.into_inner() = map,
        }
    }

    pub fn auth_type(&self, service_id: ServiceId) -> Option<AuthType> {
        let services = self.services.read().ok()?;
        services.get(&service_id).map(|s| s.auth_type)
    }

    /// Token-only authentication, as used by the in-band handshake
    pub fn authenticate_service(&self, service_id: ServiceId, token: &str) -> Result<(), AuthError> {
        self.authenticate(service_id, &Credentials::token(token))
    }

    pub fn authenticate(
        &self,
        service_id: ServiceId,
        credentials: &Credentials<'_>,
    ) -> Result<(), AuthError> {
        let result = self.check(service_id, credentials);
        match &result {
            Ok(auth_type) => {
                Metrics::inc(&self.metrics.auth_success_total);
                if *auth_type == AuthType::Base64Token {
                    if let Some((cache, ttl)) = &self.token_cache {
                        cache.remember(credentials.token, service_id, *ttl);
                    }
                }
                log::debug!("Service {} authenticated ({})", service_id, auth_type);
            }
            Err(e) => {
                Metrics::inc(&self.metrics.auth_failure_total);
                log::warn!("Authentication failed for service {}: {}", service_id, e);
            }
        }
        result.map(|_| ())
    }

    fn check(&self, service_id: ServiceId, credentials: &Credentials<'_>) -> Result<AuthType, AuthError> {
        let services = self.services.read().map_err(|_| AuthError::UnknownService(service_id))?;
        let service = services
            .get(&service_id)
            .ok_or(AuthError::UnknownService(service_id))?;
        let check = strategy(service.auth_type).ok_or(AuthError::Unsupported(service.auth_type))?;
        check.check(service, credentials)?;
        Ok(service.auth_type)
    }

    /// Mint a token for `service_id` with its configured lifetime (one hour by default)
    pub fn generate_jwt_token(&self, service_id: ServiceId) -> Result<String, AuthError> {
        let services = self.services.read().map_err(|_| AuthError::UnknownService(service_id))?;
        let service = services
            .get(&service_id)
            .ok_or(AuthError::UnknownService(service_id))?;
        if service.jwt_secret.is_empty() {
            return Err(AuthError::NotConfigured(service_id));
        }
        let ttl = if service.jwt_expiry > 0 {
            Duration::from_secs(service.jwt_expiry)
        } else {
            DEFAULT_JWT_TTL
        };
        let claims = Claims::new(service.id, &service.name, jwt::unix_now(), ttl);
        Ok(jwt::encode(&claims, service.jwt_secret.as_bytes())?)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum AuthError {
    UnknownService(ServiceId),
    /// Service demands a secret it does not have
    NotConfigured(ServiceId),
    Unsupported(AuthType),
    InvalidToken,
    Jwt(JwtError),
    MissingPeerCertificate,
    PeerMismatch { common_name: String },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::UnknownService(id) => write!(f, "service {} not found", id),
            AuthError::NotConfigured(id) => write!(f, "no credential configured for service {}", id),
            AuthError::Unsupported(t) => write!(f, "unsupported auth type: {}", t),
            AuthError::InvalidToken => write!(f, "invalid token"),
            AuthError::Jwt(e) => write!(f, "JWT validation failed: {}", e),
            AuthError::MissingPeerCertificate => write!(f, "no client certificate presented"),
            AuthError::PeerMismatch { common_name } => {
                write!(f, "client certificate '{}' does not name the service", common_name)
            }
        }
    }
}

impl std::error::Error for AuthError {}

impl From<JwtError> for AuthError {
    fn from(e: JwtError) -> Self {
        AuthError::Jwt(e)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
