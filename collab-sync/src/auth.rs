//! Connection-time authentication.
//!
//! The gate runs exactly once per connection, before any document state is
//! touched. It pulls a bearer token out of the connect payload, the handshake
//! query string or the `Authorization` header, hands it to a [`TokenVerifier`]
//! and turns the result into an immutable [`Identity`].
//!
//! Verifier failures are logged with their cause but always reach the client
//! as the same opaque `Unauthorized: invalid token`.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

/// Authenticated principal of one session.
///
/// Constructed once by the gate and passed by reference afterwards; it has no
/// setters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    user_id: String,
    tenant_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

/// Errors surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized: missing token")]
    MissingToken,
    #[error("Unauthorized: invalid token")]
    InvalidToken,
}

/// Errors raised by verifiers. Never sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token expired")]
    Expired,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("unknown token")]
    UnknownToken,
    #[error("invalid claims: {0}")]
    InvalidClaims(String),
}

/// External identity verifier.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, VerifyError>;
}

/// Handshake-time connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    /// Decoded query string pairs, in order
    pub query: Vec<(String, String)>,
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
}

impl ConnectParams {
    /// Capture query string and `Authorization` header from the upgrade request.
    pub fn from_request(request: &Request) -> Self {
        let query = request.uri().query().map(parse_query).unwrap_or_default();
        let authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Self { query, authorization }
    }

    /// First value for `name` in the query string.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Pick the credential for a connection.
///
/// Precedence: explicit token (connect payload, then `?token=`), the
/// `Authorization` header, then `?authorization=` / `?Authorization=`.
/// Empty candidates are skipped.
pub fn extract_token(payload_token: Option<&str>, params: &ConnectParams) -> Option<String> {
    let explicit = payload_token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| params.query_value("token").map(str::trim).filter(|t| !t.is_empty()));
    if let Some(token) = explicit {
        return Some(token.to_string());
    }

    let header = params.authorization.as_deref().and_then(strip_bearer);
    if let Some(token) = header {
        return Some(token.to_string());
    }

    params
        .query_value("authorization")
        .or_else(|| params.query_value("Authorization"))
        .and_then(strip_bearer)
        .map(str::to_string)
}

fn strip_bearer(value: &str) -> Option<&str> {
    let value = value.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

/// Authentication gate: token extraction plus verification.
#[derive(Clone)]
pub struct AuthGate {
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Evaluate one connection attempt.
    pub fn authenticate(
        &self,
        payload_token: Option<&str>,
        params: &ConnectParams,
    ) -> Result<Identity, AuthError> {
        let token = extract_token(payload_token, params).ok_or(AuthError::MissingToken)?;
        self.verifier.verify(&token).map_err(|e| {
            log::warn!("Token rejected: {e}");
            AuthError::InvalidToken
        })
    }
}

/// JWT claims accepted by [`JwtVerifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Tenant the user belongs to
    pub tenant_id: String,
    /// Expiration (seconds since epoch)
    pub exp: u64,
    /// Issued at (seconds since epoch)
    #[serde(default)]
    pub iat: u64,
}

/// HS256 JWT verifier with a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, VerifyError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                ErrorKind::InvalidSignature => VerifyError::InvalidSignature,
                _ => VerifyError::Malformed(e.to_string()),
            })?;
        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(VerifyError::InvalidClaims("empty sub".into()));
        }
        if claims.tenant_id.is_empty() || claims.tenant_id.contains(':') {
            return Err(VerifyError::InvalidClaims(format!(
                "unusable tenant id {:?}",
                claims.tenant_id
            )));
        }
        Ok(Identity::new(claims.sub, claims.tenant_id))
    }
}

/// Sign an HS256 token. Used by tooling and tests that need real credentials.
pub fn issue_token(secret: &[u8], claims: &Claims) -> Result<String, VerifyError> {
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret))
        .map_err(|e| VerifyError::Malformed(e.to_string()))
}

/// Fixed token table, for development servers and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` as belonging to `identity`.
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, VerifyError> {
        self.tokens.get(token).cloned().ok_or(VerifyError::UnknownToken)
    }
}

/// Split and percent-decode a query string.
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}
