//! Token primitives shared by every format and transport: lifetimes, bindings and errors.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use super::compose::ConfigError;
use super::crypto::HashAlgorithm;

/// Lifetime and application bindings carried by every token.
///
/// `bindings` is opaque to the engine. Order and values survive the whole
/// create → accept → insert → extract → validate chain byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Issue time in seconds since the Unix epoch.
    pub issue_time: u64,
    /// Lifetime in seconds, counted from `issue_time`.
    pub expires_in: u64,
    /// Ordered application data (client id, scope, resource id, ...).
    pub bindings: Vec<String>,
}

impl TokenInfo {
    /// Creates token information from its lifetime and bindings.
    pub fn new<I, S>(issue_time: u64, expires_in: u64, bindings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            issue_time,
            expires_in,
            bindings: bindings.into_iter().map(Into::into).collect(),
        }
    }

    /// Absolute expiry time in seconds since the Unix epoch.
    pub fn expires_at(&self) -> u64 {
        self.issue_time.saturating_add(self.expires_in)
    }

    /// Seconds left at `now`, zero once expired.
    pub fn remaining(&self, now: u64) -> u64 {
        self.expires_at().saturating_sub(now)
    }
}

/// A token as handed out by the authorization server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Token type marker, the scheme name (`bearer`, `mac`, ...).
    pub token_type: String,
    /// Handle, signed blob or MAC key identifier.
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Per-token shared secret for request-signing formats.
    pub secret: Option<String>,
    /// MAC algorithm the secret must be used with.
    pub algorithm: Option<HashAlgorithm>,
}

impl IssuedToken {
    /// Renders the token as OAuth2 token-endpoint response parameters.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("access_token".to_string(), self.access_token.clone()),
            ("token_type".to_string(), self.token_type.clone()),
            ("expires_in".to_string(), self.expires_in.to_string()),
        ];
        if let Some(secret) = &self.secret {
            params.push(("mac_key".to_string(), secret.clone()));
        }
        if let Some(algorithm) = self.algorithm {
            params.push(("mac_algorithm".to_string(), algorithm.mac_name().to_string()));
        }
        params
    }

    /// Parses token-endpoint response parameters back into an issued token.
    pub fn from_params(params: &[(String, String)]) -> Result<Self, TokenError> {
        let get = |name: &str| params.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());
        let access_token = get("access_token")
            .ok_or_else(|| TokenError::Malformed("missing access_token".into()))?;
        let token_type = get("token_type")
            .ok_or_else(|| TokenError::Malformed("missing token_type".into()))?;
        let expires_in = match get("expires_in") {
            Some(v) => v
                .parse()
                .map_err(|_| TokenError::Malformed(format!("invalid expires_in `{}`", v)))?,
            None => 0,
        };
        let algorithm = match get("mac_algorithm") {
            Some(name) => Some(
                HashAlgorithm::from_mac_name(&name)
                    .ok_or_else(|| TokenError::Malformed(format!("unsupported mac_algorithm `{}`", name)))?,
            ),
            None => None,
        };
        Ok(Self {
            token_type,
            access_token,
            expires_in,
            secret: get("mac_key"),
            algorithm,
        })
    }
}

/// Parameters that describe the token itself and are never retained as extras.
pub const TOKEN_PARAMS: [&str; 5] = ["access_token", "token_type", "expires_in", "mac_key", "mac_algorithm"];

/// A token as kept by the client after `token_accept`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedToken {
    pub token_type: String,
    pub access_token: String,
    pub secret: Option<String>,
    pub algorithm: Option<HashAlgorithm>,
    /// Local receipt time, recorded by request-signing formats.
    pub received_at: Option<u64>,
    /// Non-token parameters retained by the accept filter.
    pub params: Vec<(String, String)>,
}

impl SavedToken {
    /// Looks up a retained parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Request-bound evidence captured while extracting a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestProof {
    pub timestamp: u64,
    pub nonce: String,
    pub mac: String,
    pub method: String,
    pub request_uri: String,
    pub host: String,
    pub port: u16,
    /// Digest of the body actually received, never taken from the client.
    pub body_hash: String,
}

/// A candidate token found in an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedToken {
    /// Handle, signed blob or key identifier.
    pub token: String,
    /// Other recognized parameters carried next to the token.
    pub params: Vec<(String, String)>,
    /// Present only for request-signing transports.
    pub proof: Option<RequestProof>,
}

impl UsedToken {
    pub fn bare(token: impl Into<String>) -> Self {
        Self { token: token.into(), params: Vec::new(), proof: None }
    }
}

/// Categorized token lifecycle errors.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The scheme was composed or specialized incorrectly.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The token type marker does not match the scheme.
    #[error("token type `{found}` does not match scheme `{expected}`")]
    TypeMismatch { expected: String, found: String },

    /// MAC or signature verification failed, including malformed encodings.
    #[error("token signature is invalid")]
    InvalidSignature,

    /// No cache entry (local or remote) exists for the handle.
    #[error("unknown token handle")]
    UnknownHandle,

    /// No cache entry (local or remote) exists for the key identifier.
    #[error("unknown token identifier `{0}`")]
    UnknownIdentifier(String),

    /// A single-use token was presented a second time.
    #[error("token has already been used")]
    AlreadyUsed,

    /// The request timestamp lies outside the accepted clock skew.
    #[error("request timestamp {timestamp} is outside the accepted window")]
    StaleRequest { timestamp: u64 },

    /// The timestamp and nonce pair was seen before.
    #[error("request nonce has already been seen")]
    ReplayedRequest,

    /// Zero or several candidates were found where exactly one was needed.
    #[error("expected exactly one token in the request, found {found}")]
    TransportMismatch { found: usize },

    /// A vtable push or pull could not be delivered.
    #[error("vtable unavailable: {0}")]
    VtableUnavailable(String),

    /// A self-contained token is past its lifetime.
    #[error("token expired at {expired_at}")]
    Expired { expired_at: u64 },

    /// A token lacks the fields needed to use it.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The cache or nonce store failed.
    #[error("token store error: {0}")]
    Store(String),
}

impl TokenError {
    /// Stable snake_case category name.
    pub fn error_code(&self) -> &'static str {
        match self {
            TokenError::Config(_) => "config_error",
            TokenError::TypeMismatch { .. } => "type_mismatch",
            TokenError::InvalidSignature => "invalid_signature",
            TokenError::UnknownHandle => "unknown_handle",
            TokenError::UnknownIdentifier(_) => "unknown_identifier",
            TokenError::AlreadyUsed => "already_used",
            TokenError::StaleRequest { .. } => "stale_request",
            TokenError::ReplayedRequest => "replayed_request",
            TokenError::TransportMismatch { .. } => "transport_mismatch",
            TokenError::VtableUnavailable(_) => "vtable_unavailable",
            TokenError::Expired { .. } => "expired",
            TokenError::Malformed(_) => "malformed",
            TokenError::Store(_) => "store_error",
        }
    }

    /// HTTP status a resource server should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            TokenError::TypeMismatch { .. }
            | TokenError::InvalidSignature
            | TokenError::UnknownHandle
            | TokenError::UnknownIdentifier(_)
            | TokenError::AlreadyUsed
            | TokenError::StaleRequest { .. }
            | TokenError::ReplayedRequest
            | TokenError::Expired { .. } => 401,
            TokenError::TransportMismatch { .. } | TokenError::Malformed(_) => 400,
            TokenError::VtableUnavailable(_) => 503,
            TokenError::Config(_) | TokenError::Store(_) => 500,
        }
    }

    /// JSON error body in the OAuth2 `error` / `error_description` shape.
    pub fn to_json(&self) -> serde_json::Value {
        let code = self.error_code();
        warn!(error_code = code, http_status = self.http_status(), "token error rendered");
        json!({ "error": code, "error_description": self.to_string() })
    }
}
