use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::token_core::clock::Clock;
use crate::token_core::context::RoleKind;
use crate::token_core::crypto::{HashAlgorithm, decode_b64url, encode_b64url, hmac_sign, hmac_verify};
use crate::token_core::provider::{Credential, TokenFormat};
use crate::token_core::request::{HttpRequest, decode_component, encode_component};
use crate::token_core::types::{IssuedToken, SavedToken, TokenError, TokenInfo, UsedToken};

/// Self-contained tokens: `b64url(payload) "." b64url(mac)`.
///
/// The payload is `issue_time&expires_in` followed by one `&binding` per
/// binding, each binding percent-encoded. No server state is kept.
pub struct BearerSigned {
    secret: Vec<u8>,
    algorithm: HashAlgorithm,
    clock: Arc<dyn Clock>,
}

impl BearerSigned {
    pub fn new(secret: Vec<u8>, algorithm: HashAlgorithm, clock: Arc<dyn Clock>) -> Self {
        Self { secret, algorithm, clock }
    }

    fn seal(&self, info: &TokenInfo) -> Result<String, TokenError> {
        let mut payload = format!("{}&{}", info.issue_time, info.expires_in);
        for binding in &info.bindings {
            payload.push('&');
            payload.push_str(&encode_component(binding));
        }
        let tag = hmac_sign(self.algorithm, &self.secret, payload.as_bytes())?;
        Ok(format!("{}.{}", encode_b64url(payload.as_bytes()), encode_b64url(&tag)))
    }

    /// Verifies the MAC and decodes the payload. Every failure is `invalid_signature`.
    fn open(&self, token: &str) -> Result<TokenInfo, TokenError> {
        let (payload, tag) = token.split_once('.').ok_or(TokenError::InvalidSignature)?;
        let payload = decode_b64url(payload).ok_or(TokenError::InvalidSignature)?;
        let tag = decode_b64url(tag).ok_or(TokenError::InvalidSignature)?;
        if !hmac_verify(self.algorithm, &self.secret, &payload, &tag) {
            return Err(TokenError::InvalidSignature);
        }
        let payload = String::from_utf8(payload).map_err(|_| TokenError::InvalidSignature)?;
        let mut fields = payload.split('&');
        let mut number = || -> Result<u64, TokenError> {
            fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or(TokenError::InvalidSignature)
        };
        let issue_time = number()?;
        let expires_in = number()?;
        Ok(TokenInfo { issue_time, expires_in, bindings: fields.map(decode_component).collect() })
    }
}

#[async_trait]
impl TokenFormat for BearerSigned {
    fn kind(&self) -> &'static str {
        "bearer_signed"
    }

    async fn create(&self, token_type: &str, info: TokenInfo) -> Result<IssuedToken, TokenError> {
        Ok(IssuedToken {
            token_type: token_type.to_string(),
            access_token: self.seal(&info)?,
            expires_in: info.expires_in,
            secret: None,
            algorithm: None,
        })
    }

    fn credential(&self, saved: &SavedToken, _request: &HttpRequest) -> Result<Credential, TokenError> {
        Ok(Credential::Token(saved.access_token.clone()))
    }

    #[instrument(skip_all, level = "debug")]
    async fn validate(&self, used: &UsedToken, _role: RoleKind) -> Result<TokenInfo, TokenError> {
        let info = self.open(&used.token)?;
        if info.expires_at() <= self.clock.now() {
            return Err(TokenError::Expired { expired_at: info.expires_at() });
        }
        Ok(info)
    }
}
