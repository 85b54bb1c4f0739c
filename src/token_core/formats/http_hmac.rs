use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::token_core::clock::Clock;
use crate::token_core::context::RoleKind;
use crate::token_core::crypto::{HashAlgorithm, body_digest, decode_b64, encode_b64, hmac_sign, hmac_verify, random_nonce, random_token};
use crate::token_core::provider::{Credential, TokenFormat};
use crate::token_core::request::HttpRequest;
use crate::token_core::store::{CacheEntry, NonceStore};
use crate::token_core::types::{IssuedToken, SavedToken, TokenError, TokenInfo, UsedToken};
use crate::token_core::vtable::EntryStore;

const SECRET_BYTES: usize = 32;
const NONCE_LEN: usize = 16;

/// Inputs of the normalized request string, in signing order.
pub struct SignedParts<'a> {
    pub timestamp: u64,
    pub nonce: &'a str,
    pub method: &'a str,
    pub request_uri: &'a str,
    pub host: &'a str,
    pub port: u16,
    pub body_hash: &'a str,
}

impl SignedParts<'_> {
    /// One field per line, each line newline-terminated.
    pub fn normalized(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.timestamp, self.nonce, self.method, self.request_uri, self.host, self.port, self.body_hash
        )
    }
}

/// Key identifiers with per-token secrets; each request carries its own MAC.
pub struct HttpHmac {
    entries: Arc<EntryStore>,
    nonces: Arc<dyn NonceStore>,
    algorithm: HashAlgorithm,
    max_skew: u64,
    clock: Arc<dyn Clock>,
}

impl HttpHmac {
    pub fn new(
        entries: Arc<EntryStore>,
        nonces: Arc<dyn NonceStore>,
        algorithm: HashAlgorithm,
        max_skew: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { entries, nonces, algorithm, max_skew, clock }
    }
}

#[async_trait]
impl TokenFormat for HttpHmac {
    fn kind(&self) -> &'static str {
        "http_hmac"
    }

    #[instrument(skip_all, level = "debug")]
    async fn create(&self, token_type: &str, info: TokenInfo) -> Result<IssuedToken, TokenError> {
        let id = Uuid::new_v4().to_string();
        let secret = random_token(SECRET_BYTES)?;
        let expires_in = info.expires_in;
        self.entries
            .publish(&id, CacheEntry { info, secret: Some(secret.clone()), single_use: false })
            .await?;
        Ok(IssuedToken {
            token_type: token_type.to_string(),
            access_token: id,
            expires_in,
            secret: Some(secret),
            algorithm: Some(self.algorithm),
        })
    }

    fn accept(&self, issued: &IssuedToken, saved: &mut SavedToken) -> Result<(), TokenError> {
        let secret = issued
            .secret
            .clone()
            .ok_or_else(|| TokenError::Malformed("issued token has no mac_key".into()))?;
        saved.secret = Some(secret);
        saved.algorithm = Some(issued.algorithm.unwrap_or(self.algorithm));
        saved.received_at = Some(self.clock.now());
        Ok(())
    }

    fn credential(&self, saved: &SavedToken, request: &HttpRequest) -> Result<Credential, TokenError> {
        let secret = saved
            .secret
            .as_deref()
            .ok_or_else(|| TokenError::Malformed("saved token has no mac_key".into()))?;
        let algorithm = saved.algorithm.unwrap_or(self.algorithm);
        let target = request.target();
        let timestamp = self.clock.now();
        let nonce = random_nonce(NONCE_LEN);
        let body_hash = body_digest(&request.body);
        let parts = SignedParts {
            timestamp,
            nonce: &nonce,
            method: request.method.as_str(),
            request_uri: &target.request_uri,
            host: &target.host,
            port: target.port,
            body_hash: &body_hash,
        };
        let mac = encode_b64(&hmac_sign(algorithm, secret.as_bytes(), parts.normalized().as_bytes())?);
        Ok(Credential::Attributes(vec![
            ("id".to_string(), saved.access_token.clone()),
            ("ts".to_string(), timestamp.to_string()),
            ("nonce".to_string(), nonce),
            ("mac".to_string(), mac),
        ]))
    }

    /// Checks, in order: key lookup, timestamp window, MAC, nonce freshness.
    #[instrument(skip_all, level = "debug")]
    async fn validate(&self, used: &UsedToken, role: RoleKind) -> Result<TokenInfo, TokenError> {
        let proof = used.proof.as_ref().ok_or(TokenError::InvalidSignature)?;
        let lookup = self
            .entries
            .fetch(&used.token, role)
            .await?
            .ok_or_else(|| TokenError::UnknownIdentifier(used.token.clone()))?;
        let secret = lookup.entry.secret.as_deref().ok_or(TokenError::InvalidSignature)?;

        let now = self.clock.now();
        if proof.timestamp.abs_diff(now) > self.max_skew {
            debug!(timestamp = proof.timestamp, now, "request timestamp outside window");
            return Err(TokenError::StaleRequest { timestamp: proof.timestamp });
        }

        let parts = SignedParts {
            timestamp: proof.timestamp,
            nonce: &proof.nonce,
            method: &proof.method,
            request_uri: &proof.request_uri,
            host: &proof.host,
            port: proof.port,
            body_hash: &proof.body_hash,
        };
        let tag = decode_b64(&proof.mac).ok_or(TokenError::InvalidSignature)?;
        if !hmac_verify(self.algorithm, secret.as_bytes(), parts.normalized().as_bytes(), &tag) {
            return Err(TokenError::InvalidSignature);
        }

        // keep the record until this timestamp leaves the window
        let ttl = self.max_skew.max((proof.timestamp + self.max_skew).saturating_sub(now));
        let key = format!("{}:{}:{}", used.token, proof.timestamp, proof.nonce);
        if !self.nonces.check_and_insert(&key, ttl).await? {
            return Err(TokenError::ReplayedRequest);
        }
        Ok(lookup.entry.info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_string_layout() {
        let parts = SignedParts {
            timestamp: 1336363200,
            nonce: "dj83hs9s",
            method: "GET",
            request_uri: "/resource/1?b=1&a=2",
            host: "example.com",
            port: 80,
            body_hash: "",
        };
        assert_eq!(
            parts.normalized(),
            "1336363200\ndj83hs9s\nGET\n/resource/1?b=1&a=2\nexample.com\n80\n\n"
        );
    }
}
