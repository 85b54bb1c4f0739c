use std::collections::HashMap;

use regex::Regex;

use crate::token_core::compose::ConfigError;
use crate::token_core::crypto::body_digest;
use crate::token_core::provider::{Credential, Transport};
use crate::token_core::request::HttpRequest;
use crate::token_core::transports::header::HeaderCarriage;
use crate::token_core::types::{RequestProof, TokenError, UsedToken};

/// `MAC id="..", ts="..", nonce="..", mac=".."` authorization headers.
pub struct MacTransport {
    header: HeaderCarriage,
    attribute: Regex,
}

impl MacTransport {
    pub fn new(header: HeaderCarriage) -> Result<Self, ConfigError> {
        let attribute = Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#).map_err(|e| ConfigError::InvalidPattern(e.to_string()))?;
        Ok(Self { header, attribute })
    }

    fn parse(&self, credential: &str, request: &HttpRequest) -> Option<UsedToken> {
        let attributes: HashMap<&str, &str> = self
            .attribute
            .captures_iter(credential)
            .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
            .collect();
        let id = attributes.get("id")?;
        let timestamp = attributes.get("ts")?.parse().ok()?;
        let target = request.target();
        Some(UsedToken {
            token: id.to_string(),
            params: Vec::new(),
            proof: Some(RequestProof {
                timestamp,
                nonce: attributes.get("nonce")?.to_string(),
                mac: attributes.get("mac")?.to_string(),
                method: request.method.as_str().to_string(),
                request_uri: target.request_uri,
                host: target.host,
                port: target.port,
                body_hash: body_digest(&request.body),
            }),
        })
    }
}

impl Transport for MacTransport {
    fn kind(&self) -> &'static str {
        "http_hmac"
    }

    fn insert(&self, request: &mut HttpRequest, credential: Credential) -> Result<(), TokenError> {
        let attributes = match credential {
            Credential::Attributes(attributes) => attributes,
            Credential::Token(_) => {
                return Err(TokenError::Malformed("request-signing transport needs signed attributes".into()));
            }
        };
        let value = attributes
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        self.header.insert(request, &value);
        Ok(())
    }

    /// Headers missing `id`, `ts`, `nonce` or `mac` are not candidates.
    fn extract(&self, request: &HttpRequest) -> Vec<UsedToken> {
        self.header
            .credentials(request)
            .iter()
            .filter_map(|credential| self.parse(credential, request))
            .collect()
    }
}
