use crate::token_core::provider::{Credential, Transport};
use crate::token_core::request::HttpRequest;
use crate::token_core::transports::header::HeaderCarriage;
use crate::token_core::types::{TokenError, UsedToken};

/// Bearer tokens in the authorization header, optionally also accepted as a
/// form body or query parameter.
pub struct BearerTransport {
    header: HeaderCarriage,
    allow_uri: bool,
    allow_body: bool,
    param_name: String,
}

impl BearerTransport {
    pub fn new(header: HeaderCarriage, allow_uri: bool, allow_body: bool, param_name: String) -> Self {
        Self { header, allow_uri, allow_body, param_name }
    }
}

impl Transport for BearerTransport {
    fn kind(&self) -> &'static str {
        "bearer"
    }

    fn insert(&self, request: &mut HttpRequest, credential: Credential) -> Result<(), TokenError> {
        match credential {
            Credential::Token(token) => {
                self.header.insert(request, &token);
                Ok(())
            }
            Credential::Attributes(_) => {
                Err(TokenError::Malformed("bearer transport cannot carry signed attributes".into()))
            }
        }
    }

    fn extract(&self, request: &HttpRequest) -> Vec<UsedToken> {
        let mut found: Vec<UsedToken> = self.header.credentials(request).into_iter().map(UsedToken::bare).collect();
        if self.allow_body {
            found.extend(
                request
                    .body_params()
                    .into_iter()
                    .filter(|(k, _)| *k == self.param_name)
                    .map(|(_, v)| UsedToken::bare(v)),
            );
        }
        if self.allow_uri {
            found.extend(
                request
                    .query_params()
                    .into_iter()
                    .filter(|(k, _)| *k == self.param_name)
                    .map(|(_, v)| UsedToken::bare(v)),
            );
        }
        found
    }
}
