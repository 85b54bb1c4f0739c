use crate::token_core::provider::{Credential, Transport};
use crate::token_core::request::HttpRequest;
use crate::token_core::scheme::ParamLocation;
use crate::token_core::types::{TokenError, UsedToken};

/// Tokens in a named query or form parameter, with selected sibling parameters
/// carried along.
pub struct ParamTransport {
    name: String,
    location: ParamLocation,
    carried: Vec<String>,
}

impl ParamTransport {
    pub fn new(name: String, location: ParamLocation, carried: Vec<String>) -> Self {
        Self { name, location, carried }
    }

    fn candidates(&self, source: Vec<(String, String)>) -> Vec<UsedToken> {
        let carried: Vec<(String, String)> =
            source.iter().filter(|(k, _)| self.carried.contains(k)).cloned().collect();
        source
            .into_iter()
            .filter(|(k, _)| *k == self.name)
            .map(|(_, token)| UsedToken { token, params: carried.clone(), proof: None })
            .collect()
    }
}

impl Transport for ParamTransport {
    fn kind(&self) -> &'static str {
        "param"
    }

    /// Form body when the method takes one and the body is a form or empty, query otherwise.
    fn insert(&self, request: &mut HttpRequest, credential: Credential) -> Result<(), TokenError> {
        let token = match credential {
            Credential::Token(token) => token,
            Credential::Attributes(_) => {
                return Err(TokenError::Malformed("param transport cannot carry signed attributes".into()));
            }
        };
        let in_body = self.location != ParamLocation::Query
            && request.method.allows_body()
            && (request.is_form() || request.body.is_empty());
        if in_body {
            request.append_body_param(&self.name, &token);
        } else {
            request.append_query_param(&self.name, &token);
        }
        Ok(())
    }

    fn extract(&self, request: &HttpRequest) -> Vec<UsedToken> {
        match self.location {
            ParamLocation::Query => self.candidates(request.query_params()),
            ParamLocation::Body => self.candidates(request.body_params()),
            ParamLocation::Either => {
                let mut found = self.candidates(request.query_params());
                found.extend(self.candidates(request.body_params()));
                found
            }
        }
    }
}
