use regex::Regex;

use crate::token_core::compose::ConfigError;
use crate::token_core::request::HttpRequest;
use crate::token_core::scheme::HeaderSpec;

/// Reads and writes one credential-bearing header.
///
/// The header name matches case-insensitively; the value is matched against a
/// pattern whose first capture group is the credential.
#[derive(Debug, Clone)]
pub struct HeaderCarriage {
    name: String,
    scheme: String,
    synthesize: bool,
    pattern: Regex,
}

impl HeaderCarriage {
    pub fn new(spec: &HeaderSpec, default_scheme: &str) -> Result<Self, ConfigError> {
        let scheme = spec.scheme.clone().unwrap_or_else(|| default_scheme.to_string());
        let source = match &spec.pattern {
            Some(pattern) => pattern.clone(),
            None if spec.synthesize => format!(r"(?i)^\s*{}\s+(\S.*?)\s*$", regex::escape(&scheme)),
            None => r"^\s*(\S.*?)\s*$".to_string(),
        };
        let pattern = Regex::new(&source).map_err(|e| ConfigError::InvalidPattern(e.to_string()))?;
        if pattern.captures_len() < 2 {
            return Err(ConfigError::InvalidPattern(format!("`{}` has no capture group for the credential", source)));
        }
        Ok(Self { name: spec.name.clone(), scheme, synthesize: spec.synthesize, pattern })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Sets the header, replacing any previous value.
    pub fn insert(&self, request: &mut HttpRequest, credential: &str) {
        let value = if self.synthesize {
            format!("{} {}", self.scheme, credential)
        } else {
            credential.to_string()
        };
        request.set_header(&self.name, value);
    }

    /// Credential portion of every matching header, in order.
    pub fn credentials(&self, request: &HttpRequest) -> Vec<String> {
        request
            .headers_named(&self.name)
            .filter_map(|value| self.pattern.captures(value))
            .filter_map(|captures| captures.get(1).map(|m| m.as_str().to_string()))
            .collect()
    }
}
