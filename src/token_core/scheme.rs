//! Scheme specification: the declarative configuration a token type is composed from.
//!
//! A [`SchemeSpec`] is plain data and can be loaded from JSON. Live handles
//! (cache, nonce store, clock, vtable handlers) are attached through
//! [`SchemeBuilder`], which turns both into option variants and hands them to
//! the composition engine.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;

use super::clock::Clock;
use super::compose::{ConfigError, OptionVariant, Registry, TokenScheme, VtableVariant, resolve};
use super::crypto::HashAlgorithm;
use super::store::{NonceStore, TokenCache};
use super::types::TOKEN_PARAMS;
use super::vtable::{VtableMode, VtablePull, VtablePush};

fn default_handle_bytes() -> usize {
    32
}

fn default_max_skew() -> u64 {
    300
}

fn default_param_name() -> String {
    "access_token".to_string()
}

fn default_carried() -> Vec<String> {
    vec!["scope".to_string(), "expires_in".to_string()]
}

fn default_header_name() -> String {
    "Authorization".to_string()
}

fn default_true() -> bool {
    true
}

/// Token encoding chosen for a scheme.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum FormatSpec {
    /// Random opaque handle referencing cached state.
    BearerHandle {
        #[serde(default = "default_handle_bytes")]
        handle_bytes: usize,
        #[serde(default)]
        single_use: bool,
    },
    /// Self-contained token carrying its own MAC.
    BearerSigned {
        secret: String,
        #[serde(default)]
        hmac: HashAlgorithm,
    },
    /// Key identifier plus per-token secret used to sign each request.
    HttpHmac {
        #[serde(default)]
        hmac: HashAlgorithm,
        #[serde(default = "default_max_skew")]
        max_skew: u64,
    },
}

impl FormatSpec {
    pub fn bearer_handle() -> Self {
        FormatSpec::BearerHandle { handle_bytes: default_handle_bytes(), single_use: false }
    }

    /// Handles consumed by their first validation (authorization codes).
    pub fn single_use_handle() -> Self {
        FormatSpec::BearerHandle { handle_bytes: default_handle_bytes(), single_use: true }
    }

    pub fn bearer_signed(secret: impl Into<String>, hmac: HashAlgorithm) -> Self {
        FormatSpec::BearerSigned { secret: secret.into(), hmac }
    }

    pub fn http_hmac(hmac: HashAlgorithm, max_skew: u64) -> Self {
        FormatSpec::HttpHmac { hmac, max_skew }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FormatSpec::BearerHandle { .. } => "bearer_handle",
            FormatSpec::BearerSigned { .. } => "bearer_signed",
            FormatSpec::HttpHmac { .. } => "http_hmac",
        }
    }

    /// Token type marker used when the spec does not name the scheme.
    pub fn default_name(&self) -> &'static str {
        match self {
            FormatSpec::HttpHmac { .. } => "mac",
            _ => "bearer",
        }
    }

    /// Authorization scheme used in headers when none is configured.
    pub fn default_header_scheme(&self) -> &'static str {
        match self {
            FormatSpec::HttpHmac { .. } => "MAC",
            _ => "Bearer",
        }
    }
}

/// Where parameter-carried tokens are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamLocation {
    Query,
    Body,
    #[default]
    Either,
}

/// How a token travels on the request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum TransportSpec {
    /// Authorization header, optionally also accepted as a body or query parameter.
    Bearer {
        #[serde(default)]
        allow_uri: bool,
        #[serde(default)]
        allow_body: bool,
        #[serde(default = "default_param_name")]
        param_name: String,
    },
    /// MAC attributes in the authorization header.
    HttpHmac,
    /// Named query or body parameter.
    Param {
        #[serde(default = "default_param_name")]
        name: String,
        #[serde(default)]
        location: ParamLocation,
        #[serde(default = "default_carried")]
        carried: Vec<String>,
    },
}

impl TransportSpec {
    pub fn bearer() -> Self {
        TransportSpec::Bearer { allow_uri: false, allow_body: false, param_name: default_param_name() }
    }

    pub fn param(location: ParamLocation) -> Self {
        TransportSpec::Param { name: default_param_name(), location, carried: default_carried() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportSpec::Bearer { .. } => "bearer",
            TransportSpec::HttpHmac => "http_hmac",
            TransportSpec::Param { .. } => "param",
        }
    }
}

/// The header-name option group used by header transports.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderSpec {
    #[serde(default = "default_header_name")]
    pub name: String,
    /// Authorization scheme token, `Bearer` or `MAC` when unset.
    #[serde(default)]
    pub scheme: Option<String>,
    /// Insert `Scheme credential` when true, the bare credential otherwise.
    #[serde(default = "default_true")]
    pub synthesize: bool,
    /// Custom extraction pattern; its first capture group is the credential.
    #[serde(default)]
    pub pattern: Option<String>,
}

impl Default for HeaderSpec {
    fn default() -> Self {
        Self { name: default_header_name(), scheme: None, synthesize: true, pattern: None }
    }
}

impl HeaderSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }
}

/// Which non-token parameters a client keeps on `token_accept`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptFilter {
    Keep(BTreeSet<String>),
    Remove(BTreeSet<String>),
}

impl AcceptFilter {
    pub fn keep_all() -> Self {
        AcceptFilter::Remove(BTreeSet::new())
    }

    pub fn apply(&self, params: &[(String, String)]) -> Vec<(String, String)> {
        params
            .iter()
            .filter(|(k, _)| !TOKEN_PARAMS.contains(&k.as_str()))
            .filter(|(k, _)| match self {
                AcceptFilter::Keep(keep) => keep.contains(k),
                AcceptFilter::Remove(remove) => !remove.contains(k),
            })
            .cloned()
            .collect()
    }
}

/// Declarative scheme configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemeSpec {
    /// Token type marker; defaults to `bearer` or `mac` by format.
    #[serde(default)]
    pub name: Option<String>,
    pub format: FormatSpec,
    #[serde(default)]
    pub transport: Option<TransportSpec>,
    #[serde(default)]
    pub header: Option<HeaderSpec>,
    #[serde(default)]
    pub vtable: Option<VtableMode>,
    #[serde(default)]
    pub accept_keep: Option<Vec<String>>,
    #[serde(default)]
    pub accept_remove: Option<Vec<String>>,
}

impl SchemeSpec {
    pub fn new(format: FormatSpec) -> Self {
        Self {
            name: None,
            format,
            transport: None,
            header: None,
            vtable: None,
            accept_keep: None,
            accept_remove: None,
        }
    }

    /// Parses a JSON scheme document. Unknown keys are rejected.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidSpec(e.to_string()))
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn transport(mut self, transport: TransportSpec) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn header(mut self, header: HeaderSpec) -> Self {
        self.header = Some(header);
        self
    }

    pub fn vtable(mut self, mode: VtableMode) -> Self {
        self.vtable = Some(mode);
        self
    }

    pub fn accept_keep<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accept_keep = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn accept_remove<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accept_remove = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Token type marker of the composed scheme.
    pub fn scheme_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.format.default_name().to_string())
    }
}

/// Collects a spec plus live handles and composes them into a [`TokenScheme`].
pub struct SchemeBuilder {
    spec: SchemeSpec,
    cache: Option<Arc<dyn TokenCache>>,
    nonce_store: Option<Arc<dyn NonceStore>>,
    clock: Option<Arc<dyn Clock>>,
    push: Option<Arc<dyn VtablePush>>,
    pull: Option<Arc<dyn VtablePull>>,
    extra: Vec<OptionVariant>,
}

impl SchemeBuilder {
    pub fn new(spec: SchemeSpec) -> Self {
        Self {
            spec,
            cache: None,
            nonce_store: None,
            clock: None,
            push: None,
            pull: None,
            extra: Vec::new(),
        }
    }

    /// Sets the cache shared with (or mirrored by) the other roles.
    pub fn cache(mut self, cache: Arc<dyn TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn nonce_store(mut self, store: Arc<dyn NonceStore>) -> Self {
        self.nonce_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Handler an authorization server uses to deliver pushed entries.
    pub fn push_handler(mut self, handler: Arc<dyn VtablePush>) -> Self {
        self.push = Some(handler);
        self
    }

    /// Handler a resource server uses to query the authorization server.
    pub fn pull_handler(mut self, handler: Arc<dyn VtablePull>) -> Self {
        self.pull = Some(handler);
        self
    }

    /// Installs an additional option variant next to the ones the spec produces.
    pub fn install(mut self, variant: OptionVariant) -> Self {
        self.extra.push(variant);
        self
    }

    /// Turns the spec and handles into variants. A handler the vtable mode
    /// never calls is rejected.
    fn into_variants(self) -> Result<Vec<OptionVariant>, ConfigError> {
        let SchemeBuilder { spec, cache, nonce_store, clock, push, pull, extra } = self;
        let mode = spec.vtable.unwrap_or_default();
        if push.is_some() && mode != VtableMode::AuthservPush {
            return Err(ConfigError::InvalidSpec(format!(
                "push handler set but vtable mode is {}",
                mode.as_str()
            )));
        }
        if pull.is_some() && mode != VtableMode::ResourcePull {
            return Err(ConfigError::InvalidSpec(format!(
                "pull handler set but vtable mode is {}",
                mode.as_str()
            )));
        }
        let mut variants = vec![OptionVariant::Format(spec.format)];
        if let Some(transport) = spec.transport {
            variants.push(OptionVariant::Transport(transport));
        }
        if let Some(header) = spec.header {
            variants.push(OptionVariant::Header(header));
        }
        if spec.vtable.is_some() || push.is_some() || pull.is_some() {
            variants.push(OptionVariant::Vtable(VtableVariant { mode, push, pull }));
        }
        if let Some(keep) = spec.accept_keep {
            variants.push(OptionVariant::Accept(AcceptFilter::Keep(keep.into_iter().collect())));
        }
        if let Some(remove) = spec.accept_remove {
            variants.push(OptionVariant::Accept(AcceptFilter::Remove(remove.into_iter().collect())));
        }
        if let Some(cache) = cache {
            variants.push(OptionVariant::Cache(cache));
        }
        if let Some(store) = nonce_store {
            variants.push(OptionVariant::NonceStore(store));
        }
        if let Some(clock) = clock {
            variants.push(OptionVariant::Clock(clock));
        }
        variants.extend(extra);
        Ok(variants)
    }

    /// Resolves every option group against `registry` and binds the result.
    pub fn compose(self, registry: &Registry) -> Result<Arc<TokenScheme>, ConfigError> {
        let name = self.spec.scheme_name();
        let resolution = resolve(self.into_variants()?, registry)?;
        TokenScheme::bind(name, resolution).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_from_json_with_defaults() {
        let spec = SchemeSpec::from_json(
            r#"{
                "format": { "type": "bearer_signed", "secret": "k", "hmac": "sha224" },
                "transport": { "type": "bearer", "allow_uri": true },
                "vtable": "none",
                "accept_keep": ["scope"]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.format, FormatSpec::bearer_signed("k", HashAlgorithm::Sha224));
        assert_eq!(
            spec.transport,
            Some(TransportSpec::Bearer { allow_uri: true, allow_body: false, param_name: "access_token".into() })
        );
        assert_eq!(spec.vtable, Some(VtableMode::None));
        assert_eq!(spec.scheme_name(), "bearer");
    }

    #[test]
    fn handler_without_matching_mode_is_rejected() {
        let pull: Arc<dyn VtablePull> = Arc::new(NoPull);
        let err = SchemeBuilder::new(SchemeSpec::new(FormatSpec::bearer_handle()))
            .pull_handler(pull.clone())
            .compose(&Registry::in_memory())
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidSpec("pull handler set but vtable mode is none".into()));

        let err = SchemeBuilder::new(SchemeSpec::new(FormatSpec::bearer_handle()).vtable(VtableMode::AuthservPush))
            .pull_handler(pull)
            .compose(&Registry::in_memory())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSpec(_)));
    }

    struct NoPull;

    #[async_trait::async_trait]
    impl VtablePull for NoPull {
        async fn pull(&self, _query: Vec<String>) -> Result<Vec<String>, crate::token_core::vtable::VtableError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SchemeSpec::from_json(r#"{ "format": { "type": "bearer_handle" }, "colour": "red" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSpec(_)));
        let err = SchemeSpec::from_json(r#"{ "format": { "type": "bearer_handle", "entropy": 3 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSpec(_)));
    }

    #[test]
    fn http_hmac_defaults() {
        let spec = SchemeSpec::from_json(r#"{ "format": { "type": "http_hmac" } }"#).unwrap();
        assert_eq!(spec.format, FormatSpec::http_hmac(HashAlgorithm::Sha256, 300));
        assert_eq!(spec.scheme_name(), "mac");
    }

    #[test]
    fn accept_filter_drops_token_params() {
        let params = vec![
            ("access_token".to_string(), "x".to_string()),
            ("scope".to_string(), "read".to_string()),
            ("state".to_string(), "abc".to_string()),
        ];
        assert_eq!(AcceptFilter::keep_all().apply(&params), params[1..].to_vec());
        let keep = AcceptFilter::Keep(["state".to_string()].into_iter().collect());
        assert_eq!(keep.apply(&params), vec![("state".to_string(), "abc".to_string())]);
        let remove = AcceptFilter::Remove(["state".to_string()].into_iter().collect());
        assert_eq!(remove.apply(&params), vec![("scope".to_string(), "read".to_string())]);
    }
}
