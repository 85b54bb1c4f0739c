//! Option composition: resolves option groups into a bound [`TokenScheme`].
//!
//! Every plugin (clock, cache, transport, format, ...) is an [`OptionVariant`]
//! of exactly one [`OptionGroup`]. A variant exports named capabilities,
//! uses other groups and may require capabilities some other variant exports.
//! Resolution pulls in defaults for groups nobody chose, orders groups so that
//! dependencies install first, and rejects duplicate or missing capabilities.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument};

use super::clock::{Clock, SystemClock};
use super::formats::{BearerHandle, BearerSigned, HttpHmac};
use super::memory::{InMemoryCache, InMemoryNonceStore};
use super::provider::{TokenFormat, Transport};
use super::scheme::{AcceptFilter, FormatSpec, HeaderSpec, TransportSpec};
use super::store::{NonceStore, TokenCache};
use super::transports::{BearerTransport, HeaderCarriage, MacTransport, ParamTransport};
use super::vtable::{EntryStore, VtableMode, VtablePull, VtablePush};

/// Minimum entropy for random handles, in bytes.
pub const MIN_HANDLE_BYTES: usize = 16;

/// A named slot that holds one plugin variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionGroup {
    Clock,
    Cache,
    NonceStore,
    Header,
    Transport,
    Format,
    Vtable,
    Accept,
}

impl OptionGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionGroup::Clock => "clock",
            OptionGroup::Cache => "cache",
            OptionGroup::NonceStore => "nonce_store",
            OptionGroup::Header => "header",
            OptionGroup::Transport => "transport",
            OptionGroup::Format => "format",
            OptionGroup::Vtable => "vtable",
            OptionGroup::Accept => "accept",
        }
    }
}

impl fmt::Display for OptionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Groups every scheme resolves, whether or not anything uses them.
const ROOT_GROUPS: [OptionGroup; 3] = [OptionGroup::Format, OptionGroup::Vtable, OptionGroup::Accept];

/// A capability a variant contributes to the resolved scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Export {
    Now,
    EntryStorage,
    NonceCheck,
    HeaderLocation,
    HttpInsert,
    HttpExtract,
    BearerCarriage,
    RequestSigning,
    TokenCreate,
    TokenValidate,
    CachedEntries,
    EntryDistribution,
    PushDelivery,
    ReceivePush,
    PullDelivery,
    AnswerPull,
    TokenAccept,
}

impl Export {
    pub fn as_str(&self) -> &'static str {
        match self {
            Export::Now => "now",
            Export::EntryStorage => "entry_storage",
            Export::NonceCheck => "nonce_check",
            Export::HeaderLocation => "header_location",
            Export::HttpInsert => "http_insert",
            Export::HttpExtract => "http_extract",
            Export::BearerCarriage => "bearer_carriage",
            Export::RequestSigning => "request_signing",
            Export::TokenCreate => "token_create",
            Export::TokenValidate => "token_validate",
            Export::CachedEntries => "cached_entries",
            Export::EntryDistribution => "entry_distribution",
            Export::PushDelivery => "push_delivery",
            Export::ReceivePush => "receive_push",
            Export::PullDelivery => "pull_delivery",
            Export::AnswerPull => "answer_pull",
            Export::TokenAccept => "token_accept",
        }
    }
}

impl fmt::Display for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composition and specialization failures, raised before any token is handled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("option group `{group}` needed by `{required_by}` has no variant and no default")]
    Unresolved { group: OptionGroup, required_by: String },

    #[error("`{export}` is exported by both `{first}` and `{second}`")]
    Conflict { export: Export, first: String, second: String },

    #[error("`{variant}` requires `{export}`, which no installed variant exports")]
    MissingRequirement { variant: String, export: Export },

    #[error("option groups depend on each other in a cycle: {0:?}")]
    Cycle(Vec<OptionGroup>),

    #[error("{role} needs a {handler} handler in vtable mode `{mode}`")]
    MissingHandler { role: &'static str, handler: &'static str, mode: &'static str },

    #[error("`{operation}` is not provided by this scheme")]
    NotProvided { operation: &'static str },

    #[error("invalid scheme spec: {0}")]
    InvalidSpec(String),

    #[error("invalid header pattern: {0}")]
    InvalidPattern(String),
}

/// Vtable mode plus the handlers the roles deliver entries with.
#[derive(Clone, Default)]
pub struct VtableVariant {
    pub mode: VtableMode,
    pub push: Option<Arc<dyn VtablePush>>,
    pub pull: Option<Arc<dyn VtablePull>>,
}

impl VtableVariant {
    pub fn mode(mode: VtableMode) -> Self {
        Self { mode, push: None, pull: None }
    }
}

/// One plugin installed into an option group.
#[derive(Clone)]
pub enum OptionVariant {
    Clock(Arc<dyn Clock>),
    Cache(Arc<dyn TokenCache>),
    NonceStore(Arc<dyn NonceStore>),
    Header(HeaderSpec),
    Transport(TransportSpec),
    Format(FormatSpec),
    Vtable(VtableVariant),
    Accept(AcceptFilter),
}

impl fmt::Debug for OptionVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl OptionVariant {
    pub fn group(&self) -> OptionGroup {
        match self {
            OptionVariant::Clock(_) => OptionGroup::Clock,
            OptionVariant::Cache(_) => OptionGroup::Cache,
            OptionVariant::NonceStore(_) => OptionGroup::NonceStore,
            OptionVariant::Header(_) => OptionGroup::Header,
            OptionVariant::Transport(_) => OptionGroup::Transport,
            OptionVariant::Format(_) => OptionGroup::Format,
            OptionVariant::Vtable(_) => OptionGroup::Vtable,
            OptionVariant::Accept(_) => OptionGroup::Accept,
        }
    }

    /// Diagnostic name, `group(kind)`.
    pub fn name(&self) -> String {
        match self {
            OptionVariant::Clock(_) => "clock".to_string(),
            OptionVariant::Cache(_) => "cache".to_string(),
            OptionVariant::NonceStore(_) => "nonce_store".to_string(),
            OptionVariant::Header(spec) => format!("header({})", spec.name),
            OptionVariant::Transport(spec) => format!("transport({})", spec.kind()),
            OptionVariant::Format(spec) => format!("format({})", spec.kind()),
            OptionVariant::Vtable(v) => format!("vtable({})", v.mode.as_str()),
            OptionVariant::Accept(AcceptFilter::Keep(_)) => "accept(keep)".to_string(),
            OptionVariant::Accept(AcceptFilter::Remove(_)) => "accept(remove)".to_string(),
        }
    }

    pub fn exports(&self) -> Vec<Export> {
        match self {
            OptionVariant::Clock(_) => vec![Export::Now],
            OptionVariant::Cache(_) => vec![Export::EntryStorage],
            OptionVariant::NonceStore(_) => vec![Export::NonceCheck],
            OptionVariant::Header(_) => vec![Export::HeaderLocation],
            OptionVariant::Transport(TransportSpec::HttpHmac) => {
                vec![Export::HttpInsert, Export::HttpExtract, Export::RequestSigning]
            }
            OptionVariant::Transport(_) => vec![Export::HttpInsert, Export::HttpExtract, Export::BearerCarriage],
            OptionVariant::Format(FormatSpec::BearerSigned { .. }) => vec![Export::TokenCreate, Export::TokenValidate],
            OptionVariant::Format(_) => vec![Export::TokenCreate, Export::TokenValidate, Export::CachedEntries],
            OptionVariant::Vtable(v) => match v.mode {
                VtableMode::None => vec![Export::EntryDistribution],
                VtableMode::AuthservPush => {
                    vec![Export::EntryDistribution, Export::PushDelivery, Export::ReceivePush]
                }
                VtableMode::ResourcePull => {
                    vec![Export::EntryDistribution, Export::PullDelivery, Export::AnswerPull]
                }
            },
            OptionVariant::Accept(_) => vec![Export::TokenAccept],
        }
    }

    /// Groups this variant depends on, each with an optional preferred default.
    pub fn uses(&self) -> Vec<(OptionGroup, Option<OptionVariant>)> {
        match self {
            OptionVariant::Transport(TransportSpec::Param { .. }) => Vec::new(),
            OptionVariant::Transport(_) => vec![(OptionGroup::Header, None)],
            OptionVariant::Format(FormatSpec::BearerHandle { .. }) => vec![
                (OptionGroup::Clock, None),
                (OptionGroup::Cache, None),
                (OptionGroup::Transport, Some(OptionVariant::Transport(TransportSpec::bearer()))),
            ],
            OptionVariant::Format(FormatSpec::BearerSigned { .. }) => vec![
                (OptionGroup::Clock, None),
                (OptionGroup::Transport, Some(OptionVariant::Transport(TransportSpec::bearer()))),
            ],
            OptionVariant::Format(FormatSpec::HttpHmac { .. }) => vec![
                (OptionGroup::Clock, None),
                (OptionGroup::Cache, None),
                (OptionGroup::NonceStore, None),
                (OptionGroup::Transport, Some(OptionVariant::Transport(TransportSpec::HttpHmac))),
            ],
            OptionVariant::Vtable(v) if v.mode != VtableMode::None => vec![(OptionGroup::Cache, None)],
            _ => Vec::new(),
        }
    }

    /// Capabilities that must be exported by some installed variant.
    pub fn requires(&self) -> Vec<Export> {
        match self {
            OptionVariant::Format(FormatSpec::BearerHandle { .. }) => {
                vec![Export::Now, Export::EntryStorage, Export::BearerCarriage]
            }
            OptionVariant::Format(FormatSpec::BearerSigned { .. }) => vec![Export::Now, Export::BearerCarriage],
            OptionVariant::Format(FormatSpec::HttpHmac { .. }) => {
                vec![Export::Now, Export::EntryStorage, Export::NonceCheck, Export::RequestSigning]
            }
            OptionVariant::Transport(TransportSpec::Param { .. }) => Vec::new(),
            OptionVariant::Transport(_) => vec![Export::HeaderLocation],
            OptionVariant::Vtable(v) if v.mode != VtableMode::None => vec![Export::CachedEntries],
            _ => Vec::new(),
        }
    }
}

type VariantFactory = Arc<dyn Fn() -> OptionVariant + Send + Sync>;
type ClockedFactory = Arc<dyn Fn(&Arc<dyn Clock>) -> OptionVariant + Send + Sync>;

#[derive(Clone)]
enum Factory {
    Plain(VariantFactory),
    /// Built against the scheme's resolved clock.
    Clocked(ClockedFactory),
}

/// Default variants for option groups nobody chose explicitly.
#[derive(Clone, Default)]
pub struct Registry {
    defaults: BTreeMap<OptionGroup, Factory>,
}

impl Registry {
    /// A registry with no defaults; every used group must be chosen explicitly.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wall clock, in-memory nonce store, `Authorization` header, no vtable,
    /// keep every non-token parameter. No cache default: caches are shared
    /// state and must be chosen.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.set_factory(OptionGroup::Clock, || OptionVariant::Clock(Arc::new(SystemClock)));
        registry.set_clocked_factory(OptionGroup::NonceStore, |clock| {
            OptionVariant::NonceStore(Arc::new(InMemoryNonceStore::with_clock(clock.clone())))
        });
        registry.set_factory(OptionGroup::Header, || OptionVariant::Header(HeaderSpec::default()));
        registry.set_factory(OptionGroup::Vtable, || OptionVariant::Vtable(VtableVariant::default()));
        registry.set_factory(OptionGroup::Accept, || OptionVariant::Accept(AcceptFilter::keep_all()));
        registry
    }

    /// [`Registry::standard`] plus a fresh in-memory cache per composed scheme,
    /// expiring entries on the scheme's clock.
    pub fn in_memory() -> Self {
        let mut registry = Self::standard();
        registry.set_clocked_factory(OptionGroup::Cache, |clock| {
            OptionVariant::Cache(Arc::new(InMemoryCache::with_clock(clock.clone())))
        });
        registry
    }

    /// Uses `variant` (cloned) as the default for its group.
    pub fn set_default(&mut self, variant: OptionVariant) -> &mut Self {
        let group = variant.group();
        self.defaults.insert(group, Factory::Plain(Arc::new(move || variant.clone())));
        self
    }

    pub fn set_factory<F>(&mut self, group: OptionGroup, factory: F) -> &mut Self
    where
        F: Fn() -> OptionVariant + Send + Sync + 'static,
    {
        self.defaults.insert(group, Factory::Plain(Arc::new(factory)));
        self
    }

    /// Registers a factory that receives the clock the scheme resolved to.
    /// Has no effect on [`OptionGroup::Clock`] itself.
    pub fn set_clocked_factory<F>(&mut self, group: OptionGroup, factory: F) -> &mut Self
    where
        F: Fn(&Arc<dyn Clock>) -> OptionVariant + Send + Sync + 'static,
    {
        self.defaults.insert(group, Factory::Clocked(Arc::new(factory)));
        self
    }

    pub fn remove_default(&mut self, group: OptionGroup) -> &mut Self {
        self.defaults.remove(&group);
        self
    }

    fn default_for(&self, group: OptionGroup, clock: Option<&Arc<dyn Clock>>) -> Option<OptionVariant> {
        match self.defaults.get(&group)? {
            Factory::Plain(factory) => Some(factory()),
            Factory::Clocked(factory) => clock.map(|clock| factory(clock)),
        }
    }
}

/// Result of resolution: variants in install order and the export table.
#[derive(Debug)]
pub struct Resolution {
    pub variants: Vec<OptionVariant>,
    pub exports: BTreeMap<Export, String>,
}

/// Resolves explicit variants against registry defaults.
#[instrument(skip_all, level = "debug")]
pub fn resolve(explicit: Vec<OptionVariant>, registry: &Registry) -> Result<Resolution, ConfigError> {
    let mut chosen: BTreeMap<OptionGroup, Vec<OptionVariant>> = BTreeMap::new();
    for variant in explicit {
        chosen.entry(variant.group()).or_default().push(variant);
    }

    // The clock is settled first so clocked defaults share it.
    if !chosen.contains_key(&OptionGroup::Clock) {
        if let Some(variant) = registry.default_for(OptionGroup::Clock, None) {
            debug!(variant = %variant.name(), "clock defaulted");
            chosen.insert(OptionGroup::Clock, vec![variant]);
        }
    }
    let clock = match chosen.get(&OptionGroup::Clock).and_then(|variants| variants.first()) {
        Some(OptionVariant::Clock(clock)) => Some(clock.clone()),
        _ => None,
    };

    let mut pending: VecDeque<(OptionGroup, Option<OptionVariant>, String)> =
        ROOT_GROUPS.iter().map(|group| (*group, None, "scheme".to_string())).collect();
    for variants in chosen.values() {
        for variant in variants {
            for (group, preferred) in variant.uses() {
                pending.push_back((group, preferred, variant.name()));
            }
        }
    }

    while let Some((group, preferred, required_by)) = pending.pop_front() {
        if chosen.contains_key(&group) {
            continue;
        }
        let variant = match preferred.or_else(|| registry.default_for(group, clock.as_ref())) {
            Some(variant) => variant,
            None => return Err(ConfigError::Unresolved { group, required_by }),
        };
        debug!(%group, variant = %variant.name(), %required_by, "option group defaulted");
        for (used, preferred) in variant.uses() {
            pending.push_back((used, preferred, variant.name()));
        }
        chosen.insert(group, vec![variant]);
    }

    let mut edges: BTreeMap<OptionGroup, BTreeSet<OptionGroup>> = BTreeMap::new();
    for (group, variants) in &chosen {
        let deps = edges.entry(*group).or_default();
        for variant in variants {
            deps.extend(variant.uses().into_iter().map(|(used, _)| used));
        }
    }
    let order = order_groups(&edges)?;

    let mut variants = Vec::new();
    for group in order {
        if let Some(group_variants) = chosen.remove(&group) {
            variants.extend(group_variants);
        }
    }

    let mut exports: BTreeMap<Export, String> = BTreeMap::new();
    for variant in &variants {
        for export in variant.exports() {
            if let Some(first) = exports.get(&export) {
                return Err(ConfigError::Conflict { export, first: first.clone(), second: variant.name() });
            }
            exports.insert(export, variant.name());
        }
    }
    for variant in &variants {
        for export in variant.requires() {
            if !exports.contains_key(&export) {
                return Err(ConfigError::MissingRequirement { variant: variant.name(), export });
            }
        }
    }

    Ok(Resolution { variants, exports })
}

/// Orders groups so every group comes after the groups it uses.
fn order_groups(edges: &BTreeMap<OptionGroup, BTreeSet<OptionGroup>>) -> Result<Vec<OptionGroup>, ConfigError> {
    let mut remaining: BTreeMap<OptionGroup, BTreeSet<OptionGroup>> = edges
        .iter()
        .map(|(group, deps)| (*group, deps.iter().filter(|d| edges.contains_key(*d)).copied().collect()))
        .collect();
    let mut order = Vec::with_capacity(remaining.len());
    loop {
        let ready: BTreeSet<OptionGroup> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(group, _)| *group)
            .collect();
        if ready.is_empty() {
            break;
        }
        for group in &ready {
            remaining.remove(group);
        }
        for deps in remaining.values_mut() {
            deps.retain(|d| !ready.contains(d));
        }
        order.extend(ready);
    }
    if !remaining.is_empty() {
        return Err(ConfigError::Cycle(remaining.into_keys().collect()));
    }
    Ok(order)
}

/// A fully bound scheme, ready to be specialized to a role.
pub struct TokenScheme {
    name: String,
    format: Arc<dyn TokenFormat>,
    transport: Arc<dyn Transport>,
    accept: AcceptFilter,
    entries: Option<Arc<EntryStore>>,
    vtable: VtableMode,
    clock: Arc<dyn Clock>,
    exports: BTreeMap<Export, String>,
    installed: Vec<String>,
}

impl TokenScheme {
    /// Builds the live components from a resolution, dependencies first.
    pub fn bind(name: String, resolution: Resolution) -> Result<Self, ConfigError> {
        let installed: Vec<String> = resolution.variants.iter().map(OptionVariant::name).collect();

        let mut clock = None;
        let mut cache = None;
        let mut nonce_store = None;
        let mut header = None;
        let mut transport = None;
        let mut format = None;
        let mut vtable = None;
        let mut accept = None;
        for variant in resolution.variants {
            match variant {
                OptionVariant::Clock(c) => clock = Some(c),
                OptionVariant::Cache(c) => cache = Some(c),
                OptionVariant::NonceStore(n) => nonce_store = Some(n),
                OptionVariant::Header(h) => header = Some(h),
                OptionVariant::Transport(t) => transport = Some(t),
                OptionVariant::Format(f) => format = Some(f),
                OptionVariant::Vtable(v) => vtable = Some(v),
                OptionVariant::Accept(a) => accept = Some(a),
            }
        }

        let unresolved = |group: OptionGroup| ConfigError::Unresolved { group, required_by: name.clone() };
        let format_spec = format.ok_or_else(|| unresolved(OptionGroup::Format))?;
        let clock = clock.ok_or_else(|| unresolved(OptionGroup::Clock))?;
        let transport_spec = transport.ok_or_else(|| unresolved(OptionGroup::Transport))?;
        let accept = accept.ok_or_else(|| unresolved(OptionGroup::Accept))?;
        let vtable = vtable.unwrap_or_default();
        let header = header.unwrap_or_default();

        let header_scheme = format_spec.default_header_scheme();
        let transport: Arc<dyn Transport> = match transport_spec {
            TransportSpec::Bearer { allow_uri, allow_body, param_name } => Arc::new(BearerTransport::new(
                HeaderCarriage::new(&header, header_scheme)?,
                allow_uri,
                allow_body,
                param_name,
            )),
            TransportSpec::HttpHmac => Arc::new(MacTransport::new(HeaderCarriage::new(&header, header_scheme)?)?),
            TransportSpec::Param { name: param, location, carried } => {
                Arc::new(ParamTransport::new(param, location, carried))
            }
        };

        let mode = vtable.mode;
        let entries = cache.map(|cache| {
            Arc::new(EntryStore::new(name.clone(), cache, clock.clone(), mode, vtable.push, vtable.pull))
        });

        let format: Arc<dyn TokenFormat> = match format_spec {
            FormatSpec::BearerHandle { handle_bytes, single_use } => {
                if handle_bytes < MIN_HANDLE_BYTES {
                    return Err(ConfigError::InvalidSpec(format!(
                        "handle_bytes must be at least {}, got {}",
                        MIN_HANDLE_BYTES, handle_bytes
                    )));
                }
                let entries = entries.clone().ok_or_else(|| unresolved(OptionGroup::Cache))?;
                Arc::new(BearerHandle::new(entries, handle_bytes, single_use))
            }
            FormatSpec::BearerSigned { secret, hmac } => {
                if secret.is_empty() {
                    return Err(ConfigError::InvalidSpec("bearer_signed secret must not be empty".into()));
                }
                Arc::new(BearerSigned::new(secret.into_bytes(), hmac, clock.clone()))
            }
            FormatSpec::HttpHmac { hmac, max_skew } => {
                if max_skew == 0 {
                    return Err(ConfigError::InvalidSpec("max_skew must be positive".into()));
                }
                let entries = entries.clone().ok_or_else(|| unresolved(OptionGroup::Cache))?;
                let nonces = nonce_store.ok_or_else(|| unresolved(OptionGroup::NonceStore))?;
                Arc::new(HttpHmac::new(entries, nonces, hmac, max_skew, clock.clone()))
            }
        };

        info!(scheme = %name, format = format.kind(), transport = transport.kind(), vtable = mode.as_str(), "token scheme composed");
        Ok(Self {
            name,
            format,
            transport,
            accept,
            entries,
            vtable: mode,
            clock,
            exports: resolution.exports,
            installed,
        })
    }

    /// Token type marker (`bearer`, `mac`, ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> &Arc<dyn TokenFormat> {
        &self.format
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn accept_filter(&self) -> &AcceptFilter {
        &self.accept
    }

    /// Cache-backed entry store, absent for self-contained formats.
    pub fn entries(&self) -> Option<&Arc<EntryStore>> {
        self.entries.as_ref()
    }

    pub fn vtable_mode(&self) -> VtableMode {
        self.vtable
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn provides(&self, export: Export) -> bool {
        self.exports.contains_key(&export)
    }

    /// Variant that exported `export`.
    pub fn provider_of(&self, export: Export) -> Option<&str> {
        self.exports.get(&export).map(String::as_str)
    }

    pub fn exports(&self) -> impl Iterator<Item = Export> + '_ {
        self.exports.keys().copied()
    }

    /// Installed variant names in install order.
    pub fn installed(&self) -> &[String] {
        &self.installed
    }
}

impl fmt::Debug for TokenScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenScheme")
            .field("name", &self.name)
            .field("installed", &self.installed)
            .field("vtable", &self.vtable)
            .finish()
    }
}
