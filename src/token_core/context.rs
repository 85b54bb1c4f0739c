//! Role specialization: a composed scheme viewed as an authorization server,
//! a client or a resource server.
//!
//! Each role only gets the operations that are valid for it. Calling a client
//! operation on a resource-server instance does not compile.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::compose::{ConfigError, Export, TokenScheme};
use super::request::HttpRequest;
use super::types::{IssuedToken, SavedToken, TokenError, TokenInfo, UsedToken};
use super::vtable::{EntryStore, VtableMode};

/// Runtime tag for a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    AuthorizationServer,
    Client,
    ResourceServer,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::AuthorizationServer => "authorization server",
            RoleKind::Client => "client",
            RoleKind::ResourceServer => "resource server",
        }
    }

    /// Operations valid for this role, whatever the composition provides.
    pub fn operations(&self) -> &'static [Operation] {
        match self {
            RoleKind::AuthorizationServer => {
                &[Operation::TokenCreate, Operation::TokenValidate, Operation::AnswerPull]
            }
            RoleKind::Client => &[Operation::TokenAccept, Operation::HttpInsert],
            RoleKind::ResourceServer => {
                &[Operation::HttpExtract, Operation::TokenValidate, Operation::ReceivePush]
            }
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    TokenCreate,
    TokenAccept,
    HttpInsert,
    HttpExtract,
    TokenValidate,
    ReceivePush,
    AnswerPull,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        self.export().as_str()
    }

    /// Capability the composed scheme must export for this operation.
    pub fn export(&self) -> Export {
        match self {
            Operation::TokenCreate => Export::TokenCreate,
            Operation::TokenAccept => Export::TokenAccept,
            Operation::HttpInsert => Export::HttpInsert,
            Operation::HttpExtract => Export::HttpExtract,
            Operation::TokenValidate => Export::TokenValidate,
            Operation::ReceivePush => Export::ReceivePush,
            Operation::AnswerPull => Export::AnswerPull,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Marker for the three roles.
pub trait Role: sealed::Sealed + Send + Sync + 'static {
    const KIND: RoleKind;
}

#[derive(Debug, Clone, Copy)]
pub struct AuthorizationServer;
#[derive(Debug, Clone, Copy)]
pub struct Client;
#[derive(Debug, Clone, Copy)]
pub struct ResourceServer;

impl sealed::Sealed for AuthorizationServer {}
impl sealed::Sealed for Client {}
impl sealed::Sealed for ResourceServer {}

impl Role for AuthorizationServer {
    const KIND: RoleKind = RoleKind::AuthorizationServer;
}
impl Role for Client {
    const KIND: RoleKind = RoleKind::Client;
}
impl Role for ResourceServer {
    const KIND: RoleKind = RoleKind::ResourceServer;
}

/// A composed scheme specialized to role `R`. Clones share the scheme.
pub struct TokenType<R: Role> {
    scheme: Arc<TokenScheme>,
    _role: PhantomData<fn() -> R>,
}

impl<R: Role> Clone for TokenType<R> {
    fn clone(&self) -> Self {
        Self { scheme: self.scheme.clone(), _role: PhantomData }
    }
}

impl<R: Role> fmt::Debug for TokenType<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenType")
            .field("role", &R::KIND)
            .field("scheme", &self.scheme.name())
            .finish()
    }
}

impl<R: Role> TokenType<R> {
    /// Checks the role has what its vtable mode needs.
    pub fn new(scheme: Arc<TokenScheme>) -> Result<Self, ConfigError> {
        let entries = scheme.entries();
        let has = |check: fn(&EntryStore) -> bool| entries.map(|e| check(e)).unwrap_or(false);
        match (R::KIND, scheme.vtable_mode()) {
            (RoleKind::AuthorizationServer, VtableMode::AuthservPush) if !has(EntryStore::has_push_handler) => {
                return Err(ConfigError::MissingHandler {
                    role: R::KIND.as_str(),
                    handler: "push",
                    mode: VtableMode::AuthservPush.as_str(),
                });
            }
            (RoleKind::ResourceServer, VtableMode::ResourcePull) if !has(EntryStore::has_pull_handler) => {
                return Err(ConfigError::MissingHandler {
                    role: R::KIND.as_str(),
                    handler: "pull",
                    mode: VtableMode::ResourcePull.as_str(),
                });
            }
            _ => {}
        }
        debug!(scheme = scheme.name(), role = %R::KIND, "token type specialized");
        Ok(Self { scheme, _role: PhantomData })
    }

    pub fn role(&self) -> RoleKind {
        R::KIND
    }

    /// Token type marker.
    pub fn name(&self) -> &str {
        self.scheme.name()
    }

    pub fn scheme(&self) -> &Arc<TokenScheme> {
        &self.scheme
    }

    /// Whether `operation` is valid for this role and provided by the composition.
    pub fn supports(&self, operation: Operation) -> bool {
        R::KIND.operations().contains(&operation) && self.scheme.provides(operation.export())
    }

    /// Supported operations, in lifecycle order.
    pub fn operations(&self) -> Vec<Operation> {
        R::KIND
            .operations()
            .iter()
            .copied()
            .filter(|op| self.scheme.provides(op.export()))
            .collect()
    }

    fn require(&self, operation: Operation) -> Result<(), TokenError> {
        if self.supports(operation) {
            Ok(())
        } else {
            Err(ConfigError::NotProvided { operation: operation.as_str() }.into())
        }
    }

    fn entries(&self, operation: Operation) -> Result<&Arc<EntryStore>, TokenError> {
        self.require(operation)?;
        self.scheme
            .entries()
            .ok_or_else(|| ConfigError::NotProvided { operation: operation.as_str() }.into())
    }
}

impl TokenScheme {
    pub fn specialize<R: Role>(self: &Arc<Self>) -> Result<TokenType<R>, ConfigError> {
        TokenType::new(self.clone())
    }

    pub fn authorization_server(self: &Arc<Self>) -> Result<TokenType<AuthorizationServer>, ConfigError> {
        self.specialize()
    }

    pub fn client(self: &Arc<Self>) -> Result<TokenType<Client>, ConfigError> {
        self.specialize()
    }

    pub fn resource_server(self: &Arc<Self>) -> Result<TokenType<ResourceServer>, ConfigError> {
        self.specialize()
    }
}

#[async_trait]
pub trait AuthorizationServerOps {
    /// Issues a token for `bindings`, valid `expires_in` seconds from `issue_time`.
    async fn token_create(&self, issue_time: u64, expires_in: u64, bindings: Vec<String>)
    -> Result<IssuedToken, TokenError>;

    /// Validates locally, without vtable lookups (refresh tokens, codes).
    async fn token_validate(&self, token: &UsedToken) -> Result<TokenInfo, TokenError>;

    /// Answers a resource server's pull query.
    async fn answer_pull(&self, query: &[String]) -> Result<Vec<String>, TokenError>;
}

pub trait ClientOps {
    /// Checks the token type and keeps the filtered extra parameters.
    fn token_accept(&self, issued: &IssuedToken, params: &[(String, String)]) -> Result<SavedToken, TokenError>;

    /// Authorizes `request` with `token`.
    fn http_insert<'r>(
        &self,
        request: &'r mut HttpRequest,
        token: &SavedToken,
    ) -> Result<&'r mut HttpRequest, TokenError>;
}

#[async_trait]
pub trait ResourceServerOps {
    /// Every candidate token in the request.
    fn http_extract(&self, request: &HttpRequest) -> Vec<UsedToken>;

    /// The single candidate, or `transport_mismatch`.
    fn extract_one(&self, request: &HttpRequest) -> Result<UsedToken, TokenError> {
        let mut found = self.http_extract(request);
        if found.len() != 1 {
            return Err(TokenError::TransportMismatch { found: found.len() });
        }
        Ok(found.remove(0))
    }

    /// Validates, pulling the entry from the authorization server when configured.
    async fn token_validate(&self, token: &UsedToken) -> Result<TokenInfo, TokenError>;

    /// Stores an entry pushed by the authorization server.
    async fn receive_push(&self, entry: &[String]) -> Result<(), TokenError>;
}

#[async_trait]
impl AuthorizationServerOps for TokenType<AuthorizationServer> {
    #[instrument(skip(self, bindings), level = "debug", fields(scheme = self.name()))]
    async fn token_create(
        &self,
        issue_time: u64,
        expires_in: u64,
        bindings: Vec<String>,
    ) -> Result<IssuedToken, TokenError> {
        self.require(Operation::TokenCreate)?;
        let info = TokenInfo { issue_time, expires_in, bindings };
        self.scheme.format().create(self.scheme.name(), info).await
    }

    #[instrument(skip_all, level = "debug", fields(scheme = self.name()))]
    async fn token_validate(&self, token: &UsedToken) -> Result<TokenInfo, TokenError> {
        self.require(Operation::TokenValidate)?;
        let result = self.scheme.format().validate(token, RoleKind::AuthorizationServer).await;
        if let Err(e) = &result {
            warn!(error_code = e.error_code(), "token rejected");
        }
        result
    }

    async fn answer_pull(&self, query: &[String]) -> Result<Vec<String>, TokenError> {
        self.entries(Operation::AnswerPull)?.answer_pull(query).await
    }
}

impl ClientOps for TokenType<Client> {
    fn token_accept(&self, issued: &IssuedToken, params: &[(String, String)]) -> Result<SavedToken, TokenError> {
        self.require(Operation::TokenAccept)?;
        if !issued.token_type.eq_ignore_ascii_case(self.name()) {
            return Err(TokenError::TypeMismatch {
                expected: self.name().to_string(),
                found: issued.token_type.clone(),
            });
        }
        let mut saved = SavedToken {
            token_type: self.name().to_string(),
            access_token: issued.access_token.clone(),
            secret: None,
            algorithm: None,
            received_at: None,
            params: self.scheme.accept_filter().apply(params),
        };
        self.scheme.format().accept(issued, &mut saved)?;
        Ok(saved)
    }

    fn http_insert<'r>(
        &self,
        request: &'r mut HttpRequest,
        token: &SavedToken,
    ) -> Result<&'r mut HttpRequest, TokenError> {
        self.require(Operation::HttpInsert)?;
        if !token.token_type.eq_ignore_ascii_case(self.name()) {
            return Err(TokenError::TypeMismatch {
                expected: self.name().to_string(),
                found: token.token_type.clone(),
            });
        }
        let credential = self.scheme.format().credential(token, request)?;
        self.scheme.transport().insert(request, credential)?;
        Ok(request)
    }
}

#[async_trait]
impl ResourceServerOps for TokenType<ResourceServer> {
    fn http_extract(&self, request: &HttpRequest) -> Vec<UsedToken> {
        self.scheme.transport().extract(request)
    }

    #[instrument(skip_all, level = "debug", fields(scheme = self.name()))]
    async fn token_validate(&self, token: &UsedToken) -> Result<TokenInfo, TokenError> {
        self.require(Operation::TokenValidate)?;
        let result = self.scheme.format().validate(token, RoleKind::ResourceServer).await;
        if let Err(e) = &result {
            warn!(error_code = e.error_code(), "token rejected");
        }
        result
    }

    async fn receive_push(&self, entry: &[String]) -> Result<(), TokenError> {
        self.entries(Operation::ReceivePush)?.receive_push(entry).await
    }
}
