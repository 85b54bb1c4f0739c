//! Plugin seams for token formats and transports.

use async_trait::async_trait;

use super::context::RoleKind;
use super::request::HttpRequest;
use super::types::{IssuedToken, SavedToken, TokenError, TokenInfo, UsedToken};

/// What a format asks the transport to place on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// A bearer value inserted as is.
    Token(String),
    /// Ordered `name="value"` attributes for signed authorization headers.
    Attributes(Vec<(String, String)>),
}

/// Encodes token information into tokens and validates them again.
#[async_trait]
pub trait TokenFormat: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Issues a new token carrying `info`.
    async fn create(&self, token_type: &str, info: TokenInfo) -> Result<IssuedToken, TokenError>;

    /// Copies format-specific fields from the issued token into the saved one.
    fn accept(&self, _issued: &IssuedToken, _saved: &mut SavedToken) -> Result<(), TokenError> {
        Ok(())
    }

    /// Produces what the transport inserts for `saved` on `request`.
    fn credential(&self, saved: &SavedToken, request: &HttpRequest) -> Result<Credential, TokenError>;

    /// Recovers the token information, failing with the error category of the first failed check.
    async fn validate(&self, used: &UsedToken, role: RoleKind) -> Result<TokenInfo, TokenError>;
}

/// Moves credentials on and off HTTP requests.
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn insert(&self, request: &mut HttpRequest, credential: Credential) -> Result<(), TokenError>;

    /// Every candidate the transport's syntax matches, in request order.
    fn extract(&self, request: &HttpRequest) -> Vec<UsedToken>;
}
