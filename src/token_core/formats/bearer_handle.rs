use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::token_core::context::RoleKind;
use crate::token_core::crypto::random_token;
use crate::token_core::provider::{Credential, TokenFormat};
use crate::token_core::request::HttpRequest;
use crate::token_core::store::CacheEntry;
use crate::token_core::types::{IssuedToken, SavedToken, TokenError, TokenInfo, UsedToken};
use crate::token_core::vtable::{EntryStore, Origin};

/// Opaque random handles referencing cached token information.
pub struct BearerHandle {
    entries: Arc<EntryStore>,
    handle_bytes: usize,
    single_use: bool,
}

impl BearerHandle {
    pub fn new(entries: Arc<EntryStore>, handle_bytes: usize, single_use: bool) -> Self {
        Self { entries, handle_bytes, single_use }
    }
}

#[async_trait]
impl TokenFormat for BearerHandle {
    fn kind(&self) -> &'static str {
        "bearer_handle"
    }

    #[instrument(skip_all, level = "debug")]
    async fn create(&self, token_type: &str, info: TokenInfo) -> Result<IssuedToken, TokenError> {
        let handle = random_token(self.handle_bytes)?;
        let expires_in = info.expires_in;
        self.entries
            .publish(&handle, CacheEntry { info, secret: None, single_use: self.single_use })
            .await?;
        Ok(IssuedToken {
            token_type: token_type.to_string(),
            access_token: handle,
            expires_in,
            secret: None,
            algorithm: None,
        })
    }

    fn credential(&self, saved: &SavedToken, _request: &HttpRequest) -> Result<Credential, TokenError> {
        Ok(Credential::Token(saved.access_token.clone()))
    }

    #[instrument(skip_all, level = "debug")]
    async fn validate(&self, used: &UsedToken, role: RoleKind) -> Result<TokenInfo, TokenError> {
        let lookup = self.entries.fetch(&used.token, role).await?.ok_or(TokenError::UnknownHandle)?;
        if lookup.entry.single_use && lookup.origin == Origin::Local && !self.entries.consume(&used.token).await? {
            debug!("single-use handle presented again");
            return Err(TokenError::AlreadyUsed);
        }
        Ok(lookup.entry.info)
    }
}
