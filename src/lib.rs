pub mod token_core;

pub use token_core::clock::{Clock, ManualClock, SystemClock};
pub use token_core::compose::{ConfigError, Export, OptionGroup, OptionVariant, Registry, TokenScheme, VtableVariant};
pub use token_core::context::{
    AuthorizationServer, AuthorizationServerOps, Client, ClientOps, Operation, ResourceServer, ResourceServerOps,
    Role, RoleKind, TokenType,
};
pub use token_core::crypto::HashAlgorithm;
pub use token_core::memory::{InMemoryCache, InMemoryNonceStore};
pub use token_core::provider::{Credential, TokenFormat, Transport};
pub use token_core::request::{HttpMethod, HttpRequest};
pub use token_core::scheme::{AcceptFilter, FormatSpec, HeaderSpec, ParamLocation, SchemeBuilder, SchemeSpec, TransportSpec};
pub use token_core::store::{CacheEntry, NonceStore, TokenCache};
pub use token_core::types::{IssuedToken, RequestProof, SavedToken, TokenError, TokenInfo, UsedToken};
pub use token_core::vtable::{LoopbackPull, LoopbackPush, VtableError, VtableMode, VtablePull, VtablePush};
