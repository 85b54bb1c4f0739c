pub mod clock;
pub mod compose;
pub mod context;
pub mod crypto;
pub mod formats;
pub mod memory;
pub mod provider;
pub mod request;
pub mod scheme;
pub mod store;
pub mod transports;
pub mod types;
pub mod vtable;
