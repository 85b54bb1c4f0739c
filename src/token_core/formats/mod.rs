pub mod bearer_handle;
pub mod bearer_signed;
pub mod http_hmac;

pub use bearer_handle::BearerHandle;
pub use bearer_signed::BearerSigned;
pub use http_hmac::HttpHmac;
