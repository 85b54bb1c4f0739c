pub mod bearer;
pub mod header;
pub mod mac;
pub mod param;

pub use bearer::BearerTransport;
pub use header::HeaderCarriage;
pub use mac::MacTransport;
pub use param::ParamTransport;
