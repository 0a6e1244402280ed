// Output module for Sylva: errors and HTTP envelopes

pub mod errors;
pub mod response;

pub use errors::*;
pub use response::{empty, success, ErrorBody, SuccessBody};

pub type Result<T> = std::result::Result<T, SylvaError>;
