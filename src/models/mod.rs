pub mod backoff;
pub mod endpoint;

pub use backoff::*;
pub use endpoint::*;
