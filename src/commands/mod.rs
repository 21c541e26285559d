//! CLI commands implementation

pub mod init;
pub mod query;
pub mod status;

pub use init::*;
pub use query::*;
pub use status::*;
