//! Types library for the indicator engine
//!
//! Shared identifier and time types used by every service that talks to the
//! engine, so that session, symbol and worker identities are validated once
//! at the edge and carried around as strong types afterwards.
//!
//! # Modules
//! - `ids`: Identifiers (Symbol, SessionId, UserId, WorkerId, TransportRef)
//! - `time`: Unix-nanosecond timestamp helpers
//! - `errors`: Identifier validation errors

pub mod errors;
pub mod ids;
pub mod time;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::time::*;
}
