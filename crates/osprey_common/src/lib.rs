//! Shared foundation for the Osprey log restore pipeline: error taxonomy,
//! newtype identifiers, the scalar datum model, table descriptors,
//! configuration, and the cooperative cancellation signal.

pub mod cancel;
pub mod config;
pub mod datum;
pub mod error;
pub mod schema;
pub mod types;
