//! In-memory persistence: collection tables plus the harmonic log.

mod database;
mod operations;
mod records;

pub use database::*;
pub use operations::*;
pub use records::*;
