//! Pure pipeline transformations that operate on record data.
//!
//! Modules under this namespace must remain free of IO and external side effects
//! so they can be reused by the builder, the factory and test harnesses.

pub mod fingerprint;
pub mod query;
pub mod rows;

pub use fingerprint::{corpus_fingerprint, set_fingerprint};
pub use query::{IndexQuery, format_instant};
pub use rows::{PayloadSegment, Record, RowEncoder, TsvRowEncoder};
