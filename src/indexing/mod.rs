//! Everything that projects the document store into the search engine:
//! index naming, the shared template, per-record bulk op generation, and
//! the sync engine that drives it all.

pub mod indexer;
pub mod names;
pub mod sync;
pub mod templates;
