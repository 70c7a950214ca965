//! Splitgill stores, updates, and queries versioned semi-structured
//! records.
//!
//! Each record is an id plus a JSON data tree and evolves through immutable
//! versions. The document store holds the authoritative state as a current
//! tree plus a chain of backwards diffs, so any past version can be
//! rebuilt; the search engine holds a derived projection in which every
//! leaf value is expanded into typed sub-fields. The sync engine moves
//! history from the former into the latter: resumably, idempotently, and
//! under a cross-process lock.
//!
//! ```no_run
//! use serde_json::json;
//! use splitgill::database::{IngestOptions, Splitgill};
//! use splitgill::record::Record;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = splitgill::config::load_config(None)?;
//! let client = Splitgill::connect(config).await?;
//! let db = client.database("specimens");
//!
//! db.ingest(
//!     vec![Record::new("r1", json!({"name": "Jeremy", "height": 40.6}))],
//!     IngestOptions::default(),
//! )
//! .await?;
//! db.sync(Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod diff;
pub mod errors;
pub mod indexing;
pub mod locks;
pub mod parser;
pub mod record;
pub mod search;
pub mod shutdown;
pub mod store;

pub use crate::database::{IngestOptions, IngestResult, Splitgill, SplitgillDatabase};
pub use crate::indexing::sync::{SyncOptions, SyncResult};
pub use crate::parser::options::{GeoHint, ParsingOptions, ParsingOptionsBuilder};
pub use crate::record::{Record, Version};
