//! Step-partitioned historical state archive.
//!
//! Recent mutations accumulate in a mutable table store ([`kv`]); each time a
//! fixed range of transaction ordinals (a *step*) completes, the closed step
//! is frozen into immutable, compressed, index-backed static files, adjacent
//! files are merged following a size-tiered policy, and the frozen mutations
//! are pruned from the mutable store. Point reads and as-of-txNum reads
//! compose the static-file stack with the mutable deltas.
//!
//! The archive carries seven data streams: three key/value domains (accounts,
//! contract storage, contract code) and four inverted indices (log addresses,
//! log topics, trace senders, trace recipients). [`Aggregator`] orchestrates
//! them.

pub mod kv;

mod files;
mod segment;

pub mod aggregator;
pub mod domain;
pub mod inverted;

pub use aggregator::{Aggregator, AggregatorContext, FilesStats};
pub use domain::{DomainStats, HistoryIterator, ScanIterator};
pub use inverted::InvertedIterator;
