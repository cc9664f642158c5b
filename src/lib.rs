//! Porthole: Incremental Archive Index Views
//!
//! A paginated view synchronizer for a remotely queried backup-archive
//! index. Keeps a hierarchical storage view and a flat entry view current
//! against the authoritative service through debounced, abortable,
//! page-granular refresh passes.

pub mod checkset;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod logging;
pub mod model;
pub mod node;
pub mod ops;
pub mod protocol;
pub mod trigger;
pub mod types;
