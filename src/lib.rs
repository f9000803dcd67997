//! Timeseries archiver and query gateway.
//!
//! Sits between a publish/subscribe messaging fabric carrying telemetry and
//! two backing stores: a columnar timeseries engine and a metadata document
//! store. Producers publish metadata and numeric readings to URIs in a
//! hierarchical namespace; consumers submit queries against the archiver to
//! retrieve metadata, raw points, windowed statistics, or ranges changed
//! between two generations.
//!
//! The external collaborators (fabric, timeseries engine, document backend)
//! are consumed through traits; in-process implementations of each seam are
//! provided so the whole pipeline runs self-contained in tests.

pub mod archiver;
pub mod config;
pub mod dots;
pub mod engine;
pub mod envelope;
pub mod errors;
pub mod fabric;
pub mod models;
pub mod pool;
pub mod prefix;
pub mod query;
pub mod requests;
pub mod stats;
pub mod stores;
pub mod uri;
pub mod view;

pub use errors::Error;
