//! hybridex - full-text, secondary-index and vector query execution
//!
//! hybridex keeps documents in an in-memory keyspace and maintains search
//! indexes over them:
//! - Inverted text index with stemming, phrase and fuzzy matching
//! - Numeric, tag, geo and geoshape attribute indexes
//! - Flat, HNSW, quantized and tiered vector indexes with hybrid KNN
//! - A streaming result pipeline for search, aggregation and cursors
//! - RESP and HTTP command front ends

pub mod analysis;
pub mod api;
pub mod args;
pub mod command;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod gc;
pub mod index;
pub mod pipeline;
pub mod query;
pub mod runtime;
pub mod schema;
pub mod store;
pub mod types;
pub mod vector;
pub mod workers;

pub use engine::Engine;
pub use error::{Error, Result};
