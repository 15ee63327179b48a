//! Reduce side of the chunked pipeline.

pub mod aggregator;

pub use aggregator::{aggregate, Aggregate, ChunkSchema, ALL_CHUNKS_FAILED};
