//! Map side of the chunked map-reduce: merging extraction batches and
//! partitioning the merged data into size-bounded chunks.

pub mod merge;
pub mod partition;

pub use merge::merge_chunks;
pub use partition::{partition, DEFAULT_MAX_CHUNK_BYTES};
