//! Greedy size-bounded partitioning of merged extraction data.

use crate::models::ExtractedData;
use serde_json::{Map, Value};
use tracing::debug;

/// Default upper bound on a chunk's serialized size.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 500_000;

fn serialized_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Split `data` into chunks whose serialized size stays near `max_bytes`.
///
/// Types are packed greedily in key order. A type that alone exceeds the
/// limit has its page list sliced into consecutive one-type chunks. Every
/// page lands in exactly one chunk and page order within a type is kept.
pub fn partition(data: &ExtractedData, max_bytes: usize) -> Vec<ExtractedData> {
    let max_bytes = max_bytes.max(1);
    let mut chunks = Vec::new();
    let mut current = ExtractedData::new();
    let mut current_size = 0usize;

    for (doc_type, pages) in data {
        let mut single = Map::new();
        single.insert(doc_type.clone(), pages.clone());
        let doc_size = serialized_len(&Value::Object(single));

        if current_size + doc_size > max_bytes && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }

        match pages {
            Value::Array(list) if doc_size > max_bytes => {
                let per_chunk = pages_per_chunk(list.len(), serialized_len(pages), max_bytes);
                debug!(
                    doc_type = %doc_type,
                    pages = list.len(),
                    per_chunk,
                    "Splitting oversized document type"
                );
                for slice in list.chunks(per_chunk) {
                    let mut chunk = ExtractedData::new();
                    chunk.insert(doc_type.clone(), Value::Array(slice.to_vec()));
                    chunks.push(chunk);
                }
            }
            _ => {
                current.insert(doc_type.clone(), pages.clone());
                current_size += doc_size;
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// `max(1, floor(page_count * max_bytes / pages_size))`.
fn pages_per_chunk(page_count: usize, pages_size: usize, max_bytes: usize) -> usize {
    if pages_size == 0 {
        return page_count.max(1);
    }
    let per_chunk = (page_count as u128 * max_bytes as u128) / pages_size as u128;
    (per_chunk as usize).max(1)
}
