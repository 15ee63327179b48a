//! Merging of extraction batches fetched from the blob store.

use crate::models::ExtractedData;
use crate::store::{self, BlobStore};
use serde_json::Value;
use tracing::{debug, warn};

/// Blob key of a chunk reference, if it carries one.
pub fn chunk_ref_key(chunk_ref: &Value) -> Option<&str> {
    chunk_ref
        .get("chunkS3Key")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
}

/// Fetch every referenced batch in order and concatenate pages per type.
///
/// References without a key, missing blobs and unparseable blobs are
/// skipped with a warning; this never fails.
pub fn merge_chunks(blobs: &dyn BlobStore, refs: &[Value]) -> ExtractedData {
    let mut merged = ExtractedData::new();

    for (idx, chunk_ref) in refs.iter().enumerate() {
        let Some(key) = chunk_ref_key(chunk_ref) else {
            debug!(index = idx, "Skipping chunk reference without a key");
            continue;
        };

        let batch: ExtractedData = match store::get_json(blobs, key) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(index = idx, key, "Skipping chunk: {}", e);
                continue;
            }
        };

        extend_pages(&mut merged, batch);
    }

    debug!(
        types = ?merged.keys().collect::<Vec<_>>(),
        "Merged extraction batches"
    );
    merged
}

/// Append `batch` onto `merged`, concatenating lists of the same type.
pub fn extend_pages(merged: &mut ExtractedData, batch: ExtractedData) {
    for (doc_type, pages) in batch {
        let slot = merged
            .entry(doc_type.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(list) = slot else {
            warn!(doc_type = %doc_type, "Existing entry is not a page list; leaving it");
            continue;
        };
        match pages {
            Value::Array(items) => list.extend(items),
            Value::Null => {}
            other => {
                warn!(doc_type = %doc_type, "Page list is not an array; keeping it as one page");
                list.push(other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::page_count;
    use crate::store::MemoryBlobStore;
    use serde_json::json;

    fn put(store: &MemoryBlobStore, key: &str, value: Value) {
        store::put_json(store, key, &value).unwrap();
    }

    #[test]
    fn test_merge_concatenates_in_reference_order() {
        let blobs = MemoryBlobStore::new();
        put(
            &blobs,
            "j/extracted/1-2.json",
            json!({"Lab": [{"page_number": 1}], "APS": [{"page_number": 2}]}),
        );
        put(&blobs, "j/extracted/3-3.json", json!({"Lab": [{"page_number": 3}]}));

        let refs = vec![
            json!({"chunkS3Key": "j/extracted/1-2.json"}),
            json!({"chunkS3Key": "j/extracted/3-3.json"}),
        ];
        let merged = merge_chunks(&blobs, &refs);

        assert_eq!(
            Value::Object(merged.clone()),
            json!({
                "Lab": [{"page_number": 1}, {"page_number": 3}],
                "APS": [{"page_number": 2}]
            })
        );
        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["Lab", "APS"]);
    }

    #[test]
    fn test_merge_skips_bad_references() {
        let blobs = MemoryBlobStore::new();
        put(&blobs, "ok.json", json!({"A": [{"page_number": 1}]}));
        blobs.put("bad.json", b"{oops").unwrap();
        put(&blobs, "list.json", json!([1, 2]));

        let refs = vec![
            json!({}),
            json!({"chunkS3Key": ""}),
            json!({"chunkS3Key": "missing.json"}),
            json!({"chunkS3Key": "bad.json"}),
            json!({"chunkS3Key": "list.json"}),
            json!({"chunkS3Key": "ok.json"}),
        ];
        let merged = merge_chunks(&blobs, &refs);
        assert_eq!(page_count(&merged), 1);
    }

    #[test]
    fn test_merge_preserves_every_page() {
        let blobs = MemoryBlobStore::new();
        let mut refs = Vec::new();
        for i in 0..5 {
            let key = format!("j/extracted/{}.json", i);
            put(
                &blobs,
                &key,
                json!({"A": [{"page_number": i}], "B": [{"page_number": i}, {"page_number": i}]}),
            );
            refs.push(json!({"chunkS3Key": key}));
        }
        let merged = merge_chunks(&blobs, &refs);
        assert_eq!(page_count(&merged), 15);
        assert_eq!(merged["A"][4], json!({"page_number": 4}));
    }

    #[test]
    fn test_empty_input() {
        assert!(merge_chunks(&MemoryBlobStore::new(), &[]).is_empty());
    }
}
