//! Page-range planning for parallel extraction.

use super::{error_response, object_key, Services};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

/// Inclusive 1-based page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn pages(&self) -> Vec<usize> {
        (self.start..=self.end).collect()
    }
}

/// Consecutive ranges of `batch_size` pages covering `1..=total`.
pub fn batch_ranges(total: usize, batch_size: usize) -> Vec<PageRange> {
    let batch_size = batch_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 1;
    while start <= total {
        let end = (start + batch_size - 1).min(total);
        ranges.push(PageRange { start, end });
        start = end + 1;
    }
    ranges
}

/// `{batchRanges: [{start, end}]}` for the uploaded document.
pub fn run(event: &Value, services: &Services) -> Value {
    let Some(key) = object_key(event) else {
        return error_response("Missing detail.object.key");
    };

    let total = match services.pages.page_count(key) {
        Ok(total) => total,
        Err(e) => {
            error!(key, "Failed to count pages: {}", e);
            return error_response(format!("Failed to count pages: {}", e));
        }
    };

    let ranges = batch_ranges(total, services.settings.batch_size);
    info!(key, total, batches = ranges.len(), "Planned extraction batches");
    json!({ "batchRanges": ranges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::testing::{scripted, services};

    #[test]
    fn test_batch_ranges() {
        assert_eq!(
            batch_ranges(5, 2),
            vec![
                PageRange { start: 1, end: 2 },
                PageRange { start: 3, end: 4 },
                PageRange { start: 5, end: 5 },
            ]
        );
        assert_eq!(batch_ranges(3, 1).len(), 3);
        assert!(batch_ranges(0, 1).is_empty());
        assert_eq!(batch_ranges(2, 0), batch_ranges(2, 1));
    }

    #[test]
    fn test_run_returns_ranges() {
        let services = services(scripted(&[]), 3);
        let out = run(&json!({"detail": {"object": {"key": "uploads/j/a.pdf"}}}), &services);
        assert_eq!(
            out,
            json!({"batchRanges": [{"start": 1, "end": 1}, {"start": 2, "end": 2}, {"start": 3, "end": 3}]})
        );
        assert!(run(&json!({}), &services).get("error").is_some());
    }
}
