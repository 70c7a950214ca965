//! Turns one record's diff chain into the bulk operations that bring the
//! search engine in line with it.

use serde_json::{Map, Value};

use super::names;
use crate::parser::{ParsedData, Parser};
use crate::record::{StoredRecord, Version};
use crate::search::BulkOp;

/// Generates the ordered bulk operations for `record` covering the versions
/// in `(since, until]`.
///
/// When the window leaves older states in front of it, the state in force at
/// `since` is re-emitted too: it used to be the record's latest document and
/// has to move into the arc now that something newer exists. Every emitted
/// state is preceded by deletes of its document id in both candidate
/// indices, so re-running a sync (or re-running it with different options)
/// is idempotent.
pub fn generate_index_ops(
    database: &str,
    record: &StoredRecord,
    since: Option<Version>,
    until: Version,
    parser: &mut Parser,
) -> Vec<BulkOp> {
    let mut history = record.history();
    history.retain(|(version, _)| *version <= until);
    if history.is_empty() {
        return Vec::new();
    }

    // the first state that is inside the window
    let window_start = match since {
        Some(since) => history.partition_point(|(version, _)| *version <= since),
        None => 0,
    };
    if window_start == history.len() {
        return Vec::new();
    }
    // include the boundary state when the window has predecessors
    let emit_from = window_start.saturating_sub(1);

    let latest = names::latest_index(database);
    let arc = names::arc_index(database, &record.id);

    let mut ops = Vec::new();
    for (position, (version, data)) in history.iter().enumerate().skip(emit_from) {
        let next = history.get(position + 1).map(|(version, _)| *version);
        let doc_id = names::document_id(&record.id, *version);

        ops.push(BulkOp::Delete {
            index: arc.clone(),
            id: doc_id.clone(),
        });
        ops.push(BulkOp::Delete {
            index: latest.clone(),
            id: doc_id.clone(),
        });

        let Some(data) = data.as_object().filter(|map| !map.is_empty()) else {
            // deleted state: nothing to index, the deletes above are enough
            continue;
        };

        let target = if next.is_none() {
            latest.clone()
        } else {
            arc.clone()
        };
        ops.push(BulkOp::Index {
            index: target,
            id: doc_id,
            document: build_document(&record.id, *version, next, parser.parse(data)),
        });
    }
    ops
}

/// Assembles a search document. `versions` is the half-open range
/// `[version, next)`; the copy-to fields are populated by the index
/// template, never here.
fn build_document(
    record_id: &str,
    version: Version,
    next: Option<Version>,
    parsed: ParsedData,
) -> Value {
    let mut versions = Map::new();
    versions.insert("gte".to_owned(), Value::from(version));
    if let Some(next) = next {
        versions.insert("lt".to_owned(), Value::from(next));
    }

    let mut doc = Map::new();
    doc.insert("id".to_owned(), Value::String(record_id.to_owned()));
    doc.insert("version".to_owned(), Value::from(version));
    if let Some(next) = next {
        doc.insert("next".to_owned(), Value::from(next));
    }
    doc.insert("versions".to_owned(), Value::Object(versions));
    doc.insert("data".to_owned(), parsed.data);
    doc.insert(
        "data_types".to_owned(),
        Value::Array(parsed.data_types.into_iter().map(Value::String).collect()),
    );
    doc.insert(
        "parsed_types".to_owned(),
        Value::Array(parsed.parsed_types.into_iter().map(Value::String).collect()),
    );
    Value::Object(doc)
}
