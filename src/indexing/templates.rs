//! The index template shared by a database's latest and arc indices.
//!
//! Typed sub-fields are mapped through dynamic templates keyed on the parser
//! codes; the `copy_to` targets `all_text`/`all_points`/`all_shapes` make
//! cross-field search possible without the indexer doing any copying.

use serde_json::{json, Value};

use super::names;
use crate::parser::options::ParsingOptions;

/// One dynamic template entry matching `data.*._<code>` paths.
fn dynamic_template(name: &str, code: &str, mapping: Value) -> Value {
    let mut entry = serde_json::Map::new();
    entry.insert(
        name.to_owned(),
        json!({
            "path_match": format!("data.*._{code}"),
            "match_pattern": "simple",
            "mapping": mapping,
        }),
    );
    Value::Object(entry)
}

/// Builds the full index template body for a database. The keyword mapping
/// depends on the configured keyword length, so templates are re-put when
/// options change.
pub fn index_template(database: &str, options: &ParsingOptions) -> Value {
    json!({
        "index_patterns": [names::index_pattern(database)],
        "template": {
            "settings": {
                "index": {
                    "codec": "best_compression",
                },
                "analysis": {
                    "normalizer": {
                        "lowercase_normalizer": {
                            "type": "custom",
                            "filter": ["lowercase"],
                        }
                    }
                }
            },
            "mappings": {
                "dynamic_templates": [
                    dynamic_template("text", "t", json!({
                        "type": "text",
                        "copy_to": "all_text",
                    })),
                    dynamic_template("keyword", "k", json!({
                        "type": "keyword",
                        "ignore_above": options.keyword_length,
                        "normalizer": "lowercase_normalizer",
                    })),
                    dynamic_template("number", "n", json!({
                        "type": "double",
                    })),
                    dynamic_template("date", "d", json!({
                        "type": "date",
                        "format": "epoch_millis",
                    })),
                    dynamic_template("boolean", "b", json!({
                        "type": "boolean",
                    })),
                    dynamic_template("geo_point", "gp", json!({
                        "type": "geo_point",
                        "copy_to": "all_points",
                    })),
                    dynamic_template("geo_shape", "gs", json!({
                        "type": "geo_shape",
                        "copy_to": "all_shapes",
                    })),
                    dynamic_template("unparsed", "u", json!({
                        "index": false,
                        "doc_values": false,
                    })),
                ],
                "properties": {
                    "id": {"type": "keyword"},
                    "version": {"type": "date", "format": "epoch_millis"},
                    "next": {"type": "date", "format": "epoch_millis"},
                    "versions": {"type": "date_range", "format": "epoch_millis"},
                    "data_types": {"type": "keyword"},
                    "parsed_types": {"type": "keyword"},
                    "all_text": {"type": "text"},
                    "all_points": {"type": "geo_point"},
                    "all_shapes": {"type": "geo_shape"},
                }
            }
        }
    })
}
