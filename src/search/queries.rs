//! Pure query builders for the search engine, plus the inverse of the
//! parser. No I/O happens here; everything returns plain JSON bodies.

use serde_json::{json, Map, Value};

use crate::record::Version;

/// The parsed sub-field a query should target, e.g. `data.height._n`.
pub fn parsed_field(path: &str, code: &str) -> String {
    format!("data.{path}._{code}")
}

fn single(key: String, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key, value);
    Value::Object(map)
}

/// Matches documents that were live at `version`: their `versions` range
/// contains it.
pub fn version_query(version: Version) -> Value {
    json!({"term": {"versions": version}})
}

/// Matches a record by its id (all of its versions).
pub fn id_query(id: &str) -> Value {
    json!({"term": {"id": id}})
}

/// An exact match against the sub-field appropriate for the value's kind:
/// booleans hit `_b`, numbers hit `_n`, everything else hits the keyword
/// projection `_k`.
pub fn term_query(path: &str, value: &Value) -> Value {
    let code = match value {
        Value::Bool(_) => "b",
        Value::Number(_) => "n",
        _ => "k",
    };
    single(
        "term".to_owned(),
        single(parsed_field(path, code), value.clone()),
    )
}

/// A numeric range over `_n`. Bounds are inclusive and optional.
pub fn range_query(path: &str, lo: Option<f64>, hi: Option<f64>) -> Value {
    bounded_query(
        parsed_field(path, "n"),
        lo.map(Value::from),
        hi.map(Value::from),
    )
}

/// A date range over `_d`, bounds in epoch millis.
pub fn date_range_query(path: &str, lo: Option<Version>, hi: Option<Version>) -> Value {
    bounded_query(
        parsed_field(path, "d"),
        lo.map(Value::from),
        hi.map(Value::from),
    )
}

fn bounded_query(field: String, lo: Option<Value>, hi: Option<Value>) -> Value {
    let mut bounds = Map::new();
    if let Some(lo) = lo {
        bounds.insert("gte".to_owned(), lo);
    }
    if let Some(hi) = hi {
        bounds.insert("lte".to_owned(), hi);
    }
    single("range".to_owned(), single(field, Value::Object(bounds)))
}

/// Full text match over `_t`, or over every text field when no path is
/// given.
pub fn text_query(path: Option<&str>, query: &str) -> Value {
    let field = match path {
        Some(path) => parsed_field(path, "t"),
        None => "all_text".to_owned(),
    };
    single("match".to_owned(), single(field, Value::String(query.to_owned())))
}

/// Matches documents with a geo point within `distance_metres` of the given
/// coordinate, against `_gp` or every point via `all_points`.
pub fn geo_distance_query(path: Option<&str>, lat: f64, lon: f64, distance_metres: f64) -> Value {
    let field = match path {
        Some(path) => parsed_field(path, "gp"),
        None => "all_points".to_owned(),
    };
    let mut body = Map::new();
    body.insert(
        "distance".to_owned(),
        Value::String(format!("{distance_metres}m")),
    );
    body.insert(field, json!({"lat": lat, "lon": lon}));
    single("geo_distance".to_owned(), Value::Object(body))
}

/// Matches documents whose geo shape relates to the given WKT shape,
/// against `_gs` or every shape via `all_shapes`.
pub fn geo_shape_query(path: Option<&str>, wkt: &str, relation: &str) -> Value {
    let field = match path {
        Some(path) => parsed_field(path, "gs"),
        None => "all_shapes".to_owned(),
    };
    single(
        "geo_shape".to_owned(),
        single(field, json!({"shape": wkt, "relation": relation})),
    )
}

/// Inverts the parser: strips every `_`-prefixed projection key, unwraps
/// `_u` leaves, and recurses into containers, returning the original data
/// tree.
pub fn rebuild_data(parsed: &Value) -> Value {
    match parsed {
        Value::Object(map) => {
            if let Some(unparsed) = map.get("_u") {
                return unparsed.clone();
            }
            Value::Object(
                map.iter()
                    .filter(|(key, _)| !key.starts_with('_'))
                    .map(|(key, value)| (key.clone(), rebuild_data(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(rebuild_data).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::parser::options::{GeoHint, ParsingOptions};
    use crate::parser::Parser;

    #[test]
    fn term_queries_pick_the_right_subfield() {
        assert_eq!(
            term_query("h", &json!(40.6)),
            json!({"term": {"data.h._n": 40.6}})
        );
        assert_eq!(
            term_query("t", &json!("llama")),
            json!({"term": {"data.t._k": "llama"}})
        );
        assert_eq!(
            term_query("ok", &json!(true)),
            json!({"term": {"data.ok._b": true}})
        );
    }

    #[test]
    fn range_queries_keep_only_given_bounds() {
        assert_eq!(
            range_query("h", Some(1.0), None),
            json!({"range": {"data.h._n": {"gte": 1.0}}})
        );
        assert_eq!(
            date_range_query("at", Some(100), Some(200)),
            json!({"range": {"data.at._d": {"gte": 100, "lte": 200}}})
        );
    }

    #[test]
    fn text_queries_fall_back_to_all_text() {
        assert_eq!(
            text_query(Some("notes"), "llama"),
            json!({"match": {"data.notes._t": "llama"}})
        );
        assert_eq!(
            text_query(None, "llama"),
            json!({"match": {"all_text": "llama"}})
        );
    }

    #[test]
    fn version_and_id_queries() {
        assert_eq!(version_query(100), json!({"term": {"versions": 100}}));
        assert_eq!(id_query("r1"), json!({"term": {"id": "r1"}}));
    }

    #[test]
    fn geo_queries_target_projections() {
        let query = geo_distance_query(Some("lat"), 51.5, -0.1, 100.0);
        assert_eq!(
            query,
            json!({"geo_distance": {"distance": "100m", "data.lat._gp": {"lat": 51.5, "lon": -0.1}}})
        );
        let query = geo_shape_query(None, "POINT (0 0)", "intersects");
        assert!(query["geo_shape"]["all_shapes"].is_object());
    }

    fn assert_roundtrip(data: Value) {
        let mut parser = Parser::new(
            ParsingOptions::builder()
                .add_geo_hint(GeoHint::new("lat", "lon"))
                .build()
                .unwrap(),
        );
        let parsed = parser.parse(data.as_object().unwrap());
        assert_eq!(rebuild_data(&parsed.data), data);
    }

    #[test]
    fn rebuild_inverts_the_parser() {
        assert_roundtrip(json!({
            "n": "Jeremy",
            "t": "llama",
            "h": 40.6,
            "alive": true,
            "notes": null,
            "tags": ["a", "", null, 7],
            "nested": {"deep": {"at": "2021-03-01"}},
            "site": {"type": "Point", "coordinates": [-0.1, 51.5]},
            "lat": 51.5,
            "lon": -0.1,
        }));
    }

    #[test]
    fn rebuild_preserves_empty_strings_and_nulls() {
        assert_roundtrip(json!({"empty": "", "missing": null}));
    }
}
