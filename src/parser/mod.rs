//! Conversion of raw record data into type-aware search projections.
//!
//! Every non-container leaf becomes an object carrying the unparsed original
//! under `_u` plus zero or more typed projections: `_t` text, `_k` keyword,
//! `_n` number, `_d` date (epoch millis), `_b` boolean, `_gp` geo point,
//! `_gs` geo shape. Containers keep their structure, so the parsed tree can
//! be searched type-polymorphically and inverted back into the original
//! data.

pub mod geo;
pub mod options;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};

use self::geo::{Position, Shape};
use self::options::ParsingOptions;

/// Parsed projections of a single data tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedData {
    pub data: Value,
    /// `"path:kind"` strings, kind one of str/int/float/bool/null/list/dict.
    pub data_types: Vec<String>,
    /// `"path:code"` strings, code one of t/k/n/d/b/gp/gs.
    pub parsed_types: Vec<String>,
}

/// Identical scalar leaves appear over and over across records, so parsed
/// leaf objects are cached by source value. The cache is cleared wholesale
/// when it fills; parsers are cheap to make and typically per-worker.
const LEAF_CACHE_LIMIT: usize = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LeafKey {
    Bool(bool),
    Int(i64),
    UInt(u64),
    FloatBits(u64),
    Str(String),
}

impl LeafKey {
    fn from_value(value: &Value) -> Option<LeafKey> {
        match value {
            Value::Bool(b) => Some(LeafKey::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(LeafKey::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Some(LeafKey::UInt(u))
                } else {
                    n.as_f64().map(|f| LeafKey::FloatBits(f.to_bits()))
                }
            }
            Value::String(s) => Some(LeafKey::Str(s.clone())),
            _ => None,
        }
    }
}

pub struct Parser {
    options: ParsingOptions,
    float_digits: usize,
    cache: HashMap<LeafKey, Map<String, Value>>,
}

impl Parser {
    pub fn new(options: ParsingOptions) -> Self {
        let float_digits = options.float_digits();
        Parser {
            options,
            float_digits,
            cache: HashMap::new(),
        }
    }

    pub fn options(&self) -> &ParsingOptions {
        &self.options
    }

    /// Parses a record's data tree into its search projection.
    pub fn parse(&mut self, data: &Map<String, Value>) -> ParsedData {
        let mut data_types = BTreeSet::new();
        let mut parsed_types = BTreeSet::new();
        let tree = self.parse_map(data, "", true, &mut data_types, &mut parsed_types);
        ParsedData {
            data: Value::Object(tree),
            data_types: data_types.into_iter().collect(),
            parsed_types: parsed_types.into_iter().collect(),
        }
    }

    fn parse_map(
        &mut self,
        map: &Map<String, Value>,
        path: &str,
        is_root: bool,
        data_types: &mut BTreeSet<String>,
        parsed_types: &mut BTreeSet<String>,
    ) -> Map<String, Value> {
        let mut out = Map::with_capacity(map.len());
        for (key, value) in map {
            let child_path = join_path(path, key);
            data_types.insert(format!("{child_path}:{}", kind(value)));
            let parsed = match value {
                Value::Object(inner) => Value::Object(self.parse_map(
                    inner,
                    &child_path,
                    false,
                    data_types,
                    parsed_types,
                )),
                Value::Array(items) => {
                    Value::Array(self.parse_list(items, &child_path, data_types, parsed_types))
                }
                leaf => {
                    let object = self.parse_leaf(leaf);
                    record_parsed_types(&object, &child_path, parsed_types);
                    Value::Object(object)
                }
            };
            out.insert(key.clone(), parsed);
        }

        // a non-root map that is itself a GeoJSON geometry gets shape
        // projections attached alongside its keys
        if !is_root {
            if let Some(shape) = Shape::from_geojson(map) {
                out.insert("_gs".to_owned(), Value::String(shape.to_wkt()));
                parsed_types.insert(format!("{path}:gs"));
                if let Some(centroid) = shape.centroid() {
                    out.insert(
                        "_gp".to_owned(),
                        Value::String(Shape::Point(centroid).to_wkt()),
                    );
                    parsed_types.insert(format!("{path}:gp"));
                }
            }
        }

        self.apply_geo_hints(map, &mut out, path, parsed_types);
        out
    }

    fn parse_list(
        &mut self,
        items: &[Value],
        path: &str,
        data_types: &mut BTreeSet<String>,
        parsed_types: &mut BTreeSet<String>,
    ) -> Vec<Value> {
        items
            .iter()
            .map(|item| match item {
                Value::Object(inner) => {
                    data_types.insert(format!("{path}:dict"));
                    Value::Object(self.parse_map(inner, path, false, data_types, parsed_types))
                }
                Value::Array(inner) => {
                    data_types.insert(format!("{path}:list"));
                    Value::Array(self.parse_list(inner, path, data_types, parsed_types))
                }
                // a null slot stays null so positions survive
                Value::Null => {
                    data_types.insert(format!("{path}:null"));
                    Value::Null
                }
                leaf => {
                    data_types.insert(format!("{path}:{}", kind(leaf)));
                    let object = self.parse_leaf(leaf);
                    record_parsed_types(&object, path, parsed_types);
                    Value::Object(object)
                }
            })
            .collect()
    }

    /// Expands a scalar leaf into its projection object. Null and empty
    /// string leaves keep only their `_u`.
    fn parse_leaf(&mut self, value: &Value) -> Map<String, Value> {
        let key = LeafKey::from_value(value);
        if let Some(key) = &key {
            if let Some(cached) = self.cache.get(key) {
                return cached.clone();
            }
        }

        let mut object = Map::new();
        object.insert("_u".to_owned(), value.clone());

        match value {
            Value::Bool(b) => {
                let text = if *b { "true" } else { "false" };
                object.insert("_b".to_owned(), Value::Bool(*b));
                object.insert("_t".to_owned(), Value::String(text.to_owned()));
                object.insert("_k".to_owned(), Value::String(text.to_owned()));
            }
            Value::Number(number) => {
                let (as_float, text) = if let Some(i) = number.as_i64() {
                    (i as f64, i.to_string())
                } else if let Some(u) = number.as_u64() {
                    (u as f64, u.to_string())
                } else {
                    let f = number.as_f64().unwrap_or_default();
                    (f, format_float(f, self.float_digits))
                };
                object.insert("_n".to_owned(), Value::from(as_float));
                object.insert("_t".to_owned(), Value::String(text.clone()));
                object.insert("_k".to_owned(), Value::String(text));
            }
            Value::String(s) if !s.is_empty() => {
                object.insert("_t".to_owned(), Value::String(s.clone()));
                object.insert(
                    "_k".to_owned(),
                    Value::String(s.chars().take(self.options.keyword_length).collect()),
                );
                if let Ok(number) = s.trim().parse::<f64>() {
                    if number.is_finite() {
                        object.insert("_n".to_owned(), Value::from(number));
                    }
                }
                if let Some(epoch_ms) = parse_date(s, &self.options.date_formats) {
                    object.insert("_d".to_owned(), Value::from(epoch_ms));
                }
                let lowered = s.to_lowercase();
                if self.options.true_values.contains(&lowered) {
                    object.insert("_b".to_owned(), Value::Bool(true));
                } else if self.options.false_values.contains(&lowered) {
                    object.insert("_b".to_owned(), Value::Bool(false));
                }
                if let Some(shape) = Shape::parse_wkt(s) {
                    object.insert("_gs".to_owned(), Value::String(shape.to_wkt()));
                    if let Some(centroid) = shape.centroid() {
                        object.insert(
                            "_gp".to_owned(),
                            Value::String(Shape::Point(centroid).to_wkt()),
                        );
                    }
                }
            }
            _ => {}
        }

        if let Some(key) = key {
            if self.cache.len() >= LEAF_CACHE_LIMIT {
                self.cache.clear();
            }
            self.cache.insert(key, object.clone());
        }
        object
    }

    /// Builds geo projections out of plain lat/lon(/radius) fields. The
    /// point (and circle, when a radius is present) land on the lat field's
    /// parsed object.
    fn apply_geo_hints(
        &self,
        source: &Map<String, Value>,
        out: &mut Map<String, Value>,
        path: &str,
        parsed_types: &mut BTreeSet<String>,
    ) {
        for hint in &self.options.geo_hints {
            let Some(lat) = numeric_field(source.get(&hint.lat_field)) else {
                continue;
            };
            let Some(lon) = numeric_field(source.get(&hint.lon_field)) else {
                continue;
            };
            let position = Position::new(lon, lat);
            if !position.in_range() {
                continue;
            }
            let point = Shape::Point(position);

            let radius = hint
                .radius_field
                .as_ref()
                .and_then(|field| numeric_field(source.get(field)));
            let shape = match radius {
                Some(radius) if radius > 0.0 => Shape::circle(position, radius, hint.segments),
                _ => point.clone(),
            };

            if let Some(Value::Object(leaf)) = out.get_mut(&hint.lat_field) {
                leaf.insert("_gp".to_owned(), Value::String(point.to_wkt()));
                leaf.insert("_gs".to_owned(), Value::String(shape.to_wkt()));
                let lat_path = join_path(path, &hint.lat_field);
                parsed_types.insert(format!("{lat_path}:gp"));
                parsed_types.insert(format!("{lat_path}:gs"));
            }
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn record_parsed_types(object: &Map<String, Value>, path: &str, parsed_types: &mut BTreeSet<String>) {
    for code in ["t", "k", "n", "d", "b", "gp", "gs"] {
        if object.contains_key(&format!("_{code}")) {
            parsed_types.insert(format!("{path}:{code}"));
        }
    }
}

fn numeric_field(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Tries each format in order; the first match wins. Formats without a zone
/// are naive and get UTC filled in, date-only formats resolve to midnight.
fn parse_date(raw: &str, formats: &[String]) -> Option<i64> {
    for format in formats {
        if format.contains("%z") || format.contains("%:z") || format.contains("%#z") {
            if let Ok(datetime) = DateTime::parse_from_str(raw, format) {
                return Some(datetime.timestamp_millis());
            }
        } else if format.contains("%H") {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(naive.and_utc().timestamp_millis());
            }
        } else if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            let midnight = date.and_hms_opt(0, 0, 0)?;
            return Some(midnight.and_utc().timestamp_millis());
        }
    }
    None
}

/// Renders a float with the given number of significant digits, trimming
/// trailing zeros, switching to scientific notation for very large or very
/// small magnitudes.
pub(crate) fn format_float(value: f64, digits: usize) -> String {
    if value == 0.0 {
        return "0".to_owned();
    }
    let digits = digits.max(1);
    let exponent = value.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= digits as i32 {
        let precision = digits - 1;
        let formatted = format!("{value:.precision$e}");
        match formatted.split_once('e') {
            Some((mantissa, exp)) => {
                let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
                format!("{mantissa}e{exp}")
            }
            None => formatted,
        }
    } else {
        let decimals = (digits as i32 - 1 - exponent).max(0) as usize;
        let formatted = format!("{value:.decimals$}");
        if formatted.contains('.') {
            formatted
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_owned()
        } else {
            formatted
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use similar_asserts::assert_eq;
    use test_case::test_case;

    use super::options::GeoHint;
    use super::*;

    fn parse(options: ParsingOptions, data: Value) -> ParsedData {
        let mut parser = Parser::new(options);
        parser.parse(data.as_object().unwrap())
    }

    fn parse_default(data: Value) -> ParsedData {
        parse(ParsingOptions::default(), data)
    }

    #[test]
    fn booleans_project_to_b_t_k() {
        let parsed = parse_default(json!({"flag": true}));
        assert_eq!(
            parsed.data["flag"],
            json!({"_u": true, "_b": true, "_t": "true", "_k": "true"})
        );
        assert_eq!(parsed.data_types, vec!["flag:bool"]);
        assert_eq!(parsed.parsed_types, vec!["flag:b", "flag:k", "flag:t"]);
    }

    #[test]
    fn ints_and_floats_project_to_n_t_k() {
        let parsed = parse_default(json!({"count": 12, "height": 40.6}));
        assert_eq!(
            parsed.data["count"],
            json!({"_u": 12, "_n": 12.0, "_t": "12", "_k": "12"})
        );
        assert_eq!(
            parsed.data["height"],
            json!({"_u": 40.6, "_n": 40.6, "_t": "40.6", "_k": "40.6"})
        );
        assert_eq!(parsed.data_types, vec!["count:int", "height:float"]);
    }

    #[test]
    fn numeric_strings_gain_a_number_projection() {
        let parsed = parse_default(json!({"h": "40.6"}));
        let leaf = parsed.data["h"].as_object().unwrap();
        assert_eq!(leaf["_n"], json!(40.6));
        assert_eq!(leaf["_t"], json!("40.6"));

        // NaN and infinities never parse as numbers
        for bad in ["NaN", "inf", "-inf", "infinity"] {
            let parsed = parse_default(json!({ "h": bad }));
            assert!(!parsed.data["h"].as_object().unwrap().contains_key("_n"));
        }
    }

    #[test]
    fn keyword_truncation_counts_code_points() {
        let options = ParsingOptions::builder()
            .set_keyword_length(1)
            .build()
            .unwrap();
        let parsed = parse(options, json!({"word": "ñandu"}));
        let leaf = parsed.data["word"].as_object().unwrap();
        assert_eq!(leaf["_k"], json!("ñ"));
        assert_eq!(leaf["_t"], json!("ñandu"));
    }

    #[test_case("true", Some(true); "lowercase true")]
    #[test_case("TRUE", Some(true); "uppercase true")]
    #[test_case("Yes", Some(true); "yes")]
    #[test_case("no", Some(false); "no")]
    #[test_case("True-ish", None; "almost true is not true")]
    fn boolean_strings(raw: &str, expected: Option<bool>) {
        let parsed = parse_default(json!({ "v": raw }));
        let leaf = parsed.data["v"].as_object().unwrap();
        assert_eq!(leaf.get("_b").and_then(Value::as_bool), expected);
    }

    #[test]
    fn naive_datetimes_are_filled_with_utc() {
        let parsed = parse_default(json!({"at": "2021-03-01T10:30:00"}));
        let leaf = parsed.data["at"].as_object().unwrap();
        assert_eq!(leaf["_d"], json!(1_614_594_600_000_i64));

        let parsed = parse_default(json!({"on": "2021-03-01"}));
        let leaf = parsed.data["on"].as_object().unwrap();
        assert_eq!(leaf["_d"], json!(1_614_556_800_000_i64));
    }

    #[test]
    fn zoned_datetimes_respect_their_offset() {
        let parsed = parse_default(json!({"at": "2021-03-01T10:30:00+02:00"}));
        let leaf = parsed.data["at"].as_object().unwrap();
        assert_eq!(leaf["_d"], json!(1_614_587_400_000_i64));
    }

    #[test]
    fn date_formats_try_in_order_first_match_wins() {
        let options = ParsingOptions::builder()
            .clear_date_formats()
            .add_date_format("%d/%m/%Y")
            .add_date_format("%m/%d/%Y")
            .build()
            .unwrap();
        let parsed = parse(options, json!({"on": "02/03/2021"}));
        let leaf = parsed.data["on"].as_object().unwrap();
        // parsed as 2 March, not 3 February
        assert_eq!(leaf["_d"], json!(1_614_643_200_000_i64));
    }

    #[test]
    fn wkt_strings_become_shapes() {
        let parsed = parse_default(json!({"where": "POINT (-0.1 51.5)"}));
        let leaf = parsed.data["where"].as_object().unwrap();
        assert_eq!(leaf["_gs"], json!("POINT (-0.1 51.5)"));
        assert_eq!(leaf["_gp"], json!("POINT (-0.1 51.5)"));

        let parsed = parse_default(json!({"where": "POLYGON ((0 0, 1 0, 1 1, 0 1))"}));
        assert!(!parsed.data["where"].as_object().unwrap().contains_key("_gs"));
    }

    #[test]
    fn null_and_empty_string_leaves_have_no_projections() {
        let parsed = parse_default(json!({"a": null, "b": ""}));
        assert_eq!(parsed.data["a"], json!({"_u": null}));
        assert_eq!(parsed.data["b"], json!({"_u": ""}));
        assert_eq!(parsed.data_types, vec!["a:null", "b:str"]);
        assert!(parsed.parsed_types.is_empty());
    }

    #[test]
    fn null_slots_in_lists_keep_their_position() {
        let parsed = parse_default(json!({"xs": [1, null, 2]}));
        let list = parsed.data["xs"].as_array().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[1], Value::Null);
        assert!(parsed.data_types.contains(&"xs:null".to_owned()));
        assert!(parsed.data_types.contains(&"xs:int".to_owned()));
        assert!(parsed.data_types.contains(&"xs:list".to_owned()));
    }

    #[test]
    fn nested_paths_use_dots() {
        let parsed = parse_default(json!({"a": {"b": {"c": "x"}}}));
        assert_eq!(
            parsed.data_types,
            vec!["a:dict", "a.b:dict", "a.b.c:str"]
        );
        assert_eq!(parsed.parsed_types, vec!["a.b.c:k", "a.b.c:t"]);
    }

    #[test]
    fn geojson_maps_are_detected_below_the_root() {
        let parsed = parse_default(json!({
            "site": {"type": "Point", "coordinates": [-0.1, 51.5]},
        }));
        let site = parsed.data["site"].as_object().unwrap();
        assert_eq!(site["_gs"], json!("POINT (-0.1 51.5)"));
        assert_eq!(site["_gp"], json!("POINT (-0.1 51.5)"));
        // the original keys are still parsed as plain data
        assert!(site.contains_key("type"));
        assert!(site.contains_key("coordinates"));
        assert!(parsed.parsed_types.contains(&"site:gs".to_owned()));
    }

    #[test]
    fn the_root_map_is_never_geojson() {
        let parsed = parse_default(json!({
            "type": "Point",
            "coordinates": [-0.1, 51.5],
        }));
        assert!(!parsed.data.as_object().unwrap().contains_key("_gs"));
    }

    #[test]
    fn geo_hints_build_points_and_circles() {
        let options = ParsingOptions::builder()
            .add_geo_hint(GeoHint::new("lat", "lon").with_radius("r_m", 8))
            .build()
            .unwrap();
        let parsed = parse(options, json!({"lat": 51.5, "lon": -0.1, "r_m": 100}));
        let leaf = parsed.data["lat"].as_object().unwrap();
        assert_eq!(leaf["_gp"], json!("POINT (-0.1 51.5)"));
        let shape = leaf["_gs"].as_str().unwrap();
        assert!(shape.starts_with("POLYGON (("));
        // 4 * 8 perimeter vertices plus the closing repeat
        assert_eq!(shape.matches(',').count(), 32);
        assert!(parsed.parsed_types.contains(&"lat:gp".to_owned()));
        assert!(parsed.parsed_types.contains(&"lat:gs".to_owned()));
    }

    #[test]
    fn geo_hints_without_radius_use_the_point() {
        let options = ParsingOptions::builder()
            .add_geo_hint(GeoHint::new("lat", "lon"))
            .build()
            .unwrap();
        let parsed = parse(options, json!({"lat": "51.5", "lon": "-0.1"}));
        let leaf = parsed.data["lat"].as_object().unwrap();
        assert_eq!(leaf["_gs"], json!("POINT (-0.1 51.5)"));
    }

    #[test]
    fn geo_hints_skip_maps_missing_their_fields() {
        let options = ParsingOptions::builder()
            .add_geo_hint(GeoHint::new("lat", "lon"))
            .build()
            .unwrap();
        let parsed = parse(options, json!({"lat": 51.5, "height": 12}));
        assert!(!parsed.data["lat"].as_object().unwrap().contains_key("_gp"));
    }

    #[test]
    fn repeated_leaves_come_from_the_cache() {
        let mut parser = Parser::new(ParsingOptions::default());
        let first = parser.parse(json!({"a": "llama"}).as_object().unwrap());
        let second = parser.parse(json!({"b": "llama"}).as_object().unwrap());
        assert_eq!(first.data["a"], second.data["b"]);
        assert_eq!(parser.cache.len(), 1);
    }

    #[test_case(40.6, "40.6")]
    #[test_case(0.0, "0")]
    #[test_case(-2.5, "-2.5")]
    #[test_case(1e16, "1e16")]
    #[test_case(0.00001, "1e-5")]
    #[test_case(123456.0, "123456")]
    fn float_formatting(value: f64, expected: &str) {
        assert_eq!(format_float(value, 15), expected);
    }

    #[test]
    fn float_formatting_honours_digit_count() {
        assert_eq!(format_float(123.456, 4), "123.5");
        assert_eq!(format_float(0.30000000000000004, 15), "0.3");
    }
}
