//! Parsing options and their builder.
//!
//! Options are persisted on the per-database status document and versioned
//! with the same clock as record data, so changing them is an event the sync
//! engine can react to.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

/// The search engine's hard limit on keyword bytes.
pub const MAX_KEYWORD_LENGTH: usize = 32766;

pub const DEFAULT_KEYWORD_LENGTH: usize = 8191;
pub const DEFAULT_FLOAT_FORMAT: &str = "{0:.15g}";

/// ISO date, naive ISO datetime, ISO datetime with zone. First match wins.
pub const DEFAULT_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
];

pub const DEFAULT_TRUE_VALUES: &[&str] = &["true", "yes", "y"];
pub const DEFAULT_FALSE_VALUES: &[&str] = &["false", "no", "n"];

/// Instructs the parser to build geo values out of plain numeric fields.
/// Applied to every map in a record's data tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeoHint {
    pub lat_field: String,
    pub lon_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_field: Option<String>,
    #[serde(default = "default_segments")]
    pub segments: u16,
}

fn default_segments() -> u16 {
    16
}

impl GeoHint {
    pub fn new(lat_field: impl Into<String>, lon_field: impl Into<String>) -> Self {
        GeoHint {
            lat_field: lat_field.into(),
            lon_field: lon_field.into(),
            radius_field: None,
            segments: default_segments(),
        }
    }

    pub fn with_radius(mut self, radius_field: impl Into<String>, segments: u16) -> Self {
        self.radius_field = Some(radius_field.into());
        self.segments = segments;
        self
    }
}

/// How raw leaf values become typed search projections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsingOptions {
    /// Maximum number of characters stored in `_k` keyword projections.
    pub keyword_length: usize,

    /// Significant-digit template used to render floats as text, e.g.
    /// `"{0:.15g}"`.
    pub float_format: String,

    /// Ordered date formats (strftime patterns) tried against string leaves.
    pub date_formats: Vec<String>,

    /// Strings (case-insensitive) parsed to boolean true/false.
    pub true_values: BTreeSet<String>,
    pub false_values: BTreeSet<String>,

    /// Geo hints applied to every map in the tree.
    pub geo_hints: BTreeSet<GeoHint>,
}

impl Default for ParsingOptions {
    fn default() -> Self {
        ParsingOptionsBuilder::new()
            .build()
            .expect("default parsing options are valid")
    }
}

impl ParsingOptions {
    pub fn builder() -> ParsingOptionsBuilder {
        ParsingOptionsBuilder::new()
    }

    /// The number of significant digits encoded in `float_format`.
    pub fn float_digits(&self) -> usize {
        parse_float_format(&self.float_format).unwrap_or(15)
    }
}

/// Extracts the digit count from a `"{0:.15g}"` style template.
fn parse_float_format(format: &str) -> Option<usize> {
    let inner = format
        .strip_prefix("{0:.")
        .or_else(|| format.strip_prefix("{:."))?;
    let digits: usize = inner.strip_suffix("g}")?.parse().ok()?;
    (1..=17).contains(&digits).then_some(digits)
}

#[derive(Debug, Clone)]
pub struct ParsingOptionsBuilder {
    keyword_length: usize,
    float_format: String,
    date_formats: Vec<String>,
    true_values: BTreeSet<String>,
    false_values: BTreeSet<String>,
    geo_hints: BTreeSet<GeoHint>,
}

impl Default for ParsingOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ParsingOptionsBuilder {
    pub fn new() -> Self {
        ParsingOptionsBuilder {
            keyword_length: DEFAULT_KEYWORD_LENGTH,
            float_format: DEFAULT_FLOAT_FORMAT.to_owned(),
            date_formats: DEFAULT_DATE_FORMATS.iter().map(|s| (*s).to_owned()).collect(),
            true_values: DEFAULT_TRUE_VALUES.iter().map(|s| (*s).to_owned()).collect(),
            false_values: DEFAULT_FALSE_VALUES.iter().map(|s| (*s).to_owned()).collect(),
            geo_hints: BTreeSet::new(),
        }
    }

    pub fn set_keyword_length(mut self, length: usize) -> Self {
        self.keyword_length = length;
        self
    }

    pub fn set_float_format(mut self, format: impl Into<String>) -> Self {
        self.float_format = format.into();
        self
    }

    pub fn add_date_format(mut self, format: impl Into<String>) -> Self {
        self.date_formats.push(format.into());
        self
    }

    pub fn clear_date_formats(mut self) -> Self {
        self.date_formats.clear();
        self
    }

    pub fn reset_date_formats(mut self) -> Self {
        self.date_formats = DEFAULT_DATE_FORMATS.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    pub fn add_true_value(mut self, value: impl Into<String>) -> Self {
        self.true_values.insert(value.into().to_lowercase());
        self
    }

    pub fn add_false_value(mut self, value: impl Into<String>) -> Self {
        self.false_values.insert(value.into().to_lowercase());
        self
    }

    pub fn add_geo_hint(mut self, hint: GeoHint) -> Self {
        self.geo_hints.insert(hint);
        self
    }

    pub fn clear_geo_hints(mut self) -> Self {
        self.geo_hints.clear();
        self
    }

    pub fn build(self) -> Result<ParsingOptions, ValidationError> {
        if self.keyword_length == 0 || self.keyword_length > MAX_KEYWORD_LENGTH {
            return Err(ValidationError::KeywordLength(self.keyword_length));
        }
        if parse_float_format(&self.float_format).is_none() {
            return Err(ValidationError::FloatFormat(self.float_format));
        }
        let mut lat_fields = BTreeSet::new();
        for hint in &self.geo_hints {
            if hint.segments < 3 {
                return Err(ValidationError::GeoHintSegments(hint.segments));
            }
            if !lat_fields.insert(&hint.lat_field) {
                return Err(ValidationError::DuplicateGeoHint(hint.lat_field.clone()));
            }
        }
        Ok(ParsingOptions {
            keyword_length: self.keyword_length,
            float_format: self.float_format,
            date_formats: self.date_formats,
            true_values: self.true_values,
            false_values: self.false_values,
            geo_hints: self.geo_hints,
        })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(1 => true; "smallest allowed")]
    #[test_case(8191 => true; "default")]
    #[test_case(32766 => true; "largest allowed")]
    #[test_case(0 => false; "zero rejected")]
    #[test_case(32767 => false; "over the engine limit")]
    fn keyword_length_bounds(length: usize) -> bool {
        ParsingOptions::builder()
            .set_keyword_length(length)
            .build()
            .is_ok()
    }

    #[test]
    fn float_format_template_is_validated() {
        assert!(ParsingOptions::builder()
            .set_float_format("{0:.6g}")
            .build()
            .is_ok());
        assert!(ParsingOptions::builder()
            .set_float_format("%.15f")
            .build()
            .is_err());
        assert_eq!(ParsingOptions::default().float_digits(), 15);
    }

    #[test]
    fn duplicate_lat_fields_are_rejected() {
        let result = ParsingOptions::builder()
            .add_geo_hint(GeoHint::new("lat", "lon"))
            .add_geo_hint(GeoHint::new("lat", "lng"))
            .build();
        assert!(matches!(result, Err(ValidationError::DuplicateGeoHint(_))));
    }

    #[test]
    fn date_formats_can_be_cleared_and_reset() {
        let options = ParsingOptions::builder()
            .clear_date_formats()
            .add_date_format("%d/%m/%Y")
            .build()
            .unwrap();
        assert_eq!(options.date_formats, vec!["%d/%m/%Y".to_owned()]);

        let options = ParsingOptions::builder()
            .clear_date_formats()
            .reset_date_formats()
            .build()
            .unwrap();
        assert_eq!(options.date_formats.len(), DEFAULT_DATE_FORMATS.len());
    }

    #[test]
    fn true_false_values_are_lowercased() {
        let options = ParsingOptions::builder().add_true_value("AYE").build().unwrap();
        assert!(options.true_values.contains("aye"));
    }

    #[test]
    fn options_roundtrip_through_json() {
        let options = ParsingOptions::builder()
            .add_geo_hint(GeoHint::new("lat", "lon").with_radius("r_m", 8))
            .build()
            .unwrap();
        let encoded = serde_json::to_value(&options).unwrap();
        let decoded: ParsingOptions = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, options);
    }
}
