//! Input binding: validates and coerces caller parameters against a
//! playbook's `input_schema` before execution starts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::playbooks::types::{ParamSpec, ParamType};

/// Literal accepted by `content_source` for inline content.
pub const PASTED_TEXT: &str = "pasted_text";

static CONTENT_SOURCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(obsidian|workspace|url)://(\S+)$").expect("content source pattern is valid")
});

/// Errors produced while binding inputs. Always names the offending field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// A required parameter was not supplied.
    #[error("Missing required input '{0}'")]
    MissingField(String),

    /// A parameter could not be coerced to its declared type.
    #[error("Invalid value for input '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl BindingError {
    /// Name of the offending input field.
    pub fn field(&self) -> &str {
        match self {
            BindingError::MissingField(field) | BindingError::InvalidValue { field, .. } => field,
        }
    }

    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        BindingError::InvalidValue { field: field.to_string(), reason: reason.into() }
    }
}

/// Result type alias for binding operations.
pub type Result<T> = std::result::Result<T, BindingError>;

macro_rules! pattern_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Input field carrying this pattern parameter.
            pub const FIELD: &'static str = $field;

            /// Wire name of the value.
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = BindingError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BindingError::invalid(
                        $field,
                        format!("'{}' is not one of [{}]", other, [$($text),+].join(", ")),
                    )),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pattern_enum!(
    /// Whether an invocation processes one content item or many.
    RunMode, "run_mode", {
        Single => "single",
        Batch => "batch",
    }
);

pattern_enum!(
    /// Publication status of generated content.
    ContentStatus, "content_status", {
        Draft => "draft",
        InReview => "in_review",
        Published => "published",
        Archived => "archived",
    }
);

pattern_enum!(
    /// How strictly claims must be tied to sources.
    CitationMode, "citation_mode", {
        None => "none",
        Light => "light",
        Strict => "strict",
    }
);

impl Default for RunMode {
    fn default() -> Self {
        Self::Single
    }
}

impl Default for ContentStatus {
    fn default() -> Self {
        Self::Draft
    }
}

impl Default for CitationMode {
    fn default() -> Self {
        Self::None
    }
}

/// Where a playbook reads its content from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    Obsidian(String),
    Workspace(String),
    Url(String),
    PastedText,
}

impl FromStr for ContentSource {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self> {
        if s == PASTED_TEXT {
            return Ok(Self::PastedText);
        }
        let captures = CONTENT_SOURCE_RE.captures(s).ok_or_else(|| {
            BindingError::invalid(
                "content_source",
                format!(
                    "'{s}' must start with obsidian://, workspace:// or url://, or be '{PASTED_TEXT}'"
                ),
            )
        })?;
        let location = captures[2].to_string();
        Ok(match &captures[1] {
            "obsidian" => Self::Obsidian(location),
            "workspace" => Self::Workspace(location),
            _ => Self::Url(location),
        })
    }
}

/// Inputs that passed schema binding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundInputs {
    values: Map<String, Value>,
}

impl BoundInputs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    fn parsed<T: FromStr + Default>(&self, field: &str) -> T {
        self.values
            .get(field)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn run_mode(&self) -> RunMode {
        self.parsed(RunMode::FIELD)
    }

    pub fn content_status(&self) -> ContentStatus {
        self.parsed(ContentStatus::FIELD)
    }

    pub fn citation_mode(&self) -> CitationMode {
        self.parsed(CitationMode::FIELD)
    }

    /// Step ids the caller asked to skip.
    pub fn skip_steps(&self) -> Vec<&str> {
        self.values
            .get("skip_steps")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn content_source(&self) -> Option<ContentSource> {
        self.values.get("content_source").and_then(Value::as_str).and_then(|s| s.parse().ok())
    }
}

/// Bind raw caller inputs against a declared schema.
///
/// Declared parameters are coerced to their type, absent optional parameters
/// take their default, undeclared inputs pass through unchanged. The
/// recognized pattern parameters (`run_mode`, `content_status`,
/// `citation_mode`) are validated whenever present.
///
/// # Errors
///
/// Returns a [`BindingError`] naming the first offending field.
pub fn bind(schema: &BTreeMap<String, ParamSpec>, raw: &Map<String, Value>) -> Result<BoundInputs> {
    let mut values = Map::new();

    for (name, value) in raw {
        if !schema.contains_key(name) && !value.is_null() {
            values.insert(name.clone(), value.clone());
        }
    }

    for (name, spec) in schema {
        match raw.get(name).filter(|v| !v.is_null()) {
            Some(value) => {
                values.insert(name.clone(), coerce(name, spec, value)?);
            }
            None if spec.required => return Err(BindingError::MissingField(name.clone())),
            None => {
                if let Some(default) = &spec.default {
                    values.insert(name.clone(), coerce(name, spec, default)?);
                }
            }
        }
    }

    validate_patterns(&values)?;

    Ok(BoundInputs { values })
}

fn validate_patterns(values: &Map<String, Value>) -> Result<()> {
    for field in [RunMode::FIELD, ContentStatus::FIELD, CitationMode::FIELD] {
        let Some(value) = values.get(field) else { continue };
        let text = value
            .as_str()
            .ok_or_else(|| BindingError::invalid(field, "expected a string"))?;
        match field {
            RunMode::FIELD => text.parse::<RunMode>().map(drop)?,
            ContentStatus::FIELD => text.parse::<ContentStatus>().map(drop)?,
            _ => text.parse::<CitationMode>().map(drop)?,
        }
    }

    if let Some(skip) = values.get("skip_steps") {
        let valid = skip.as_array().is_some_and(|items| items.iter().all(Value::is_string));
        if !valid {
            return Err(BindingError::invalid("skip_steps", "expected a list of step ids"));
        }
    }

    Ok(())
}

fn coerce(field: &str, spec: &ParamSpec, value: &Value) -> Result<Value> {
    let mismatch = || BindingError::invalid(field, format!("expected {}, got {value}", spec.param_type));

    match spec.param_type {
        ParamType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(mismatch()),
        },
        ParamType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| Value::from(f as i64))
                .ok_or_else(mismatch),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
        ParamType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        ParamType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
            _ => Err(mismatch()),
        },
        ParamType::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            Value::Object(_) => Err(mismatch()),
            scalar => Ok(Value::Array(vec![scalar.clone()])),
        },
        ParamType::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err(mismatch()),
        },
        ParamType::ContentSource => {
            let text = value.as_str().ok_or_else(mismatch)?;
            text.parse::<ContentSource>().map_err(|e| match e {
                BindingError::InvalidValue { reason, .. } => BindingError::invalid(field, reason),
                other => other,
            })?;
            Ok(value.clone())
        }
        ParamType::Enum => {
            let text = value.as_str().ok_or_else(mismatch)?;
            if spec.values.iter().any(|allowed| allowed == text) {
                Ok(value.clone())
            } else {
                Err(BindingError::invalid(
                    field,
                    format!("'{text}' is not one of [{}]", spec.values.join(", ")),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param(param_type: ParamType, required: bool, default: Option<Value>) -> ParamSpec {
        ParamSpec { param_type, required, default, values: vec![], description: None }
    }

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_bind_applies_defaults() {
        let mut schema = BTreeMap::new();
        schema.insert("limit".to_string(), param(ParamType::Integer, false, Some(json!(10))));
        schema.insert("tone".to_string(), param(ParamType::String, false, None));

        let bound = bind(&schema, &Map::new()).unwrap();
        assert_eq!(bound.get("limit"), Some(&json!(10)));
        assert!(bound.get("tone").is_none());
    }

    #[test]
    fn test_bind_missing_required() {
        let mut schema = BTreeMap::new();
        schema.insert("content_source".to_string(), param(ParamType::ContentSource, true, None));

        let err = bind(&schema, &Map::new()).unwrap_err();
        assert_eq!(err, BindingError::MissingField("content_source".to_string()));
        assert_eq!(err.field(), "content_source");
    }

    #[test]
    fn test_bind_coercions() {
        let mut schema = BTreeMap::new();
        schema.insert("count".to_string(), param(ParamType::Integer, true, None));
        schema.insert("ratio".to_string(), param(ParamType::Number, true, None));
        schema.insert("dry".to_string(), param(ParamType::Boolean, true, None));
        schema.insert("engines".to_string(), param(ParamType::Array, true, None));

        let bound = bind(
            &schema,
            &raw(json!({"count": "3", "ratio": "0.5", "dry": "TRUE", "engines": "perplexity"})),
        )
        .unwrap();

        assert_eq!(bound.get("count"), Some(&json!(3)));
        assert_eq!(bound.get("ratio"), Some(&json!(0.5)));
        assert_eq!(bound.get("dry"), Some(&json!(true)));
        assert_eq!(bound.get("engines"), Some(&json!(["perplexity"])));
    }

    #[test]
    fn test_bind_type_mismatch_names_field() {
        let mut schema = BTreeMap::new();
        schema.insert("count".to_string(), param(ParamType::Integer, true, None));

        let err = bind(&schema, &raw(json!({"count": "many"}))).unwrap_err();
        assert_eq!(err.field(), "count");
    }

    #[test]
    fn test_content_source_patterns() {
        let mut schema = BTreeMap::new();
        schema.insert("content_source".to_string(), param(ParamType::ContentSource, true, None));

        for ok in ["obsidian://vault/a.md", "workspace://docs/b.md", "url://example.com", "pasted_text"] {
            assert!(bind(&schema, &raw(json!({ "content_source": ok }))).is_ok(), "{ok}");
        }
        for bad in ["https://example.com", "obsidian://", "text"] {
            let err = bind(&schema, &raw(json!({ "content_source": bad }))).unwrap_err();
            assert_eq!(err.field(), "content_source", "{bad}");
        }

        assert_eq!(
            "obsidian://vault/a.md".parse::<ContentSource>().unwrap(),
            ContentSource::Obsidian("vault/a.md".to_string())
        );
    }

    #[test]
    fn test_enum_values() {
        let mut schema = BTreeMap::new();
        let mut spec = param(ParamType::Enum, false, Some(json!("casual")));
        spec.values = vec!["casual".to_string(), "formal".to_string()];
        schema.insert("tone".to_string(), spec);

        assert_eq!(bind(&schema, &Map::new()).unwrap().get("tone"), Some(&json!("casual")));
        assert!(bind(&schema, &raw(json!({"tone": "angry"}))).is_err());
    }

    #[test]
    fn test_pattern_parameters_validated_even_when_undeclared() {
        let schema = BTreeMap::new();
        let bound = bind(
            &schema,
            &raw(json!({"run_mode": "batch", "content_status": "published", "citation_mode": "strict"})),
        )
        .unwrap();
        assert_eq!(bound.run_mode(), RunMode::Batch);
        assert_eq!(bound.content_status(), ContentStatus::Published);
        assert_eq!(bound.citation_mode(), CitationMode::Strict);

        let err = bind(&schema, &raw(json!({"content_status": "live"}))).unwrap_err();
        assert_eq!(err.field(), "content_status");
        let err = bind(&schema, &raw(json!({"citation_mode": "loose"}))).unwrap_err();
        assert_eq!(err.field(), "citation_mode");
    }

    #[test]
    fn test_pattern_defaults() {
        let bound = bind(&BTreeMap::new(), &Map::new()).unwrap();
        assert_eq!(bound.run_mode(), RunMode::Single);
        assert_eq!(bound.content_status(), ContentStatus::Draft);
        assert_eq!(bound.citation_mode(), CitationMode::None);
    }

    #[test]
    fn test_skip_steps() {
        let bound = bind(&BTreeMap::new(), &raw(json!({"skip_steps": ["rewrite"]}))).unwrap();
        assert_eq!(bound.skip_steps(), vec!["rewrite"]);
        assert!(bind(&BTreeMap::new(), &raw(json!({"skip_steps": [1]}))).is_err());
    }
}
