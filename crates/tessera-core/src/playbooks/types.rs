//! Core types for playbook definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::playbooks::error::{PlaybookError, Result};
use crate::workflow::condition::Condition;

/// Locale used when neither the requested nor the default locale is available.
pub const FALLBACK_LOCALE: &str = "en";

/// Kind of playbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybookKind {
    /// A workflow invoked on behalf of a user.
    UserWorkflow,
    /// A system-level tool playbook invoked by other playbooks.
    SystemTool,
}

impl fmt::Display for PlaybookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybookKind::UserWorkflow => write!(f, "user_workflow"),
            PlaybookKind::SystemTool => write!(f, "system_tool"),
        }
    }
}

/// Reference to an external capability, written as `capability.tool_name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolRef {
    capability: String,
    tool: String,
}

impl ToolRef {
    /// Creates a tool reference from its two halves.
    pub fn new(capability: impl Into<String>, tool: impl Into<String>) -> Self {
        Self { capability: capability.into(), tool: tool.into() }
    }

    /// The capability half (`seo` in `seo.analyze_page`).
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// The tool half (`analyze_page` in `seo.analyze_page`).
    pub fn tool(&self) -> &str {
        &self.tool
    }
}

impl FromStr for ToolRef {
    type Err = PlaybookError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(capability), Some(tool), None)
                if !capability.trim().is_empty() && !tool.trim().is_empty() =>
            {
                Ok(Self::new(capability.trim(), tool.trim()))
            }
            _ => Err(PlaybookError::InvalidToolRef(s.to_string())),
        }
    }
}

impl TryFrom<String> for ToolRef {
    type Error = PlaybookError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ToolRef> for String {
    fn from(value: ToolRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ToolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.capability, self.tool)
    }
}

/// Declares that a field of a step's output is persisted as an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    /// Artifact name, unique within the playbook.
    pub name: String,
    /// Output field holding the artifact content.
    pub content_field: String,
    /// File extension for the stored content.
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    "md".to_string()
}

/// One execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    /// Step identifier, unique within the playbook.
    #[serde(rename = "id")]
    pub step_id: String,
    /// Symbolic action name (e.g. `analyze_content`).
    pub action: String,
    /// Capability the step invokes.
    #[serde(rename = "tool")]
    pub tool_ref: ToolRef,
    /// Predicate deciding whether the step runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Dispatch a job and return its id instead of waiting for a result.
    #[serde(rename = "async", default)]
    pub is_async: bool,
    /// Parameter template sent to the tool.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
    /// Artifact produced by this step, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactSpec>,
}

/// Declared type of an input parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// `obsidian://`, `workspace://`, `url://` or the `pasted_text` sentinel.
    ContentSource,
    /// One of the values listed in `values`.
    Enum,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
            ParamType::ContentSource => "content_source",
            ParamType::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// Declaration of one input parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values for `enum` parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declared type of an output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldType {
    /// Returns `true` if `value` conforms to this type. `null` never conforms.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Any => !value.is_null(),
        }
    }

    /// Object and array fields count as structured output.
    pub fn is_structured(self) -> bool {
        matches!(self, FieldType::Array | FieldType::Object)
    }
}

/// Numeric reducer for `reduce` merge policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    #[default]
    Mean,
    Sum,
    Min,
    Max,
}

/// How values for one output field are combined across step outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Later step's value replaces the earlier one.
    #[default]
    OverwriteLast,
    /// Arrays of objects unioned by an identity field.
    UnionByKey {
        key: String,
        /// Nested list fields deduplicated on key collision.
        #[serde(default)]
        dedup: Vec<String>,
        /// Numeric field keeping its maximum on key collision.
        #[serde(default)]
        max: Option<String>,
    },
    /// Numeric values reduced into this field.
    Reduce {
        #[serde(default)]
        reducer: Reducer,
        /// Source fields; defaults to the field itself.
        #[serde(default)]
        from: Vec<String>,
    },
}

/// Declaration of one output field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputField {
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: FieldType,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub merge: MergePolicy,
}

fn default_field_type() -> FieldType {
    FieldType::Any
}

fn default_true() -> bool {
    true
}

/// An immutable playbook definition loaded from a Markdown document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    pub code: String,
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: PlaybookKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_code: Option<String>,
    pub locale: String,
    pub supported_locales: Vec<String>,
    pub default_locale: String,
    #[serde(default)]
    pub required_tools: Vec<ToolRef>,
    #[serde(default)]
    pub optional_tools: Vec<ToolRef>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub input_schema: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub output_schema: BTreeMap<String, OutputField>,
    /// Output field averaged into `batch_summary.avg_score`.
    pub primary_score: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Markdown body split by `##` headings.
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
}

impl PlaybookDefinition {
    /// Validates the structural invariants of the definition.
    ///
    /// # Errors
    ///
    /// Returns error if a step references an undeclared tool, step ids collide,
    /// the version is not semver, or the locale set is inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(PlaybookError::MissingField("playbook_code".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(PlaybookError::MissingField("name".to_string()));
        }

        semver::Version::parse(&self.version).map_err(|e| PlaybookError::InvalidVersion {
            version: self.version.clone(),
            reason: e.to_string(),
        })?;

        if !self.supported_locales.contains(&self.default_locale) {
            return Err(PlaybookError::InvalidLocale(format!(
                "default_locale '{}' is not in supported_locales {:?}",
                self.default_locale, self.supported_locales
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(PlaybookError::DuplicateStep(step.step_id.clone()));
            }
            if !self.declares_tool(&step.tool_ref) {
                return Err(PlaybookError::UndeclaredTool {
                    step_id: step.step_id.clone(),
                    tool: step.tool_ref.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Checks whether the tool is listed in `required_tools` or `optional_tools`.
    pub fn declares_tool(&self, tool: &ToolRef) -> bool {
        self.required_tools.contains(tool) || self.optional_tools.contains(tool)
    }

    /// Checks whether the tool is only optional for this playbook.
    pub fn is_optional_tool(&self, tool: &ToolRef) -> bool {
        self.optional_tools.contains(tool) && !self.required_tools.contains(tool)
    }

    /// Returns `true` if any step dispatches an asynchronous job.
    pub fn has_async_steps(&self) -> bool {
        self.steps.iter().any(|step| step.is_async)
    }

    /// Capability under which artifacts of this playbook are stored.
    pub fn artifact_capability(&self) -> &str {
        self.capability_code.as_deref().unwrap_or(&self.code)
    }

    /// Looks up a body section by heading.
    pub fn section(&self, heading: &str) -> Option<&str> {
        self.sections.get(heading).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> PlaybookDefinition {
        PlaybookDefinition {
            code: "seo_optimization".to_string(),
            version: "1.0.0".to_string(),
            name: "SEO".to_string(),
            description: String::new(),
            kind: PlaybookKind::UserWorkflow,
            capability_code: None,
            locale: "zh-TW".to_string(),
            supported_locales: vec!["zh-TW".to_string(), "en".to_string()],
            default_locale: "zh-TW".to_string(),
            required_tools: vec!["seo.analyze".parse().unwrap()],
            optional_tools: vec!["geo.cite".parse().unwrap()],
            steps: vec![StepSpec {
                step_id: "analyze".to_string(),
                action: "analyze_content".to_string(),
                tool_ref: "seo.analyze".parse().unwrap(),
                condition: None,
                is_async: false,
                params: BTreeMap::new(),
                artifact: None,
            }],
            input_schema: BTreeMap::new(),
            output_schema: BTreeMap::new(),
            primary_score: "overall_score".to_string(),
            tags: vec![],
            sections: BTreeMap::new(),
        }
    }

    #[test]
    fn test_tool_ref_parse() {
        let tool: ToolRef = "seo.analyze_page".parse().unwrap();
        assert_eq!(tool.capability(), "seo");
        assert_eq!(tool.tool(), "analyze_page");
        assert_eq!(tool.to_string(), "seo.analyze_page");
    }

    #[test]
    fn test_tool_ref_rejects_malformed() {
        assert!("seo".parse::<ToolRef>().is_err());
        assert!("seo.".parse::<ToolRef>().is_err());
        assert!("a.b.c".parse::<ToolRef>().is_err());
    }

    #[test]
    fn test_validate_ok() {
        assert!(definition().validate().is_ok());
    }

    #[test]
    fn test_validate_undeclared_tool() {
        let mut def = definition();
        def.steps[0].tool_ref = "image.resize".parse().unwrap();
        assert!(matches!(def.validate(), Err(PlaybookError::UndeclaredTool { .. })));
    }

    #[test]
    fn test_validate_bad_version() {
        let mut def = definition();
        def.version = "v1".to_string();
        assert!(matches!(def.validate(), Err(PlaybookError::InvalidVersion { .. })));
    }

    #[test]
    fn test_validate_default_locale_not_supported() {
        let mut def = definition();
        def.default_locale = "ja".to_string();
        assert!(matches!(def.validate(), Err(PlaybookError::InvalidLocale(_))));
    }

    #[test]
    fn test_validate_duplicate_step() {
        let mut def = definition();
        def.steps.push(def.steps[0].clone());
        assert!(matches!(def.validate(), Err(PlaybookError::DuplicateStep(_))));
    }

    #[test]
    fn test_optional_tool() {
        let def = definition();
        assert!(def.is_optional_tool(&"geo.cite".parse().unwrap()));
        assert!(!def.is_optional_tool(&"seo.analyze".parse().unwrap()));
    }

    #[test]
    fn test_field_type_accepts() {
        assert!(FieldType::Array.accepts(&serde_json::json!([])));
        assert!(!FieldType::String.accepts(&serde_json::json!(1)));
        assert!(!FieldType::Any.accepts(&Value::Null));
    }
}
