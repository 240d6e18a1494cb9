//! Parser for playbook YAML frontmatter and markdown content.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::playbooks::error::{PlaybookError, Result};
use crate::playbooks::types::{
    FALLBACK_LOCALE, OutputField, ParamSpec, PlaybookDefinition, PlaybookKind, StepSpec, ToolRef,
};

/// Raw frontmatter block. Unknown keys are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrontMatter {
    playbook_code: String,
    version: String,
    name: String,
    kind: PlaybookKind,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    capability_code: Option<String>,
    #[serde(default)]
    locale: Option<String>,
    #[serde(default)]
    supported_locales: Vec<String>,
    #[serde(default)]
    default_locale: Option<String>,
    #[serde(default)]
    required_tools: Vec<ToolRef>,
    #[serde(default)]
    optional_tools: Vec<ToolRef>,
    #[serde(default)]
    steps: Vec<StepSpec>,
    #[serde(default)]
    input_schema: BTreeMap<String, ParamSpec>,
    #[serde(default)]
    output_schema: BTreeMap<String, OutputField>,
    #[serde(default)]
    primary_score: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Parser for playbook files with YAML frontmatter.
pub struct PlaybookParser;

impl PlaybookParser {
    /// Parse a playbook definition from markdown content with YAML frontmatter.
    ///
    /// Expected format:
    /// ```markdown
    /// ---
    /// playbook_code: seo_optimization
    /// version: 1.0.0
    /// name: SEO 優化
    /// kind: user_workflow
    /// locale: zh-TW
    /// supported_locales: [zh-TW, en]
    /// default_locale: zh-TW
    /// required_tools: [seo.analyze_content]
    /// steps:
    ///   - id: analyze
    ///     action: analyze_content
    ///     tool: seo.analyze_content
    /// ---
    ///
    /// ## 目標
    /// ...
    /// ```
    ///
    /// # Errors
    ///
    /// Returns error if frontmatter is invalid, contains unknown keys, or the
    /// resulting definition violates its invariants.
    pub fn parse(content: &str) -> Result<PlaybookDefinition> {
        let (frontmatter, body) = Self::split_frontmatter(content)?;

        // Enum-valued fields (conditions, merge policies) are written as
        // single-key maps rather than YAML `!tags`.
        let front: FrontMatter = serde_yaml::with::singleton_map_recursive::deserialize(
            serde_yaml::Deserializer::from_str(&frontmatter),
        )
        .map_err(|e| PlaybookError::ParseError { path: None, source: e })?;

        let definition = Self::build(front, &body);
        definition.validate()?;
        Ok(definition)
    }

    /// Parse a playbook definition from a file.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<PlaybookDefinition> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| PlaybookError::LoadError { path: path.to_path_buf(), source: e })?;

        Self::parse(&content).map_err(|e| match e {
            PlaybookError::ParseError { source, .. } => {
                PlaybookError::ParseError { path: Some(path.to_path_buf()), source }
            }
            other => other,
        })
    }

    fn build(front: FrontMatter, body: &str) -> PlaybookDefinition {
        let sections = Self::split_sections(body);

        let default_locale = front
            .default_locale
            .or_else(|| front.locale.clone())
            .unwrap_or_else(|| FALLBACK_LOCALE.to_string());
        let locale = front.locale.unwrap_or_else(|| default_locale.clone());
        let supported_locales = if front.supported_locales.is_empty() {
            vec![default_locale.clone()]
        } else {
            front.supported_locales
        };

        // The goal section doubles as the description when none is given.
        let description = front
            .description
            .or_else(|| {
                ["目標", "Goal", "Goals"]
                    .iter()
                    .find_map(|heading| sections.get(*heading))
                    .map(|text| text.lines().next().unwrap_or_default().trim().to_string())
            })
            .unwrap_or_default();

        PlaybookDefinition {
            code: front.playbook_code,
            version: front.version,
            name: front.name,
            description,
            kind: front.kind,
            capability_code: front.capability_code,
            locale,
            supported_locales,
            default_locale,
            required_tools: front.required_tools,
            optional_tools: front.optional_tools,
            steps: front.steps,
            input_schema: front.input_schema,
            output_schema: front.output_schema,
            primary_score: front.primary_score.unwrap_or_else(|| "overall_score".to_string()),
            tags: front.tags,
            sections,
        }
    }

    /// Split YAML frontmatter from markdown content.
    fn split_frontmatter(content: &str) -> Result<(String, String)> {
        let trimmed = content.trim_start_matches('\u{feff}').trim_start();

        if !trimmed.starts_with("---") {
            return Err(PlaybookError::InvalidFrontmatter(
                "content does not start with '---'".to_string(),
            ));
        }

        let after_first = &trimmed[3..];
        let end_idx = after_first.find("\n---").ok_or_else(|| {
            PlaybookError::InvalidFrontmatter("no closing '---' delimiter found".to_string())
        })?;

        let frontmatter = &after_first[..end_idx];
        let body = &after_first[end_idx + 4..];

        Ok((frontmatter.to_string(), body.trim().to_string()))
    }

    /// Split the markdown body into `## heading` sections.
    fn split_sections(body: &str) -> BTreeMap<String, String> {
        let mut sections = BTreeMap::new();
        let mut current: Option<(String, Vec<&str>)> = None;

        for line in body.lines() {
            if let Some(heading) = line.strip_prefix("## ") {
                if let Some((title, lines)) = current.take() {
                    sections.insert(title, lines.join("\n").trim().to_string());
                }
                current = Some((heading.trim().to_string(), Vec::new()));
            } else if let Some((_, lines)) = current.as_mut() {
                lines.push(line);
            }
        }

        if let Some((title, lines)) = current {
            sections.insert(title, lines.join("\n").trim().to_string());
        }

        sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbooks::types::{MergePolicy, ParamType, Reducer};
    use crate::workflow::condition::Condition;

    const VALID: &str = r#"---
playbook_code: seo_optimization
version: 1.2.0
name: SEO 優化
kind: user_workflow
capability_code: seo
locale: zh-TW
supported_locales: [zh-TW, en]
default_locale: zh-TW
required_tools: [seo.analyze_content, seo.rewrite]
steps:
  - id: analyze
    action: analyze_content
    tool: seo.analyze_content
  - id: rewrite
    action: rewrite_content
    tool: seo.rewrite
    condition:
      not_skipped: rewrite
input_schema:
  content_source:
    type: content_source
    required: true
  citation_mode:
    type: enum
    values: [none, light, strict]
    default: light
output_schema:
  content_md:
    type: string
  structured_data:
    type: array
    merge:
      union_by_key:
        key: "@type"
---
## 目標
優化內容以提升搜尋能見度。

## 輸入
- content_source
"#;

    #[test]
    fn test_parse_valid_playbook() {
        let def = PlaybookParser::parse(VALID).unwrap();
        assert_eq!(def.code, "seo_optimization");
        assert_eq!(def.version, "1.2.0");
        assert_eq!(def.locale, "zh-TW");
        assert_eq!(def.steps.len(), 2);
        assert!(def.steps[1].condition.is_some());
        assert_eq!(def.input_schema["content_source"].param_type, ParamType::ContentSource);
        assert!(matches!(
            def.output_schema["structured_data"].merge,
            MergePolicy::UnionByKey { ref key, .. } if key == "@type"
        ));
        assert_eq!(def.description, "優化內容以提升搜尋能見度。");
        assert!(def.section("輸入").unwrap().contains("content_source"));
        assert_eq!(def.primary_score, "overall_score");
    }

    #[test]
    fn test_parse_map_form_conditions_and_reduce() {
        let content = r"---
playbook_code: scoring
version: 1.0.0
name: Scoring
kind: system_tool
required_tools: [seo.score]
steps:
  - id: score
    action: score
    tool: seo.score
    condition:
      all:
        - always
        - not:
            flag: dry_run
output_schema:
  overall_score:
    type: number
    merge:
      reduce:
        reducer: mean
        from: [seo_score, geo_score]
---
";
        let def = PlaybookParser::parse(content).unwrap();
        assert!(matches!(
            def.steps[0].condition,
            Some(Condition::All(ref inner)) if inner.len() == 2
        ));
        assert_eq!(
            def.output_schema["overall_score"].merge,
            MergePolicy::Reduce {
                reducer: Reducer::Mean,
                from: vec!["seo_score".to_string(), "geo_score".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_missing_frontmatter() {
        let result = PlaybookParser::parse("# Just markdown, no frontmatter");
        assert!(matches!(result.unwrap_err(), PlaybookError::InvalidFrontmatter(_)));
    }

    #[test]
    fn test_parse_unterminated_frontmatter() {
        let result = PlaybookParser::parse("---\nplaybook_code: x\n");
        assert!(matches!(result.unwrap_err(), PlaybookError::InvalidFrontmatter(_)));
    }

    #[test]
    fn test_parse_missing_required_key() {
        let content = "---\nplaybook_code: x\nversion: 1.0.0\nkind: system_tool\n---\n";
        assert!(matches!(
            PlaybookParser::parse(content).unwrap_err(),
            PlaybookError::ParseError { .. }
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_key() {
        let content =
            "---\nplaybook_code: x\nversion: 1.0.0\nname: X\nkind: system_tool\nowner: me\n---\n";
        assert!(matches!(
            PlaybookParser::parse(content).unwrap_err(),
            PlaybookError::ParseError { .. }
        ));
    }

    #[test]
    fn test_parse_dangling_tool_reference() {
        let content = r"---
playbook_code: x
version: 1.0.0
name: X
kind: system_tool
required_tools: [a.b]
steps:
  - id: s1
    action: run
    tool: c.d
---
";
        assert!(matches!(
            PlaybookParser::parse(content).unwrap_err(),
            PlaybookError::UndeclaredTool { .. }
        ));
    }

    #[test]
    fn test_parse_locale_defaults() {
        let content = "---\nplaybook_code: x\nversion: 0.1.0\nname: X\nkind: system_tool\n---\n";
        let def = PlaybookParser::parse(content).unwrap();
        assert_eq!(def.locale, "en");
        assert_eq!(def.default_locale, "en");
        assert_eq!(def.supported_locales, vec!["en".to_string()]);
    }

    #[test]
    fn test_parse_file_sets_path_on_parse_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("broken.md");
        std::fs::write(&path, "---\nplaybook_code: [unclosed\n---\n").unwrap();

        match PlaybookParser::parse_file(&path).unwrap_err() {
            PlaybookError::ParseError { path: Some(p), .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {other}"),
        }
    }
}
