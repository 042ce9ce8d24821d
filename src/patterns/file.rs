//! Declarative pattern file formats.
//!
//! Two shapes are accepted on disk: a flat `"patterns": [...]` list, and
//! top-level sections whose values map pattern name to the same record.
//! Both normalise to one internal representation here; nothing past this
//! module sees the difference.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level keys that are not pattern sections.
const RESERVED_KEYS: &[&str] = &[
    "metadata",
    "entity_types",
    "patterns",
    "dependencies",
    "validation",
    "quality_metrics",
    "testing",
];

/// File-level metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMetadata {
    #[serde(default)]
    pub pattern_type: Option<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub court_level: Option<String>,
    #[serde(default)]
    pub bluebook_compliance: Option<String>,
    #[serde(default)]
    pub pattern_version: Option<String>,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Range checks a pattern may declare for its captured components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_volume: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_volume: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_page: Option<u32>,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        self.min_year.is_none()
            && self.max_year.is_none()
            && self.min_volume.is_none()
            && self.max_volume.is_none()
            && self.min_page.is_none()
            && self.max_page.is_none()
    }
}

/// A single pattern record as written in a file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPattern {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "pattern")]
    pub match_expression: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub components: HashMap<String, String>,
    #[serde(default)]
    pub examples: Vec<String>,
    /// Declared entity types: a single string or a list; the first entry
    /// wins when several are declared.
    #[serde(default)]
    pub entity_types: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub validation: ValidationRules,
}

impl RawPattern {
    /// The declared entity type, if any.
    pub fn declared_entity_type(&self) -> Option<String> {
        match &self.entity_types {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Array(items) => items
                .iter()
                .find_map(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => None,
        }
    }
}

/// A pattern record plus where it came from inside the file.
#[derive(Debug, Clone)]
pub struct NormalizedPattern {
    /// Section name (`"patterns"` for the flat form).
    pub section: String,
    pub name: String,
    pub record: RawPattern,
}

/// One parsed pattern file, shape differences resolved.
#[derive(Debug, Clone)]
pub struct NormalizedFile {
    pub metadata: RawMetadata,
    pub patterns: Vec<NormalizedPattern>,
    /// Group-level dependencies (`dependencies` or `dependencies.requires`).
    pub dependencies: Vec<String>,
}

/// Parse a pattern file body, accepting both the flat and sectioned shapes.
pub fn parse_pattern_file(content: &str) -> anyhow::Result<NormalizedFile> {
    let root: serde_json::Value = serde_json::from_str(content)?;
    let obj = root
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("pattern file root must be an object"))?;

    let metadata: RawMetadata = obj
        .get("metadata")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .unwrap_or_default()
        .unwrap_or_default();

    let dependencies = parse_group_dependencies(obj.get("dependencies"));

    let mut patterns = Vec::new();

    // Flat form
    if let Some(serde_json::Value::Array(items)) = obj.get("patterns") {
        for (idx, item) in items.iter().enumerate() {
            let Ok(record) = serde_json::from_value::<RawPattern>(item.clone()) else {
                anyhow::bail!("invalid pattern record at patterns[{}]", idx);
            };
            let name = record
                .name
                .clone()
                .unwrap_or_else(|| format!("pattern_{}", idx));
            patterns.push(NormalizedPattern {
                section: "patterns".to_string(),
                name,
                record,
            });
        }
    }

    // Sectioned form: any other top-level object whose values are pattern
    // records keyed by name.
    for (section, value) in obj {
        if RESERVED_KEYS.contains(&section.as_str()) {
            continue;
        }
        let Some(section_map) = value.as_object() else {
            continue;
        };

        for (name, pattern_value) in section_map {
            if !pattern_value.is_object() {
                continue;
            }
            let Ok(record) = serde_json::from_value::<RawPattern>(pattern_value.clone()) else {
                anyhow::bail!("invalid pattern record at {}.{}", section, name);
            };
            patterns.push(NormalizedPattern {
                section: section.clone(),
                name: name.clone(),
                record,
            });
        }
    }

    Ok(NormalizedFile {
        metadata,
        patterns,
        dependencies,
    })
}

fn parse_group_dependencies(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect(),
        Some(serde_json::Value::Object(map)) => match map.get("requires") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

/// A relationship pattern record as written in a relationship file.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRelationshipPattern {
    pub relationship_type: String,
    pub source_entity: String,
    pub target_entity: String,
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
}

/// Relationship files use the flat form only.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRelationshipFile {
    #[serde(default)]
    pub metadata: RawMetadata,
    pub patterns: Vec<RawRelationshipPattern>,
}

pub fn parse_relationship_file(content: &str) -> anyhow::Result<RawRelationshipFile> {
    Ok(serde_json::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_form() {
        let content = r#"{
            "metadata": {"pattern_type": "courts", "jurisdiction": "federal"},
            "patterns": [
                {
                    "name": "supreme_court",
                    "match_expression": "Supreme Court of the United States",
                    "confidence": 0.95,
                    "entity_types": ["COURT"],
                    "examples": ["Supreme Court of the United States"]
                }
            ]
        }"#;

        let file = parse_pattern_file(content).unwrap();
        assert_eq!(file.metadata.pattern_type.as_deref(), Some("courts"));
        assert_eq!(file.patterns.len(), 1);
        assert_eq!(file.patterns[0].name, "supreme_court");
        assert_eq!(file.patterns[0].section, "patterns");
        assert_eq!(
            file.patterns[0].record.declared_entity_type().as_deref(),
            Some("COURT")
        );
    }

    #[test]
    fn test_sectioned_form() {
        let content = r#"{
            "metadata": {"pattern_type": "judges", "jurisdiction": "federal"},
            "judges": {
                "district_judge": {
                    "pattern": "Judge\\s+[A-Z][a-z]+",
                    "confidence": 0.85
                },
                "chief_judge": {
                    "pattern": "Chief Judge\\s+[A-Z][a-z]+",
                    "confidence": 0.9
                }
            }
        }"#;

        let file = parse_pattern_file(content).unwrap();
        assert_eq!(file.patterns.len(), 2);
        let names: Vec<&str> = file.patterns.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"district_judge"));
        assert!(names.contains(&"chief_judge"));
        assert!(file.patterns.iter().all(|p| p.section == "judges"));
    }

    #[test]
    fn test_pattern_alias_for_match_expression() {
        let content = r#"{
            "patterns": [{"name": "x", "pattern": "abc", "confidence": 0.5}]
        }"#;
        let file = parse_pattern_file(content).unwrap();
        assert_eq!(file.patterns[0].record.match_expression, "abc");
    }

    #[test]
    fn test_unnamed_flat_pattern_gets_generated_name() {
        let content = r#"{"patterns": [{"match_expression": "abc"}]}"#;
        let file = parse_pattern_file(content).unwrap();
        assert_eq!(file.patterns[0].name, "pattern_0");
    }

    #[test]
    fn test_group_dependencies_both_shapes() {
        let list = r#"{"dependencies": ["a.b"], "patterns": []}"#;
        assert_eq!(parse_pattern_file(list).unwrap().dependencies, vec!["a.b"]);

        let map = r#"{"dependencies": {"requires": ["c.d"]}, "patterns": []}"#;
        assert_eq!(parse_pattern_file(map).unwrap().dependencies, vec!["c.d"]);
    }

    #[test]
    fn test_entity_types_string_or_list() {
        let content = r#"{
            "patterns": [
                {"name": "a", "match_expression": "x", "entity_types": "JUDGE"},
                {"name": "b", "match_expression": "y", "entity_types": ["COURT", "JUDGE"]},
                {"name": "c", "match_expression": "z"}
            ]
        }"#;
        let file = parse_pattern_file(content).unwrap();
        assert_eq!(
            file.patterns[0].record.declared_entity_type().as_deref(),
            Some("JUDGE")
        );
        assert_eq!(
            file.patterns[1].record.declared_entity_type().as_deref(),
            Some("COURT")
        );
        assert_eq!(file.patterns[2].record.declared_entity_type(), None);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        assert!(parse_pattern_file("not json").is_err());
        assert!(parse_pattern_file("[1, 2, 3]").is_err());
        assert!(parse_pattern_file(r#"{"patterns": [{"name": "x"}]}"#).is_err());
    }

    #[test]
    fn test_relationship_file() {
        let content = r#"{
            "metadata": {"pattern_type": "relationships"},
            "patterns": [
                {
                    "relationship_type": "PRESIDES_OVER",
                    "source_entity": "JUDGE",
                    "target_entity": "CASE_NUMBER",
                    "indicators": ["presiding", "before"],
                    "bidirectional": false,
                    "confidence": 0.85
                }
            ]
        }"#;

        let file = parse_relationship_file(content).unwrap();
        assert_eq!(file.patterns.len(), 1);
        assert_eq!(file.patterns[0].relationship_type, "PRESIDES_OVER");
        assert!(!file.patterns[0].bidirectional);
    }

    #[test]
    fn test_validation_rules() {
        let content = r#"{
            "patterns": [{
                "name": "cite",
                "match_expression": "\\d+ U\\.S\\. \\d+",
                "validation": {"min_year": 1790, "max_year": 2030, "min_volume": 1}
            }]
        }"#;
        let file = parse_pattern_file(content).unwrap();
        let rules = &file.patterns[0].record.validation;
        assert_eq!(rules.min_year, Some(1790));
        assert_eq!(rules.min_volume, Some(1));
        assert!(!rules.is_empty());
    }
}
