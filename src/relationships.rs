//! Relationship wave support.
//!
//! Filters the declarative relationship patterns down to those whose
//! endpoint types are actually present among the extracted entities,
//! builds the entity listing for the prompt, and validates the model's
//! returned relationships against the known entity ids.

use crate::model::{clamp_confidence, Citation, Entity, Relationship, Span};
use crate::patterns::RelationshipPattern;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Relationship patterns whose source and target types both appear among
/// the extracted records. Bidirectional patterns need the pair in either
/// role, which the same presence check covers.
pub fn eligible_patterns(
    all: &BTreeMap<String, Vec<RelationshipPattern>>,
    entities: &[Entity],
    citations: &[Citation],
) -> Vec<RelationshipPattern> {
    let mut present: HashSet<&str> = HashSet::new();
    for entity in entities {
        present.insert(entity.entity_type.as_str());
    }
    for citation in citations {
        present.insert(citation.citation_type.as_str());
    }

    let mut eligible = Vec::new();
    let mut seen = HashSet::new();
    for patterns in all.values() {
        for pattern in patterns {
            if present.contains(pattern.source_entity_type.as_str())
                && present.contains(pattern.target_entity_type.as_str())
                && seen.insert((
                    pattern.relationship_type.clone(),
                    pattern.source_entity_type.clone(),
                    pattern.target_entity_type.clone(),
                ))
            {
                eligible.push(pattern.clone());
            }
        }
    }

    debug!(
        "{} of {} relationship patterns eligible for {} present types",
        eligible.len(),
        all.values().map(|v| v.len()).sum::<usize>(),
        present.len()
    );
    eligible
}

/// Human-readable eligible-type listing for the prompt.
pub fn describe_relationship_types(patterns: &[RelationshipPattern]) -> String {
    patterns
        .iter()
        .map(|p| {
            let arrow = if p.bidirectional { "<->" } else { "->" };
            format!(
                "{} ({} {} {}), indicators: {}",
                p.relationship_type,
                p.source_entity_type,
                arrow,
                p.target_entity_type,
                p.indicators.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Entity listing handed to the relationship prompt.
pub fn entities_json(entities: &[Entity], citations: &[Citation]) -> serde_json::Value {
    let mut items: Vec<serde_json::Value> = entities
        .iter()
        .map(|e| {
            serde_json::json!({
                "id": e.id,
                "entity_type": e.entity_type.as_str(),
                "text": e.text,
                "start": e.position.start,
                "end": e.position.end,
            })
        })
        .collect();
    items.extend(citations.iter().map(|c| {
        serde_json::json!({
            "id": c.id,
            "entity_type": c.citation_type.as_str(),
            "text": c.text,
            "start": c.position.start,
            "end": c.position.end,
        })
    }));
    serde_json::Value::Array(items)
}

/// Outcome of validating one relationship wave response.
#[derive(Debug, Default)]
pub struct ParsedRelationships {
    pub relationships: Vec<Relationship>,
    pub dropped_unknown_ids: usize,
    pub dropped_duplicates: usize,
    pub dropped_low_confidence: usize,
}

/// Validate the model's relationships: both ids must reference known
/// entities, duplicates collapse on `(type, source, target)`, confidences
/// are clamped and floored, and indicator phrases found in the evidence
/// are recorded.
pub fn parse_response(
    json: &serde_json::Value,
    known_ids: &HashSet<String>,
    patterns: &[RelationshipPattern],
    document: &str,
    confidence_floor: f64,
    max_relationships: usize,
) -> ParsedRelationships {
    let mut out = ParsedRelationships::default();
    let doc_len = document.chars().count();

    let Some(items) = json.get("relationships").and_then(|v| v.as_array()) else {
        return out;
    };

    let mut seen: HashSet<(String, String, String)> = HashSet::new();

    for item in items {
        let Some(relationship_type) = string_field(item, &["relationship_type", "type"]) else {
            continue;
        };
        let relationship_type = relationship_type.to_uppercase();

        let Some(source_id) = string_field(item, &["source_entity_id", "source_id", "source"])
        else {
            continue;
        };
        let Some(target_id) = string_field(item, &["target_entity_id", "target_id", "target"])
        else {
            continue;
        };

        if !known_ids.contains(&source_id) || !known_ids.contains(&target_id) {
            out.dropped_unknown_ids += 1;
            continue;
        }

        let confidence = clamp_confidence(
            item.get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.7),
        );
        if confidence < confidence_floor {
            out.dropped_low_confidence += 1;
            continue;
        }

        let key = (
            relationship_type.clone(),
            source_id.clone(),
            target_id.clone(),
        );
        if !seen.insert(key) {
            out.dropped_duplicates += 1;
            continue;
        }

        let evidence_text = string_field(item, &["evidence_text", "evidence"]).unwrap_or_default();

        let position = extract_span(item, &evidence_text, document, doc_len);

        let indicators_matched = patterns
            .iter()
            .find(|p| p.relationship_type == relationship_type)
            .map(|p| {
                let evidence_lower = evidence_text.to_lowercase();
                p.indicators
                    .iter()
                    .filter(|i| evidence_lower.contains(&i.to_lowercase()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        out.relationships.push(Relationship {
            id: Relationship::new_id(),
            relationship_type,
            source_entity_id: source_id,
            target_entity_id: target_id,
            confidence,
            evidence_text,
            position,
            indicators_matched,
        });

        if out.relationships.len() >= max_relationships {
            break;
        }
    }

    out
}

fn string_field(item: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| item.get(*key).and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Span from explicit offsets, clamped; falls back to locating the
/// evidence text in the document.
fn extract_span(
    item: &serde_json::Value,
    evidence_text: &str,
    document: &str,
    doc_len: usize,
) -> Span {
    let start = item.get("start").and_then(|v| v.as_u64()).map(|v| v as usize);
    let end = item.get("end").and_then(|v| v.as_u64()).map(|v| v as usize);

    if let (Some(start), Some(end)) = (start, end) {
        if start < end && end <= doc_len {
            return Span { start, end };
        }
    }

    if !evidence_text.is_empty() {
        if let Some(byte_pos) = document.find(evidence_text) {
            let start = document[..byte_pos].chars().count();
            return Span {
                start,
                end: start + evidence_text.chars().count(),
            };
        }
    }

    Span { start: 0, end: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_types::{CitationType, EntityType};
    use crate::model::{EntityAttributes, Position, Provenance};

    fn entity(id: &str, entity_type: EntityType, text: &str, start: usize) -> Entity {
        Entity {
            id: id.to_string(),
            entity_type,
            text: text.to_string(),
            cleaned_text: text.to_string(),
            confidence: 0.9,
            position: Position::with_context(start, start + text.chars().count(), 30, 10_000),
            context_snippet: None,
            extraction_method: "wave_1".to_string(),
            attributes: EntityAttributes::default(),
            provenance: Provenance {
                document_id: "doc_test".to_string(),
                ..Default::default()
            },
        }
    }

    fn pattern(
        relationship_type: &str,
        source: &str,
        target: &str,
        indicators: &[&str],
    ) -> RelationshipPattern {
        RelationshipPattern {
            relationship_type: relationship_type.to_string(),
            category: "test".to_string(),
            source_entity_type: source.to_string(),
            target_entity_type: target.to_string(),
            indicators: indicators.iter().map(|s| s.to_string()).collect(),
            examples: Vec::new(),
            confidence: 0.8,
            bidirectional: false,
            description: None,
        }
    }

    fn patterns_map(
        patterns: Vec<RelationshipPattern>,
    ) -> BTreeMap<String, Vec<RelationshipPattern>> {
        BTreeMap::from([("test".to_string(), patterns)])
    }

    #[test]
    fn test_eligibility_requires_both_endpoint_types() {
        let all = patterns_map(vec![
            pattern("REPRESENTS", "ATTORNEY", "PARTY", &[]),
            pattern("PRESIDES_OVER", "JUDGE", "CASE_NUMBER", &[]),
        ]);
        let entities = vec![
            entity("ent_1", EntityType::Attorney, "Jane Smith", 0),
            entity("ent_2", EntityType::Party, "Acme Corp", 20),
        ];

        let eligible = eligible_patterns(&all, &entities, &[]);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].relationship_type, "REPRESENTS");
    }

    #[test]
    fn test_eligibility_sees_citation_types() {
        let all = patterns_map(vec![pattern("CITES", "OPINION", "CASE_CITATION", &[])]);
        let entities = vec![entity("ent_1", EntityType::Opinion, "the opinion", 0)];
        let citations = vec![Citation {
            id: "cit_1".to_string(),
            citation_type: CitationType::CaseCitation,
            text: "410 U.S. 113".to_string(),
            cleaned_text: "410 U.S. 113".to_string(),
            confidence: 0.95,
            position: Position::with_context(40, 52, 30, 10_000),
            context_snippet: None,
            extraction_method: "wave_1".to_string(),
            components: Default::default(),
            bluebook_compliant: true,
            provenance: Provenance {
                document_id: "doc_test".to_string(),
                ..Default::default()
            },
        }];

        let eligible = eligible_patterns(&all, &entities, &citations);
        assert_eq!(eligible.len(), 1);
    }

    #[test]
    fn test_parse_drops_unknown_ids() {
        let known: HashSet<String> = ["ent_1".to_string(), "ent_2".to_string()].into();
        let patterns = vec![pattern("REPRESENTS", "ATTORNEY", "PARTY", &[])];
        let json = serde_json::json!({
            "relationships": [
                {"relationship_type": "REPRESENTS", "source_entity_id": "ent_1",
                 "target_entity_id": "ent_2", "confidence": 0.9, "evidence_text": "x"},
                {"relationship_type": "REPRESENTS", "source_entity_id": "ent_1",
                 "target_entity_id": "ent_999", "confidence": 0.9, "evidence_text": "y"}
            ]
        });

        let parsed = parse_response(&json, &known, &patterns, "doc", 0.0, 100);
        assert_eq!(parsed.relationships.len(), 1);
        assert_eq!(parsed.dropped_unknown_ids, 1);
    }

    #[test]
    fn test_parse_deduplicates_on_type_and_ids() {
        let known: HashSet<String> = ["ent_1".to_string(), "ent_2".to_string()].into();
        let json = serde_json::json!({
            "relationships": [
                {"relationship_type": "REPRESENTS", "source_entity_id": "ent_1",
                 "target_entity_id": "ent_2", "confidence": 0.9},
                {"relationship_type": "represents", "source_entity_id": "ent_1",
                 "target_entity_id": "ent_2", "confidence": 0.8}
            ]
        });

        let parsed = parse_response(&json, &known, &[], "doc", 0.0, 100);
        assert_eq!(parsed.relationships.len(), 1);
        assert_eq!(parsed.dropped_duplicates, 1);
    }

    #[test]
    fn test_parse_applies_confidence_floor() {
        let known: HashSet<String> = ["ent_1".to_string(), "ent_2".to_string()].into();
        let json = serde_json::json!({
            "relationships": [
                {"relationship_type": "REPRESENTS", "source_entity_id": "ent_1",
                 "target_entity_id": "ent_2", "confidence": 0.3}
            ]
        });

        let parsed = parse_response(&json, &known, &[], "doc", 0.5, 100);
        assert!(parsed.relationships.is_empty());
        assert_eq!(parsed.dropped_low_confidence, 1);
    }

    #[test]
    fn test_parse_records_matched_indicators() {
        let known: HashSet<String> = ["ent_1".to_string(), "ent_2".to_string()].into();
        let patterns = vec![pattern(
            "REPRESENTS",
            "ATTORNEY",
            "PARTY",
            &["counsel for", "on behalf of"],
        )];
        let document = "Jane Smith appeared as counsel for Acme Corp.";
        let json = serde_json::json!({
            "relationships": [
                {"relationship_type": "REPRESENTS", "source_entity_id": "ent_1",
                 "target_entity_id": "ent_2", "confidence": 0.9,
                 "evidence_text": "appeared as counsel for Acme Corp"}
            ]
        });

        let parsed = parse_response(&json, &known, &patterns, document, 0.0, 100);
        assert_eq!(parsed.relationships[0].indicators_matched, vec!["counsel for"]);
        // Span recovered by locating the evidence in the document
        let span = parsed.relationships[0].position;
        assert!(span.start > 0 && span.end > span.start);
    }

    #[test]
    fn test_parse_respects_max_relationships() {
        let known: HashSet<String> =
            ["ent_1".to_string(), "ent_2".to_string(), "ent_3".to_string()].into();
        let json = serde_json::json!({
            "relationships": [
                {"relationship_type": "A", "source_entity_id": "ent_1",
                 "target_entity_id": "ent_2", "confidence": 0.9},
                {"relationship_type": "B", "source_entity_id": "ent_2",
                 "target_entity_id": "ent_3", "confidence": 0.9}
            ]
        });

        let parsed = parse_response(&json, &known, &[], "doc", 0.0, 1);
        assert_eq!(parsed.relationships.len(), 1);
    }

    #[test]
    fn test_entities_json_shape() {
        let entities = vec![entity("ent_1", EntityType::Judge, "Judge Smith", 5)];
        let json = entities_json(&entities, &[]);
        assert_eq!(json[0]["id"], "ent_1");
        assert_eq!(json[0]["entity_type"], "JUDGE");
        assert_eq!(json[0]["start"], 5);
    }

    #[test]
    fn test_describe_relationship_types() {
        let description = describe_relationship_types(&[pattern(
            "REPRESENTS",
            "ATTORNEY",
            "PARTY",
            &["counsel for"],
        )]);
        assert!(description.contains("REPRESENTS (ATTORNEY -> PARTY)"));
        assert!(description.contains("counsel for"));
    }
}
