//! Canonical extraction result records.
//!
//! Entities, citations and relationships are created inside the
//! orchestrator, owned by the returned [`ExtractionResult`], and never
//! mutated after emission. Positions are half-open `[start, end)` character
//! offsets into the original document text.

use crate::entity_types::{CitationType, EntityType};
use crate::router::ProcessingStrategy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Clamp a reported confidence into `[0, 1]`. Out-of-range reports are
/// clipped, never rejected.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Half-open character span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// Entity position with surrounding context bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Position {
    pub start: usize,
    pub end: usize,
    pub context_start: usize,
    pub context_end: usize,
}

impl Position {
    /// Build a position for `[start, end)` with a context window extended by
    /// `margin` chars on both sides, clamped to the document.
    pub fn with_context(start: usize, end: usize, margin: usize, doc_len: usize) -> Self {
        Self {
            start,
            end,
            context_start: start.saturating_sub(margin),
            context_end: (end + margin).min(doc_len),
        }
    }
}

/// Which pattern/wave/chunk produced a record. Read-only after creation;
/// back-references are names and ids, never pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    pub document_id: String,
    /// The declared type when the fallback canonical type was assigned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_type: Option<String>,
}

/// Structured attributes an extraction wave may fill in per entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntityAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub court_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_type: Option<String>,
}

impl EntityAttributes {
    pub fn is_empty(&self) -> bool {
        self.court_name.is_none()
            && self.judge_title.is_none()
            && self.jurisdiction.is_none()
            && self.party_role.is_none()
            && self.organization_type.is_none()
    }
}

/// A typed entity extracted from a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    pub text: String,
    pub cleaned_text: String,
    pub confidence: f64,
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_snippet: Option<String>,
    pub extraction_method: String,
    #[serde(default, skip_serializing_if = "EntityAttributes::is_empty")]
    pub attributes: EntityAttributes,
    pub provenance: Provenance,
}

impl Entity {
    pub fn new_id() -> String {
        format!("ent_{}", Uuid::new_v4().simple())
    }

    /// Deduplication key: canonical type, exact text, start offset.
    pub fn dedup_key(&self) -> (EntityType, String, usize) {
        (self.entity_type, self.text.clone(), self.position.start)
    }
}

/// Bluebook-style components of a citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CitationComponents {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pincite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// A citation record. Same shape as [`Entity`] with a citation type and
/// parsed components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub id: String,
    pub citation_type: CitationType,
    pub text: String,
    pub cleaned_text: String,
    pub confidence: f64,
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_snippet: Option<String>,
    pub extraction_method: String,
    #[serde(default)]
    pub components: CitationComponents,
    pub bluebook_compliant: bool,
    pub provenance: Provenance,
}

impl Citation {
    pub fn new_id() -> String {
        format!("cit_{}", Uuid::new_v4().simple())
    }

    pub fn dedup_key(&self) -> (CitationType, String, usize) {
        (self.citation_type, self.text.clone(), self.position.start)
    }
}

/// A typed binary relationship between two extracted entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub relationship_type: String,
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub confidence: f64,
    pub evidence_text: String,
    pub position: Span,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indicators_matched: Vec<String>,
}

impl Relationship {
    pub fn new_id() -> String {
        format!("rel_{}", Uuid::new_v4().simple())
    }
}

/// Per-wave execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveStatistics {
    pub wave_number: u32,
    pub entities_found: usize,
    pub tokens_used: u64,
    pub duration_ms: u64,
    pub retries: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate statistics for one extraction.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtractionStatistics {
    pub waves_attempted: usize,
    pub waves_succeeded: usize,
    pub waves_failed: usize,
    pub entities_extracted: usize,
    pub unique_entities: usize,
    pub duplicates_removed: usize,
    pub relationships_dropped: usize,
    pub total_retries: u32,
    pub num_chunks: usize,
    pub duration_ms: u64,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waves: Vec<WaveStatistics>,
}

/// Final result of one document extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub document_id: String,
    pub strategy: ProcessingStrategy,
    pub waves_executed: usize,
    pub tokens_used: u64,
    pub extracted_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,
    pub statistics: ExtractionStatistics,
}

impl ExtractionResult {
    /// An empty result for sentinel routing decisions.
    pub fn empty(document_id: String, strategy: ProcessingStrategy) -> Self {
        Self {
            document_id,
            strategy,
            waves_executed: 0,
            tokens_used: 0,
            extracted_at: chrono::Utc::now().to_rfc3339(),
            entities: Vec::new(),
            citations: Vec::new(),
            relationships: Vec::new(),
            statistics: ExtractionStatistics::default(),
        }
    }

    pub fn new_document_id() -> String {
        format!("doc_{}", Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(0.5), 0.5);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
    }

    #[test]
    fn test_position_context_clamps_to_document() {
        let pos = Position::with_context(5, 10, 20, 15);
        assert_eq!(pos.context_start, 0);
        assert_eq!(pos.context_end, 15);
        assert_eq!(pos.start, 5);
        assert_eq!(pos.end, 10);
    }

    #[test]
    fn test_id_prefixes() {
        assert!(Entity::new_id().starts_with("ent_"));
        assert!(Citation::new_id().starts_with("cit_"));
        assert!(Relationship::new_id().starts_with("rel_"));
        assert!(ExtractionResult::new_document_id().starts_with("doc_"));
    }

    #[test]
    fn test_entity_serializes_canonical_type() {
        let entity = Entity {
            id: Entity::new_id(),
            entity_type: EntityType::Court,
            text: "Supreme Court".to_string(),
            cleaned_text: "Supreme Court".to_string(),
            confidence: 0.9,
            position: Position::with_context(0, 13, 50, 13),
            context_snippet: None,
            extraction_method: "wave_1".to_string(),
            attributes: EntityAttributes::default(),
            provenance: Provenance {
                document_id: "doc_test".to_string(),
                wave_number: Some(1),
                ..Default::default()
            },
        };

        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["entity_type"], "COURT");
        assert_eq!(json["provenance"]["wave_number"], 1);
        // Empty attributes are omitted entirely
        assert!(json.get("attributes").is_none());
    }
}
