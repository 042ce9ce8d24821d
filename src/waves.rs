//! Wave plans and prompt templates.
//!
//! Every processing strategy maps to a fixed sequence of waves, each
//! targeting a declared subset of the canonical type enumeration. Entity
//! waves run at low temperature; the final sweep and the relationship wave
//! run slightly hotter.

use crate::router::ProcessingStrategy;

/// One wave in an extraction plan.
#[derive(Debug, Clone)]
pub struct WaveSpec {
    pub wave_number: u32,
    pub name: &'static str,
    pub target_entity_types: &'static [&'static str],
    pub prompt_template: &'static str,
    pub max_tokens: u32,
    pub temperature: f32,
    pub priority: u32,
    pub retry_count: u32,
    pub is_relationship_wave: bool,
}

const ENTITY_TEMPERATURE: f32 = 0.15;
const SWEEP_TEMPERATURE: f32 = 0.25;
const RELATIONSHIP_TEMPERATURE: f32 = 0.20;

const DEFAULT_MAX_TOKENS: u32 = 1_000;
const SWEEP_MAX_TOKENS: u32 = 2_000;
const RELATIONSHIP_MAX_TOKENS: u32 = 2_000;

const DEFAULT_RETRIES: u32 = 2;

// ---------------------------------------------------------------------------
// Target type sets
// ---------------------------------------------------------------------------

/// Consolidated set for the single-pass strategy (15 types).
const SINGLE_PASS_TYPES: &[&str] = &[
    "COURT",
    "JUDGE",
    "ATTORNEY",
    "PARTY",
    "PLAINTIFF",
    "DEFENDANT",
    "CASE_CITATION",
    "STATUTE_CITATION",
    "CASE_NUMBER",
    "DATE",
    "DEADLINE",
    "MONETARY_AMOUNT",
    "ORGANIZATION",
    "JURISDICTION",
    "LEGAL_CONCEPT",
];

/// Wave 1: core actors and case law (12 types).
const CORE_TYPES: &[&str] = &[
    "COURT",
    "JUDGE",
    "JUSTICE",
    "MAGISTRATE",
    "ATTORNEY",
    "LAW_FIRM",
    "PARTY",
    "PLAINTIFF",
    "DEFENDANT",
    "CASE_CITATION",
    "FEDERAL_CASE_CITATION",
    "STATE_CASE_CITATION",
];

/// Wave 2: procedural material (11 types).
const PROCEDURAL_TYPES: &[&str] = &[
    "MOTION",
    "BRIEF",
    "ORDER",
    "JUDGMENT",
    "OPINION",
    "COMPLAINT",
    "CASE_NUMBER",
    "DOCKET_NUMBER",
    "STATUTE_CITATION",
    "FEDERAL_STATUTE_CITATION",
    "PROCEDURAL_RULE",
];

/// Wave 3: supporting context (11 types).
const SUPPORTING_TYPES: &[&str] = &[
    "DATE",
    "DEADLINE",
    "FILING_DATE",
    "MONETARY_AMOUNT",
    "DAMAGES",
    "ORGANIZATION",
    "CORPORATION",
    "GOVERNMENT_AGENCY",
    "JURISDICTION",
    "VENUE",
    "LOCATION",
];

// Legacy eight-pass sets.
const EIGHT_CITATION_TYPES: &[&str] = &[
    "CASE_CITATION",
    "FEDERAL_CASE_CITATION",
    "STATE_CASE_CITATION",
    "DOCKET_NUMBER",
];
const EIGHT_STATUTE_TYPES: &[&str] = &[
    "STATUTE_CITATION",
    "FEDERAL_STATUTE_CITATION",
    "CODE_SECTION",
    "LEGISLATIVE_ACT",
];
const EIGHT_REGULATION_TYPES: &[&str] = &[
    "REGULATION_CITATION",
    "CFR_CITATION",
    "ADMINISTRATIVE_CODE",
    "EXECUTIVE_ORDER",
];
const EIGHT_ENTITY_TYPES: &[&str] = &[
    "PERSON",
    "ORGANIZATION",
    "CORPORATION",
    "GOVERNMENT_ENTITY",
    "LAW_FIRM",
];
const EIGHT_COURT_TYPES: &[&str] = &["COURT", "JUDGE", "JUSTICE", "MAGISTRATE"];
const EIGHT_TEMPORAL_TYPES: &[&str] = &["DATE", "DEADLINE", "TIME_PERIOD", "FILING_DATE"];
const EIGHT_SWEEP_TYPES: &[&str] = &[
    "LEGAL_CONCEPT",
    "LEGAL_DOCTRINE",
    "LEGAL_STANDARD",
    "PROCEDURE",
];

// ---------------------------------------------------------------------------
// Prompt templates
// ---------------------------------------------------------------------------

pub const ENTITY_WAVE_TEMPLATE: &str = r#"Extract every entity of the following types from the text below.

Target entity types:
{{entity_types}}

Known examples of these types:
{{examples}}

Document opening, for context only (do not extract from it):
{{whole_document}}

Text to analyze:
{{chunk_content}}

Return ONLY a JSON object of this exact shape:
{"entities": [{"entity_type": "TYPE", "text": "exact span", "confidence": 0.9, "start": 0, "end": 10, "context": "surrounding words"}]}

Rules:
- "start" and "end" are character offsets into the text to analyze.
- "text" must be copied verbatim from the text to analyze.
- Use only the target entity types listed above.
- Return {"entities": []} if nothing matches."#;

pub const RELATIONSHIP_WAVE_TEMPLATE: &str = r#"Identify relationships between the entities below as they appear in the text.

Eligible relationship types:
{{relationship_types}}

Already-extracted entities (use their ids):
{{entities_json}}

Text to analyze:
{{chunk_content}}

Return ONLY a JSON object of this exact shape:
{"relationships": [{"relationship_type": "TYPE", "source_entity_id": "id", "target_entity_id": "id", "confidence": 0.9, "evidence_text": "exact supporting sentence", "start": 0, "end": 40}]}

Rules:
- Both ids must come from the entity list above.
- "evidence_text" must be copied verbatim from the text.
- Return {"relationships": []} if no relationships are present."#;

/// System prompt shared by every wave call.
pub const SYSTEM_PROMPT: &str = "You are a legal entity extraction specialist. \
Extract entities accurately and return them in the requested JSON format.";

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

fn entity_wave(
    wave_number: u32,
    name: &'static str,
    types: &'static [&'static str],
) -> WaveSpec {
    WaveSpec {
        wave_number,
        name,
        target_entity_types: types,
        prompt_template: ENTITY_WAVE_TEMPLATE,
        max_tokens: DEFAULT_MAX_TOKENS,
        temperature: ENTITY_TEMPERATURE,
        priority: wave_number,
        retry_count: DEFAULT_RETRIES,
        is_relationship_wave: false,
    }
}

fn relationship_wave(wave_number: u32) -> WaveSpec {
    WaveSpec {
        wave_number,
        name: "relationships",
        target_entity_types: &[],
        prompt_template: RELATIONSHIP_WAVE_TEMPLATE,
        max_tokens: RELATIONSHIP_MAX_TOKENS,
        temperature: RELATIONSHIP_TEMPERATURE,
        priority: wave_number,
        retry_count: DEFAULT_RETRIES,
        is_relationship_wave: true,
    }
}

pub fn single_pass_plan() -> Vec<WaveSpec> {
    vec![entity_wave(1, "consolidated", SINGLE_PASS_TYPES)]
}

pub fn three_wave_plan() -> Vec<WaveSpec> {
    vec![
        entity_wave(1, "core", CORE_TYPES),
        entity_wave(2, "procedural", PROCEDURAL_TYPES),
        entity_wave(3, "supporting", SUPPORTING_TYPES),
    ]
}

pub fn four_wave_plan() -> Vec<WaveSpec> {
    let mut plan = three_wave_plan();
    plan.push(relationship_wave(4));
    plan
}

pub fn eight_wave_plan() -> Vec<WaveSpec> {
    let mut sweep = entity_wave(7, "catchall", EIGHT_SWEEP_TYPES);
    sweep.max_tokens = SWEEP_MAX_TOKENS;
    sweep.temperature = SWEEP_TEMPERATURE;

    vec![
        entity_wave(1, "citations", EIGHT_CITATION_TYPES),
        entity_wave(2, "statutes", EIGHT_STATUTE_TYPES),
        entity_wave(3, "regulations", EIGHT_REGULATION_TYPES),
        entity_wave(4, "entities", EIGHT_ENTITY_TYPES),
        entity_wave(5, "courts", EIGHT_COURT_TYPES),
        entity_wave(6, "temporal", EIGHT_TEMPORAL_TYPES),
        sweep,
        relationship_wave(8),
    ]
}

/// The wave plan bound to a routing strategy. Sentinel strategies have no
/// plan. Chunked strategies run this plan once per chunk.
pub fn plan_for_strategy(strategy: ProcessingStrategy) -> Vec<WaveSpec> {
    match strategy {
        ProcessingStrategy::SinglePass => single_pass_plan(),
        ProcessingStrategy::ThreeWave | ProcessingStrategy::ThreeWaveChunked => three_wave_plan(),
        ProcessingStrategy::FourWave => four_wave_plan(),
        ProcessingStrategy::EightWaveFallback => eight_wave_plan(),
        ProcessingStrategy::EmptyDocument
        | ProcessingStrategy::TooSmall
        | ProcessingStrategy::InvalidDocument => Vec::new(),
    }
}

/// Fill in an entity wave prompt.
pub fn build_entity_prompt(
    spec: &WaveSpec,
    chunk_content: &str,
    examples: &str,
    whole_document: &str,
) -> String {
    spec.prompt_template
        .replace("{{entity_types}}", &spec.target_entity_types.join(", "))
        .replace("{{examples}}", examples)
        .replace("{{whole_document}}", whole_document)
        .replace("{{chunk_content}}", chunk_content)
}

/// Fill in the relationship wave prompt.
pub fn build_relationship_prompt(
    spec: &WaveSpec,
    chunk_content: &str,
    relationship_types: &str,
    entities_json: &str,
) -> String {
    spec.prompt_template
        .replace("{{relationship_types}}", relationship_types)
        .replace("{{entities_json}}", entities_json)
        .replace("{{chunk_content}}", chunk_content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pass_covers_fifteen_types() {
        let plan = single_pass_plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].target_entity_types.len(), 15);
        assert!(!plan[0].is_relationship_wave);
    }

    #[test]
    fn test_three_wave_covers_thirty_four_types() {
        let plan = three_wave_plan();
        assert_eq!(plan.len(), 3);
        let total: usize = plan.iter().map(|w| w.target_entity_types.len()).sum();
        assert_eq!(total, 34);
    }

    #[test]
    fn test_four_wave_ends_with_relationship_wave() {
        let plan = four_wave_plan();
        assert_eq!(plan.len(), 4);
        assert!(plan.last().unwrap().is_relationship_wave);
        assert!(plan[..3].iter().all(|w| !w.is_relationship_wave));
    }

    #[test]
    fn test_eight_wave_plan_shape() {
        let plan = eight_wave_plan();
        assert_eq!(plan.len(), 8);
        assert!(plan.last().unwrap().is_relationship_wave);
        // The catch-all sweep runs hotter with a bigger budget
        let sweep = &plan[6];
        assert_eq!(sweep.name, "catchall");
        assert_eq!(sweep.temperature, SWEEP_TEMPERATURE);
        assert_eq!(sweep.max_tokens, SWEEP_MAX_TOKENS);
    }

    #[test]
    fn test_waves_ordered_by_priority() {
        for plan in [three_wave_plan(), four_wave_plan(), eight_wave_plan()] {
            let priorities: Vec<u32> = plan.iter().map(|w| w.priority).collect();
            let mut sorted = priorities.clone();
            sorted.sort();
            assert_eq!(priorities, sorted);
        }
    }

    #[test]
    fn test_entity_temperatures_are_low() {
        for wave in three_wave_plan() {
            assert_eq!(wave.temperature, ENTITY_TEMPERATURE);
        }
        let relationship = &four_wave_plan()[3];
        assert_eq!(relationship.temperature, RELATIONSHIP_TEMPERATURE);
    }

    #[test]
    fn test_sentinel_strategies_have_no_plan() {
        assert!(plan_for_strategy(ProcessingStrategy::EmptyDocument).is_empty());
        assert!(plan_for_strategy(ProcessingStrategy::TooSmall).is_empty());
        assert!(plan_for_strategy(ProcessingStrategy::InvalidDocument).is_empty());
    }

    #[test]
    fn test_entity_prompt_substitution() {
        let plan = single_pass_plan();
        let prompt = build_entity_prompt(&plan[0], "the chunk text", "COURT: \"Supreme Court\"", "doc opening");

        assert!(prompt.contains("the chunk text"));
        assert!(prompt.contains("COURT, JUDGE"));
        assert!(prompt.contains("doc opening"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn test_relationship_prompt_substitution() {
        let spec = relationship_wave(4);
        let prompt = build_relationship_prompt(
            &spec,
            "chunk",
            "REPRESENTS (ATTORNEY -> PARTY)",
            r#"[{"id": "ent_1"}]"#,
        );

        assert!(prompt.contains("REPRESENTS"));
        assert!(prompt.contains("ent_1"));
        assert!(!prompt.contains("{{"));
    }
}
