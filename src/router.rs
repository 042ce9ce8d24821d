//! Size- and content-aware document routing.
//!
//! Maps a document to one of a small enumerated set of processing
//! strategies plus a chunking plan, with cost/duration/accuracy estimates.
//! Routing is a pure function of its inputs; repeated calls with the same
//! document and options produce the same decision.

use crate::size_detector::{SizeCategory, SizeDetector, SizeInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Model context limit and safety margin (tokens).
pub const DEFAULT_MAX_CONTEXT: usize = 32_768;
pub const DEFAULT_SAFETY_MARGIN: usize = 2_000;

// Token budgets per strategy.
const SINGLE_PASS_PROMPT_TOKENS: usize = 5_000;
const THREE_WAVE_PROMPT_TOKENS: usize = 17_500;
const FOUR_WAVE_PROMPT_TOKENS: usize = 45_000;
const EIGHT_WAVE_PROMPT_TOKENS: usize = 26_900;

const SINGLE_PASS_RESPONSE_TOKENS: usize = 1_000;
const THREE_WAVE_RESPONSE_TOKENS: usize = 4_096;
const FOUR_WAVE_RESPONSE_TOKENS: usize = 6_000;

// Chunking defaults (tokens).
const DEFAULT_CHUNK_SIZE: usize = 8_000;
const DEFAULT_OVERLAP: usize = 500;
const LARGE_DOC_OVERLAP: usize = 1_000;

/// Processing strategies for entity extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStrategy {
    #[serde(rename = "SINGLE_PASS")]
    SinglePass,
    #[serde(rename = "THREE_WAVE")]
    ThreeWave,
    #[serde(rename = "FOUR_WAVE")]
    FourWave,
    #[serde(rename = "THREE_WAVE_CHUNKED")]
    ThreeWaveChunked,
    #[serde(rename = "EIGHT_WAVE_FALLBACK")]
    EightWaveFallback,
    #[serde(rename = "EMPTY_DOCUMENT")]
    EmptyDocument,
    #[serde(rename = "TOO_SMALL")]
    TooSmall,
    #[serde(rename = "INVALID_DOCUMENT")]
    InvalidDocument,
}

impl ProcessingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStrategy::SinglePass => "SINGLE_PASS",
            ProcessingStrategy::ThreeWave => "THREE_WAVE",
            ProcessingStrategy::FourWave => "FOUR_WAVE",
            ProcessingStrategy::ThreeWaveChunked => "THREE_WAVE_CHUNKED",
            ProcessingStrategy::EightWaveFallback => "EIGHT_WAVE_FALLBACK",
            ProcessingStrategy::EmptyDocument => "EMPTY_DOCUMENT",
            ProcessingStrategy::TooSmall => "TOO_SMALL",
            ProcessingStrategy::InvalidDocument => "INVALID_DOCUMENT",
        }
    }

    /// Parse an override name, tolerating case and whitespace.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "SINGLE_PASS" => Some(ProcessingStrategy::SinglePass),
            "THREE_WAVE" => Some(ProcessingStrategy::ThreeWave),
            "FOUR_WAVE" => Some(ProcessingStrategy::FourWave),
            "THREE_WAVE_CHUNKED" => Some(ProcessingStrategy::ThreeWaveChunked),
            "EIGHT_WAVE_FALLBACK" => Some(ProcessingStrategy::EightWaveFallback),
            _ => None,
        }
    }

    /// Terminal strategies that short-circuit extraction.
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            ProcessingStrategy::EmptyDocument
                | ProcessingStrategy::TooSmall
                | ProcessingStrategy::InvalidDocument
        )
    }
}

/// Boundary type preserved when chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryKind {
    Sentence,
    Paragraph,
    Section,
    Page,
}

/// Chunking strategy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    Extraction,
    PageBased,
    None,
}

/// Configuration for document chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    pub strategy: ChunkStrategy,
    pub chunk_size_tokens: usize,
    pub overlap_tokens: usize,
    pub preserve_boundaries: BoundaryKind,
}

/// Complete routing decision with estimates and rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub strategy: ProcessingStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_config: Option<ChunkConfig>,
    pub estimated_tokens: usize,
    pub estimated_duration_s: f64,
    pub estimated_cost_usd: f64,
    pub expected_accuracy: f64,
    pub size_info: SizeInfo,
    pub rationale: String,
    pub num_chunks: usize,
    pub extract_relationships: bool,
}

/// Caller-supplied routing options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteOptions {
    #[serde(default)]
    pub strategy_override: Option<String>,
    #[serde(default)]
    pub extract_relationships: bool,
    #[serde(default)]
    pub graphrag_mode: bool,
}

/// Intelligent document router.
#[derive(Debug, Clone)]
pub struct DocumentRouter {
    size_detector: SizeDetector,
    max_context: usize,
    safety_margin: usize,
    force_strategy: Option<String>,
}

impl Default for DocumentRouter {
    fn default() -> Self {
        Self::new(
            SizeDetector::default(),
            DEFAULT_MAX_CONTEXT,
            DEFAULT_SAFETY_MARGIN,
            None,
        )
    }
}

impl DocumentRouter {
    pub fn new(
        size_detector: SizeDetector,
        max_context: usize,
        safety_margin: usize,
        force_strategy: Option<String>,
    ) -> Self {
        Self {
            size_detector,
            max_context,
            safety_margin,
            force_strategy,
        }
    }

    /// Route a document to its processing strategy.
    ///
    /// The decision procedure evaluates, in order: edge cases (empty, too
    /// small, binary), GraphRAG mode, explicit override, configured forced
    /// strategy, relationship/large-document triggers, then size-category
    /// routing.
    pub fn route(
        &self,
        document_text: &str,
        metadata: Option<&HashMap<String, serde_json::Value>>,
        options: &RouteOptions,
    ) -> RoutingDecision {
        let size_info = self.size_detector.detect(document_text, metadata);

        info!(
            "Routing document: {} ({} chars, {} tokens) | graphrag: {} | relationships: {}",
            size_info.category.as_str(),
            size_info.chars,
            size_info.tokens,
            options.graphrag_mode,
            options.extract_relationships,
        );

        if let Some(decision) = self.check_edge_cases(document_text, size_info) {
            warn!("Edge case detected: {}", decision.strategy.as_str());
            return decision;
        }

        let decision = if options.graphrag_mode {
            self.route_four_wave(size_info, true, false)
        } else if let Some(override_name) = options.strategy_override.as_deref() {
            info!("Strategy override requested: {}", override_name);
            self.apply_strategy_override(override_name, size_info)
        } else if let Some(forced) = self.force_strategy.as_deref() {
            info!("Forced strategy from config: {}", forced);
            self.apply_strategy_override(forced, size_info)
        } else if options.extract_relationships && size_info.chars > 5_000 {
            self.route_four_wave(size_info, false, true)
        } else if size_info.chars > 20_000 && size_info.category == SizeCategory::Small {
            // Big enough to deserve the comprehensive pass, still small
            // enough for a single context. Medium and large documents chunk.
            self.route_four_wave(size_info, false, false)
        } else {
            self.route_by_size(size_info)
        };

        info!(
            "Routing decision: {} | accuracy: {:.0}% | tokens: {} | chunks: {}",
            decision.strategy.as_str(),
            decision.expected_accuracy * 100.0,
            decision.estimated_tokens,
            decision.num_chunks,
        );

        decision
    }

    /// Sanity-check a decision. Returns `(is_valid, warnings)`.
    pub fn validate_decision(&self, decision: &RoutingDecision) -> (bool, Vec<String>) {
        let mut warnings = Vec::new();

        if decision.estimated_tokens > self.max_context {
            warnings.push(format!(
                "estimated tokens ({}) exceed context limit ({})",
                decision.estimated_tokens, self.max_context
            ));
        }
        if decision.estimated_cost_usd > 1.0 {
            warnings.push(format!(
                "estimated cost (${:.2}) is very high",
                decision.estimated_cost_usd
            ));
        }
        if decision.estimated_duration_s > 60.0 {
            warnings.push(format!(
                "estimated duration ({:.1}s) is very long",
                decision.estimated_duration_s
            ));
        }
        if decision.estimated_tokens == 0 && !decision.strategy.is_sentinel() {
            warnings.push("zero estimated tokens for non-sentinel strategy".to_string());
        }

        (warnings.is_empty(), warnings)
    }

    fn check_edge_cases(&self, text: &str, size_info: SizeInfo) -> Option<RoutingDecision> {
        if text.trim().is_empty() {
            return Some(sentinel_decision(
                ProcessingStrategy::EmptyDocument,
                0,
                size_info,
                "Empty document - no extraction needed",
            ));
        }

        if size_info.chars < 50 {
            return Some(sentinel_decision(
                ProcessingStrategy::TooSmall,
                size_info.tokens,
                size_info,
                "Document too small (<50 chars) - likely fragment",
            ));
        }

        if !is_text_document(text) {
            return Some(sentinel_decision(
                ProcessingStrategy::InvalidDocument,
                0,
                size_info,
                "Document contains binary data or is malformed",
            ));
        }

        if size_info.chars > 1_000_000 {
            warn!(
                "Extremely large document ({} chars), processing may be slow",
                size_info.chars
            );
        }

        None
    }

    fn route_by_size(&self, size_info: SizeInfo) -> RoutingDecision {
        match size_info.category {
            SizeCategory::VerySmall => self.route_very_small(size_info),
            SizeCategory::Small => self.route_small(size_info),
            SizeCategory::Medium => self.route_medium(size_info),
            SizeCategory::Large => self.route_large(size_info),
        }
    }

    fn route_very_small(&self, size_info: SizeInfo) -> RoutingDecision {
        let estimated_tokens =
            SINGLE_PASS_PROMPT_TOKENS + size_info.tokens + SINGLE_PASS_RESPONSE_TOKENS;

        RoutingDecision {
            strategy: ProcessingStrategy::SinglePass,
            prompt_version: Some("single_pass_consolidated_v1".to_string()),
            chunk_config: None,
            estimated_tokens,
            estimated_duration_s: 0.5,
            estimated_cost_usd: 0.0038,
            expected_accuracy: 0.87,
            size_info,
            rationale: "Very small document - single pass optimization for speed and cost"
                .to_string(),
            num_chunks: 0,
            extract_relationships: false,
        }
    }

    fn route_small(&self, size_info: SizeInfo) -> RoutingDecision {
        let estimated_tokens =
            THREE_WAVE_PROMPT_TOKENS + size_info.tokens + THREE_WAVE_RESPONSE_TOKENS;
        let available_context = self.max_context - self.safety_margin;

        if estimated_tokens <= available_context {
            RoutingDecision {
                strategy: ProcessingStrategy::ThreeWave,
                prompt_version: Some("three_wave_optimized_v1".to_string()),
                chunk_config: None,
                estimated_tokens,
                estimated_duration_s: 1.0,
                estimated_cost_usd: 0.0159,
                expected_accuracy: 0.90,
                size_info,
                rationale: "Small document - 3-wave optimized extraction".to_string(),
                num_chunks: 0,
                extract_relationships: false,
            }
        } else {
            let num_chunks = num_chunks(size_info.tokens, DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP);
            RoutingDecision {
                strategy: ProcessingStrategy::ThreeWaveChunked,
                prompt_version: Some("three_wave_optimized_v1".to_string()),
                chunk_config: Some(ChunkConfig {
                    strategy: ChunkStrategy::Extraction,
                    chunk_size_tokens: DEFAULT_CHUNK_SIZE,
                    overlap_tokens: DEFAULT_OVERLAP,
                    preserve_boundaries: BoundaryKind::Paragraph,
                }),
                estimated_tokens,
                estimated_duration_s: num_chunks as f64 * 0.85,
                estimated_cost_usd: num_chunks as f64 * 0.0159,
                expected_accuracy: 0.89,
                size_info,
                rationale: "Small document near context limit - chunked 3-wave".to_string(),
                num_chunks,
                extract_relationships: false,
            }
        }
    }

    fn route_medium(&self, size_info: SizeInfo) -> RoutingDecision {
        let chunks = num_chunks(size_info.tokens, DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP);

        RoutingDecision {
            strategy: ProcessingStrategy::ThreeWaveChunked,
            prompt_version: Some("three_wave_optimized_v1".to_string()),
            chunk_config: Some(ChunkConfig {
                strategy: ChunkStrategy::Extraction,
                chunk_size_tokens: DEFAULT_CHUNK_SIZE,
                overlap_tokens: DEFAULT_OVERLAP,
                preserve_boundaries: BoundaryKind::Paragraph,
            }),
            estimated_tokens: size_info.tokens,
            estimated_duration_s: chunks as f64 * 0.85,
            estimated_cost_usd: chunks as f64 * 0.0159,
            expected_accuracy: 0.91,
            size_info,
            rationale: format!(
                "Medium document - chunked 3-wave with deduplication ({} chunks)",
                chunks
            ),
            num_chunks: chunks,
            extract_relationships: false,
        }
    }

    fn route_large(&self, size_info: SizeInfo) -> RoutingDecision {
        let chunks = num_chunks(size_info.tokens, DEFAULT_CHUNK_SIZE, LARGE_DOC_OVERLAP);

        RoutingDecision {
            strategy: ProcessingStrategy::ThreeWaveChunked,
            prompt_version: Some("three_wave_optimized_v1".to_string()),
            chunk_config: Some(ChunkConfig {
                strategy: ChunkStrategy::Extraction,
                chunk_size_tokens: DEFAULT_CHUNK_SIZE,
                overlap_tokens: LARGE_DOC_OVERLAP,
                preserve_boundaries: BoundaryKind::Section,
            }),
            estimated_tokens: size_info.tokens,
            estimated_duration_s: chunks as f64,
            estimated_cost_usd: chunks as f64 * 0.0159,
            expected_accuracy: 0.92,
            size_info,
            rationale: format!(
                "Large document - chunked 3-wave with section preservation ({} chunks)",
                chunks
            ),
            num_chunks: chunks,
            extract_relationships: false,
        }
    }

    fn route_four_wave(
        &self,
        size_info: SizeInfo,
        graphrag_mode: bool,
        explicit_relationships: bool,
    ) -> RoutingDecision {
        let estimated_tokens =
            FOUR_WAVE_PROMPT_TOKENS + size_info.tokens + FOUR_WAVE_RESPONSE_TOKENS;

        let (rationale, estimated_duration_s, expected_accuracy) = if graphrag_mode {
            (
                "GraphRAG mode: full 4-wave extraction with relationships for knowledge graph",
                180.0,
                0.95,
            )
        } else if explicit_relationships {
            (
                "Relationships requested: 4-wave extraction with entity relationships",
                150.0,
                0.92,
            )
        } else if size_info.chars > 20_000 {
            (
                "Large document: comprehensive 4-wave extraction with relationships",
                200.0,
                0.95,
            )
        } else {
            (
                "4-wave extraction with comprehensive entity coverage and relationships",
                150.0,
                0.92,
            )
        };

        let estimated_cost_usd = (estimated_tokens as f64 / 1000.0) * 0.00075;

        RoutingDecision {
            strategy: ProcessingStrategy::FourWave,
            prompt_version: Some("four_wave_optimized_v1".to_string()),
            chunk_config: None,
            estimated_tokens,
            estimated_duration_s,
            estimated_cost_usd,
            expected_accuracy,
            size_info,
            rationale: rationale.to_string(),
            num_chunks: 0,
            extract_relationships: true,
        }
    }

    fn apply_strategy_override(&self, name: &str, size_info: SizeInfo) -> RoutingDecision {
        let Some(strategy) = ProcessingStrategy::parse(name) else {
            warn!("Unknown strategy override '{}', using default routing", name);
            return self.route_by_size(size_info);
        };

        match strategy {
            ProcessingStrategy::SinglePass => self.route_very_small(size_info),
            ProcessingStrategy::ThreeWave => {
                let mut decision = self.route_small(size_info);
                decision.rationale.push_str(" (manual override)");
                decision
            }
            ProcessingStrategy::FourWave => {
                let mut decision = self.route_four_wave(size_info, false, true);
                decision.rationale.push_str(" (manual override)");
                decision
            }
            ProcessingStrategy::ThreeWaveChunked => {
                let mut decision = if matches!(
                    size_info.category,
                    SizeCategory::Medium | SizeCategory::Large
                ) {
                    self.route_medium(size_info)
                } else {
                    self.route_small(size_info)
                };
                decision.rationale.push_str(" (manual override)");
                decision
            }
            ProcessingStrategy::EightWaveFallback => RoutingDecision {
                strategy: ProcessingStrategy::EightWaveFallback,
                prompt_version: Some("eight_wave_multipass_v2".to_string()),
                chunk_config: None,
                estimated_tokens: EIGHT_WAVE_PROMPT_TOKENS + size_info.tokens,
                estimated_duration_s: 2.0,
                estimated_cost_usd: 0.0254,
                expected_accuracy: 0.93,
                size_info,
                rationale: "8-wave fallback (manual override for maximum accuracy)".to_string(),
                num_chunks: 0,
                extract_relationships: false,
            },
            // Sentinels are never valid overrides
            _ => self.route_by_size(size_info),
        }
    }
}

fn sentinel_decision(
    strategy: ProcessingStrategy,
    estimated_tokens: usize,
    size_info: SizeInfo,
    rationale: &str,
) -> RoutingDecision {
    RoutingDecision {
        strategy,
        prompt_version: None,
        chunk_config: None,
        estimated_tokens,
        estimated_duration_s: 0.0,
        estimated_cost_usd: 0.0,
        expected_accuracy: 0.0,
        size_info,
        rationale: rationale.to_string(),
        num_chunks: 0,
        extract_relationships: false,
    }
}

/// Number of chunks: `ceil(doc_tokens / (chunk_size - overlap))`, at least 1.
fn num_chunks(total_tokens: usize, chunk_size: usize, overlap: usize) -> usize {
    let effective = chunk_size.saturating_sub(overlap).max(1);
    total_tokens.div_ceil(effective).max(1)
}

/// More than 5% non-printable control characters (outside `\n\r\t`) in the
/// first 1000 chars marks a document as binary.
fn is_text_document(text: &str) -> bool {
    if text.is_empty() {
        return true;
    }

    let sample: Vec<char> = text.chars().take(1000).collect();
    let non_printable = sample
        .iter()
        .filter(|c| (**c as u32) < 32 && !matches!(**c, '\n' | '\r' | '\t'))
        .count();

    (non_printable as f64 / sample.len() as f64) <= 0.05
}
