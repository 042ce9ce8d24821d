//! Extraction orchestrator.
//!
//! Executes the wave plan bound to a routing decision: builds prompts from
//! the pattern library, calls the throttled client, normalises and
//! deduplicates the returned entities, merges chunked results back to
//! absolute document offsets, and runs the relationship wave over the
//! deduplicated entity set. One orchestrator serves many concurrent
//! documents and holds no per-document state.

use crate::chunker::{self, Chunk};
use crate::entity_types::CanonicalType;
use crate::llm::{ChatClient, ChatRequest, Message};
use crate::model::{
    clamp_confidence, Citation, CitationComponents, Entity, EntityAttributes, ExtractionResult,
    ExtractionStatistics, Position, Provenance, WaveStatistics,
};
use crate::pattern_match;
use crate::patterns::cache::CachedPatternStore;
use crate::relationships;
use crate::router::RoutingDecision;
use crate::waves::{self, WaveSpec};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub chars_per_token: f64,
    /// Per-wave call timeout.
    pub wave_timeout: Duration,
    /// Whole-extraction deadline; partial results are returned on expiry.
    pub extraction_timeout: Option<Duration>,
    /// Chars of document opening passed to waves as context.
    pub context_snippet_chars: usize,
    /// Aggregated examples included per target type.
    pub examples_per_type: usize,
    pub relationship_confidence_floor: f64,
    pub max_relationships: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
            wave_timeout: Duration::from_secs(120),
            extraction_timeout: None,
            context_snippet_chars: 2_000,
            examples_per_type: 3,
            relationship_confidence_floor: 0.5,
            max_relationships: 100,
        }
    }
}

/// Drives a full document extraction (C7).
#[derive(Clone)]
pub struct ExtractionOrchestrator {
    client: Arc<dyn ChatClient>,
    patterns: Arc<CachedPatternStore>,
    config: OrchestratorConfig,
}

struct ChunkOutcome {
    index: usize,
    entities: Vec<Entity>,
    citations: Vec<Citation>,
    waves: Vec<WaveStatistics>,
    timed_out: bool,
}

enum WaveCall {
    Success {
        json: serde_json::Value,
        tokens: u64,
        retries: u32,
    },
    Failure {
        error: String,
        retries: u32,
        deadline_hit: bool,
    },
}

impl ExtractionOrchestrator {
    pub fn new(
        client: Arc<dyn ChatClient>,
        patterns: Arc<CachedPatternStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            patterns,
            config,
        }
    }

    /// Execute the strategy chosen by the router and assemble the result.
    pub async fn extract(&self, document_text: &str, decision: &RoutingDecision) -> ExtractionResult {
        let document_id = ExtractionResult::new_document_id();
        let started = Instant::now();

        if decision.strategy.is_sentinel() {
            debug!(
                "Sentinel strategy {}, returning empty result",
                decision.strategy.as_str()
            );
            return ExtractionResult::empty(document_id, decision.strategy);
        }

        let plan = waves::plan_for_strategy(decision.strategy);
        if plan.is_empty() {
            return ExtractionResult::empty(document_id, decision.strategy);
        }

        let deadline = self.config.extraction_timeout.map(|t| started + t);
        let document: Arc<str> = Arc::from(document_text);
        let snippet: Arc<str> = Arc::from(truncate_chars(
            document_text,
            self.config.context_snippet_chars,
        ));

        let (entity_plan, relationship_spec): (Vec<WaveSpec>, Option<WaveSpec>) = {
            let mut entity_plan = plan;
            let relationship_spec = match entity_plan.last() {
                Some(spec) if spec.is_relationship_wave => entity_plan.pop(),
                _ => None,
            };
            (entity_plan, relationship_spec)
        };

        let chunks = match &decision.chunk_config {
            Some(config) => chunker::chunk_document(document_text, config, self.config.chars_per_token),
            None => vec![Chunk {
                id: "chunk_0".to_string(),
                index: 0,
                start: 0,
                end: document_text.chars().count(),
                text: document_text.to_string(),
            }],
        };
        let num_chunks = chunks.len();
        let chunked = decision.chunk_config.is_some();

        info!(
            "Starting extraction {}: strategy={}, {} entity waves, {} chunks",
            document_id,
            decision.strategy.as_str(),
            entity_plan.len(),
            num_chunks,
        );

        // Chunks run concurrently; waves within a chunk are sequential.
        let entity_plan = Arc::new(entity_plan);
        let mut join_set = JoinSet::new();
        for chunk in chunks {
            let orchestrator = self.clone();
            let document = Arc::clone(&document);
            let snippet = Arc::clone(&snippet);
            let plan = Arc::clone(&entity_plan);
            let document_id = document_id.clone();
            join_set.spawn(async move {
                orchestrator
                    .run_chunk(document, snippet, chunk, plan, document_id, deadline, chunked)
                    .await
            });
        }

        let mut outcomes: Vec<ChunkOutcome> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("Chunk task failed: {}", e),
            }
        }
        outcomes.sort_by_key(|o| o.index);

        let mut statistics = ExtractionStatistics {
            num_chunks,
            ..Default::default()
        };
        let mut all_entities = Vec::new();
        let mut all_citations = Vec::new();
        for outcome in outcomes {
            statistics.timed_out |= outcome.timed_out;
            statistics.waves.extend(outcome.waves);
            all_entities.extend(outcome.entities);
            all_citations.extend(outcome.citations);
        }

        statistics.entities_extracted = all_entities.len() + all_citations.len();

        // Cross-wave and cross-chunk deduplication.
        let entities = dedup_entities(all_entities, &mut statistics.duplicates_removed);
        let citations = dedup_citations(all_citations, &mut statistics.duplicates_removed);
        statistics.unique_entities = entities.len() + citations.len();

        // The relationship wave runs last and sees the deduplicated union.
        let mut relationships = Vec::new();
        if let Some(spec) = relationship_spec {
            let deadline_passed = deadline
                .map(|d| Instant::now() >= d)
                .unwrap_or(false);
            if deadline_passed {
                statistics.timed_out = true;
            } else if entities.is_empty() && citations.is_empty() {
                debug!("No entities extracted, skipping relationship wave");
            } else {
                relationships = self
                    .run_relationship_wave(
                        &spec,
                        &document,
                        &entities,
                        &citations,
                        deadline,
                        &mut statistics,
                    )
                    .await;
            }
        }

        statistics.waves_attempted = statistics.waves.len();
        statistics.waves_succeeded = statistics.waves.iter().filter(|w| w.success).count();
        statistics.waves_failed = statistics.waves_attempted - statistics.waves_succeeded;
        statistics.total_retries = statistics.waves.iter().map(|w| w.retries).sum();
        statistics.duration_ms = started.elapsed().as_millis() as u64;

        let tokens_used = statistics.waves.iter().map(|w| w.tokens_used).sum();

        info!(
            "Extraction {} complete: {} entities, {} citations, {} relationships, {} waves ({} failed), {} tokens",
            document_id,
            entities.len(),
            citations.len(),
            relationships.len(),
            statistics.waves_attempted,
            statistics.waves_failed,
            tokens_used,
        );

        ExtractionResult {
            document_id,
            strategy: decision.strategy,
            waves_executed: statistics.waves_attempted,
            tokens_used,
            extracted_at: chrono::Utc::now().to_rfc3339(),
            entities,
            citations,
            relationships,
            statistics,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_chunk(
        &self,
        document: Arc<str>,
        snippet: Arc<str>,
        chunk: Chunk,
        plan: Arc<Vec<WaveSpec>>,
        document_id: String,
        deadline: Option<Instant>,
        chunked: bool,
    ) -> ChunkOutcome {
        let document_chars: Vec<char> = document.chars().collect();
        let mut outcome = ChunkOutcome {
            index: chunk.index,
            entities: Vec::new(),
            citations: Vec::new(),
            waves: Vec::new(),
            timed_out: false,
        };

        for spec in plan.iter() {
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                warn!(
                    "Extraction deadline reached before wave {} of {}",
                    spec.wave_number, chunk.id
                );
                outcome.timed_out = true;
                break;
            }

            let examples = self.examples_for_types(spec.target_entity_types);
            let prompt = waves::build_entity_prompt(spec, &chunk.text, &examples, &snippet);
            let request = ChatRequest::json(
                vec![
                    Message::system(waves::SYSTEM_PROMPT),
                    Message::user(prompt),
                ],
                spec.max_tokens,
                spec.temperature,
            );

            let wave_started = Instant::now();
            match self.call_wave(spec, &request, deadline).await {
                WaveCall::Success {
                    json,
                    tokens,
                    retries,
                } => {
                    let (entities, citations) = self.parse_wave_items(
                        &json,
                        spec,
                        &chunk,
                        &document_chars,
                        &document_id,
                        chunked,
                    );
                    debug!(
                        "Wave {} ({}) on {}: {} entities, {} citations",
                        spec.wave_number,
                        spec.name,
                        chunk.id,
                        entities.len(),
                        citations.len(),
                    );
                    outcome.waves.push(WaveStatistics {
                        wave_number: spec.wave_number,
                        entities_found: entities.len() + citations.len(),
                        tokens_used: tokens,
                        duration_ms: wave_started.elapsed().as_millis() as u64,
                        retries,
                        success: true,
                        error: None,
                    });
                    outcome.entities.extend(entities);
                    outcome.citations.extend(citations);
                }
                WaveCall::Failure {
                    error,
                    retries,
                    deadline_hit,
                } => {
                    warn!(
                        "Wave {} ({}) on {} failed after {} retries: {}",
                        spec.wave_number, spec.name, chunk.id, retries, error
                    );
                    outcome.waves.push(WaveStatistics {
                        wave_number: spec.wave_number,
                        entities_found: 0,
                        tokens_used: 0,
                        duration_ms: wave_started.elapsed().as_millis() as u64,
                        retries,
                        success: false,
                        error: Some(error),
                    });
                    if deadline_hit {
                        outcome.timed_out = true;
                        break;
                    }
                    // A failed wave does not abort the plan.
                }
            }
        }

        outcome
    }

    /// Call the client with the wave's retry budget and exponential
    /// backoff. Each attempt is bounded by the wave timeout and the
    /// remaining extraction deadline.
    async fn call_wave(
        &self,
        spec: &WaveSpec,
        request: &ChatRequest,
        deadline: Option<Instant>,
    ) -> WaveCall {
        let mut retries = 0;
        let mut last_error = String::new();

        for attempt in 0..=spec.retry_count {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }

            let mut timeout = self.config.wave_timeout;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return WaveCall::Failure {
                        error: if last_error.is_empty() {
                            "extraction deadline exceeded".to_string()
                        } else {
                            last_error
                        },
                        retries,
                        deadline_hit: true,
                    };
                }
                timeout = timeout.min(remaining);
            }

            match tokio::time::timeout(timeout, self.client.generate(request)).await {
                Err(_) => {
                    retries += 1;
                    last_error = format!("wave timed out after {:?}", timeout);
                }
                Ok(Err(e)) => {
                    retries += 1;
                    last_error = e.to_string();
                }
                Ok(Ok(response)) => {
                    let json = response
                        .json
                        .unwrap_or_else(|| serde_json::json!({ "entities": [] }));
                    return WaveCall::Success {
                        json,
                        tokens: response.total_tokens,
                        retries,
                    };
                }
            }
        }

        WaveCall::Failure {
            error: last_error,
            retries,
            deadline_hit: false,
        }
    }

    /// Aggregated examples for the wave's target types, drawn through the
    /// pattern cache.
    fn examples_for_types(&self, types: &[&str]) -> String {
        let mut lines = Vec::new();
        for entity_type in types {
            let examples = self.patterns.aggregated_examples(entity_type);
            if examples.is_empty() {
                continue;
            }
            let sample: Vec<String> = examples
                .iter()
                .take(self.config.examples_per_type)
                .map(|e| format!("\"{}\"", e))
                .collect();
            lines.push(format!("{}: {}", entity_type, sample.join("; ")));
        }

        if lines.is_empty() {
            "(no examples available)".to_string()
        } else {
            lines.join("\n")
        }
    }

    /// Turn one wave response into entity/citation candidates with
    /// absolute, clamped positions.
    fn parse_wave_items(
        &self,
        json: &serde_json::Value,
        spec: &WaveSpec,
        chunk: &Chunk,
        document_chars: &[char],
        document_id: &str,
        chunked: bool,
    ) -> (Vec<Entity>, Vec<Citation>) {
        let mut entities = Vec::new();
        let mut citations = Vec::new();
        let doc_len = document_chars.len();
        let aliases = self.patterns.store().aliases();

        let Some(items) = json.get("entities").and_then(|v| v.as_array()) else {
            return (entities, citations);
        };

        for item in items {
            let Some(text) = item
                .get("text")
                .or_else(|| item.get("name"))
                .or_else(|| item.get("entity_text"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
            else {
                continue;
            };

            let declared = item
                .get("entity_type")
                .or_else(|| item.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let canonicalized = aliases.canonicalize(declared);

            let Some((start, end)) = resolve_span(item, text, chunk, doc_len) else {
                debug!(
                    "Dropping '{}' from wave {}: no usable span",
                    text, spec.wave_number
                );
                continue;
            };

            let mut confidence = clamp_confidence(
                item.get("confidence")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.8),
            );

            // Confirm against the library: a matching pattern of the same
            // type goes into provenance and floors the confidence.
            let type_patterns = self
                .patterns
                .patterns_by_entity_type(canonicalized.canonical.as_str());
            let pattern_match = pattern_match::verify_candidate(type_patterns.as_slice(), text);
            if let Some(matched) = &pattern_match {
                confidence = confidence.max(matched.pattern_confidence);
            }

            let position = Position::with_context(start, end, 50, doc_len);
            let context_snippet = item
                .get("context")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| {
                    Some(
                        document_chars[position.context_start..position.context_end]
                            .iter()
                            .collect(),
                    )
                });

            let provenance = Provenance {
                pattern_full_name: pattern_match.map(|m| m.pattern_full_name),
                wave_number: Some(spec.wave_number),
                chunk_id: chunked.then(|| chunk.id.clone()),
                document_id: document_id.to_string(),
                original_type: canonicalized
                    .is_fallback
                    .then(|| declared.to_string()),
            };

            let cleaned_text = clean_entity_text(text);
            let extraction_method = format!("wave_{}", spec.wave_number);

            match canonicalized.canonical {
                CanonicalType::Citation(citation_type) => {
                    let components = parse_components(item);
                    let bluebook_compliant = components.volume.is_some()
                        && components.reporter.is_some()
                        && components.page.is_some();
                    citations.push(Citation {
                        id: Citation::new_id(),
                        citation_type,
                        text: text.to_string(),
                        cleaned_text,
                        confidence,
                        position,
                        context_snippet,
                        extraction_method,
                        components,
                        bluebook_compliant,
                        provenance,
                    });
                }
                CanonicalType::Entity(entity_type) => {
                    entities.push(Entity {
                        id: Entity::new_id(),
                        entity_type,
                        text: text.to_string(),
                        cleaned_text,
                        confidence,
                        position,
                        context_snippet,
                        extraction_method,
                        attributes: parse_attributes(item),
                        provenance,
                    });
                }
            }
        }

        (entities, citations)
    }

    async fn run_relationship_wave(
        &self,
        spec: &WaveSpec,
        document: &str,
        entities: &[Entity],
        citations: &[Citation],
        deadline: Option<Instant>,
        statistics: &mut ExtractionStatistics,
    ) -> Vec<crate::model::Relationship> {
        let eligible = relationships::eligible_patterns(
            &self.patterns.relationship_patterns(),
            entities,
            citations,
        );
        if eligible.is_empty() {
            debug!("No eligible relationship patterns, skipping relationship wave");
            return Vec::new();
        }

        let entities_json =
            serde_json::to_string_pretty(&relationships::entities_json(entities, citations))
                .unwrap_or_else(|_| "[]".to_string());
        let prompt = waves::build_relationship_prompt(
            spec,
            document,
            &relationships::describe_relationship_types(&eligible),
            &entities_json,
        );
        let request = ChatRequest::json(
            vec![
                Message::system(waves::SYSTEM_PROMPT),
                Message::user(prompt),
            ],
            spec.max_tokens,
            spec.temperature,
        );

        info!(
            "Executing relationship wave with {} entities and {} eligible patterns",
            entities.len() + citations.len(),
            eligible.len(),
        );

        let wave_started = Instant::now();
        match self.call_wave(spec, &request, deadline).await {
            WaveCall::Success {
                json,
                tokens,
                retries,
            } => {
                let known_ids: HashSet<String> = entities
                    .iter()
                    .map(|e| e.id.clone())
                    .chain(citations.iter().map(|c| c.id.clone()))
                    .collect();
                let parsed = relationships::parse_response(
                    &json,
                    &known_ids,
                    &eligible,
                    document,
                    self.config.relationship_confidence_floor,
                    self.config.max_relationships,
                );
                statistics.relationships_dropped += parsed.dropped_unknown_ids;
                statistics.waves.push(WaveStatistics {
                    wave_number: spec.wave_number,
                    entities_found: parsed.relationships.len(),
                    tokens_used: tokens,
                    duration_ms: wave_started.elapsed().as_millis() as u64,
                    retries,
                    success: true,
                    error: None,
                });
                parsed.relationships
            }
            WaveCall::Failure {
                error,
                retries,
                deadline_hit,
            } => {
                warn!("Relationship wave failed: {}", error);
                statistics.waves.push(WaveStatistics {
                    wave_number: spec.wave_number,
                    entities_found: 0,
                    tokens_used: 0,
                    duration_ms: wave_started.elapsed().as_millis() as u64,
                    retries,
                    success: false,
                    error: Some(error),
                });
                statistics.timed_out |= deadline_hit;
                Vec::new()
            }
        }
    }
}

/// Resolve an item's chunk-relative span to absolute document offsets.
/// Spans wholly outside the chunk are rejected; spans reaching past the
/// document are clamped. Items without usable offsets are located by their
/// text inside the chunk.
fn resolve_span(
    item: &serde_json::Value,
    text: &str,
    chunk: &Chunk,
    doc_len: usize,
) -> Option<(usize, usize)> {
    let start = item
        .get("start")
        .or_else(|| item.get("start_position"))
        .and_then(|v| v.as_u64())
        .map(|v| v as usize);
    let end = item
        .get("end")
        .or_else(|| item.get("end_position"))
        .and_then(|v| v.as_u64())
        .map(|v| v as usize);

    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            let abs_start = chunk.start + start;
            let abs_end = chunk.start + end;
            // A span that begins past the chunk is not trusted at all.
            if abs_start < chunk.end && abs_start < doc_len {
                return Some((abs_start, abs_end.min(doc_len)));
            }
        }
    }

    // Fall back to locating the text inside the chunk.
    chunk.text.find(text).map(|byte_pos| {
        let start = chunk.start + chunk.text[..byte_pos].chars().count();
        let end = (start + text.chars().count()).min(doc_len);
        (start, end)
    })
}

fn parse_components(item: &serde_json::Value) -> CitationComponents {
    let Some(components) = item.get("components").and_then(|v| v.as_object()) else {
        return CitationComponents::default();
    };

    let field = |key: &str| -> Option<String> {
        components.get(key).and_then(|v| match v {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    CitationComponents {
        case_name: field("case_name"),
        volume: field("volume"),
        reporter: field("reporter"),
        page: field("page"),
        year: field("year"),
        pincite: field("pincite"),
        section: field("section"),
    }
}

fn parse_attributes(item: &serde_json::Value) -> EntityAttributes {
    let Some(attributes) = item.get("attributes").and_then(|v| v.as_object()) else {
        return EntityAttributes::default();
    };

    let field = |key: &str| -> Option<String> {
        attributes
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    EntityAttributes {
        court_name: field("court_name"),
        judge_title: field("judge_title"),
        jurisdiction: field("jurisdiction"),
        party_role: field("party_role"),
        organization_type: field("organization_type"),
    }
}

fn dedup_entities(entities: Vec<Entity>, removed: &mut usize) -> Vec<Entity> {
    let mut map: HashMap<_, Entity> = HashMap::new();
    for entity in entities {
        match map.entry(entity.dedup_key()) {
            Entry::Occupied(mut occupied) => {
                *removed += 1;
                if entity.confidence > occupied.get().confidence {
                    occupied.insert(entity);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entity);
            }
        }
    }
    let mut out: Vec<Entity> = map.into_values().collect();
    out.sort_by_key(|e| (e.position.start, e.position.end));
    out
}

fn dedup_citations(citations: Vec<Citation>, removed: &mut usize) -> Vec<Citation> {
    let mut map: HashMap<_, Citation> = HashMap::new();
    for citation in citations {
        match map.entry(citation.dedup_key()) {
            Entry::Occupied(mut occupied) => {
                *removed += 1;
                if citation.confidence > occupied.get().confidence {
                    occupied.insert(citation);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(citation);
            }
        }
    }
    let mut out: Vec<Citation> = map.into_values().collect();
    out.sort_by_key(|c| (c.position.start, c.position.end));
    out
}

/// Char-safe prefix truncation.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Normalise an extracted span for display: collapse whitespace, strip
/// wrapping quotes and dangling separators. The raw `text` field keeps the
/// verbatim span.
fn clean_entity_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c| matches!(c, '"' | '\'' | '\u{201c}' | '\u{201d}'))
        .trim_end_matches([',', ';', ':'])
        .trim()
        .to_string()
}
