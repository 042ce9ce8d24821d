//! Pattern library: loading, compilation, and indexed retrieval.
//!
//! Pattern files are discovered recursively below a configured root,
//! hashed, parsed, validated and compiled at startup. Reloads are keyed on
//! the per-file content hash: only changed files are re-parsed, and a file
//! that fails to parse leaves its previously loaded group untouched.

pub mod cache;
pub mod file;

use crate::entity_types::AliasMap;
use file::{NormalizedFile, RawRelationshipPattern, ValidationRules};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// How many parser threads a load may use.
const MAX_LOAD_WORKERS: usize = 4;

/// Metadata shared by all patterns from one file.
#[derive(Debug, Clone, Serialize)]
pub struct PatternMetadata {
    pub pattern_type: String,
    pub jurisdiction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub court_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bluebook_compliance: Option<String>,
    pub pattern_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub file_path: PathBuf,
    pub file_hash: String,
}

/// A compiled, immutable pattern.
#[derive(Debug)]
pub struct Pattern {
    /// `group.pattern` identity.
    pub full_name: String,
    pub group_name: String,
    pub pattern_name: String,
    pub expression: String,
    pub regex: Regex,
    pub confidence: f64,
    pub components: HashMap<String, String>,
    pub examples: Vec<String>,
    /// Type as written in the file.
    pub declared_type: String,
    /// Canonical type name after alias mapping.
    pub canonical_type: String,
    pub is_citation: bool,
    pub dependencies: Vec<String>,
    pub validation: ValidationRules,
    pub metadata: Arc<PatternMetadata>,
}

impl Pattern {
    /// Serializable view for the introspection endpoints.
    pub fn detail(&self) -> PatternDetail {
        PatternDetail {
            name: self.full_name.clone(),
            group: self.group_name.clone(),
            match_expression: self.expression.clone(),
            entity_type: self.canonical_type.clone(),
            original_entity_type: self.declared_type.clone(),
            confidence: self.confidence,
            examples: self.examples.iter().take(5).cloned().collect(),
            components: self.components.clone(),
            dependencies: self.dependencies.clone(),
            validation: self.validation.clone(),
            pattern_type: self.metadata.pattern_type.clone(),
            jurisdiction: self.metadata.jurisdiction.clone(),
        }
    }
}

/// All patterns loaded from one file.
#[derive(Debug, Clone)]
pub struct PatternGroup {
    pub group_name: String,
    pub metadata: Arc<PatternMetadata>,
    pub patterns: Vec<Arc<Pattern>>,
    pub dependencies: Vec<String>,
}

/// A declarative binary relationship description.
#[derive(Debug, Clone, Serialize)]
pub struct RelationshipPattern {
    pub relationship_type: String,
    pub category: String,
    pub source_entity_type: String,
    pub target_entity_type: String,
    pub indicators: Vec<String>,
    pub examples: Vec<String>,
    pub confidence: f64,
    pub bidirectional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Serializable pattern listing for introspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PatternDetail {
    pub name: String,
    pub group: String,
    pub match_expression: String,
    pub entity_type: String,
    pub original_entity_type: String,
    pub confidence: f64,
    pub examples: Vec<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub components: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "ValidationRules::is_empty")]
    pub validation: ValidationRules,
    pub pattern_type: String,
    pub jurisdiction: String,
}

/// Aggregate information about an entity type.
#[derive(Debug, Clone, Serialize)]
pub struct EntityTypeInfo {
    pub entity_type: String,
    pub pattern_count: usize,
    pub examples: Vec<String>,
    pub description: String,
    pub average_confidence: f64,
    pub pattern_names: Vec<String>,
    pub has_patterns: bool,
    pub jurisdictions: Vec<String>,
    pub pattern_types: Vec<String>,
}

/// Pattern library statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PatternStatistics {
    pub total_groups: usize,
    pub total_patterns: usize,
    pub total_entity_types: usize,
    pub dependency_count: usize,
    pub groups: BTreeMap<String, GroupStatistics>,
    pub confidence_distribution: BTreeMap<&'static str, usize>,
    pub entity_type_distribution: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatistics {
    pub pattern_count: usize,
    pub pattern_type: String,
    pub jurisdiction: String,
    pub version: String,
}

/// Aggregate statistics over the relationship pattern library.
#[derive(Debug, Clone, Serialize)]
pub struct RelationshipStatistics {
    pub total_relationships: usize,
    pub total_categories: usize,
    pub total_indicators: usize,
    pub bidirectional_relationships: usize,
    pub average_indicators_per_relationship: f64,
}

/// Loading metrics, cumulative across reloads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadMetrics {
    pub files_loaded: usize,
    pub patterns_loaded: usize,
    pub load_errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_load_time: Option<String>,
    pub total_load_time_ms: u64,
}

/// Outcome of one `load_all`/`reload` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub files_checked: usize,
    pub files_loaded: usize,
    pub files_unchanged: usize,
    pub errors: usize,
    pub patterns_loaded: usize,
}

#[derive(Default)]
struct StoreState {
    /// Group per source file; file path is the reload granularity.
    groups_by_file: HashMap<PathBuf, PatternGroup>,
    relationships_by_file: HashMap<PathBuf, (String, Vec<RelationshipPattern>)>,
    file_hashes: HashMap<PathBuf, String>,

    // Derived indexes, rebuilt after each load mutation.
    by_name: HashMap<String, Arc<Pattern>>,
    by_type: HashMap<String, Vec<Arc<Pattern>>>,
    aggregated_examples: HashMap<String, Vec<String>>,
    dependency_graph: HashMap<String, Vec<String>>,

    metrics: LoadMetrics,
}

/// The process-wide pattern store (C1). All reads are lock-cheap clones of
/// `Arc`ed patterns; loads take the single writer lock.
pub struct PatternStore {
    root: PathBuf,
    aliases: AliasMap,
    inner: RwLock<StoreState>,
}

enum FileOutcome {
    Unchanged,
    Group {
        path: PathBuf,
        hash: String,
        group: PatternGroup,
    },
    Relationships {
        path: PathBuf,
        hash: String,
        category: String,
        patterns: Vec<RelationshipPattern>,
    },
    Failed {
        path: PathBuf,
        error: String,
    },
}

impl PatternStore {
    pub fn new(root: impl Into<PathBuf>, aliases: AliasMap) -> Self {
        Self {
            root: root.into(),
            aliases,
            inner: RwLock::new(StoreState::default()),
        }
    }

    pub fn aliases(&self) -> &AliasMap {
        &self.aliases
    }

    /// Load (or reload) every pattern file under the root. Only files whose
    /// content hash changed are re-parsed; a failed parse leaves the prior
    /// group intact and counts as a load error.
    pub fn load_all(&self) -> LoadReport {
        let start = Instant::now();

        if !self.root.exists() {
            warn!("Patterns directory does not exist: {:?}", self.root);
            return LoadReport::default();
        }

        let files = self.discover_files();
        if files.is_empty() {
            warn!("No pattern files found in {:?}", self.root);
            return LoadReport::default();
        }

        info!("Loading {} pattern files from {:?}", files.len(), self.root);

        let known_hashes = {
            let state = self.inner.read().unwrap();
            state.file_hashes.clone()
        };

        let outcomes = self.parse_files(&files, &known_hashes);

        let mut report = LoadReport {
            files_checked: files.len(),
            ..Default::default()
        };

        {
            let mut state = self.inner.write().unwrap();
            for outcome in outcomes {
                match outcome {
                    FileOutcome::Unchanged => report.files_unchanged += 1,
                    FileOutcome::Failed { path, error } => {
                        warn!("Skipping pattern file {:?}: {}", path, error);
                        state.metrics.load_errors += 1;
                        report.errors += 1;
                    }
                    FileOutcome::Group { path, hash, group } => {
                        debug!(
                            "Loaded group '{}' with {} patterns from {:?}",
                            group.group_name,
                            group.patterns.len(),
                            path
                        );
                        report.files_loaded += 1;
                        report.patterns_loaded += group.patterns.len();
                        state.metrics.files_loaded += 1;
                        state.metrics.patterns_loaded += group.patterns.len();
                        state.file_hashes.insert(path.clone(), hash);
                        state.groups_by_file.insert(path, group);
                    }
                    FileOutcome::Relationships {
                        path,
                        hash,
                        category,
                        patterns,
                    } => {
                        debug!(
                            "Loaded {} relationship patterns for category '{}'",
                            patterns.len(),
                            category
                        );
                        report.files_loaded += 1;
                        state.metrics.files_loaded += 1;
                        state.file_hashes.insert(path.clone(), hash);
                        state.relationships_by_file.insert(path, (category, patterns));
                    }
                }
            }

            rebuild_indexes(&mut state);

            let elapsed = start.elapsed();
            state.metrics.last_load_time = Some(chrono::Utc::now().to_rfc3339());
            state.metrics.total_load_time_ms += elapsed.as_millis() as u64;

            info!(
                "Pattern loading completed in {:?}: {} loaded, {} unchanged, {} errors ({} patterns)",
                elapsed, report.files_loaded, report.files_unchanged, report.errors,
                state.by_name.len()
            );
        }

        report
    }

    /// Alias for `load_all`; reload semantics are identical (hash-keyed).
    pub fn reload(&self) -> LoadReport {
        info!("Reloading patterns from {:?}", self.root);
        self.load_all()
    }

    fn discover_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| path.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        files.sort();
        files
    }

    fn parse_files(
        &self,
        files: &[PathBuf],
        known_hashes: &HashMap<PathBuf, String>,
    ) -> Vec<FileOutcome> {
        let workers = MAX_LOAD_WORKERS.min(files.len()).max(1);
        let chunk_size = files.len().div_ceil(workers);

        std::thread::scope(|scope| {
            let handles: Vec<_> = files
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|path| self.parse_one(path, known_hashes))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| handle.join().expect("pattern load worker panicked"))
                .collect()
        })
    }

    fn parse_one(&self, path: &Path, known_hashes: &HashMap<PathBuf, String>) -> FileOutcome {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                return FileOutcome::Failed {
                    path: path.to_path_buf(),
                    error: format!("read error: {}", e),
                }
            }
        };

        let hash = content_hash(&content);
        if known_hashes.get(path) == Some(&hash) {
            return FileOutcome::Unchanged;
        }

        if is_relationship_file(path) {
            match file::parse_relationship_file(&content) {
                Ok(parsed) => {
                    let category = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| "general".to_string());
                    let patterns = parsed
                        .patterns
                        .into_iter()
                        .map(|raw| self.build_relationship_pattern(raw, &category))
                        .collect();
                    FileOutcome::Relationships {
                        path: path.to_path_buf(),
                        hash,
                        category,
                        patterns,
                    }
                }
                Err(e) => FileOutcome::Failed {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                },
            }
        } else {
            match file::parse_pattern_file(&content) {
                Ok(parsed) => {
                    let group = self.build_group(path, &hash, parsed);
                    FileOutcome::Group {
                        path: path.to_path_buf(),
                        hash,
                        group,
                    }
                }
                Err(e) => FileOutcome::Failed {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                },
            }
        }
    }

    fn build_relationship_pattern(
        &self,
        raw: RawRelationshipPattern,
        category: &str,
    ) -> RelationshipPattern {
        RelationshipPattern {
            relationship_type: raw.relationship_type.to_uppercase(),
            category: category.to_string(),
            source_entity_type: self.aliases.canonical_name(&raw.source_entity),
            target_entity_type: self.aliases.canonical_name(&raw.target_entity),
            indicators: raw.indicators,
            examples: raw.examples,
            confidence: raw.confidence.unwrap_or(0.7).clamp(0.0, 1.0),
            bidirectional: raw.bidirectional,
            description: raw.description,
        }
    }

    fn build_group(&self, path: &Path, hash: &str, parsed: NormalizedFile) -> PatternGroup {
        let group_name = parsed
            .metadata
            .pattern_type
            .clone()
            .filter(|t| !t.is_empty() && t != "unknown")
            .unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "patterns".to_string())
            });

        let metadata = Arc::new(PatternMetadata {
            pattern_type: parsed
                .metadata
                .pattern_type
                .unwrap_or_else(|| "unknown".to_string()),
            jurisdiction: parsed
                .metadata
                .jurisdiction
                .unwrap_or_else(|| "unknown".to_string()),
            court_level: parsed.metadata.court_level,
            bluebook_compliance: parsed.metadata.bluebook_compliance,
            pattern_version: parsed
                .metadata
                .pattern_version
                .unwrap_or_else(|| "1.0".to_string()),
            created_date: parsed.metadata.created_date,
            last_updated: parsed.metadata.last_updated,
            description: parsed.metadata.description,
            file_path: path.to_path_buf(),
            file_hash: hash.to_string(),
        });

        let mut patterns = Vec::new();
        for normalized in parsed.patterns {
            let full_name = format!("{}.{}", group_name, normalized.name);

            let regex = match RegexBuilder::new(&normalized.record.match_expression)
                .multi_line(true)
                .build()
            {
                Ok(regex) => regex,
                Err(e) => {
                    warn!("Invalid regex in pattern {}: {}", full_name, e);
                    continue;
                }
            };

            let declared_type = normalized
                .record
                .declared_entity_type()
                .unwrap_or_else(|| normalized.section.clone());
            let canonicalized = self.aliases.canonicalize(&declared_type);
            if canonicalized.is_fallback {
                debug!(
                    "Pattern {} declares unknown type '{}', using fallback",
                    full_name, declared_type
                );
            }

            let raw_confidence = normalized.record.confidence.unwrap_or(0.7);
            let confidence = raw_confidence.clamp(0.0, 1.0);
            if confidence != raw_confidence {
                warn!(
                    "Pattern {} confidence {} out of range, clamped",
                    full_name, raw_confidence
                );
            }

            let examples: Vec<String> = normalized
                .record
                .examples
                .into_iter()
                .filter(|e| {
                    if e.trim().is_empty() {
                        warn!("Pattern {} declares an empty example, dropped", full_name);
                        false
                    } else {
                        true
                    }
                })
                .collect();
            for example in &examples {
                if !regex.is_match(example) {
                    warn!(
                        "Pattern {} example does not match its expression: {:?}",
                        full_name, example
                    );
                }
            }

            patterns.push(Arc::new(Pattern {
                full_name,
                group_name: group_name.clone(),
                pattern_name: normalized.name,
                expression: normalized.record.match_expression,
                regex,
                confidence,
                components: normalized.record.components,
                examples,
                declared_type: declared_type.clone(),
                canonical_type: canonicalized.canonical.as_str().to_string(),
                is_citation: canonicalized.canonical.is_citation(),
                dependencies: normalized.record.dependencies,
                validation: normalized.record.validation,
                metadata: Arc::clone(&metadata),
            }));
        }

        PatternGroup {
            group_name,
            metadata,
            patterns,
            dependencies: parsed.dependencies,
        }
    }

    // ------------------------------------------------------------------
    // Read operations
    // ------------------------------------------------------------------

    pub fn get_pattern(&self, full_name: &str) -> Option<Arc<Pattern>> {
        self.inner.read().unwrap().by_name.get(full_name).cloned()
    }

    /// Patterns for an entity type, resolvable by canonical or declared name.
    pub fn get_patterns_by_entity_type(&self, entity_type: &str) -> Vec<Arc<Pattern>> {
        let canonical = self.aliases.canonical_name(entity_type);
        let state = self.inner.read().unwrap();

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in [canonical.as_str(), entity_type] {
            if let Some(patterns) = state.by_type.get(key) {
                for pattern in patterns {
                    if seen.insert(pattern.full_name.clone()) {
                        out.push(Arc::clone(pattern));
                    }
                }
            }
        }
        out
    }

    pub fn get_patterns_by_confidence(&self, min_confidence: f64) -> Vec<Arc<Pattern>> {
        let state = self.inner.read().unwrap();
        let mut out: Vec<Arc<Pattern>> = state
            .by_name
            .values()
            .filter(|p| p.confidence >= min_confidence)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        out
    }

    pub fn get_entity_types(&self) -> Vec<String> {
        let state = self.inner.read().unwrap();
        let mut types: Vec<String> = state.by_type.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_entity_types_with_examples(&self) -> Vec<String> {
        let state = self.inner.read().unwrap();
        let mut types: Vec<String> = state
            .by_type
            .keys()
            .filter(|t| {
                state
                    .aggregated_examples
                    .get(*t)
                    .map(|e| !e.is_empty())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Aggregated examples for an entity type (canonical name tried first).
    pub fn get_aggregated_examples(&self, entity_type: &str) -> Vec<String> {
        let canonical = self.aliases.canonical_name(entity_type);
        let state = self.inner.read().unwrap();
        state
            .aggregated_examples
            .get(&canonical)
            .or_else(|| state.aggregated_examples.get(entity_type))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_all_aggregated_examples(&self) -> HashMap<String, Vec<String>> {
        self.inner.read().unwrap().aggregated_examples.clone()
    }

    pub fn get_relationship_patterns(&self) -> BTreeMap<String, Vec<RelationshipPattern>> {
        let state = self.inner.read().unwrap();
        let mut out: BTreeMap<String, Vec<RelationshipPattern>> = BTreeMap::new();
        for (category, patterns) in state.relationships_by_file.values() {
            out.entry(category.clone())
                .or_default()
                .extend(patterns.iter().cloned());
        }
        out
    }

    pub fn get_relationship_categories(&self) -> BTreeMap<String, Vec<String>> {
        self.get_relationship_patterns()
            .into_iter()
            .map(|(category, patterns)| {
                let mut types: Vec<String> = patterns
                    .into_iter()
                    .map(|p| p.relationship_type)
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                types.sort();
                (category, types)
            })
            .collect()
    }

    pub fn get_relationship_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .get_relationship_patterns()
            .into_values()
            .flatten()
            .map(|p| p.relationship_type)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        types.sort();
        types
    }

    pub fn relationship_statistics(&self) -> RelationshipStatistics {
        let by_category = self.get_relationship_patterns();
        let total_categories = by_category.len();
        let patterns: Vec<RelationshipPattern> = by_category.into_values().flatten().collect();

        let total_relationships = patterns.len();
        let total_indicators: usize = patterns.iter().map(|p| p.indicators.len()).sum();
        let bidirectional_relationships = patterns.iter().filter(|p| p.bidirectional).count();
        let average_indicators_per_relationship = if total_relationships == 0 {
            0.0
        } else {
            total_indicators as f64 / total_relationships as f64
        };

        RelationshipStatistics {
            total_relationships,
            total_categories,
            total_indicators,
            bidirectional_relationships,
            average_indicators_per_relationship,
        }
    }

    /// Entity type info for every known type.
    pub fn all_entity_type_info(&self) -> Vec<EntityTypeInfo> {
        self.get_entity_types()
            .into_iter()
            .map(|entity_type| self.entity_type_info(&entity_type))
            .collect()
    }

    /// Citation-valued canonical types currently backed by patterns.
    pub fn citation_types(&self) -> Vec<String> {
        let state = self.inner.read().unwrap();
        let mut types: Vec<String> = state
            .by_name
            .values()
            .filter(|p| p.is_citation)
            .map(|p| p.canonical_type.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        types.sort();
        types
    }

    /// Map of pattern full name to declared dependencies that do not exist.
    pub fn validate_dependencies(&self) -> HashMap<String, Vec<String>> {
        let state = self.inner.read().unwrap();
        let mut missing_map = HashMap::new();

        for (name, deps) in &state.dependency_graph {
            let missing: Vec<String> = deps
                .iter()
                .filter(|dep| !state.by_name.contains_key(*dep))
                .cloned()
                .collect();
            if !missing.is_empty() {
                missing_map.insert(name.clone(), missing);
            }
        }

        missing_map
    }

    pub fn pattern_statistics(&self) -> PatternStatistics {
        let state = self.inner.read().unwrap();

        let mut groups = BTreeMap::new();
        for group in state.groups_by_file.values() {
            groups.insert(
                group.group_name.clone(),
                GroupStatistics {
                    pattern_count: group.patterns.len(),
                    pattern_type: group.metadata.pattern_type.clone(),
                    jurisdiction: group.metadata.jurisdiction.clone(),
                    version: group.metadata.pattern_version.clone(),
                },
            );
        }

        let mut confidence_distribution: BTreeMap<&'static str, usize> = BTreeMap::from([
            ("0.0-0.5", 0),
            ("0.5-0.7", 0),
            ("0.7-0.8", 0),
            ("0.8-0.9", 0),
            ("0.9-1.0", 0),
        ]);
        for pattern in state.by_name.values() {
            let bucket = match pattern.confidence {
                c if c < 0.5 => "0.0-0.5",
                c if c < 0.7 => "0.5-0.7",
                c if c < 0.8 => "0.7-0.8",
                c if c < 0.9 => "0.8-0.9",
                _ => "0.9-1.0",
            };
            *confidence_distribution.entry(bucket).or_default() += 1;
        }

        let mut entity_type_distribution = BTreeMap::new();
        for (entity_type, patterns) in &state.by_type {
            entity_type_distribution.insert(entity_type.clone(), patterns.len());
        }

        PatternStatistics {
            total_groups: groups.len(),
            total_patterns: state.by_name.len(),
            total_entity_types: state.by_type.len(),
            dependency_count: state.dependency_graph.values().map(|d| d.len()).sum(),
            groups,
            confidence_distribution,
            entity_type_distribution,
        }
    }

    pub fn entity_type_info(&self, entity_type: &str) -> EntityTypeInfo {
        let patterns = self.get_patterns_by_entity_type(entity_type);

        let mut examples: Vec<String> = Vec::new();
        let mut descriptions = Vec::new();
        let mut jurisdictions = HashSet::new();
        let mut pattern_types = HashSet::new();

        for pattern in &patterns {
            for example in pattern.examples.iter().take(3) {
                if !examples.contains(example) {
                    examples.push(example.clone());
                }
            }
            if let Some(description) = &pattern.metadata.description {
                descriptions.push(description.clone());
            }
            jurisdictions.insert(pattern.metadata.jurisdiction.clone());
            pattern_types.insert(pattern.metadata.pattern_type.clone());
        }
        examples.truncate(10);

        if examples.is_empty() {
            examples = self.get_aggregated_examples(entity_type);
            examples.truncate(5);
        }

        let average_confidence = if patterns.is_empty() {
            0.0
        } else {
            patterns.iter().map(|p| p.confidence).sum::<f64>() / patterns.len() as f64
        };

        let description = descriptions.into_iter().next().unwrap_or_else(|| {
            format!(
                "Legal entity type: {}",
                entity_type.replace('_', " ").to_lowercase()
            )
        });

        let mut jurisdictions: Vec<String> = jurisdictions.into_iter().collect();
        jurisdictions.sort();
        let mut pattern_types: Vec<String> = pattern_types.into_iter().collect();
        pattern_types.sort();

        EntityTypeInfo {
            entity_type: entity_type.to_string(),
            pattern_count: patterns.len(),
            examples,
            description,
            average_confidence,
            pattern_names: patterns
                .iter()
                .take(10)
                .map(|p| p.full_name.clone())
                .collect(),
            has_patterns: !patterns.is_empty(),
            jurisdictions,
            pattern_types,
        }
    }

    /// Substring search over name, description and examples.
    pub fn search_patterns(
        &self,
        query: &str,
        entity_type: Option<&str>,
        min_confidence: Option<f64>,
    ) -> Vec<Arc<Pattern>> {
        let query_lower = query.to_lowercase();
        let canonical_filter = entity_type.map(|t| self.aliases.canonical_name(t));
        let state = self.inner.read().unwrap();

        let mut matches: Vec<Arc<Pattern>> = state
            .by_name
            .values()
            .filter(|p| {
                if let Some(filter) = &canonical_filter {
                    if &p.canonical_type != filter {
                        return false;
                    }
                }
                if let Some(min) = min_confidence {
                    if p.confidence < min {
                        return false;
                    }
                }
                p.full_name.to_lowercase().contains(&query_lower)
                    || p.metadata
                        .description
                        .as_deref()
                        .map(|d| d.to_lowercase().contains(&query_lower))
                        .unwrap_or(false)
                    || p.examples
                        .iter()
                        .any(|e| e.to_lowercase().contains(&query_lower))
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches
    }

    pub fn all_patterns_detailed(&self) -> Vec<PatternDetail> {
        let state = self.inner.read().unwrap();
        let mut details: Vec<PatternDetail> = state.by_name.values().map(|p| p.detail()).collect();
        details.sort_by(|a, b| a.name.cmp(&b.name));
        details
    }

    pub fn pattern_names(&self) -> Vec<String> {
        let state = self.inner.read().unwrap();
        let mut names: Vec<String> = state.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn load_metrics(&self) -> LoadMetrics {
        self.inner.read().unwrap().metrics.clone()
    }
}

fn rebuild_indexes(state: &mut StoreState) {
    state.by_name.clear();
    state.by_type.clear();
    state.aggregated_examples.clear();
    state.dependency_graph.clear();

    for group in state.groups_by_file.values() {
        for pattern in &group.patterns {
            state
                .by_name
                .insert(pattern.full_name.clone(), Arc::clone(pattern));

            state
                .by_type
                .entry(pattern.canonical_type.clone())
                .or_default()
                .push(Arc::clone(pattern));
            let declared_normalized = pattern.declared_type.to_uppercase();
            if declared_normalized != pattern.canonical_type {
                state
                    .by_type
                    .entry(declared_normalized.clone())
                    .or_default()
                    .push(Arc::clone(pattern));
            }

            for key in [pattern.canonical_type.clone(), declared_normalized] {
                let examples = state.aggregated_examples.entry(key).or_default();
                for example in &pattern.examples {
                    if !examples.contains(example) {
                        examples.push(example.clone());
                    }
                }
            }

            let mut deps = pattern.dependencies.clone();
            deps.extend(group.dependencies.iter().cloned());
            if !deps.is_empty() {
                state
                    .dependency_graph
                    .insert(pattern.full_name.clone(), deps);
            }
        }
    }

    // Drop example keys that ended up empty so "with examples" queries are
    // meaningful.
    state.aggregated_examples.retain(|_, v| !v.is_empty());
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_relationship_file(path: &Path) -> bool {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|name| name == "relationships")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn courts_file() -> &'static str {
        r#"{
            "metadata": {"pattern_type": "courts", "jurisdiction": "federal", "pattern_version": "2.1"},
            "patterns": [
                {
                    "name": "supreme_court",
                    "match_expression": "Supreme Court of the United States",
                    "confidence": 0.98,
                    "entity_types": ["COURT"],
                    "examples": ["Supreme Court of the United States"]
                },
                {
                    "name": "district_court",
                    "match_expression": "United States District Court",
                    "confidence": 0.9,
                    "entity_types": ["COURT"],
                    "examples": ["United States District Court"]
                }
            ]
        }"#
    }

    fn store(dir: &Path) -> PatternStore {
        let store = PatternStore::new(dir, AliasMap::builtin());
        store.load_all();
        store
    }

    #[test]
    fn test_load_and_lookup_by_name() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "courts.json", courts_file());

        let store = store(dir.path());
        let pattern = store.get_pattern("courts.supreme_court").expect("pattern");
        assert_eq!(pattern.canonical_type, "COURT");
        assert_eq!(pattern.confidence, 0.98);
        assert_eq!(pattern.group_name, "courts");
    }

    #[test]
    fn test_lookup_by_entity_type_and_alias() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "courts.json", courts_file());

        let store = store(dir.path());
        assert_eq!(store.get_patterns_by_entity_type("COURT").len(), 2);
        // Alias resolves through the same index
        assert_eq!(store.get_patterns_by_entity_type("courts").len(), 2);
    }

    #[test]
    fn test_recursive_discovery() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "federal/courts.json", courts_file());

        let store = store(dir.path());
        assert!(store.get_pattern("courts.supreme_court").is_some());
    }

    #[test]
    fn test_invalid_regex_skips_pattern_not_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "mixed.json",
            r#"{
                "metadata": {"pattern_type": "mixed", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "bad", "match_expression": "[unclosed", "entity_types": ["JUDGE"]},
                    {"name": "good", "match_expression": "Judge [A-Z][a-z]+", "entity_types": ["JUDGE"]}
                ]
            }"#,
        );

        let store = store(dir.path());
        assert!(store.get_pattern("mixed.bad").is_none());
        assert!(store.get_pattern("mixed.good").is_some());
    }

    #[test]
    fn test_malformed_file_preserves_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "courts.json", courts_file());

        let store = PatternStore::new(dir.path(), AliasMap::builtin());
        let first = store.load_all();
        assert_eq!(first.errors, 0);
        assert_eq!(store.pattern_names().len(), 2);

        // Corrupt the file and reload: prior group must survive
        fs::write(&path, "{{{ not json").unwrap();
        let second = store.reload();
        assert_eq!(second.errors, 1);
        assert_eq!(store.pattern_names().len(), 2);
        assert!(store.get_pattern("courts.supreme_court").is_some());
    }

    #[test]
    fn test_reload_skips_unchanged_and_applies_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "courts.json", courts_file());

        let store = PatternStore::new(dir.path(), AliasMap::builtin());
        store.load_all();

        let unchanged = store.reload();
        assert_eq!(unchanged.files_unchanged, 1);
        assert_eq!(unchanged.files_loaded, 0);

        let updated = courts_file().replace("0.98", "0.91");
        fs::write(&path, updated).unwrap();
        let changed = store.reload();
        assert_eq!(changed.files_loaded, 1);
        assert_eq!(
            store.get_pattern("courts.supreme_court").unwrap().confidence,
            0.91
        );
    }

    #[test]
    fn test_load_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "courts.json", courts_file());

        let store = PatternStore::new(dir.path(), AliasMap::builtin());
        store.load_all();
        let names_first = store.pattern_names();
        let types_first = store.get_entity_types();

        store.load_all();
        assert_eq!(store.pattern_names(), names_first);
        assert_eq!(store.get_entity_types(), types_first);
    }

    #[test]
    fn test_missing_directory_is_not_fatal() {
        let store = PatternStore::new("/nonexistent/patterns", AliasMap::builtin());
        let report = store.load_all();
        assert_eq!(report.files_checked, 0);
        assert!(store.pattern_names().is_empty());
    }

    #[test]
    fn test_unknown_entity_type_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "odd.json",
            r#"{
                "metadata": {"pattern_type": "odd", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "weird", "match_expression": "xyz", "entity_types": ["SOMETHING_NOVEL"]}
                ]
            }"#,
        );

        let store = store(dir.path());
        let pattern = store.get_pattern("odd.weird").unwrap();
        assert_eq!(pattern.canonical_type, "LEGAL_CONCEPT");
        assert_eq!(pattern.declared_type, "SOMETHING_NOVEL");
        // Both names are queryable
        assert_eq!(store.get_patterns_by_entity_type("LEGAL_CONCEPT").len(), 1);
        assert_eq!(
            store.get_patterns_by_entity_type("SOMETHING_NOVEL").len(),
            1
        );
    }

    #[test]
    fn test_confidence_clamped() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "odd.json",
            r#"{"patterns": [{"name": "hot", "match_expression": "x", "confidence": 1.7}]}"#,
        );
        let store = store(dir.path());
        assert_eq!(store.get_pattern("odd.hot").unwrap().confidence, 1.0);
    }

    #[test]
    fn test_aggregated_examples() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "courts.json", courts_file());

        let store = store(dir.path());
        let examples = store.get_aggregated_examples("COURT");
        assert_eq!(examples.len(), 2);
        assert!(examples.contains(&"Supreme Court of the United States".to_string()));

        assert_eq!(store.get_entity_types_with_examples(), vec!["COURT"]);
    }

    #[test]
    fn test_relationship_patterns() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "courts.json", courts_file());
        write_file(
            dir.path(),
            "relationships/procedural.json",
            r#"{
                "patterns": [
                    {
                        "relationship_type": "presides_over",
                        "source_entity": "JUDGE",
                        "target_entity": "CASE_NUMBER",
                        "indicators": ["presiding"],
                        "confidence": 0.8
                    },
                    {
                        "relationship_type": "FILED_IN",
                        "source_entity": "MOTION",
                        "target_entity": "COURT",
                        "indicators": ["filed in"]
                    }
                ]
            }"#,
        );

        let store = store(dir.path());
        let by_category = store.get_relationship_patterns();
        assert_eq!(by_category.len(), 1);
        assert_eq!(by_category["procedural"].len(), 2);
        // Relationship types are uppercased on load
        assert_eq!(
            store.get_relationship_types(),
            vec!["FILED_IN", "PRESIDES_OVER"]
        );
        assert_eq!(
            store.get_relationship_categories()["procedural"],
            vec!["FILED_IN", "PRESIDES_OVER"]
        );
    }

    #[test]
    fn test_validate_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "deps.json",
            r#"{
                "metadata": {"pattern_type": "deps", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "base", "match_expression": "base"},
                    {"name": "derived", "match_expression": "derived",
                     "dependencies": ["deps.base", "deps.missing"]}
                ]
            }"#,
        );

        let store = store(dir.path());
        let missing = store.validate_dependencies();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing["deps.derived"], vec!["deps.missing"]);
    }

    #[test]
    fn test_patterns_by_confidence() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "courts.json", courts_file());

        let store = store(dir.path());
        assert_eq!(store.get_patterns_by_confidence(0.95).len(), 1);
        assert_eq!(store.get_patterns_by_confidence(0.5).len(), 2);
    }

    #[test]
    fn test_statistics_and_info() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "courts.json", courts_file());

        let store = store(dir.path());
        let stats = store.pattern_statistics();
        assert_eq!(stats.total_groups, 1);
        assert_eq!(stats.total_patterns, 2);
        assert_eq!(stats.confidence_distribution["0.9-1.0"], 2);
        assert_eq!(stats.groups["courts"].version, "2.1");

        let info = store.entity_type_info("COURT");
        assert_eq!(info.pattern_count, 2);
        assert!(info.has_patterns);
        assert!(info.average_confidence > 0.9);
        assert_eq!(info.jurisdictions, vec!["federal"]);
    }

    #[test]
    fn test_search_patterns() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "courts.json", courts_file());

        let store = store(dir.path());
        let hits = store.search_patterns("supreme", None, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].full_name, "courts.supreme_court");

        let none = store.search_patterns("supreme", None, Some(0.99));
        assert!(none.is_empty());
    }

    #[test]
    fn test_relationship_statistics() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "relationships/procedural.json",
            r#"{
                "patterns": [
                    {"relationship_type": "A", "source_entity": "JUDGE",
                     "target_entity": "COURT", "indicators": ["x", "y"]},
                    {"relationship_type": "B", "source_entity": "PARTY",
                     "target_entity": "PARTY", "indicators": ["z"], "bidirectional": true}
                ]
            }"#,
        );

        let store = store(dir.path());
        let stats = store.relationship_statistics();
        assert_eq!(stats.total_relationships, 2);
        assert_eq!(stats.total_categories, 1);
        assert_eq!(stats.total_indicators, 3);
        assert_eq!(stats.bidirectional_relationships, 1);
        assert!((stats.average_indicators_per_relationship - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_all_entity_type_info() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "courts.json", courts_file());

        let store = store(dir.path());
        let info = store.all_entity_type_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].entity_type, "COURT");
        assert_eq!(info[0].pattern_count, 2);
    }

    #[test]
    fn test_citation_types() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "citations.json",
            r#"{
                "metadata": {"pattern_type": "case_citations", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "us_reports", "match_expression": "\\d+ U\\.S\\. \\d+",
                     "entity_types": ["CASE_CITATION"], "examples": ["410 U.S. 113"]}
                ]
            }"#,
        );

        let store = store(dir.path());
        assert_eq!(store.citation_types(), vec!["CASE_CITATION"]);
        let pattern = store.get_pattern("case_citations.us_reports").unwrap();
        assert!(pattern.is_citation);
    }
}
