//! Pattern verification of wave candidates.
//!
//! The library patterns guide wave prompts, but they also confirm what the
//! model returns: a candidate whose text matches a compiled pattern of its
//! type gets the pattern recorded in provenance and its confidence floored
//! at the pattern's. Validation rules declared on the pattern (year and
//! volume/page ranges over named captures) must pass for a match to count.

use crate::patterns::Pattern;
use regex::Captures;
use std::sync::Arc;
use tracing::debug;

/// A confirmed pattern match for a candidate.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern_full_name: String,
    pub pattern_confidence: f64,
}

/// Check a candidate's text against the patterns indexed for its type.
/// The first pattern that matches and passes its validation rules wins;
/// callers pass patterns in library order.
pub fn verify_candidate(patterns: &[Arc<Pattern>], text: &str) -> Option<PatternMatch> {
    for pattern in patterns {
        let Some(captures) = pattern.regex.captures(text) else {
            continue;
        };

        if !validation_passes(pattern, &captures) {
            debug!(
                "Pattern {} matched '{}' but failed validation rules",
                pattern.full_name, text
            );
            continue;
        }

        return Some(PatternMatch {
            pattern_full_name: pattern.full_name.clone(),
            pattern_confidence: pattern.confidence,
        });
    }

    None
}

/// Apply the pattern's declared range rules to its named captures. A rule
/// whose capture is absent is not violated; an unparsable capture is.
fn validation_passes(pattern: &Pattern, captures: &Captures<'_>) -> bool {
    let rules = &pattern.validation;
    if rules.is_empty() {
        return true;
    }

    if let Some(year) = named_number::<i32>(captures, "year") {
        match year {
            Some(year) => {
                if rules.min_year.map(|min| year < min).unwrap_or(false)
                    || rules.max_year.map(|max| year > max).unwrap_or(false)
                {
                    return false;
                }
            }
            None => return false,
        }
    }

    if let Some(volume) = named_number::<u32>(captures, "volume") {
        match volume {
            Some(volume) => {
                if rules.min_volume.map(|min| volume < min).unwrap_or(false)
                    || rules.max_volume.map(|max| volume > max).unwrap_or(false)
                {
                    return false;
                }
            }
            None => return false,
        }
    }

    if let Some(page) = named_number::<u32>(captures, "page") {
        match page {
            Some(page) => {
                if rules.min_page.map(|min| page < min).unwrap_or(false)
                    || rules.max_page.map(|max| page > max).unwrap_or(false)
                {
                    return false;
                }
            }
            None => return false,
        }
    }

    true
}

/// `None` when the group is absent, `Some(None)` when present but not a
/// number.
fn named_number<T: std::str::FromStr>(captures: &Captures<'_>, name: &str) -> Option<Option<T>> {
    captures
        .name(name)
        .map(|m| m.as_str().trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_types::AliasMap;
    use crate::patterns::PatternStore;

    fn store_with(patterns_json: &str) -> PatternStore {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.json"), patterns_json).unwrap();
        let store = PatternStore::new(dir.path(), AliasMap::builtin());
        store.load_all();
        std::mem::forget(dir);
        store
    }

    #[test]
    fn test_match_records_pattern_name() {
        let store = store_with(
            r#"{
                "metadata": {"pattern_type": "courts", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "supreme", "match_expression": "Supreme Court",
                     "confidence": 0.95, "entity_types": ["COURT"]}
                ]
            }"#,
        );

        let patterns = store.get_patterns_by_entity_type("COURT");
        let matched = verify_candidate(&patterns, "Supreme Court of the United States").unwrap();
        assert_eq!(matched.pattern_full_name, "courts.supreme");
        assert_eq!(matched.pattern_confidence, 0.95);
    }

    #[test]
    fn test_no_match_for_unrelated_text() {
        let store = store_with(
            r#"{
                "metadata": {"pattern_type": "courts", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "supreme", "match_expression": "Supreme Court",
                     "confidence": 0.95, "entity_types": ["COURT"]}
                ]
            }"#,
        );

        let patterns = store.get_patterns_by_entity_type("COURT");
        assert!(verify_candidate(&patterns, "the trial court below").is_none());
    }

    #[test]
    fn test_validation_rules_reject_out_of_range_year() {
        let store = store_with(
            r#"{
                "metadata": {"pattern_type": "case_citations", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "us_reports",
                     "match_expression": "(?P<volume>\\d+) U\\.S\\. (?P<page>\\d+) \\((?P<year>\\d{4})\\)",
                     "confidence": 0.97, "entity_types": ["CASE_CITATION"],
                     "validation": {"min_year": 1790, "max_year": 2030}}
                ]
            }"#,
        );

        let patterns = store.get_patterns_by_entity_type("CASE_CITATION");
        assert!(verify_candidate(&patterns, "410 U.S. 113 (1973)").is_some());
        assert!(verify_candidate(&patterns, "410 U.S. 113 (1492)").is_none());
        assert!(verify_candidate(&patterns, "410 U.S. 113 (2099)").is_none());
    }

    #[test]
    fn test_validation_rules_reject_out_of_range_volume() {
        let store = store_with(
            r#"{
                "metadata": {"pattern_type": "case_citations", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "us_reports",
                     "match_expression": "(?P<volume>\\d+) U\\.S\\. (?P<page>\\d+)",
                     "confidence": 0.97, "entity_types": ["CASE_CITATION"],
                     "validation": {"min_volume": 1, "max_volume": 999}}
                ]
            }"#,
        );

        let patterns = store.get_patterns_by_entity_type("CASE_CITATION");
        assert!(verify_candidate(&patterns, "410 U.S. 113").is_some());
        assert!(verify_candidate(&patterns, "5000 U.S. 113").is_none());
    }

    #[test]
    fn test_rules_without_matching_capture_pass() {
        let store = store_with(
            r#"{
                "metadata": {"pattern_type": "judges", "jurisdiction": "federal"},
                "patterns": [
                    {"name": "judge", "match_expression": "Judge [A-Z][a-z]+",
                     "confidence": 0.9, "entity_types": ["JUDGE"],
                     "validation": {"min_year": 1900}}
                ]
            }"#,
        );

        // No "year" capture group: the year rule cannot be violated
        let patterns = store.get_patterns_by_entity_type("JUDGE");
        assert!(verify_candidate(&patterns, "Judge Smith").is_some());
    }
}
