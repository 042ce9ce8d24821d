//! Document size detection and categorization.
//!
//! Pure functions over the document text plus optional metadata. Token
//! counts are estimated from character counts; this is a deliberate
//! approximation used only for routing, never a tokenizer call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Size thresholds in characters. At an exact threshold the lower
/// category wins.
pub const VERY_SMALL_THRESHOLD: usize = 5_000;
pub const SMALL_THRESHOLD: usize = 50_000;
pub const MEDIUM_THRESHOLD: usize = 150_000;

/// Characters per token for legal text.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Approximate cost per 1K tokens in USD, used only for routing estimates.
const COST_PER_1K_TOKENS: f64 = 0.000656;

/// Document size categories for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeCategory {
    #[serde(rename = "VERY_SMALL")]
    VerySmall,
    #[serde(rename = "SMALL")]
    Small,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "LARGE")]
    Large,
}

impl SizeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeCategory::VerySmall => "VERY_SMALL",
            SizeCategory::Small => "SMALL",
            SizeCategory::Medium => "MEDIUM",
            SizeCategory::Large => "LARGE",
        }
    }
}

/// Complete document size analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub chars: usize,
    pub tokens: usize,
    pub pages: u32,
    pub category: SizeCategory,
    pub words: usize,
    pub lines: usize,
}

/// Detects and categorizes document size for routing decisions.
#[derive(Debug, Clone)]
pub struct SizeDetector {
    chars_per_token: f64,
}

impl Default for SizeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl SizeDetector {
    pub fn new(chars_per_token: f64) -> Self {
        Self { chars_per_token }
    }

    /// Analyze document text and determine its size category.
    pub fn detect(
        &self,
        document_text: &str,
        metadata: Option<&HashMap<String, serde_json::Value>>,
    ) -> SizeInfo {
        let chars = document_text.chars().count();
        let tokens = self.estimate_tokens(chars);
        let pages = metadata.map(extract_page_count).unwrap_or(0);
        let words = document_text.split_whitespace().count();
        let lines = if document_text.is_empty() {
            0
        } else {
            document_text.matches('\n').count() + 1
        };

        let category = categorize(chars);

        debug!(
            "Document size detected: {} ({} chars, {} tokens, {} pages)",
            category.as_str(),
            chars,
            tokens,
            pages
        );

        SizeInfo {
            chars,
            tokens,
            pages,
            category,
            words,
            lines,
        }
    }

    /// Estimate token count from character count.
    pub fn estimate_tokens(&self, chars: usize) -> usize {
        (chars as f64 / self.chars_per_token) as usize
    }

    /// Coarse processing-time estimate in seconds, by category.
    pub fn estimate_processing_time(&self, size_info: &SizeInfo) -> f64 {
        match size_info.category {
            SizeCategory::VerySmall => 0.5,
            SizeCategory::Small => 1.0,
            SizeCategory::Medium => {
                let chunks_needed = (size_info.chars / 32_000) + 1;
                (chunks_needed as f64 * 0.85).min(4.0)
            }
            SizeCategory::Large => {
                let chunks_needed = (size_info.chars / 32_000) + 1;
                chunks_needed as f64
            }
        }
    }

    /// Coarse cost estimate in USD, by category. Never used for billing.
    pub fn estimate_cost(&self, size_info: &SizeInfo) -> f64 {
        match size_info.category {
            SizeCategory::VerySmall => 5_810.0 * COST_PER_1K_TOKENS / 1000.0,
            SizeCategory::Small => 30_838.0 * COST_PER_1K_TOKENS / 1000.0,
            SizeCategory::Medium | SizeCategory::Large => {
                let chunks_needed = (size_info.chars / 32_000) + 1;
                chunks_needed as f64 * 30_838.0 * COST_PER_1K_TOKENS / 1000.0
            }
        }
    }
}

fn categorize(chars: usize) -> SizeCategory {
    if chars <= VERY_SMALL_THRESHOLD {
        SizeCategory::VerySmall
    } else if chars <= SMALL_THRESHOLD {
        SizeCategory::Small
    } else if chars <= MEDIUM_THRESHOLD {
        SizeCategory::Medium
    } else {
        SizeCategory::Large
    }
}

/// Page count from metadata, trying common key spellings with tolerant
/// coercion. Absent or unusable values yield 0.
fn extract_page_count(metadata: &HashMap<String, serde_json::Value>) -> u32 {
    for key in ["pages", "page_count", "num_pages", "pageCount"] {
        if let Some(value) = metadata.get(key) {
            if let Some(n) = value.as_u64() {
                return n as u32;
            }
            if let Some(s) = value.as_str() {
                if let Ok(n) = s.trim().parse::<u32>() {
                    return n;
                }
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_empty_document() {
        let info = SizeDetector::default().detect("", None);
        assert_eq!(info.chars, 0);
        assert_eq!(info.tokens, 0);
        assert_eq!(info.words, 0);
        assert_eq!(info.lines, 0);
        assert_eq!(info.category, SizeCategory::VerySmall);
    }

    #[test]
    fn test_token_estimation() {
        let detector = SizeDetector::default();
        assert_eq!(detector.estimate_tokens(4_000), 1_000);
        assert_eq!(detector.estimate_tokens(10), 2);

        let coarse = SizeDetector::new(5.0);
        assert_eq!(coarse.estimate_tokens(10_000), 2_000);
    }

    #[test]
    fn test_category_boundaries_lower_wins() {
        assert_eq!(categorize(5_000), SizeCategory::VerySmall);
        assert_eq!(categorize(5_001), SizeCategory::Small);
        assert_eq!(categorize(50_000), SizeCategory::Small);
        assert_eq!(categorize(50_001), SizeCategory::Medium);
        assert_eq!(categorize(150_000), SizeCategory::Medium);
        assert_eq!(categorize(150_001), SizeCategory::Large);
    }

    #[test]
    fn test_page_count_key_variants() {
        let detector = SizeDetector::default();
        for key in ["pages", "page_count", "num_pages", "pageCount"] {
            let info = detector.detect("text", Some(&meta(&[(key, serde_json::json!(12))])));
            assert_eq!(info.pages, 12, "key {}", key);
        }
    }

    #[test]
    fn test_page_count_tolerant_coercion() {
        let detector = SizeDetector::default();
        let info = detector.detect("text", Some(&meta(&[("pages", serde_json::json!("7"))])));
        assert_eq!(info.pages, 7);

        let info = detector.detect(
            "text",
            Some(&meta(&[("pages", serde_json::json!("not a number"))])),
        );
        assert_eq!(info.pages, 0);
    }

    #[test]
    fn test_word_and_line_counts() {
        let info = SizeDetector::default().detect("one two three\nfour five", None);
        assert_eq!(info.words, 5);
        assert_eq!(info.lines, 2);
    }

    #[test]
    fn test_processing_time_by_category() {
        let detector = SizeDetector::default();
        let very_small = detector.detect(&"a".repeat(1_000), None);
        assert_eq!(detector.estimate_processing_time(&very_small), 0.5);

        let small = detector.detect(&"a".repeat(20_000), None);
        assert_eq!(detector.estimate_processing_time(&small), 1.0);

        let medium = detector.detect(&"a".repeat(100_000), None);
        let estimate = detector.estimate_processing_time(&medium);
        assert!(estimate > 1.0 && estimate <= 4.0);
    }

    #[test]
    fn test_cost_scales_with_chunks() {
        let detector = SizeDetector::default();
        let medium = detector.detect(&"a".repeat(100_000), None);
        let large = detector.detect(&"a".repeat(300_000), None);
        assert!(detector.estimate_cost(&large) > detector.estimate_cost(&medium));
    }
}
