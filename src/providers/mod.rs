//! External contracts consumed by the pipeline
//!
//! Concrete database connectors, LLM clients, PDF retrieval, and section
//! writers live outside this crate; the pipeline only sees these traits.

pub mod offline;

use crate::config::{DateRange, TopicContext};
use crate::error::ReviewResult;
use crate::prisma::PrismaCounts;
use crate::state::ExtractedRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bibliographic record returned by a search provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRef {
    pub title: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub journal: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub source_db: String,
}

impl PaperRef {
    /// Canonical identity: lowercased DOI when present, otherwise the
    /// normalized title. Exact-normalized rather than fuzzy so resumes
    /// deduplicate identically.
    pub fn identity(&self) -> String {
        match &self.doi {
            Some(doi) if !doi.trim().is_empty() => doi.trim().to_lowercase(),
            _ => normalize_title(&self.title),
        }
    }

    /// Key used to cite this paper from manuscript sections.
    pub fn citation_key(&self) -> String {
        self.identity()
    }
}

/// Lowercase, collapse non-alphanumeric runs to single spaces, trim.
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_space = true;
    for c in title.chars() {
        if c.is_alphanumeric() {
            for lower in c.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// One LLM completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Model tier name, also the rate-limiter key
    pub model: String,
    pub temperature: f32,
    /// When set, the response must be a JSON string validating against
    /// this schema; otherwise plain text.
    pub schema: Option<serde_json::Value>,
}

/// Parsed full text of a retrieved paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulltextDocument {
    pub text: String,
    pub parser_used: String,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Context handed to a section writer.
#[derive(Debug, Clone)]
pub struct WritingContext {
    pub topic: TopicContext,
    pub extractions: Vec<ExtractedRecord>,
    pub cited_papers: Vec<PaperRef>,
    pub prisma: PrismaCounts,
}

/// Scholarly database search, addressed by name.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        max_results: usize,
        date_range: &DateRange,
    ) -> ReviewResult<Vec<PaperRef>>;
}

/// Text completion capability.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> ReviewResult<String>;
}

/// Full-text retrieval. Implementations try a structured parser first,
/// then a fallback extractor; `Ok(None)` means the paper could not be
/// retrieved at all.
#[async_trait]
pub trait PdfRetriever: Send + Sync {
    async fn fetch_and_parse(
        &self,
        paper: &PaperRef,
        max_chars: usize,
    ) -> ReviewResult<Option<FulltextDocument>>;
}

/// Manuscript section writer.
#[async_trait]
pub trait SectionWriter: Send + Sync {
    async fn write_section(&self, section: &str, context: &WritingContext)
        -> ReviewResult<String>;
}

/// Accumulates observed USD cost across provider calls for the cost gate.
#[derive(Debug, Clone, Default)]
pub struct CostMeter(Arc<Mutex<f64>>);

impl CostMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, usd: f64) {
        *self.0.lock() += usd;
    }

    pub fn total(&self) -> f64 {
        *self.0.lock()
    }
}

/// Bundle of everything external the pipeline calls.
#[derive(Clone)]
pub struct ProviderSet {
    pub search: Vec<Arc<dyn SearchProvider>>,
    pub llm: Arc<dyn LlmClient>,
    pub pdf: Arc<dyn PdfRetriever>,
    pub writer: Arc<dyn SectionWriter>,
    /// Shared with provider implementations that report spend
    pub cost: CostMeter,
}

impl ProviderSet {
    pub fn search_provider(&self, name: &str) -> Option<&Arc<dyn SearchProvider>> {
        self.search.iter().find(|p| p.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_doi() {
        let paper = PaperRef {
            title: "A Study".to_string(),
            abstract_text: None,
            authors: vec![],
            year: None,
            doi: Some("10.1000/XYZ.1".to_string()),
            journal: None,
            url: None,
            source_db: "a".to_string(),
        };
        assert_eq!(paper.identity(), "10.1000/xyz.1");
    }

    #[test]
    fn identity_falls_back_to_normalized_title() {
        let paper = PaperRef {
            title: "  Deep   Learning: A Survey!  ".to_string(),
            abstract_text: None,
            authors: vec![],
            year: None,
            doi: None,
            journal: None,
            url: None,
            source_db: "a".to_string(),
        };
        assert_eq!(paper.identity(), "deep learning a survey");
    }

    #[test]
    fn normalize_collapses_punctuation_runs() {
        assert_eq!(normalize_title("A--B__C"), "a b c");
    }

    #[test]
    fn paper_ref_tolerates_unknown_fields() {
        let json = r#"{
            "title": "T",
            "source_db": "a",
            "relevance_score": 0.93
        }"#;
        let paper: PaperRef = serde_json::from_str(json).unwrap();
        assert_eq!(paper.title, "T");
    }
}
