//! Shared mocks and fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use revflow::config::{DateRange, ReviewConfig};
use revflow::error::{ReviewError, ReviewResult};
use revflow::providers::offline::{OfflineLlm, OfflinePdf, OfflineWriter};
use revflow::providers::{
    CompletionRequest, CostMeter, LlmClient, PaperRef, ProviderSet, SearchProvider, SectionWriter,
    WritingContext,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub fn paper(title: &str, doi: &str, db: &str) -> PaperRef {
    PaperRef {
        title: title.to_string(),
        abstract_text: Some(format!("{} abstract", title)),
        authors: vec![format!("{} Author", title)],
        year: Some(2023),
        doi: Some(doi.to_string()),
        journal: Some("Test Journal".to_string()),
        url: None,
        source_db: db.to_string(),
    }
}

/// Search provider returning a fixed result set, counting invocations.
pub struct ScriptedSearch {
    name: String,
    results: Vec<PaperRef>,
    pub calls: Arc<AtomicU32>,
}

impl ScriptedSearch {
    pub fn new(name: &str, results: Vec<PaperRef>) -> Self {
        Self {
            name: name.to_string(),
            results,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(
        &self,
        _query: &str,
        max_results: usize,
        _date_range: &DateRange,
    ) -> ReviewResult<Vec<PaperRef>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.results.iter().take(max_results).cloned().collect())
    }
}

/// LLM that can be switched into a permanently-failing mode.
pub struct SwitchableLlm {
    pub fail: Arc<AtomicBool>,
    inner: OfflineLlm,
}

impl SwitchableLlm {
    pub fn new(fail: bool) -> Self {
        Self {
            fail: Arc::new(AtomicBool::new(fail)),
            inner: OfflineLlm,
        }
    }
}

#[async_trait]
impl LlmClient for SwitchableLlm {
    async fn complete(&self, request: CompletionRequest) -> ReviewResult<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ReviewError::ExternalPermanent(
                "llm hard down".to_string(),
            ));
        }
        self.inner.complete(request).await
    }
}

/// Writer emitting a controlled number of valid and invalid citations,
/// spread across the abstract section.
pub struct CitationControlWriter {
    pub valid: usize,
    pub invalid: usize,
}

#[async_trait]
impl SectionWriter for CitationControlWriter {
    async fn write_section(
        &self,
        section: &str,
        context: &WritingContext,
    ) -> ReviewResult<String> {
        if section != "abstract" {
            return Ok(format!("Narrative {} for {}.", section, context.topic.topic));
        }
        let mut citations = Vec::new();
        let keys: Vec<String> = context
            .cited_papers
            .iter()
            .map(|p| p.citation_key())
            .collect();
        for i in 0..self.valid {
            citations.push(format!("[@{}]", keys[i % keys.len()]));
        }
        for i in 0..self.invalid {
            citations.push(format!("[@10.9999/bogus.{}]", i));
        }
        Ok(format!("Summary of findings. {}", citations.join(" ")))
    }
}

/// Provider set with scripted search results, everything else offline.
pub fn scripted_providers(searches: Vec<ScriptedSearch>) -> ProviderSet {
    ProviderSet {
        search: searches
            .into_iter()
            .map(|s| Arc::new(s) as Arc<dyn SearchProvider>)
            .collect(),
        llm: Arc::new(OfflineLlm),
        pdf: Arc::new(OfflinePdf),
        writer: Arc::new(OfflineWriter),
        cost: CostMeter::new(),
    }
}

/// Two databases, two distinct papers each (scenario baseline).
pub fn two_db_searches() -> (Vec<ScriptedSearch>, Arc<AtomicU32>, Arc<AtomicU32>) {
    let a = ScriptedSearch::new(
        "a",
        vec![paper("P1", "10.1/p1", "a"), paper("P2", "10.1/p2", "a")],
    );
    let b = ScriptedSearch::new(
        "b",
        vec![paper("P3", "10.1/p3", "b"), paper("P4", "10.1/p4", "b")],
    );
    let calls_a = a.calls.clone();
    let calls_b = b.calls.clone();
    (vec![a, b], calls_a, calls_b)
}

pub fn config_for(run_root: &Path, topic: &str) -> ReviewConfig {
    let mut config = ReviewConfig::for_topic(topic, vec!["a".to_string(), "b".to_string()]);
    config.run_root = run_root.to_path_buf();
    config.max_results_per_db = 2;
    config
}
