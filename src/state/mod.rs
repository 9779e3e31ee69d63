//! Typed workflow state and per-phase payloads
//!
//! The original dict-shaped state is re-architected as tagged variants:
//! each checkpointed phase produces exactly one [`PhasePayload`], and the
//! accumulated [`WorkflowState`] merges payloads last-writer-wins.

pub mod checkpoint;
pub mod run_registry;

use crate::error::{ReviewError, ReviewResult};
use crate::providers::PaperRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub const PHASE_SEARCH: &str = "search_databases";
pub const PHASE_DEDUP: &str = "deduplication";
pub const PHASE_TA_SCREEN: &str = "title_abstract_screening";
pub const PHASE_FT_SCREEN: &str = "fulltext_screening";
pub const PHASE_EXTRACTION: &str = "data_extraction";
pub const PHASE_PRISMA: &str = "prisma_generation";
pub const PHASE_WRITING: &str = "article_writing";
pub const PHASE_EXPORT: &str = "export";

/// Unique identifier for one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new run ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> ReviewResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ReviewError::Validation(format!("invalid run ID '{}': {}", s, e)))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One include/exclude decision for a paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningDecision {
    /// Canonical paper identity (see [`PaperRef::identity`])
    pub paper_id: String,
    pub title: String,
    pub include: bool,
    #[serde(default)]
    pub reason: String,
}

/// Structured data extracted from one included study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub paper_id: String,
    pub title: String,
    #[serde(default)]
    pub study_design: Option<String>,
    #[serde(default)]
    pub population: Option<String>,
    #[serde(default)]
    pub sample_size: Option<u64>,
    #[serde(default)]
    pub interventions: Vec<String>,
    #[serde(default)]
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub limitations: Vec<String>,
}

/// Output of one checkpointed phase.
///
/// The discriminant doubles as the checkpoint schema tag; unknown JSON
/// fields inside a variant are tolerated on read so checkpoints written by
/// newer versions still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhasePayload {
    Search {
        papers: Vec<PaperRef>,
        database_breakdown: BTreeMap<String, u64>,
    },
    Deduplication {
        unique_papers: Vec<PaperRef>,
        duplicates_removed: u64,
    },
    TitleAbstractScreening {
        decisions: Vec<ScreeningDecision>,
        included_papers: Vec<PaperRef>,
        excluded: u64,
    },
    FulltextScreening {
        decisions: Vec<ScreeningDecision>,
        final_papers: Vec<PaperRef>,
        not_retrieved: u64,
        excluded: u64,
    },
    DataExtraction {
        records: Vec<ExtractedRecord>,
    },
    PrismaDiagram {
        diagram_path: String,
    },
    ArticleWriting {
        sections: BTreeMap<String, String>,
    },
    Export {
        manuscript_path: String,
        bibliography_path: String,
        total_citations: u64,
        invalid_citations: u64,
        citation_validation_passed: bool,
    },
}

impl PhasePayload {
    /// The phase that produces this payload.
    pub fn phase_name(&self) -> &'static str {
        match self {
            PhasePayload::Search { .. } => PHASE_SEARCH,
            PhasePayload::Deduplication { .. } => PHASE_DEDUP,
            PhasePayload::TitleAbstractScreening { .. } => PHASE_TA_SCREEN,
            PhasePayload::FulltextScreening { .. } => PHASE_FT_SCREEN,
            PhasePayload::DataExtraction { .. } => PHASE_EXTRACTION,
            PhasePayload::PrismaDiagram { .. } => PHASE_PRISMA,
            PhasePayload::ArticleWriting { .. } => PHASE_WRITING,
            PhasePayload::Export { .. } => PHASE_EXPORT,
        }
    }
}

/// Accumulated state threaded through the executor.
///
/// Every field is filled by exactly one phase; merging a payload twice
/// (re-run after resume) overwrites that phase's contribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(default)]
    pub papers: Vec<PaperRef>,
    #[serde(default)]
    pub database_breakdown: BTreeMap<String, u64>,
    #[serde(default)]
    pub unique_papers: Vec<PaperRef>,
    #[serde(default)]
    pub duplicates_removed: u64,
    #[serde(default)]
    pub screening_decisions: Vec<ScreeningDecision>,
    /// Papers surviving title/abstract screening
    #[serde(default)]
    pub included_papers: Vec<PaperRef>,
    #[serde(default)]
    pub title_abstract_excluded: u64,
    #[serde(default)]
    pub fulltext_decisions: Vec<ScreeningDecision>,
    /// Papers included in the review after full-text assessment
    #[serde(default)]
    pub final_papers: Vec<PaperRef>,
    #[serde(default)]
    pub fulltext_not_retrieved: u64,
    #[serde(default)]
    pub fulltext_excluded: u64,
    #[serde(default)]
    pub extractions: Vec<ExtractedRecord>,
    #[serde(default)]
    pub prisma_diagram_path: Option<String>,
    #[serde(default)]
    pub manuscript_sections: BTreeMap<String, String>,
    #[serde(default)]
    pub manuscript_path: Option<String>,
    #[serde(default)]
    pub bibliography_path: Option<String>,
    #[serde(default)]
    pub total_citations: u64,
    #[serde(default)]
    pub invalid_citations: u64,
    #[serde(default)]
    pub citation_validation_passed: bool,
    /// Phases whose output is present in this state
    #[serde(default)]
    pub completed_phases: BTreeSet<String>,
}

impl WorkflowState {
    /// Merge one phase's output into the accumulated state
    /// (last-writer-wins).
    pub fn apply(&mut self, payload: &PhasePayload) {
        match payload {
            PhasePayload::Search {
                papers,
                database_breakdown,
            } => {
                self.papers = papers.clone();
                self.database_breakdown = database_breakdown.clone();
            }
            PhasePayload::Deduplication {
                unique_papers,
                duplicates_removed,
            } => {
                self.unique_papers = unique_papers.clone();
                self.duplicates_removed = *duplicates_removed;
            }
            PhasePayload::TitleAbstractScreening {
                decisions,
                included_papers,
                excluded,
            } => {
                self.screening_decisions = decisions.clone();
                self.included_papers = included_papers.clone();
                self.title_abstract_excluded = *excluded;
            }
            PhasePayload::FulltextScreening {
                decisions,
                final_papers,
                not_retrieved,
                excluded,
            } => {
                self.fulltext_decisions = decisions.clone();
                self.final_papers = final_papers.clone();
                self.fulltext_not_retrieved = *not_retrieved;
                self.fulltext_excluded = *excluded;
            }
            PhasePayload::DataExtraction { records } => {
                self.extractions = records.clone();
            }
            PhasePayload::PrismaDiagram { diagram_path } => {
                self.prisma_diagram_path = Some(diagram_path.clone());
            }
            PhasePayload::ArticleWriting { sections } => {
                self.manuscript_sections = sections.clone();
            }
            PhasePayload::Export {
                manuscript_path,
                bibliography_path,
                total_citations,
                invalid_citations,
                citation_validation_passed,
            } => {
                self.manuscript_path = Some(manuscript_path.clone());
                self.bibliography_path = Some(bibliography_path.clone());
                self.total_citations = *total_citations;
                self.invalid_citations = *invalid_citations;
                self.citation_validation_passed = *citation_validation_passed;
            }
        }
        self.completed_phases
            .insert(payload.phase_name().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper(title: &str, doi: &str, db: &str) -> PaperRef {
        PaperRef {
            title: title.to_string(),
            abstract_text: None,
            authors: vec!["A. Author".to_string()],
            year: Some(2023),
            doi: Some(doi.to_string()),
            journal: None,
            url: None,
            source_db: db.to_string(),
        }
    }

    #[test]
    fn payload_round_trip_preserves_fields() {
        let payload = PhasePayload::Search {
            papers: vec![paper("P1", "10.1/p1", "a")],
            database_breakdown: [("a".to_string(), 1)].into_iter().collect(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: PhasePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn payload_read_tolerates_unknown_fields() {
        let json = r#"{
            "kind": "deduplication",
            "unique_papers": [],
            "duplicates_removed": 2,
            "strategy": "fuzzy-title"
        }"#;
        let payload: PhasePayload = serde_json::from_str(json).unwrap();
        assert!(matches!(
            payload,
            PhasePayload::Deduplication {
                duplicates_removed: 2,
                ..
            }
        ));
    }

    #[test]
    fn apply_marks_phase_complete_and_overwrites() {
        let mut state = WorkflowState::default();
        state.apply(&PhasePayload::Deduplication {
            unique_papers: vec![paper("P1", "10.1/p1", "a")],
            duplicates_removed: 1,
        });
        assert!(state.completed_phases.contains(PHASE_DEDUP));
        assert_eq!(state.unique_papers.len(), 1);

        // Re-applying the same phase replaces, never appends.
        state.apply(&PhasePayload::Deduplication {
            unique_papers: vec![],
            duplicates_removed: 0,
        });
        assert!(state.unique_papers.is_empty());
    }
}
