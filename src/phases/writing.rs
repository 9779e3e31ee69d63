//! PRISMA diagram, section writing, and export phases

use crate::context::RunContext;
use crate::error::ReviewResult;
use crate::gates::CapabilityContract;
use crate::providers::{PaperRef, WritingContext};
use crate::registry::PhaseHandler;
use crate::state::{PhasePayload, WorkflowState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, warn};

/// Manuscript assembly order; the writer is invoked in this order too.
const SECTION_ORDER: [&str; 5] = ["abstract", "introduction", "methods", "results", "discussion"];

/// Renders the PRISMA flow diagram as Mermaid text under `figures/`.
pub struct PrismaDiagramPhase;

fn mermaid_flow(counts: &crate::prisma::PrismaCounts) -> String {
    let n = |v: Option<u64>| v.map_or("?".to_string(), |n| n.to_string());
    let mut out = String::from("flowchart TD\n");
    out.push_str(&format!(
        "    identified[\"Records identified (n={})\"]\n",
        counts.total_found()
    ));
    out.push_str(&format!(
        "    deduplicated[\"Records after duplicates removed (n={})\"]\n",
        n(counts.no_dupes)
    ));
    out.push_str(&format!(
        "    screened[\"Records screened (n={})\"]\n",
        n(counts.screened)
    ));
    out.push_str(&format!(
        "    screen_excluded[\"Records excluded (n={})\"]\n",
        n(counts.screen_exclusions)
    ));
    out.push_str(&format!(
        "    sought[\"Reports sought for retrieval (n={})\"]\n",
        n(counts.fulltext_sought)
    ));
    out.push_str(&format!(
        "    not_retrieved[\"Reports not retrieved (n={})\"]\n",
        n(counts.fulltext_not_retrieved)
    ));
    out.push_str(&format!(
        "    assessed[\"Reports assessed for eligibility (n={})\"]\n",
        n(counts.fulltext_assessed)
    ));
    out.push_str(&format!(
        "    ft_excluded[\"Reports excluded (n={})\"]\n",
        n(counts.fulltext_exclusions)
    ));
    out.push_str(&format!(
        "    included[\"Studies included in review (n={})\"]\n",
        n(counts.included())
    ));
    out.push_str(
        "    identified --> deduplicated\n\
         \x20   deduplicated --> screened\n\
         \x20   screened --> screen_excluded\n\
         \x20   screened --> sought\n\
         \x20   sought --> not_retrieved\n\
         \x20   sought --> assessed\n\
         \x20   assessed --> ft_excluded\n\
         \x20   assessed --> included\n",
    );
    out
}

#[async_trait]
impl PhaseHandler for PrismaDiagramPhase {
    async fn run(&self, ctx: &RunContext, _state: &WorkflowState) -> ReviewResult<PhasePayload> {
        let figures_dir = ctx.artifacts_dir.join("figures");
        std::fs::create_dir_all(&figures_dir)?;
        let path = figures_dir.join("prisma_flow.mmd");
        std::fs::write(&path, mermaid_flow(&ctx.prisma.counts()))?;
        info!(path = %path.display(), "wrote PRISMA flow diagram");
        Ok(PhasePayload::PrismaDiagram {
            diagram_path: path.to_string_lossy().into_owned(),
        })
    }
}

/// Writes every required manuscript section through the section writer.
pub struct ArticleWritingPhase;

#[async_trait]
impl PhaseHandler for ArticleWritingPhase {
    async fn run(&self, ctx: &RunContext, state: &WorkflowState) -> ReviewResult<PhasePayload> {
        let writing_context = WritingContext {
            topic: ctx.config.context.clone(),
            extractions: state.extractions.clone(),
            cited_papers: state.final_papers.clone(),
            prisma: ctx.prisma.counts(),
        };
        let contract = CapabilityContract::default();
        let mut sections = BTreeMap::new();
        for section in SECTION_ORDER {
            if !contract.required_sections.iter().any(|s| s == section) {
                continue;
            }
            let text = ctx
                .with_timeout(
                    ctx.llm_timeout(),
                    ctx.providers.writer.write_section(section, &writing_context),
                )
                .await?;
            if text.trim().is_empty() {
                warn!(section = %section, "writer produced an empty section");
            }
            sections.insert(section.to_string(), text);
        }
        info!(sections = sections.len(), "article writing complete");
        Ok(PhasePayload::ArticleWriting { sections })
    }
}

/// CSL-JSON bibliography item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CslItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub title: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub author: Vec<CslName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued: Option<CslDate>,
    #[serde(rename = "DOI", skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(rename = "container-title", skip_serializing_if = "Option::is_none")]
    pub container_title: Option<String>,
    #[serde(rename = "URL", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CslName {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CslDate {
    #[serde(rename = "date-parts")]
    pub date_parts: Vec<Vec<i32>>,
}

fn csl_name(author: &str) -> CslName {
    match author.trim().rsplit_once(' ') {
        Some((given, family)) => CslName {
            family: Some(family.to_string()),
            given: Some(given.to_string()),
        },
        None => CslName {
            family: Some(author.trim().to_string()),
            given: None,
        },
    }
}

fn csl_item(paper: &PaperRef) -> CslItem {
    CslItem {
        id: paper.citation_key(),
        item_type: "article-journal".to_string(),
        title: paper.title.clone(),
        author: paper.authors.iter().map(|a| csl_name(a)).collect(),
        issued: paper.year.map(|year| CslDate {
            date_parts: vec![vec![year]],
        }),
        doi: paper.doi.clone(),
        container_title: paper.journal.clone(),
        url: paper.url.clone(),
    }
}

/// Extract every `@key` citation from pandoc-style `[@a; @b]` groups.
pub fn citation_keys(text: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("[@") {
        let after = &rest[start + 1..];
        let Some(end) = after.find(']') else {
            break;
        };
        for token in after[..end].split(';') {
            let token = token.trim();
            if let Some(key) = token.strip_prefix('@') {
                if !key.is_empty() {
                    keys.push(key.to_string());
                }
            }
        }
        rest = &after[end + 1..];
    }
    keys
}

/// Validates citations, emits the CSL-JSON bibliography, and assembles the
/// manuscript.
pub struct ExportPhase;

impl ExportPhase {
    fn assemble_manuscript(topic: &str, sections: &BTreeMap<String, String>) -> String {
        let mut out = format!("# {}\n", topic);
        for section in SECTION_ORDER {
            if let Some(text) = sections.get(section) {
                let mut heading: Vec<char> = section.chars().collect();
                if let Some(first) = heading.first_mut() {
                    *first = first.to_ascii_uppercase();
                }
                out.push_str(&format!(
                    "\n## {}\n\n{}\n",
                    heading.into_iter().collect::<String>(),
                    text.trim_end()
                ));
            }
        }
        out
    }

    fn write_artifact(path: &Path, bytes: &[u8]) -> ReviewResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

#[async_trait]
impl PhaseHandler for ExportPhase {
    async fn run(&self, ctx: &RunContext, state: &WorkflowState) -> ReviewResult<PhasePayload> {
        let known: BTreeSet<String> = state
            .final_papers
            .iter()
            .map(|p| p.citation_key())
            .collect();
        let mut total = 0u64;
        let mut invalid = 0u64;
        for text in state.manuscript_sections.values() {
            for key in citation_keys(text) {
                total += 1;
                if !known.contains(&key) {
                    invalid += 1;
                }
            }
        }
        let ratio = if total == 0 {
            0.0
        } else {
            invalid as f64 / total as f64
        };
        let citation_validation_passed = ratio <= ctx.config.gates.max_invalid_citation_ratio;
        if !citation_validation_passed {
            warn!(
                invalid,
                total, "manuscript cites papers outside the included set"
            );
        }

        let bibliography: Vec<CslItem> = state.final_papers.iter().map(csl_item).collect();
        let bibliography_path = ctx.artifacts_dir.join("references.csl.json");
        Self::write_artifact(
            &bibliography_path,
            &serde_json::to_vec_pretty(&bibliography)?,
        )?;

        let manuscript_path = ctx.artifacts_dir.join("manuscript.md");
        let manuscript = Self::assemble_manuscript(
            &ctx.config.context.topic,
            &state.manuscript_sections,
        );
        Self::write_artifact(&manuscript_path, manuscript.as_bytes())?;

        info!(
            citations = total,
            invalid,
            references = bibliography.len(),
            "export complete"
        );
        Ok(PhasePayload::Export {
            manuscript_path: manuscript_path.to_string_lossy().into_owned(),
            bibliography_path: bibliography_path.to_string_lossy().into_owned(),
            total_citations: total,
            invalid_citations: invalid,
            citation_validation_passed,
        })
    }
}
