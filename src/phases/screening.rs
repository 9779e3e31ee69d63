//! Title/abstract and full-text screening phases
//!
//! Screening fans out across papers with bounded concurrency; every LLM
//! call is rate-limited by model tier, wrapped in the shared retry policy,
//! and bounded by the LLM timeout. Results are aggregated on a stable key
//! before checkpointing so parallel completion order never leaks into
//! state.

use crate::context::RunContext;
use crate::error::{ReviewError, ReviewResult};
use crate::providers::{CompletionRequest, PaperRef};
use crate::registry::PhaseHandler;
use crate::resilience::retry;
use crate::state::{PhasePayload, ScreeningDecision, WorkflowState};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

/// Shape every screening completion must produce.
fn decision_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "include": { "type": "boolean" },
            "reason": { "type": "string" }
        },
        "required": ["include"]
    })
}

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    include: bool,
    #[serde(default)]
    reason: String,
}

fn criteria_block(ctx: &RunContext) -> String {
    let context = &ctx.config.context;
    format!(
        "Inclusion criteria:\n{}\n\nExclusion criteria:\n{}",
        context
            .inclusion_criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n"),
        context
            .exclusion_criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// One rate-limited, retried, schema-validated screening call.
async fn screen_one(
    ctx: &RunContext,
    paper: &PaperRef,
    prompt: String,
    tier: &str,
) -> ReviewResult<ScreeningDecision> {
    ctx.throttle(tier).await?;
    let policy = ctx.retry_policy();
    let response = retry(
        ctx.cancel_token(),
        &policy,
        ReviewError::is_transient,
        || {
            let request = CompletionRequest {
                prompt: prompt.clone(),
                model: tier.to_string(),
                temperature: 0.0,
                schema: Some(decision_schema()),
            };
            async move {
                ctx.with_timeout(ctx.llm_timeout(), ctx.providers.llm.complete(request))
                    .await
            }
        },
    )
    .await?;

    let decision: DecisionResponse = serde_json::from_str(&response).map_err(|e| {
        ReviewError::ExternalPermanent(format!("screening response violates schema: {}", e))
    })?;
    Ok(ScreeningDecision {
        paper_id: paper.identity(),
        title: paper.title.clone(),
        include: decision.include,
        reason: decision.reason,
    })
}

/// Screens papers by title and abstract against the review criteria.
pub struct TitleAbstractScreeningPhase;

#[async_trait]
impl PhaseHandler for TitleAbstractScreeningPhase {
    async fn run(&self, ctx: &RunContext, state: &WorkflowState) -> ReviewResult<PhasePayload> {
        let papers = &state.unique_papers;
        if papers.is_empty() {
            return Err(ReviewError::Validation(
                "no unique papers to screen".to_string(),
            ));
        }
        let tier = ctx.config.models.screening.clone();
        let criteria = criteria_block(ctx);

        let mut decisions: Vec<ScreeningDecision> =
            stream::iter(papers.iter().cloned().map(|paper| {
                let prompt = format!(
                    "Screen this paper for a systematic review on \"{}\".\n\n{}\n\n\
                     Title: {}\nAbstract: {}\n\n\
                     Decide whether it passes title/abstract screening.",
                    ctx.config.context.topic,
                    criteria,
                    paper.title,
                    paper.abstract_text.as_deref().unwrap_or("(not available)"),
                );
                let tier = tier.clone();
                async move { screen_one(ctx, &paper, prompt, &tier).await }
            }))
            .buffer_unordered(ctx.config.max_concurrency)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<ReviewResult<_>>()?;
        decisions.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));

        let include_ids: std::collections::BTreeSet<&str> = decisions
            .iter()
            .filter(|d| d.include)
            .map(|d| d.paper_id.as_str())
            .collect();
        let included: Vec<PaperRef> = papers
            .iter()
            .filter(|p| include_ids.contains(p.identity().as_str()))
            .cloned()
            .collect();
        let excluded = (papers.len() - included.len()) as u64;

        ctx.prisma.set_screened(papers.len() as u64)?;
        ctx.prisma.set_screen_exclusions(excluded)?;
        info!(
            screened = papers.len(),
            included = included.len(),
            excluded,
            "title/abstract screening complete"
        );

        Ok(PhasePayload::TitleAbstractScreening {
            decisions,
            included_papers: included,
            excluded,
        })
    }
}

enum FulltextOutcome {
    NotRetrieved(String),
    Assessed(ScreeningDecision),
}

/// Retrieves full texts and screens them against the review criteria.
///
/// A paper whose PDF cannot be fetched counts as "not retrieved" rather
/// than failing the phase; assessment only runs on retrieved texts.
pub struct FulltextScreeningPhase;

impl FulltextScreeningPhase {
    async fn assess_one(
        &self,
        ctx: &RunContext,
        paper: &PaperRef,
        criteria: &str,
        tier: &str,
    ) -> ReviewResult<FulltextOutcome> {
        let policy = ctx.retry_policy();
        let fetched = retry(
            ctx.cancel_token(),
            &policy,
            ReviewError::is_transient,
            || async {
                ctx.with_timeout(
                    ctx.pdf_timeout(),
                    ctx.providers
                        .pdf
                        .fetch_and_parse(paper, ctx.config.fulltext_max_chars),
                )
                .await
            },
        )
        .await;

        let document = match fetched {
            Ok(Some(document)) => document,
            Ok(None) => {
                return Ok(FulltextOutcome::NotRetrieved(paper.identity()));
            }
            Err(ReviewError::Cancelled) => return Err(ReviewError::Cancelled),
            Err(e) => {
                warn!(paper = %paper.title, error = %e, "full text unavailable");
                return Ok(FulltextOutcome::NotRetrieved(paper.identity()));
            }
        };

        let prompt = format!(
            "Assess this full text for a systematic review on \"{}\".\n\n{}\n\n\
             Title: {}\nFull text ({}):\n{}\n\n\
             Decide whether the study meets the eligibility criteria.",
            ctx.config.context.topic, criteria, paper.title, document.parser_used, document.text,
        );
        let decision = screen_one(ctx, paper, prompt, tier).await?;
        Ok(FulltextOutcome::Assessed(decision))
    }
}

#[async_trait]
impl PhaseHandler for FulltextScreeningPhase {
    async fn run(&self, ctx: &RunContext, state: &WorkflowState) -> ReviewResult<PhasePayload> {
        let candidates = &state.included_papers;
        let sought = candidates.len() as u64;
        ctx.prisma.set_fulltext_sought(sought)?;
        let tier = ctx.config.models.screening.clone();
        let criteria = criteria_block(ctx);

        let outcomes: Vec<FulltextOutcome> = stream::iter(candidates.iter().cloned().map(
            |paper| {
                let criteria = criteria.clone();
                let tier = tier.clone();
                async move { self.assess_one(ctx, &paper, &criteria, &tier).await }
            },
        ))
        .buffer_unordered(ctx.config.max_concurrency)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<ReviewResult<_>>()?;

        let mut not_retrieved_ids = std::collections::BTreeSet::new();
        let mut decisions = Vec::new();
        for outcome in outcomes {
            match outcome {
                FulltextOutcome::NotRetrieved(id) => {
                    not_retrieved_ids.insert(id);
                }
                FulltextOutcome::Assessed(decision) => decisions.push(decision),
            }
        }
        decisions.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));

        let not_retrieved = not_retrieved_ids.len() as u64;
        let assessed = sought - not_retrieved;
        let include_ids: std::collections::BTreeSet<&str> = decisions
            .iter()
            .filter(|d| d.include)
            .map(|d| d.paper_id.as_str())
            .collect();
        let final_papers: Vec<PaperRef> = candidates
            .iter()
            .filter(|p| include_ids.contains(p.identity().as_str()))
            .cloned()
            .collect();
        let excluded = assessed - final_papers.len() as u64;

        ctx.prisma.set_fulltext_not_retrieved(not_retrieved)?;
        ctx.prisma.set_fulltext_assessed(assessed)?;
        ctx.prisma.set_fulltext_exclusions(excluded)?;
        ctx.prisma.set_qualitative(final_papers.len() as u64)?;
        ctx.prisma.set_quantitative(final_papers.len() as u64)?;
        info!(
            sought,
            not_retrieved,
            assessed,
            included = final_papers.len(),
            "full-text screening complete"
        );

        Ok(PhasePayload::FulltextScreening {
            decisions,
            final_papers,
            not_retrieved,
            excluded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReviewConfig;
    use crate::prisma::PrismaCounter;
    use crate::providers::offline::offline_provider_set;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn paper(title: &str, doi: &str) -> PaperRef {
        PaperRef {
            title: title.to_string(),
            abstract_text: Some(format!("{} abstract", title)),
            authors: vec![],
            year: Some(2022),
            doi: Some(doi.to_string()),
            journal: None,
            url: None,
            source_db: "openalex".to_string(),
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(
            Arc::new(ReviewConfig::for_topic("T1", vec!["openalex".to_string()])),
            Arc::new(offline_provider_set(2)),
            Arc::new(PrismaCounter::new()),
            PathBuf::from("/tmp"),
            CancellationToken::new(),
        )
    }

    fn seeded_state(n: usize) -> (RunContext, WorkflowState) {
        let ctx = ctx();
        let papers: Vec<PaperRef> = (0..n)
            .map(|i| paper(&format!("Paper {}", i), &format!("10.1/p{}", i)))
            .collect();
        ctx.prisma
            .set_found([("openalex".to_string(), n as u64)].into_iter().collect())
            .unwrap();
        ctx.prisma.set_no_dupes(n as u64).unwrap();
        let state = WorkflowState {
            unique_papers: papers,
            ..WorkflowState::default()
        };
        (ctx, state)
    }

    #[tokio::test]
    async fn title_abstract_screening_screens_everything() {
        let (ctx, state) = seeded_state(4);
        let payload = TitleAbstractScreeningPhase.run(&ctx, &state).await.unwrap();
        let PhasePayload::TitleAbstractScreening {
            decisions,
            included_papers,
            excluded,
        } = payload
        else {
            panic!("wrong payload variant");
        };
        // Offline screening includes everything.
        assert_eq!(decisions.len(), 4);
        assert_eq!(included_papers.len(), 4);
        assert_eq!(excluded, 0);
        assert_eq!(ctx.prisma.counts().screened, Some(4));
        // Decisions aggregate in stable order regardless of completion order.
        let ids: Vec<&str> = decisions.iter().map(|d| d.paper_id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn screening_with_no_papers_is_a_validation_error() {
        let ctx = ctx();
        let err = TitleAbstractScreeningPhase
            .run(&ctx, &WorkflowState::default())
            .await;
        assert!(matches!(err, Err(ReviewError::Validation(_))));
    }

    #[tokio::test]
    async fn fulltext_counts_follow_the_funnel() {
        let (ctx, mut state) = seeded_state(3);
        state.included_papers = state.unique_papers.clone();
        ctx.prisma.set_screened(3).unwrap();
        ctx.prisma.set_screen_exclusions(0).unwrap();

        let payload = FulltextScreeningPhase.run(&ctx, &state).await.unwrap();
        let PhasePayload::FulltextScreening {
            final_papers,
            not_retrieved,
            excluded,
            ..
        } = payload
        else {
            panic!("wrong payload variant");
        };
        assert_eq!(final_papers.len(), 3);
        assert_eq!(not_retrieved, 0);
        assert_eq!(excluded, 0);
        let counts = ctx.prisma.counts();
        assert_eq!(counts.fulltext_sought, Some(3));
        assert_eq!(counts.fulltext_assessed, Some(3));
        assert_eq!(counts.qualitative, Some(3));
    }
}
