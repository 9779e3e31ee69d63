//! Search and deduplication phases

use crate::context::RunContext;
use crate::error::{ReviewError, ReviewResult};
use crate::providers::PaperRef;
use crate::registry::PhaseHandler;
use crate::resilience::retry;
use crate::state::{PhasePayload, WorkflowState};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// Query string sent to every search provider.
fn build_query(ctx: &RunContext) -> String {
    let context = &ctx.config.context;
    if context.keywords.is_empty() {
        context.topic.clone()
    } else {
        format!("{} {}", context.topic, context.keywords.join(" "))
    }
}

/// Fans out to every configured database, wrapping each provider call in
/// its own circuit breaker, the shared retry policy, and the search
/// timeout. Records the per-database breakdown in the PRISMA counter.
pub struct SearchPhase;

#[async_trait]
impl PhaseHandler for SearchPhase {
    async fn run(&self, ctx: &RunContext, _state: &WorkflowState) -> ReviewResult<PhasePayload> {
        let query = build_query(ctx);
        let policy = ctx.retry_policy();
        let mut papers: Vec<PaperRef> = Vec::new();
        let mut breakdown: BTreeMap<String, u64> = BTreeMap::new();

        for db in &ctx.config.databases {
            let provider = ctx.providers.search_provider(db).ok_or_else(|| {
                ReviewError::Config(format!("no search provider registered for '{}'", db))
            })?;
            let breaker = ctx.breakers.get(db);
            let results = retry(
                ctx.cancel_token(),
                &policy,
                ReviewError::is_transient,
                || {
                    let breaker = breaker.clone();
                    let provider = provider.clone();
                    let query = query.clone();
                    async move {
                        breaker
                            .call(|| async {
                                ctx.with_timeout(
                                    ctx.search_timeout(),
                                    provider.search(
                                        &query,
                                        ctx.config.max_results_per_db,
                                        &ctx.config.context.date_range,
                                    ),
                                )
                                .await
                            })
                            .await
                    }
                },
            )
            .await?;

            info!(database = %db, results = results.len(), "database search complete");
            breakdown.insert(db.clone(), results.len() as u64);
            papers.extend(results);
        }

        // Task ordering within the fan-out is undefined; aggregate on a
        // stable key before checkpointing.
        papers.sort_by(|a, b| {
            (a.source_db.as_str(), a.identity()).cmp(&(b.source_db.as_str(), b.identity()))
        });

        ctx.prisma.set_found(breakdown.clone())?;
        info!(
            total = papers.len(),
            databases = ctx.config.databases.len(),
            "search phase found papers"
        );

        Ok(PhasePayload::Search {
            papers,
            database_breakdown: breakdown,
        })
    }
}

/// Removes duplicate records across databases. Identity is the lowercased
/// DOI when present, otherwise the normalized title; the first occurrence
/// wins.
pub struct DeduplicationPhase;

#[async_trait]
impl PhaseHandler for DeduplicationPhase {
    async fn run(&self, ctx: &RunContext, state: &WorkflowState) -> ReviewResult<PhasePayload> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut unique: Vec<PaperRef> = Vec::new();
        for paper in &state.papers {
            if seen.insert(paper.identity()) {
                unique.push(paper.clone());
            }
        }
        let duplicates_removed = (state.papers.len() - unique.len()) as u64;

        ctx.prisma.set_no_dupes(unique.len() as u64)?;
        info!(
            duplicates_removed,
            unique = unique.len(),
            "deduplication complete"
        );

        Ok(PhasePayload::Deduplication {
            unique_papers: unique,
            duplicates_removed,
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

    fn ctx() -> RunContext {
        RunContext::new(
            Arc::new(ReviewConfig::for_topic("T1", vec!["a".to_string()])),
            Arc::new(offline_provider_set(2)),
            Arc::new(PrismaCounter::new()),
            PathBuf::from("/tmp"),
            CancellationToken::new(),
        )
    }

    fn paper(title: &str, doi: Option<&str>, db: &str) -> PaperRef {
        PaperRef {
            title: title.to_string(),
            abstract_text: None,
            authors: vec![],
            year: None,
            doi: doi.map(|d| d.to_string()),
            journal: None,
            url: None,
            source_db: db.to_string(),
        }
    }

    #[tokio::test]
    async fn dedup_keeps_first_occurrence_per_identity() {
        let ctx = ctx();
        let mut state = WorkflowState::default();
        state.papers = vec![
            paper("P1", Some("10.1/p1"), "a"),
            paper("P2", Some("10.1/p2"), "a"),
            paper("P1 again", Some("10.1/P1"), "b"),
            paper("P3", None, "b"),
            paper("p3!", None, "b"),
        ];
        ctx.prisma
            .set_found([("a".to_string(), 2), ("b".to_string(), 3)].into_iter().collect())
            .unwrap();

        let payload = DeduplicationPhase.run(&ctx, &state).await.unwrap();
        let PhasePayload::Deduplication {
            unique_papers,
            duplicates_removed,
        } = payload
        else {
            panic!("wrong payload variant");
        };
        assert_eq!(unique_papers.len(), 3);
        assert_eq!(duplicates_removed, 2);
        assert_eq!(unique_papers[0].source_db, "a");
        assert_eq!(ctx.prisma.counts().no_dupes, Some(3));
    }

    #[tokio::test]
    async fn search_rejects_unregistered_database() {
        let config = ReviewConfig::for_topic("T1", vec!["nonexistent".to_string()]);
        let ctx = RunContext::new(
            Arc::new(config),
            Arc::new(offline_provider_set(2)),
            Arc::new(PrismaCounter::new()),
            PathBuf::from("/tmp"),
            CancellationToken::new(),
        );
        let err = SearchPhase.run(&ctx, &WorkflowState::default()).await;
        assert!(matches!(err, Err(ReviewError::Config(_))));
    }
}
