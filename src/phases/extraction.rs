//! Structured data extraction from included studies

use crate::context::RunContext;
use crate::error::{ReviewError, ReviewResult};
use crate::providers::{CompletionRequest, PaperRef};
use crate::registry::PhaseHandler;
use crate::resilience::retry;
use crate::state::{ExtractedRecord, PhasePayload, WorkflowState};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tracing::info;

fn extraction_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "study_design": { "type": "string" },
            "population": { "type": "string" },
            "sample_size": { "type": "integer" },
            "interventions": { "type": "array", "items": { "type": "string" } },
            "outcomes": { "type": "array", "items": { "type": "string" } },
            "key_findings": { "type": "array", "items": { "type": "string" } },
            "limitations": { "type": "array", "items": { "type": "string" } }
        }
    })
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    study_design: Option<String>,
    #[serde(default)]
    population: Option<String>,
    #[serde(default)]
    sample_size: Option<u64>,
    #[serde(default)]
    interventions: Vec<String>,
    #[serde(default)]
    outcomes: Vec<String>,
    #[serde(default)]
    key_findings: Vec<String>,
    #[serde(default)]
    limitations: Vec<String>,
}

async fn extract_one(ctx: &RunContext, paper: &PaperRef) -> ReviewResult<ExtractedRecord> {
    let tier = &ctx.config.models.extraction;
    ctx.throttle(tier).await?;
    let prompt = format!(
        "Extract structured study data for a systematic review on \"{}\".\n\n\
         Title: {}\nYear: {}\nAbstract: {}",
        ctx.config.context.topic,
        paper.title,
        paper.year.map_or("unknown".to_string(), |y| y.to_string()),
        paper.abstract_text.as_deref().unwrap_or("(not available)"),
    );
    let policy = ctx.retry_policy();
    let response = retry(
        ctx.cancel_token(),
        &policy,
        ReviewError::is_transient,
        || {
            let request = CompletionRequest {
                prompt: prompt.clone(),
                model: tier.clone(),
                temperature: 0.0,
                schema: Some(extraction_schema()),
            };
            async move {
                ctx.with_timeout(ctx.llm_timeout(), ctx.providers.llm.complete(request))
                    .await
            }
        },
    )
    .await?;

    let parsed: ExtractionResponse = serde_json::from_str(&response).map_err(|e| {
        ReviewError::ExternalPermanent(format!("extraction response violates schema: {}", e))
    })?;
    Ok(ExtractedRecord {
        paper_id: paper.identity(),
        title: paper.title.clone(),
        study_design: parsed.study_design,
        population: parsed.population,
        sample_size: parsed.sample_size,
        interventions: parsed.interventions,
        outcomes: parsed.outcomes,
        key_findings: parsed.key_findings,
        limitations: parsed.limitations,
    })
}

/// Schema-constrained extraction, one record per included study.
pub struct DataExtractionPhase;

#[async_trait]
impl PhaseHandler for DataExtractionPhase {
    async fn run(&self, ctx: &RunContext, state: &WorkflowState) -> ReviewResult<PhasePayload> {
        let mut records: Vec<ExtractedRecord> = stream::iter(
            state
                .final_papers
                .iter()
                .cloned()
                .map(|paper| async move { extract_one(ctx, &paper).await }),
        )
        .buffer_unordered(ctx.config.max_concurrency)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<ReviewResult<_>>()?;
        records.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));

        info!(studies = records.len(), "data extraction complete");
        Ok(PhasePayload::DataExtraction { records })
    }
}
