//! Capability contract and reliability gates
//!
//! Evaluated before export: the contract checks that every required
//! output of a finished review exists; the gates check quality and budget
//! thresholds. Strict mode turns failures fatal, non-strict mode reports
//! them as warnings.

use crate::config::GateSettings;
use crate::state::WorkflowState;
use serde::{Deserialize, Serialize};

pub const GATE_CHECKPOINT_RESUME: &str = "checkpoint_resume";
pub const GATE_CITATION_QUALITY: &str = "citation_quality";
pub const GATE_COST_BUDGET: &str = "cost_budget";

/// Outcome of a single reliability gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    pub details: String,
}

/// Evaluates reliability criteria before final export.
pub struct ReliabilityGates {
    max_invalid_citation_ratio: f64,
    max_cost_usd: Option<f64>,
}

impl ReliabilityGates {
    pub fn from_settings(settings: &GateSettings) -> Self {
        Self {
            max_invalid_citation_ratio: settings.max_invalid_citation_ratio,
            max_cost_usd: settings.max_cost_usd,
        }
    }

    pub fn run(
        &self,
        state: &WorkflowState,
        checkpoint_resume_enabled: bool,
        observed_cost_usd: f64,
    ) -> Vec<GateResult> {
        vec![
            self.checkpoint_gate(checkpoint_resume_enabled),
            self.citation_gate(state),
            self.cost_gate(observed_cost_usd),
        ]
    }

    fn checkpoint_gate(&self, enabled: bool) -> GateResult {
        GateResult {
            gate: GATE_CHECKPOINT_RESUME.to_string(),
            passed: enabled,
            details: if enabled {
                "checkpoint resume is enabled".to_string()
            } else {
                "checkpoint resume is disabled".to_string()
            },
        }
    }

    fn citation_gate(&self, state: &WorkflowState) -> GateResult {
        let ratio = if state.total_citations == 0 {
            0.0
        } else {
            state.invalid_citations as f64 / state.total_citations as f64
        };
        GateResult {
            gate: GATE_CITATION_QUALITY.to_string(),
            passed: ratio <= self.max_invalid_citation_ratio,
            details: format!(
                "invalid_ratio={:.4} threshold={:.4}",
                ratio, self.max_invalid_citation_ratio
            ),
        }
    }

    fn cost_gate(&self, observed: f64) -> GateResult {
        let Some(budget) = self.max_cost_usd else {
            return GateResult {
                gate: GATE_COST_BUDGET.to_string(),
                passed: true,
                details: "cost gate disabled".to_string(),
            };
        };
        GateResult {
            gate: GATE_COST_BUDGET.to_string(),
            passed: observed <= budget,
            details: format!("observed={:.4} budget={:.4}", observed, budget),
        }
    }
}

/// Non-negotiable outputs a finished review must have.
#[derive(Debug, Clone)]
pub struct CapabilityContract {
    pub requires_prisma: bool,
    pub requires_citation_validation: bool,
    pub requires_checkpoint_resume: bool,
    pub required_sections: Vec<String>,
}

impl Default for CapabilityContract {
    fn default() -> Self {
        Self {
            requires_prisma: true,
            requires_citation_validation: true,
            requires_checkpoint_resume: true,
            required_sections: [
                "introduction",
                "methods",
                "results",
                "discussion",
                "abstract",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Validation result for a contract check.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractValidation {
    pub is_valid: bool,
    pub missing: Vec<String>,
}

impl CapabilityContract {
    pub fn validate(
        &self,
        state: &WorkflowState,
        checkpoint_resume_enabled: bool,
    ) -> ContractValidation {
        let mut missing = Vec::new();

        if self.requires_prisma && state.prisma_diagram_path.is_none() {
            missing.push("prisma_diagram".to_string());
        }
        if self.requires_citation_validation && !state.citation_validation_passed {
            missing.push("citation_validation".to_string());
        }
        if self.requires_checkpoint_resume && !checkpoint_resume_enabled {
            missing.push("checkpoint_resume".to_string());
        }
        for section in &self.required_sections {
            let present = state
                .manuscript_sections
                .get(section)
                .map_or(false, |content| !content.trim().is_empty());
            if !present {
                missing.push(format!("section:{}", section));
            }
        }

        ContractValidation {
            is_valid: missing.is_empty(),
            missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: f64, budget: Option<f64>) -> GateSettings {
        GateSettings {
            strict: false,
            max_invalid_citation_ratio: threshold,
            max_cost_usd: budget,
        }
    }

    fn state_with_citations(total: u64, invalid: u64) -> WorkflowState {
        WorkflowState {
            total_citations: total,
            invalid_citations: invalid,
            ..WorkflowState::default()
        }
    }

    #[test]
    fn citation_gate_fails_over_threshold() {
        let gates = ReliabilityGates::from_settings(&settings(0.01, None));
        let results = gates.run(&state_with_citations(100, 3), true, 0.0);
        let citation = results
            .iter()
            .find(|g| g.gate == GATE_CITATION_QUALITY)
            .unwrap();
        assert!(!citation.passed);
        assert!(citation.details.contains("0.0300"));
    }

    #[test]
    fn citation_gate_passes_with_no_citations() {
        let gates = ReliabilityGates::from_settings(&settings(0.01, None));
        let results = gates.run(&state_with_citations(0, 0), true, 0.0);
        assert!(results.iter().all(|g| g.passed));
    }

    #[test]
    fn cost_gate_disabled_without_budget() {
        let gates = ReliabilityGates::from_settings(&settings(0.01, None));
        let results = gates.run(&state_with_citations(10, 0), true, 1_000_000.0);
        let cost = results.iter().find(|g| g.gate == GATE_COST_BUDGET).unwrap();
        assert!(cost.passed);
    }

    #[test]
    fn cost_gate_enforces_budget() {
        let gates = ReliabilityGates::from_settings(&settings(0.01, Some(5.0)));
        let results = gates.run(&state_with_citations(10, 0), true, 5.5);
        let cost = results.iter().find(|g| g.gate == GATE_COST_BUDGET).unwrap();
        assert!(!cost.passed);
    }

    #[test]
    fn contract_reports_missing_capabilities() {
        let contract = CapabilityContract::default();
        let mut state = WorkflowState::default();
        state.prisma_diagram_path = Some("figures/prisma_flow.mmd".to_string());
        state.citation_validation_passed = true;
        for section in ["introduction", "methods", "results", "discussion"] {
            state
                .manuscript_sections
                .insert(section.to_string(), "text".to_string());
        }
        // Abstract missing, and a blank section does not count.
        state
            .manuscript_sections
            .insert("abstract".to_string(), "   ".to_string());

        let validation = contract.validate(&state, true);
        assert!(!validation.is_valid);
        assert_eq!(validation.missing, vec!["section:abstract".to_string()]);
    }
}
