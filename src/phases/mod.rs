//! Builtin pipeline phases
//!
//! Each phase is a [`PhaseHandler`] producing one typed payload; the
//! standard registry wires them into the PRISMA-shaped dependency graph:
//!
//! ```text
//! search -> dedup -> title/abstract -> fulltext -> extraction -> writing -> export
//!                                          \-> prisma_generation ----------^
//! ```

pub mod extraction;
pub mod screening;
pub mod search;
pub mod writing;

use crate::registry::{PhaseDefinition, PhaseRegistry};
use crate::state::{
    PHASE_DEDUP, PHASE_EXPORT, PHASE_EXTRACTION, PHASE_FT_SCREEN, PHASE_PRISMA, PHASE_SEARCH,
    PHASE_TA_SCREEN, PHASE_WRITING,
};
use std::sync::Arc;

/// The full systematic-review pipeline.
pub fn standard_registry() -> PhaseRegistry {
    let mut registry = PhaseRegistry::new();
    registry
        .register(PhaseDefinition::new(
            PHASE_SEARCH,
            1,
            &[],
            Arc::new(search::SearchPhase),
        ))
        .register(PhaseDefinition::new(
            PHASE_DEDUP,
            2,
            &[PHASE_SEARCH],
            Arc::new(search::DeduplicationPhase),
        ))
        .register(PhaseDefinition::new(
            PHASE_TA_SCREEN,
            3,
            &[PHASE_DEDUP],
            Arc::new(screening::TitleAbstractScreeningPhase),
        ))
        .register(PhaseDefinition::new(
            PHASE_FT_SCREEN,
            4,
            &[PHASE_TA_SCREEN],
            Arc::new(screening::FulltextScreeningPhase),
        ))
        .register(PhaseDefinition::new(
            PHASE_EXTRACTION,
            5,
            &[PHASE_FT_SCREEN],
            Arc::new(extraction::DataExtractionPhase),
        ))
        .register(PhaseDefinition::new(
            PHASE_PRISMA,
            6,
            &[PHASE_FT_SCREEN],
            Arc::new(writing::PrismaDiagramPhase),
        ))
        .register(PhaseDefinition::new(
            PHASE_WRITING,
            7,
            &[PHASE_EXTRACTION],
            Arc::new(writing::ArticleWritingPhase),
        ))
        .register(PhaseDefinition::new(
            PHASE_EXPORT,
            8,
            &[PHASE_WRITING, PHASE_PRISMA],
            Arc::new(writing::ExportPhase),
        ));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_orders_the_funnel() {
        let registry = standard_registry();
        assert!(registry.validate_dependencies().is_empty());
        let order = registry.execution_order().unwrap();
        assert_eq!(order.first().map(|s| s.as_str()), Some(PHASE_SEARCH));
        assert_eq!(order.last().map(|s| s.as_str()), Some(PHASE_EXPORT));

        let position = |name: &str| order.iter().position(|p| p == name).unwrap();
        assert!(position(PHASE_DEDUP) > position(PHASE_SEARCH));
        assert!(position(PHASE_EXPORT) > position(PHASE_PRISMA));
        assert!(position(PHASE_EXPORT) > position(PHASE_WRITING));
    }

    #[test]
    fn export_transitively_depends_on_everything() {
        let registry = standard_registry();
        let deps = registry.transitive_deps(PHASE_EXPORT);
        assert_eq!(deps.len(), 7);
    }
}
