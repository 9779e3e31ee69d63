//! Declarative phase registry with dependency management
//!
//! Phases are registered once at startup and executed in topological
//! order (Kahn's algorithm) with a stable tie-break by ordinal.

use crate::config::ReviewConfig;
use crate::context::RunContext;
use crate::error::{ReviewError, ReviewResult};
use crate::state::{PhasePayload, WorkflowState};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// A unit of pipeline work.
///
/// Handlers consume the accumulated state and return the delta payload for
/// their phase; they never mutate state directly.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn run(&self, ctx: &RunContext, state: &WorkflowState) -> ReviewResult<PhasePayload>;
}

type EnabledPredicate = Arc<dyn Fn(&ReviewConfig) -> bool + Send + Sync>;

/// Definition of one workflow phase. Immutable after registration.
#[derive(Clone)]
pub struct PhaseDefinition {
    pub name: String,
    pub ordinal: u32,
    pub dependencies: BTreeSet<String>,
    pub handler: Arc<dyn PhaseHandler>,
    /// Whether to write a checkpoint after completion
    pub checkpoint: bool,
    /// Required phases abort the run on failure; optional ones log and
    /// continue
    pub required: bool,
    enabled: Option<EnabledPredicate>,
}

impl PhaseDefinition {
    pub fn new(
        name: &str,
        ordinal: u32,
        dependencies: &[&str],
        handler: Arc<dyn PhaseHandler>,
    ) -> Self {
        Self {
            name: name.to_string(),
            ordinal,
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            handler,
            checkpoint: true,
            required: true,
            enabled: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn without_checkpoint(mut self) -> Self {
        self.checkpoint = false;
        self
    }

    /// Gate this phase on a config predicate; disabled phases are skipped.
    pub fn enabled_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ReviewConfig) -> bool + Send + Sync + 'static,
    {
        self.enabled = Some(Arc::new(predicate));
        self
    }

    pub fn is_enabled(&self, config: &ReviewConfig) -> bool {
        self.enabled.as_ref().map_or(true, |p| p(config))
    }
}

/// Registry of phases with dependency validation and ordering.
#[derive(Default)]
pub struct PhaseRegistry {
    phases: HashMap<String, PhaseDefinition>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, phase: PhaseDefinition) -> &mut Self {
        if self.phases.contains_key(&phase.name) {
            warn!(phase = %phase.name, "phase already registered, overwriting");
        }
        self.phases.insert(phase.name.clone(), phase);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.phases.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Ordinal per phase name, for resume discovery ranking.
    pub fn ordinals(&self) -> std::collections::BTreeMap<String, u32> {
        self.phases
            .values()
            .map(|p| (p.name.clone(), p.ordinal))
            .collect()
    }

    /// Dependencies that reference unregistered phases.
    pub fn validate_dependencies(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut names: Vec<&String> = self.phases.keys().collect();
        names.sort();
        for name in names {
            let phase = &self.phases[name];
            for dep in &phase.dependencies {
                if !self.phases.contains_key(dep) {
                    errors.push(format!(
                        "phase '{}' depends on '{}' which is not registered",
                        name, dep
                    ));
                }
            }
        }
        errors
    }

    /// Phases in execution order: topological sort with a stable tie-break
    /// by ordinal, then name. Missing dependencies and cycles are
    /// configuration errors, not silent omissions.
    pub fn execution_order(&self) -> ReviewResult<Vec<String>> {
        let errors = self.validate_dependencies();
        if !errors.is_empty() {
            return Err(ReviewError::Config(errors.join("; ")));
        }

        let mut in_degree: HashMap<&str, usize> =
            self.phases.keys().map(|name| (name.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for phase in self.phases.values() {
            for dep in &phase.dependencies {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(phase.name.as_str());
                if let Some(degree) = in_degree.get_mut(phase.name.as_str()) {
                    *degree += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<(u32, &str)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| Reverse((self.phases[*name].ordinal, *name)))
            .collect();
        let mut order = Vec::with_capacity(self.phases.len());

        while let Some(Reverse((_, name))) = ready.pop() {
            order.push(name.to_string());
            if let Some(children) = dependents.get(name) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(Reverse((self.phases[*child].ordinal, *child)));
                        }
                    }
                }
            }
        }

        if order.len() != self.phases.len() {
            let mut stuck: Vec<&str> = self
                .phases
                .keys()
                .map(|s| s.as_str())
                .filter(|name| !order.iter().any(|o| o == name))
                .collect();
            stuck.sort();
            return Err(ReviewError::Config(format!(
                "circular dependency among phases: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// All direct and transitive dependencies of a phase, dependencies
    /// first.
    pub fn transitive_deps(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        self.collect_deps(name, &mut seen, &mut out);
        out
    }

    fn collect_deps(&self, name: &str, seen: &mut BTreeSet<String>, out: &mut Vec<String>) {
        let Some(phase) = self.phases.get(name) else {
            return;
        };
        for dep in &phase.dependencies {
            if seen.insert(dep.clone()) {
                self.collect_deps(dep, seen, out);
                out.push(dep.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl PhaseHandler for NoopHandler {
        async fn run(
            &self,
            _ctx: &RunContext,
            _state: &WorkflowState,
        ) -> ReviewResult<PhasePayload> {
            Ok(PhasePayload::Deduplication {
                unique_papers: vec![],
                duplicates_removed: 0,
            })
        }
    }

    fn phase(name: &str, ordinal: u32, deps: &[&str]) -> PhaseDefinition {
        PhaseDefinition::new(name, ordinal, deps, Arc::new(NoopHandler))
    }

    #[test]
    fn order_respects_dependencies_and_ordinals() {
        let mut registry = PhaseRegistry::new();
        registry
            .register(phase("c", 3, &["a"]))
            .register(phase("a", 1, &[]))
            .register(phase("b", 2, &["a"]))
            .register(phase("d", 4, &["b", "c"]));

        let order = registry.execution_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn independent_phases_break_ties_by_ordinal() {
        let mut registry = PhaseRegistry::new();
        registry
            .register(phase("z", 1, &[]))
            .register(phase("m", 2, &[]))
            .register(phase("a", 3, &[]));
        assert_eq!(registry.execution_order().unwrap(), vec!["z", "m", "a"]);
    }

    #[test]
    fn missing_dependency_is_config_error() {
        let mut registry = PhaseRegistry::new();
        registry.register(phase("a", 1, &["ghost"]));
        let errors = registry.validate_dependencies();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ghost"));
        assert!(matches!(
            registry.execution_order(),
            Err(ReviewError::Config(_))
        ));
    }

    #[test]
    fn cycle_is_detected_and_named() {
        let mut registry = PhaseRegistry::new();
        registry
            .register(phase("a", 1, &["b"]))
            .register(phase("b", 2, &["a"]))
            .register(phase("c", 3, &[]));
        let err = registry.execution_order().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("a"));
        assert!(message.contains("b"));
        assert!(!message.contains("c,"));
    }

    #[test]
    fn transitive_deps_are_complete() {
        let mut registry = PhaseRegistry::new();
        registry
            .register(phase("a", 1, &[]))
            .register(phase("b", 2, &["a"]))
            .register(phase("c", 3, &["b"]));
        assert_eq!(registry.transitive_deps("c"), vec!["a", "b"]);
        assert!(registry.transitive_deps("a").is_empty());
    }

    #[test]
    fn enabled_predicate_gates_phase() {
        let definition =
            phase("a", 1, &[]).enabled_when(|config| config.databases.len() > 1);
        let one_db = crate::config::ReviewConfig::for_topic("t", vec!["a".to_string()]);
        let two_dbs = crate::config::ReviewConfig::for_topic(
            "t",
            vec!["a".to_string(), "b".to_string()],
        );
        assert!(!definition.is_enabled(&one_db));
        assert!(definition.is_enabled(&two_dbs));
    }
}
