//! Dependency resolution: execution order and concurrency-safe batches.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::builder::{DagBuilder, FeatureGraph, FeatureIndex};
use crate::errors::ConfigError;
use crate::feature::Feature;

/// A set of mutually independent features that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub index: usize,
    pub feature_ids: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.feature_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feature_ids.is_empty()
    }
}

/// Ordered batches for a run. Batch N+1 only depends on batches `0..=N`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub batches: Vec<Batch>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }

    /// Flattened sequential order.
    pub fn execution_order(&self) -> Vec<String> {
        self.batches
            .iter()
            .flat_map(|b| b.feature_ids.iter().cloned())
            .collect()
    }
}

/// Resolves feature execution order from the dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    graph: FeatureGraph,
    layers: Vec<Vec<FeatureIndex>>,
}

impl DependencyResolver {
    /// Build the graph and compute batches. Fails on cycles, unknown or
    /// duplicate ids and malformed features; no batches exist in that case.
    pub fn new(features: &[Feature]) -> Result<Self, ConfigError> {
        let graph = DagBuilder::new(features.to_vec()).build()?;
        let layers = Self::compute_layers(&graph);
        Ok(Self { graph, layers })
    }

    /// Kahn layering over in-degrees: a feature joins the layer after the last
    /// of its dependencies. Within a layer, features keep their input order.
    fn compute_layers(graph: &FeatureGraph) -> Vec<Vec<FeatureIndex>> {
        let mut pending: Vec<usize> = (0..graph.len())
            .map(|i| graph.dependencies(i).len())
            .collect();
        let mut layer: Vec<FeatureIndex> = (0..graph.len()).filter(|&i| pending[i] == 0).collect();
        let mut layers = Vec::new();

        while !layer.is_empty() {
            let mut next = Vec::new();
            for &node in &layer {
                for &dependent in graph.dependents(node) {
                    pending[dependent] -= 1;
                    if pending[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            layers.push(std::mem::replace(&mut layer, next));
        }

        layers
    }

    pub fn graph(&self) -> &FeatureGraph {
        &self.graph
    }

    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.graph.get_feature_by_id(id)
    }

    pub fn features(&self) -> &[Feature] {
        self.graph.features()
    }

    fn ids(&self, indices: &[FeatureIndex]) -> Vec<String> {
        indices
            .iter()
            .filter_map(|&i| self.graph.get_feature(i).map(|f| f.id.clone()))
            .collect()
    }

    /// Batches of feature ids, in execution order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.layers.iter().map(|layer| self.ids(layer)).collect()
    }

    /// A total order satisfying every dependency constraint.
    pub fn execution_order(&self) -> Vec<String> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn plan(&self) -> ExecutionPlan {
        ExecutionPlan {
            batches: self
                .batches()
                .into_iter()
                .enumerate()
                .map(|(index, feature_ids)| Batch { index, feature_ids })
                .collect(),
        }
    }

    /// Every feature `id` depends on, directly or indirectly, in input order.
    pub fn transitive_dependencies(&self, id: &str) -> Vec<String> {
        self.walk(id, |graph, i| graph.dependencies(i))
    }

    /// Every feature that depends on `id`, directly or indirectly, in input order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        self.walk(id, |graph, i| graph.dependents(i))
    }

    fn walk<'a>(
        &'a self,
        id: &str,
        next: impl Fn(&'a FeatureGraph, FeatureIndex) -> &'a [FeatureIndex],
    ) -> Vec<String> {
        let Some(start) = self.graph.get_index(id) else {
            return Vec::new();
        };

        let mut seen: BTreeSet<FeatureIndex> = BTreeSet::new();
        let mut queue: VecDeque<FeatureIndex> = next(&self.graph, start).iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if seen.insert(node) {
                queue.extend(next(&self.graph, node).iter().copied());
            }
        }

        let indices: Vec<FeatureIndex> = seen.into_iter().collect();
        self.ids(&indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: &str, deps: &[&str]) -> Feature {
        Feature::new(id, &format!("Feature {}", id)).with_dependencies(deps)
    }

    #[test]
    fn test_batches_linear() {
        let features = vec![feature("a", &[]), feature("b", &["a"]), feature("c", &["b"])];

        let resolver = DependencyResolver::new(&features).unwrap();
        let batches = resolver.batches();

        assert_eq!(batches, vec![vec!["a"], vec!["b"], vec!["c"]]);
        assert_eq!(resolver.execution_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_batches_fan_out() {
        let features = vec![feature("a", &[]), feature("b", &["a"]), feature("c", &["a"])];

        let resolver = DependencyResolver::new(&features).unwrap();
        assert_eq!(resolver.batches(), vec![vec!["a"], vec!["b", "c"]]);
    }

    #[test]
    fn test_batches_diamond() {
        let features = vec![
            feature("a", &[]),
            feature("b", &["a"]),
            feature("c", &["a"]),
            feature("d", &["b", "c"]),
        ];

        let plan = DependencyResolver::new(&features).unwrap().plan();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.batches[1].feature_ids, vec!["b", "c"]);
        assert_eq!(plan.batches[2].index, 2);
        assert_eq!(plan.feature_count(), 4);
    }

    #[test]
    fn test_batches_stable_by_input_order() {
        let features = vec![
            feature("z", &[]),
            feature("m", &["z"]),
            feature("a", &[]),
            feature("k", &["a"]),
        ];

        let resolver = DependencyResolver::new(&features).unwrap();
        assert_eq!(resolver.batches(), vec![vec!["z", "a"], vec!["m", "k"]]);
    }

    #[test]
    fn test_input_order_independent_of_dependency_position() {
        // Dependents may be listed before their dependencies.
        let features = vec![feature("b", &["a"]), feature("a", &[])];
        let resolver = DependencyResolver::new(&features).unwrap();
        assert_eq!(resolver.batches(), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_cycle_produces_no_batches() {
        let features = vec![feature("a", &["b"]), feature("b", &["a"])];
        let result = DependencyResolver::new(&features);
        assert!(matches!(result, Err(ConfigError::CyclicDependency { .. })));
    }

    #[test]
    fn test_transitive_queries() {
        let features = vec![
            feature("a", &[]),
            feature("b", &["a"]),
            feature("c", &["b"]),
            feature("d", &[]),
        ];

        let resolver = DependencyResolver::new(&features).unwrap();
        assert_eq!(resolver.transitive_dependencies("c"), vec!["a", "b"]);
        assert_eq!(resolver.transitive_dependents("a"), vec!["b", "c"]);
        assert!(resolver.transitive_dependents("d").is_empty());
        assert!(resolver.transitive_dependencies("unknown").is_empty());
    }

    #[test]
    fn test_empty_feature_set() {
        let resolver = DependencyResolver::new(&[]).unwrap();
        assert!(resolver.plan().is_empty());
        assert!(resolver.execution_order().is_empty());
    }

    #[test]
    fn test_plan_serialization() {
        let features = vec![feature("a", &[]), feature("b", &["a"])];
        let plan = DependencyResolver::new(&features).unwrap().plan();
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: ExecutionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, plan);
        assert_eq!(parsed.execution_order(), vec!["a", "b"]);
    }

    #[test]
    fn test_long_chain_layers() {
        let ids: Vec<String> = (0..50_000).map(|i| format!("f{}", i)).collect();
        let features: Vec<Feature> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                if i == 0 {
                    feature(id, &[])
                } else {
                    feature(id, &[ids[i - 1].as_str()])
                }
            })
            .collect();

        let resolver = DependencyResolver::new(&features).unwrap();
        let batches = resolver.batches();
        assert_eq!(batches.len(), 50_000);
        assert_eq!(batches[49_999], vec!["f49999".to_string()]);
    }

    #[test]
    fn test_layer_keeps_input_order_across_uneven_depths() {
        let features = vec![
            feature("late", &["mid"]),
            feature("root", &[]),
            feature("mid", &["root"]),
            feature("early", &["root"]),
            feature("join", &["late", "early"]),
        ];

        let resolver = DependencyResolver::new(&features).unwrap();
        assert_eq!(
            resolver.batches(),
            vec![
                vec!["root".to_string()],
                vec!["mid".to_string(), "early".to_string()],
                vec!["late".to_string()],
                vec!["join".to_string()],
            ]
        );
    }
}
