//! DAG builder for constructing dependency graphs from features.
//!
//! The builder takes a list of features with their dependencies and constructs
//! a directed acyclic graph (DAG) that can be used for scheduling.

use std::collections::HashMap;

use crate::errors::ConfigError;
use crate::feature::Feature;

/// Index into the feature list.
pub type FeatureIndex = usize;

/// A directed acyclic graph of features.
#[derive(Debug, Clone)]
pub struct FeatureGraph {
    /// Features indexed by their position in the input
    features: Vec<Feature>,
    /// Map from feature id to index
    index_map: HashMap<String, FeatureIndex>,
    /// Forward edges: index -> features that depend on it
    forward_edges: Vec<Vec<FeatureIndex>>,
    /// Reverse edges: index -> features it depends on
    reverse_edges: Vec<Vec<FeatureIndex>>,
}

impl FeatureGraph {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get_feature(&self, index: FeatureIndex) -> Option<&Feature> {
        self.features.get(index)
    }

    pub fn get_feature_by_id(&self, id: &str) -> Option<&Feature> {
        self.index_map.get(id).and_then(|&i| self.features.get(i))
    }

    pub fn get_index(&self, id: &str) -> Option<FeatureIndex> {
        self.index_map.get(id).copied()
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Features that depend on the given feature (forward edges).
    pub fn dependents(&self, index: FeatureIndex) -> &[FeatureIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Features the given feature depends on (reverse edges).
    pub fn dependencies(&self, index: FeatureIndex) -> &[FeatureIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }
}

/// DFS colouring state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Builder for constructing feature graphs.
pub struct DagBuilder {
    features: Vec<Feature>,
}

impl DagBuilder {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    /// Build the feature graph.
    ///
    /// Validates:
    /// - every feature is individually well formed
    /// - ids are unique
    /// - all dependencies reference existing features
    /// - no cycles exist (the error carries the cycle path)
    pub fn build(self) -> Result<FeatureGraph, ConfigError> {
        let mut index_map = HashMap::new();
        for (i, feature) in self.features.iter().enumerate() {
            feature.validate()?;
            if index_map.insert(feature.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateFeature(feature.id.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<FeatureIndex>> = vec![Vec::new(); self.features.len()];
        let mut reverse_edges: Vec<Vec<FeatureIndex>> = vec![Vec::new(); self.features.len()];

        for (to_idx, feature) in self.features.iter().enumerate() {
            for dep in &feature.dependencies {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| ConfigError::UnknownDependency {
                            feature: feature.id.clone(),
                            dependency: dep.clone(),
                        })?;

                // from must complete before to
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = FeatureGraph {
            features: self.features,
            index_map,
            forward_edges,
            reverse_edges,
        };

        if let Some(cycle) = Self::find_cycle(&graph) {
            return Err(ConfigError::CyclicDependency { cycle });
        }

        Ok(graph)
    }

    /// Find a cycle with DFS colouring. Returns the cycle as a closed path of
    /// feature ids (first id repeated at the end), following dependency edges.
    ///
    /// Iterative: each stack frame is a node and the position of its next
    /// dependency to visit, so chain length does not grow the call stack.
    fn find_cycle(graph: &FeatureGraph) -> Option<Vec<String>> {
        let mut marks = vec![Mark::White; graph.len()];

        for start in 0..graph.len() {
            if marks[start] != Mark::White {
                continue;
            }
            marks[start] = Mark::Grey;
            let mut stack: Vec<(FeatureIndex, usize)> = vec![(start, 0)];

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                let Some(&dep) = graph.dependencies(node).get(next) else {
                    marks[node] = Mark::Black;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                match marks[dep] {
                    Mark::Grey => {
                        let from = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[from..]
                            .iter()
                            .filter_map(|&(i, _)| graph.get_feature(i).map(|f| f.id.clone()))
                            .collect();
                        if let Some(first) = cycle.first().cloned() {
                            cycle.push(first);
                        }
                        return Some(cycle);
                    }
                    Mark::White => {
                        marks[dep] = Mark::Grey;
                        stack.push((dep, 0));
                    }
                    Mark::Black => {}
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: &str, deps: &[&str]) -> Feature {
        Feature::new(id, &format!("Feature {}", id)).with_dependencies(deps)
    }

    #[test]
    fn test_build_simple_graph() {
        let features = vec![
            feature("a", &[]),
            feature("b", &["a"]),
            feature("c", &["a"]),
            feature("d", &["b", "c"]),
        ];

        let graph = DagBuilder::new(features).build().unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.dependencies(3), &[1, 2]);
        assert_eq!(graph.get_feature_by_id("d").unwrap().title, "Feature d");
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let features = vec![feature("a", &[]), feature("b", &["a"]), feature("c", &["a"])];

        let graph = DagBuilder::new(features).build().unwrap();

        assert!(graph.dependencies(0).is_empty());
        assert_eq!(graph.dependencies(1), &[0]);
        assert_eq!(graph.dependencies(2), &[0]);
        let dependents = graph.dependents(0);
        assert!(dependents.contains(&1));
        assert!(dependents.contains(&2));
    }

    #[test]
    fn test_two_node_cycle_reports_path() {
        let features = vec![feature("a", &["b"]), feature("b", &["a"])];

        let err = DagBuilder::new(features).build().unwrap_err();
        match err {
            ConfigError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("Expected CyclicDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_detection_behind_acyclic_prefix() {
        let features = vec![
            feature("root", &[]),
            feature("x", &["root", "z"]),
            feature("y", &["x"]),
            feature("z", &["y"]),
        ];

        let err = DagBuilder::new(features).build().unwrap_err();
        assert!(err.to_string().contains("Cycle"));
        let ConfigError::CyclicDependency { cycle } = err else {
            panic!("Expected CyclicDependency");
        };
        assert_eq!(cycle.first(), cycle.last());
        assert!(!cycle.contains(&"root".to_string()));
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_missing_dependency() {
        let result = DagBuilder::new(vec![feature("a", &["nonexistent"])]).build();
        assert_eq!(
            result.unwrap_err(),
            ConfigError::UnknownDependency {
                feature: "a".into(),
                dependency: "nonexistent".into()
            }
        );
    }

    #[test]
    fn test_duplicate_feature_id() {
        let result = DagBuilder::new(vec![feature("a", &[]), feature("a", &[])]).build();
        assert_eq!(result.unwrap_err(), ConfigError::DuplicateFeature("a".into()));
    }

    #[test]
    fn test_malformed_feature_rejected() {
        let result = DagBuilder::new(vec![feature("a", &["a"])]).build();
        assert!(matches!(result, Err(ConfigError::MalformedFeature { .. })));
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(vec![]).build().unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_long_chain_with_cycle_at_the_end() {
        let n = 50_000;
        let mut features: Vec<Feature> = (0..n)
            .map(|i| {
                let id = format!("f{}", i);
                if i == 0 {
                    feature(&id, &[])
                } else {
                    let dep = format!("f{}", i - 1);
                    feature(&id, &[dep.as_str()])
                }
            })
            .collect();
        assert!(DagBuilder::new(features.clone()).build().is_ok());

        let last = format!("f{}", n - 1);
        features[0] = feature("f0", &[last.as_str()]);
        match DagBuilder::new(features).build().unwrap_err() {
            ConfigError::CyclicDependency { cycle } => assert_eq!(cycle.len(), n + 1),
            other => panic!("expected cycle, got {:?}", other),
        }
    }
}
