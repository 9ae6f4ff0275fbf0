//! Dependency graph, batch planning and parallel batch execution.
//!
//! ## Architecture
//!
//! 1. **Builder** - Validates features and constructs the graph, rejecting
//!    unknown or duplicate ids and dependency cycles
//! 2. **Scheduler** - Layers the graph into batches of mutually independent features
//! 3. **Executor** - Runs batches in order, features within a batch concurrently
//!
//! ## Example
//!
//! ```
//! use forge_tdd::dag::DependencyResolver;
//! use forge_tdd::feature::Feature;
//!
//! # fn example() -> Result<(), forge_tdd::errors::ConfigError> {
//! let features = vec![
//!     Feature::new("a", "Parser"),
//!     Feature::new("b", "Evaluator").with_dependencies(&["a"]),
//!     Feature::new("c", "Printer").with_dependencies(&["a"]),
//! ];
//!
//! let resolver = DependencyResolver::new(&features)?;
//! assert_eq!(resolver.batches(), vec![vec!["a"], vec!["b", "c"]]);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

mod builder;
mod executor;
mod scheduler;

pub use builder::{DagBuilder, FeatureGraph, FeatureIndex};
pub use executor::{BatchReport, BatchResults, FeatureWorker, ParallelScheduler};
pub use scheduler::{Batch, DependencyResolver, ExecutionPlan};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigError;
    use crate::feature::Feature;

    #[test]
    fn test_plan_matches_batches() {
        let features = vec![
            Feature::new("01", "Setup"),
            Feature::new("02", "Core A").with_dependencies(&["01"]),
            Feature::new("03", "Core B").with_dependencies(&["01"]),
            Feature::new("04", "Integration").with_dependencies(&["02", "03"]),
        ];
        let resolver = DependencyResolver::new(&features).unwrap();
        let plan = resolver.plan();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.batches[1].feature_ids, vec!["02", "03"]);
        assert_eq!(plan.execution_order(), resolver.execution_order());
    }

    #[test]
    fn test_cycle_produces_no_plan() {
        let features = vec![
            Feature::new("a", "A").with_dependencies(&["b"]),
            Feature::new("b", "B").with_dependencies(&["a"]),
        ];
        let err = DependencyResolver::new(&features).unwrap_err();
        assert!(matches!(err, ConfigError::CyclicDependency { .. }));
    }
}
