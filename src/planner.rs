//! Branch planning
//!
//! Splits a run's building specs into branches whose estimated serialized
//! payload stays under a byte budget. Planning is a pure function of the spec
//! order and the budget, so reruns reproduce the same partition.

use crate::error::{FanoutError, Result};
use crate::spec::BuildingSpec;
use crate::types::RunName;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// An ordered, non-overlapping subset of a run's specs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Parent run
    pub run: RunName,
    /// Position of this branch in the plan
    pub index: usize,
    /// Specs assigned to this branch, in planned order
    pub specs: Vec<BuildingSpec>,
    /// Estimated serialized size of `specs`
    pub payload_bytes: usize,
}

impl Branch {
    /// Number of specs
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the branch holds no specs
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Serialized size of one spec, as sent inside a task descriptor
pub fn estimate_spec_size(spec: &BuildingSpec) -> usize {
    serde_json::to_vec(spec).map(|v| v.len()).unwrap_or(0)
}

/// Computes branch partitions
#[derive(Debug, Clone, Default)]
pub struct BranchPlanner {
    max_specs: Option<usize>,
}

impl BranchPlanner {
    /// Create a planner without a spec limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Only plan the first `max` specs (in input order)
    pub fn with_max_specs(mut self, max: usize) -> Self {
        self.max_specs = Some(max);
        self
    }

    /// Partition `specs` into branches of at most `max_branch_payload_bytes`
    ///
    /// A spec that alone exceeds the budget gets its own branch. Fails with
    /// `InvalidConfiguration` if the budget is not positive or there is
    /// nothing to plan.
    pub fn plan(
        &self,
        run: &RunName,
        specs: &[BuildingSpec],
        max_branch_payload_bytes: i64,
    ) -> Result<Vec<Branch>> {
        if max_branch_payload_bytes <= 0 {
            return Err(FanoutError::config(format!(
                "max branch payload must be positive, got {}",
                max_branch_payload_bytes
            )));
        }
        let specs = match self.max_specs {
            Some(max) => &specs[..specs.len().min(max)],
            None => specs,
        };
        if specs.is_empty() {
            return Err(FanoutError::config("no building specs to plan"));
        }
        let budget = usize::try_from(max_branch_payload_bytes).unwrap_or(usize::MAX);

        // par_iter keeps input order on collect
        let sizes: Vec<usize> = specs.par_iter().map(estimate_spec_size).collect();

        let mut branches = Vec::new();
        let mut current: Vec<BuildingSpec> = Vec::new();
        let mut current_bytes = 0usize;

        for (spec, &size) in specs.iter().zip(&sizes) {
            if size > budget {
                if !current.is_empty() {
                    push_branch(&mut branches, run, std::mem::take(&mut current), current_bytes);
                    current_bytes = 0;
                }
                warn!(
                    run = %run,
                    spec = %spec.building_id,
                    size,
                    budget,
                    "Oversized spec placed in its own branch"
                );
                push_branch(&mut branches, run, vec![spec.clone()], size);
                continue;
            }

            if current_bytes + size > budget && !current.is_empty() {
                push_branch(&mut branches, run, std::mem::take(&mut current), current_bytes);
                current_bytes = 0;
            }
            current.push(spec.clone());
            current_bytes += size;
        }
        if !current.is_empty() {
            push_branch(&mut branches, run, current, current_bytes);
        }

        info!(
            run = %run,
            specs = specs.len(),
            branches = branches.len(),
            budget,
            "Planned branches"
        );
        Ok(branches)
    }
}

fn push_branch(branches: &mut Vec<Branch>, run: &RunName, specs: Vec<BuildingSpec>, bytes: usize) {
    let index = branches.len();
    branches.push(Branch {
        run: run.clone(),
        index,
        specs,
        payload_bytes: bytes,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn run() -> RunName {
        RunName::new("city/base").unwrap()
    }

    fn specs(n: usize) -> Vec<BuildingSpec> {
        (0..n)
            .map(|i| BuildingSpec::new(format!("b-{:04}", i), 12.0, 10.0, 2, "w.zip"))
            .collect()
    }

    #[test]
    fn test_even_partition() {
        let specs = specs(100);
        let size = estimate_spec_size(&specs[0]);
        let branches = BranchPlanner::new()
            .plan(&run(), &specs, (size * 25) as i64)
            .unwrap();

        assert_eq!(branches.len(), 4);
        for (i, b) in branches.iter().enumerate() {
            assert_eq!(b.index, i);
            assert_eq!(b.len(), 25);
            assert!(b.payload_bytes <= size * 25);
        }
    }

    #[test]
    fn test_partition_covers_all_specs_once() {
        let specs = specs(37);
        let branches = BranchPlanner::new().plan(&run(), &specs, 1_000).unwrap();

        let mut seen = HashSet::new();
        for b in &branches {
            assert!(b.payload_bytes <= 1_000 || b.len() == 1);
            for s in &b.specs {
                assert!(seen.insert(s.building_id.clone()), "duplicate {}", s.building_id);
            }
        }
        assert_eq!(seen.len(), 37);

        let flattened: Vec<_> = branches.iter().flat_map(|b| b.specs.iter()).collect();
        let original: Vec<_> = specs.iter().collect();
        assert_eq!(flattened, original);
    }

    #[test]
    fn test_oversized_spec_gets_own_branch() {
        let mut specs = specs(4);
        specs[2] = specs[2]
            .clone()
            .with_semantic("Notes", "x".repeat(5_000).as_str());
        let normal = estimate_spec_size(&specs[0]);
        let branches = BranchPlanner::new()
            .plan(&run(), &specs, (normal * 4) as i64)
            .unwrap();

        assert_eq!(branches.len(), 3);
        assert_eq!(branches[0].len(), 2);
        assert_eq!(branches[1].len(), 1);
        assert_eq!(branches[1].specs[0].building_id.as_str(), "b-0002");
        assert!(branches[1].payload_bytes > normal * 4);
        assert_eq!(branches[2].len(), 1);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let specs = specs(250);
        let planner = BranchPlanner::new();
        let a = planner.plan(&run(), &specs, 4_096).unwrap();
        let b = planner.plan(&run(), &specs, 4_096).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_configuration() {
        let planner = BranchPlanner::new();
        assert!(matches!(
            planner.plan(&run(), &specs(3), 0),
            Err(FanoutError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            planner.plan(&run(), &specs(3), -5),
            Err(FanoutError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            planner.plan(&run(), &[], 1_000),
            Err(FanoutError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            BranchPlanner::new().with_max_specs(0).plan(&run(), &specs(3), 1_000),
            Err(FanoutError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_max_specs_truncates() {
        let branches = BranchPlanner::new()
            .with_max_specs(5)
            .plan(&run(), &specs(50), 1_000_000)
            .unwrap();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].len(), 5);
        assert_eq!(branches[0].specs[4].building_id.as_str(), "b-0004");
    }
}
