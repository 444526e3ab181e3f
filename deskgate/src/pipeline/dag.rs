//! Dependency ordering for stage startup.

use super::StageSpec;
use crate::errors::CycleDetectedError;
use std::collections::{BTreeMap, HashSet};

/// Returns a start order in which every stage follows its dependencies.
///
/// The order is deterministic: stages are visited in insertion order and
/// dependencies in name order. Unknown dependency names are skipped here;
/// the builder rejects them earlier.
///
/// # Errors
///
/// Returns [`CycleDetectedError`] with the cycle path (first stage repeated
/// at the end) if no valid order exists.
pub fn topological_order(
    stages: &BTreeMap<String, StageSpec>,
    insertion_order: &[String],
) -> Result<Vec<String>, CycleDetectedError> {
    let mut order = Vec::with_capacity(stages.len());
    let mut visited = HashSet::new();
    let mut on_path = Vec::new();

    for name in insertion_order {
        visit(name, stages, &mut visited, &mut on_path, &mut order)?;
    }

    Ok(order)
}

fn visit(
    node: &str,
    stages: &BTreeMap<String, StageSpec>,
    visited: &mut HashSet<String>,
    on_path: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), CycleDetectedError> {
    if visited.contains(node) {
        return Ok(());
    }
    if let Some(start) = on_path.iter().position(|n| n == node) {
        let mut cycle = on_path[start..].to_vec();
        cycle.push(node.to_string());
        return Err(CycleDetectedError::new(cycle));
    }
    let Some(spec) = stages.get(node) else {
        return Ok(());
    };

    on_path.push(node.to_string());
    for dep in &spec.dependencies {
        visit(dep, stages, visited, on_path, order)?;
    }
    on_path.pop();

    visited.insert(node.to_string());
    order.push(node.to_string());
    Ok(())
}
