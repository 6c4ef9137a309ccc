//! Filesystem combinators: merge (union) and diff (delta).

use crate::error::{ValidationError, ValidationResult};
use crate::graph::{NodeMeta, OpNode, Origin, State};
use crate::pb;

/// Union of two or more filesystems, later inputs winning on conflict.
pub fn merge(states: &[State], origin: Origin) -> ValidationResult<State> {
    if states.len() < 2 {
        return Err(ValidationError::MergeTooFewInputs {
            count: states.len(),
        });
    }

    let inputs = (0..states.len() as i64)
        .map(|input| pb::MergeInput { input })
        .collect();
    let op = pb::Op {
        op: Some(pb::op::Op::Merge(pb::MergeOp { inputs })),
        ..Default::default()
    };
    let node = OpNode::new(
        op,
        NodeMeta {
            origin,
            ..Default::default()
        },
    );
    for state in states {
        node.add_edge(state.node(), state.output());
    }

    let mut result = State::new(node);
    if let Some(platform) = states[0].platform() {
        result = result.with_platform(platform.clone());
    }
    Ok(result)
}

/// Filesystem delta turning `lower` into `upper`.
///
/// Both sides are required; the two inputs are fixed at positions 0
/// (lower) and 1 (upper).
pub fn diff(lower: Option<&State>, upper: Option<&State>, origin: Origin) -> ValidationResult<State> {
    let (lower, upper) = match (lower, upper) {
        (Some(lower), Some(upper)) => (lower, upper),
        _ => return Err(ValidationError::DiffMissingInput),
    };

    let op = pb::Op {
        op: Some(pb::op::Op::Diff(pb::DiffOp {
            lower: Some(pb::LowerDiffInput { input: 0 }),
            upper: Some(pb::UpperDiffInput { input: 1 }),
        })),
        ..Default::default()
    };
    let node = OpNode::new(
        op,
        NodeMeta {
            origin,
            ..Default::default()
        },
    );
    node.add_edge(lower.node(), lower.output());
    node.add_edge(upper.node(), upper.output());

    let mut result = State::new(node);
    if let Some(platform) = lower.platform() {
        result = result.with_platform(platform.clone());
    }
    Ok(result)
}
