//! Graph walks over stored nodes

use std::collections::BTreeSet;

use super::{LockedStorage, NodeId, NodeKind};
use crate::error::EngineResult;

/// Block starts still open around `node`, innermost first
///
/// Walks first parents back to the flow start. A block end jumps straight to
/// its start, so closed blocks are skipped. `node` itself is not included.
pub fn enclosing_blocks(storage: &LockedStorage, node: NodeId) -> EngineResult<Vec<NodeId>> {
    let mut blocks = Vec::new();
    let mut seen = BTreeSet::new();
    let mut current = storage.node(node)?;

    loop {
        let next = match current.kind {
            NodeKind::BlockEnd { start } => storage.node(start)?.parents.first().copied(),
            _ => current.parents.first().copied(),
        };
        let Some(next) = next else {
            break;
        };
        if !seen.insert(next) {
            break;
        }
        current = storage.node(next)?;
        match current.kind {
            NodeKind::BlockStart { .. } => blocks.push(current.id),
            NodeKind::FlowStart => break,
            _ => {}
        }
    }

    Ok(blocks)
}

/// Whether `node` is `scope` or lies inside it
pub fn is_within(storage: &LockedStorage, node: NodeId, scope: NodeId) -> EngineResult<bool> {
    if node == scope {
        return Ok(true);
    }
    Ok(enclosing_blocks(storage, node)?.contains(&scope))
}
