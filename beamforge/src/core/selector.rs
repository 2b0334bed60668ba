//! Deterministic candidate selection for beam search.

use crate::tree::{NodeId, SearchTree, TreeError};

/// Number of copies proposed for a branch-point leaf.
///
/// Counts every strict descendant of the search root, not only the children
/// of the candidate. Once that total reaches `beam_width`, branch points are
/// no longer fanned out.
pub fn effective_beam_width(total_descendants: usize, beam_width: usize) -> usize {
    if total_descendants >= beam_width {
        1
    } else {
        beam_width
    }
}

/// Select expandable candidates under `root`.
///
/// A candidate is a leaf with `depth <= max_depth`. Branch-point leaves are
/// returned `effective_beam_width` times (one per parallel continuation),
/// other leaves once. Order follows a pre-order walk.
pub fn select(
    tree: &SearchTree,
    root: NodeId,
    beam_width: usize,
    max_depth: u32,
) -> Result<Vec<NodeId>, TreeError> {
    let descendants = tree.descendants(root)?;
    let effective = effective_beam_width(descendants.len().saturating_sub(1), beam_width.max(1));

    let mut candidates = Vec::new();
    for id in descendants {
        let node = tree.get(id)?;
        if !node.is_leaf() || node.depth > max_depth {
            continue;
        }
        let copies = if node.branch_point { effective } else { 1 };
        candidates.extend(std::iter::repeat_n(id, copies));
    }
    Ok(candidates)
}
