//! Structural invariants of a [`SearchTree`], checked after deserialization.

use std::collections::HashSet;

use crate::tree::SearchTree;

/// Check structural invariants:
/// - node ids equal their arena index
/// - exactly one root (index 0, no parent) and depth 0 at the root
/// - every non-root node appears in its parent's children, with `depth = parent.depth + 1`
/// - every child lists the node as parent, and no child is listed twice
pub fn validate_invariants(tree: &SearchTree) -> Vec<String> {
    let mut errors = Vec::new();
    let nodes = tree.nodes();

    for (index, node) in nodes.iter().enumerate() {
        if node.id.index() != index {
            errors.push(format!("{}: stored at index {index}", node.id));
        }

        match node.parent {
            None if index != 0 => errors.push(format!("{}: non-root node has no parent", node.id)),
            None => {
                if node.depth != 0 {
                    errors.push(format!("{}: root depth must be 0", node.id));
                }
            }
            Some(parent_id) => match nodes.get(parent_id.index()) {
                None => errors.push(format!("{}: parent {parent_id} missing", node.id)),
                Some(parent) => {
                    if parent_id.index() >= index {
                        errors.push(format!("{}: parent {parent_id} created after child", node.id));
                    }
                    if !parent.children.contains(&node.id) {
                        errors.push(format!(
                            "{}: not listed among children of {parent_id}",
                            node.id
                        ));
                    }
                    if node.depth != parent.depth + 1 {
                        errors.push(format!(
                            "{}: depth {} does not follow parent depth {}",
                            node.id, node.depth, parent.depth
                        ));
                    }
                }
            },
        }

        let mut seen = HashSet::new();
        for child_id in &node.children {
            if !seen.insert(*child_id) {
                errors.push(format!("{}: child {child_id} listed twice", node.id));
            }
            match nodes.get(child_id.index()) {
                Some(child) if child.parent == Some(node.id) => {}
                Some(_) => errors.push(format!(
                    "{}: child {child_id} names a different parent",
                    node.id
                )),
                None => errors.push(format!("{}: child {child_id} missing", node.id)),
            }
        }
    }

    errors
}
