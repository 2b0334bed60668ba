//! Arena-backed search tree of candidate conversation/workspace states.
//!
//! Nodes live in a flat `Vec` and reference each other by [`NodeId`] index, so
//! there are no owning cycles. A node only stores the files written *at that
//! node*; the effective workspace is the layered merge along the root path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::Message;

/// Path → content snapshot of a workspace.
pub type FileMap = BTreeMap<String, String>;

/// Index of a node inside a [`SearchTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A file write or a deletion marker recorded at one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "content", rename_all = "lowercase")]
pub enum FileChange {
    Write(String),
    Delete,
}

/// Changes turning `before` into `after`.
pub fn file_delta(before: &FileMap, after: &FileMap) -> BTreeMap<String, FileChange> {
    let mut delta: BTreeMap<String, FileChange> = after
        .iter()
        .filter(|(path, content)| before.get(*path) != Some(*content))
        .map(|(path, content)| (path.clone(), FileChange::Write(content.clone())))
        .collect();
    delta.extend(
        before
            .keys()
            .filter(|path| !after.contains_key(*path))
            .map(|path| (path.clone(), FileChange::Delete)),
    );
    delta
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub depth: u32,
    /// Messages appended at this node (the full conversation is the root-path concatenation).
    pub messages: Vec<Message>,
    pub files: BTreeMap<String, FileChange>,
    pub branch_point: bool,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchTree {
    nodes: Vec<Node>,
}

impl SearchTree {
    /// Create a tree whose root holds the initial prompt. The root is a branch point
    /// so the first selection fans out to the full beam.
    pub fn new(initial: Message) -> Self {
        Self {
            nodes: vec![Node {
                id: NodeId(0),
                parent: None,
                children: Vec::new(),
                depth: 0,
                messages: vec![initial],
                files: BTreeMap::new(),
                branch_point: true,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get(&self, id: NodeId) -> Result<&Node, TreeError> {
        self.nodes.get(id.0).ok_or(TreeError::UnknownNode(id))
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut Node, TreeError> {
        self.nodes.get_mut(id.0).ok_or(TreeError::UnknownNode(id))
    }

    /// Append a child holding `message` under `parent`.
    pub fn add_child(&mut self, parent: NodeId, message: Message) -> Result<NodeId, TreeError> {
        let depth = self.get(parent)?.depth + 1;
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            children: Vec::new(),
            depth,
            messages: vec![message],
            files: BTreeMap::new(),
            branch_point: false,
        });
        self.get_mut(parent)?.children.push(id);
        Ok(id)
    }

    pub fn push_message(&mut self, id: NodeId, message: Message) -> Result<(), TreeError> {
        self.get_mut(id)?.messages.push(message);
        Ok(())
    }

    pub fn record_files(
        &mut self,
        id: NodeId,
        files: BTreeMap<String, FileChange>,
    ) -> Result<(), TreeError> {
        self.get_mut(id)?.files.extend(files);
        Ok(())
    }

    pub fn mark_branch_point(&mut self, id: NodeId) -> Result<(), TreeError> {
        self.get_mut(id)?.branch_point = true;
        Ok(())
    }

    /// Node ids from the root down to `id`, inclusive.
    pub fn path_to(&self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            path.push(current);
            cursor = self.get(current)?.parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Full conversation at `id`: the messages of every node on the root path.
    pub fn conversation(&self, id: NodeId) -> Result<Vec<Message>, TreeError> {
        let mut messages = Vec::new();
        for node_id in self.path_to(id)? {
            messages.extend(self.get(node_id)?.messages.iter().cloned());
        }
        Ok(messages)
    }

    /// Layered lookup: the closest node on the root path that touched `path` wins.
    pub fn file_at(&self, id: NodeId, path: &str) -> Result<Option<&FileChange>, TreeError> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = self.get(current)?;
            if let Some(change) = node.files.get(path) {
                return Ok(Some(change));
            }
            cursor = node.parent;
        }
        Ok(None)
    }

    /// Net changes along the root path, including deletion markers.
    pub fn effective_changes(&self, id: NodeId) -> Result<BTreeMap<String, FileChange>, TreeError> {
        let mut merged = BTreeMap::new();
        for node_id in self.path_to(id)? {
            for (path, change) in &self.get(node_id)?.files {
                merged.insert(path.clone(), change.clone());
            }
        }
        Ok(merged)
    }

    /// Effective file state at `id`, with deletions masking ancestor content.
    pub fn effective_files(&self, id: NodeId) -> Result<FileMap, TreeError> {
        Ok(self
            .effective_changes(id)?
            .into_iter()
            .filter_map(|(path, change)| match change {
                FileChange::Write(content) => Some((path, content)),
                FileChange::Delete => None,
            })
            .collect())
    }

    /// True if any node on the root path (including `id`) recorded a file change.
    pub fn has_modifications(&self, id: NodeId) -> Result<bool, TreeError> {
        for node_id in self.path_to(id)? {
            if !self.get(node_id)?.files.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Pre-order walk of the subtree rooted at `id`, `id` first.
    pub fn descendants(&self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            let node = self.get(current)?;
            stack.extend(node.children.iter().rev().copied());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_chain() -> (SearchTree, NodeId, NodeId) {
        let mut tree = SearchTree::new(Message::user_text("build it"));
        let a = tree
            .add_child(tree.root(), Message::assistant(Vec::new()))
            .expect("a");
        let b = tree.add_child(a, Message::assistant(Vec::new())).expect("b");
        (tree, a, b)
    }

    #[test]
    fn children_and_depth_are_consistent() {
        let (tree, a, b) = tree_with_chain();
        assert_eq!(tree.get(tree.root()).expect("root").depth, 0);
        assert_eq!(tree.get(a).expect("a").depth, 1);
        assert_eq!(tree.get(b).expect("b").depth, 2);
        assert_eq!(tree.get(a).expect("a").children, vec![b]);
        assert_eq!(tree.path_to(b).expect("path"), vec![tree.root(), a, b]);
    }

    #[test]
    fn closest_node_overrides_ancestor_content() {
        let (mut tree, a, b) = tree_with_chain();
        tree.record_files(
            a,
            BTreeMap::from([
                ("x.ts".to_string(), FileChange::Write("old".to_string())),
                ("y.ts".to_string(), FileChange::Write("keep".to_string())),
            ]),
        )
        .expect("record a");
        tree.record_files(
            b,
            BTreeMap::from([("x.ts".to_string(), FileChange::Write("new".to_string()))]),
        )
        .expect("record b");

        let files = tree.effective_files(b).expect("files");
        assert_eq!(files.get("x.ts").map(String::as_str), Some("new"));
        assert_eq!(files.get("y.ts").map(String::as_str), Some("keep"));
        assert_eq!(
            tree.effective_files(a).expect("files a").get("x.ts").map(String::as_str),
            Some("old")
        );
    }

    #[test]
    fn deletion_masks_ancestor_content() {
        let (mut tree, a, b) = tree_with_chain();
        tree.record_files(
            a,
            BTreeMap::from([("x.ts".to_string(), FileChange::Write("old".to_string()))]),
        )
        .expect("record a");
        tree.record_files(b, BTreeMap::from([("x.ts".to_string(), FileChange::Delete)]))
            .expect("record b");

        assert!(!tree.effective_files(b).expect("files").contains_key("x.ts"));
        assert_eq!(
            tree.file_at(b, "x.ts").expect("lookup"),
            Some(&FileChange::Delete)
        );
    }

    #[test]
    fn modifications_are_tracked_along_ancestor_chain() {
        let (mut tree, a, b) = tree_with_chain();
        assert!(!tree.has_modifications(b).expect("mods"));
        tree.record_files(
            a,
            BTreeMap::from([("x.ts".to_string(), FileChange::Write(String::new()))]),
        )
        .expect("record");
        assert!(tree.has_modifications(b).expect("mods"));
        assert!(!tree.has_modifications(tree.root()).expect("root mods"));
    }

    #[test]
    fn conversation_concatenates_root_path() {
        let (mut tree, _a, b) = tree_with_chain();
        tree.push_message(b, Message::user_text("tool results"))
            .expect("push");
        let conversation = tree.conversation(b).expect("conversation");
        assert_eq!(conversation.len(), 4);
        assert_eq!(conversation[0].text(), "build it");
        assert_eq!(conversation[3].text(), "tool results");
    }

    #[test]
    fn delta_records_writes_and_deletions() {
        let before = FileMap::from([
            ("keep.ts".to_string(), "same".to_string()),
            ("edit.ts".to_string(), "old".to_string()),
            ("drop.ts".to_string(), "x".to_string()),
        ]);
        let after = FileMap::from([
            ("keep.ts".to_string(), "same".to_string()),
            ("edit.ts".to_string(), "new".to_string()),
            ("add.ts".to_string(), "y".to_string()),
        ]);
        assert_eq!(
            file_delta(&before, &after),
            BTreeMap::from([
                ("add.ts".to_string(), FileChange::Write("y".to_string())),
                ("drop.ts".to_string(), FileChange::Delete),
                ("edit.ts".to_string(), FileChange::Write("new".to_string())),
            ])
        );
    }

    #[test]
    fn unknown_node_is_an_error() {
        let tree = SearchTree::new(Message::user_text("x"));
        assert_eq!(
            tree.get(NodeId(7)).expect_err("missing"),
            TreeError::UnknownNode(NodeId(7))
        );
    }
}
