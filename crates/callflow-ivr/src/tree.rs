//! The IVR node tree.
//!
//! A tree is a flat id-indexed map of [`IvrNode`]s plus a registry of
//! entry points ("roots"). The dialplan hands the engine an optional
//! entry key on call start; an unknown or missing key falls back to the
//! node named `root`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{IvrError, Result};
use crate::types::NodeId;

/// What executing a node does. Exhaustive by design: a new action kind
/// must be handled everywhere the compiler points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    /// Play a media reference, then return control to the parent menu.
    Playback,
    /// Play an optional prompt, then wait for a digit.
    Menu,
    /// Originate a call leg to the payload target.
    Dial,
    /// Jump to the node named by the payload, without a history push.
    Goto,
    /// Hand the call off to the queuing subsystem named by the payload.
    Queue,
    /// Terminate the channel and release all call state.
    Hangup,
}

/// One step in the IVR tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvrNode {
    pub id: NodeId,
    pub name: String,
    pub parent: Option<NodeId>,
    pub action: NodeAction,
    /// Media reference, dial target, goto target, or queue name,
    /// depending on `action`.
    pub payload: Option<String>,
    /// Ordering among siblings.
    pub order: u32,
    /// Menu digit-wait timeout in milliseconds; zero disables the timer.
    pub timeout_ms: u64,
    /// Digit that selects this node from its parent menu.
    pub digit: Option<char>,
    /// Control digit that replays the current menu.
    pub repeat_digit: char,
    /// Control digit that jumps back to the configured root.
    pub root_digit: char,
    /// Control digit that navigates to the parent (only honored when a
    /// parent exists).
    pub back_digit: char,
    /// Whether digits may interrupt this node's prompt while it is
    /// still playing.
    pub allow_early_dtmf: bool,
}

impl IvrNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: NodeAction) -> Self {
        IvrNode {
            id: NodeId::new(id),
            name: name.into(),
            parent: None,
            action,
            payload: None,
            order: 0,
            timeout_ms: 0,
            digit: None,
            repeat_digit: '*',
            root_digit: '#',
            back_digit: '0',
            allow_early_dtmf: true,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(NodeId::new(parent));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_digit(mut self, digit: char) -> Self {
        self.digit = Some(digit);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn without_early_dtmf(mut self) -> Self {
        self.allow_early_dtmf = false;
        self
    }

    pub fn is_menu(&self) -> bool {
        self.action == NodeAction::Menu
    }
}

/// Id-indexed node storage with entry-point lookup.
#[derive(Debug, Default, Clone)]
pub struct NodeTree {
    nodes: HashMap<NodeId, IvrNode>,
    roots: HashMap<String, NodeId>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, enforcing digit uniqueness among siblings.
    pub fn insert(&mut self, node: IvrNode) -> Result<()> {
        if let (Some(parent), Some(digit)) = (&node.parent, node.digit) {
            let taken = self.nodes.values().any(|n| {
                n.id != node.id && n.parent.as_ref() == Some(parent) && n.digit == Some(digit)
            });
            if taken {
                return Err(IvrError::tree(format!(
                    "digit '{}' already used by a sibling under {}",
                    digit, parent
                )));
            }
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Register an entry point name for a root node.
    pub fn register_root(&mut self, entry_key: impl Into<String>, node_id: impl Into<String>) {
        self.roots.insert(entry_key.into(), NodeId::new(node_id));
    }

    /// Resolve the root for an optional entry key; falls back to the
    /// node named `root`.
    pub fn root(&self, entry_key: Option<&str>) -> Option<&IvrNode> {
        if let Some(key) = entry_key {
            if let Some(id) = self.roots.get(key) {
                return self.nodes.get(id);
            }
        }
        if let Some(id) = self.roots.get("root") {
            return self.nodes.get(id);
        }
        self.nodes.values().find(|n| n.name == "root")
    }

    pub fn get(&self, id: &NodeId) -> Option<&IvrNode> {
        self.nodes.get(id)
    }

    /// Children of `parent`, sorted by their configured order.
    pub fn children(&self, parent: &NodeId) -> Vec<&IvrNode> {
        let mut out: Vec<&IvrNode> = self
            .nodes
            .values()
            .filter(|n| n.parent.as_ref() == Some(parent))
            .collect();
        out.sort_by_key(|n| n.order);
        out
    }

    /// Child of `parent` selected by `digit`, if any.
    pub fn child_by_digit(&self, parent: &NodeId, digit: char) -> Option<&IvrNode> {
        self.nodes
            .values()
            .find(|n| n.parent.as_ref() == Some(parent) && n.digit == Some(digit))
    }

    /// Walk up from `id` (exclusive) to the nearest ancestor menu node.
    pub fn nearest_menu_ancestor(&self, id: &NodeId) -> Option<&IvrNode> {
        let mut current = self.nodes.get(id)?.parent.as_ref();
        while let Some(parent_id) = current {
            let parent = self.nodes.get(parent_id)?;
            if parent.is_menu() {
                return Some(parent);
            }
            current = parent.parent.as_ref();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> NodeTree {
        let mut tree = NodeTree::new();
        tree.insert(
            IvrNode::new("n-root", "root", NodeAction::Menu).with_timeout_ms(5000),
        )
        .unwrap();
        tree.insert(
            IvrNode::new("n-1", "hours", NodeAction::Playback)
                .with_parent("n-root")
                .with_digit('1'),
        )
        .unwrap();
        tree.insert(
            IvrNode::new("n-2", "support", NodeAction::Queue)
                .with_parent("n-root")
                .with_digit('2')
                .with_payload("support"),
        )
        .unwrap();
        tree.register_root("root", "n-root");
        tree
    }

    #[test]
    fn duplicate_sibling_digit_is_rejected() {
        let mut tree = sample_tree();
        let dup = IvrNode::new("n-3", "sales", NodeAction::Queue)
            .with_parent("n-root")
            .with_digit('1');
        assert!(matches!(tree.insert(dup), Err(IvrError::Tree(_))));
    }

    #[test]
    fn root_falls_back_to_name() {
        let tree = sample_tree();
        assert_eq!(tree.root(None).unwrap().id, NodeId::new("n-root"));
        // Unknown entry key falls back to the registered root.
        assert_eq!(tree.root(Some("after-hours")).unwrap().id, NodeId::new("n-root"));
    }

    #[test]
    fn child_lookup_by_digit() {
        let tree = sample_tree();
        let root = NodeId::new("n-root");
        assert_eq!(tree.child_by_digit(&root, '2').unwrap().name, "support");
        assert!(tree.child_by_digit(&root, '9').is_none());
    }

    #[test]
    fn nearest_menu_ancestor_skips_non_menus() {
        let mut tree = sample_tree();
        tree.insert(
            IvrNode::new("n-1a", "deep", NodeAction::Playback).with_parent("n-1"),
        )
        .unwrap();

        let found = tree.nearest_menu_ancestor(&NodeId::new("n-1a")).unwrap();
        assert_eq!(found.id, NodeId::new("n-root"));
        assert!(tree.nearest_menu_ancestor(&NodeId::new("n-root")).is_none());
    }
}
