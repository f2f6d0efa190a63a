//! The process tree: a binary history of forks.
//!
//! Each live state owns one leaf. A fork splits a leaf into two children;
//! termination removes the leaf and compacts its parent. Path replay and
//! test-case attribution read paths off this tree.

use crate::state::StateId;

pub type NodeId = usize;

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    state: Option<StateId>,
}

#[derive(Debug, Default)]
pub struct ProcessTree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
}

impl ProcessTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = node;
            id
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    pub fn root(&mut self, state: StateId) -> NodeId {
        assert!(self.root.is_none(), "process tree already has a root");
        let id = self.insert(Node {
            parent: None,
            left: None,
            right: None,
            state: Some(state),
        });
        self.root = Some(id);
        id
    }

    /// Split the leaf of `node` into two children carrying `left_state`
    /// and `right_state`. Returns the two new leaves (left, right).
    pub fn attach(
        &mut self,
        node: NodeId,
        left_state: StateId,
        right_state: StateId,
    ) -> (NodeId, NodeId) {
        assert!(
            self.nodes[node].left.is_none() && self.nodes[node].right.is_none(),
            "fork must attach to a leaf"
        );
        let left = self.insert(Node {
            parent: Some(node),
            left: None,
            right: None,
            state: Some(left_state),
        });
        let right = self.insert(Node {
            parent: Some(node),
            left: None,
            right: None,
            state: Some(right_state),
        });
        let inner = &mut self.nodes[node];
        inner.state = None;
        inner.left = Some(left);
        inner.right = Some(right);
        (left, right)
    }

    /// Drop a leaf; a parent left with one child is compacted away.
    pub fn remove(&mut self, node: NodeId) {
        assert!(
            self.nodes[node].left.is_none() && self.nodes[node].right.is_none(),
            "only leaves can be removed"
        );
        let parent = self.nodes[node].parent;
        self.free.push(node);

        match parent {
            None => self.root = None,
            Some(parent_id) => {
                let parent_node = &mut self.nodes[parent_id];
                let sibling = if parent_node.left == Some(node) {
                    parent_node.right.take()
                } else {
                    parent_node.left.take()
                };
                parent_node.left = None;
                parent_node.right = None;

                let sibling = sibling.expect("inner nodes have two children");
                // splice the sibling into the parent's place
                let grandparent = parent_node.parent;
                self.nodes[sibling].parent = grandparent;
                match grandparent {
                    None => self.root = Some(sibling),
                    Some(gp) => {
                        let gp_node = &mut self.nodes[gp];
                        if gp_node.left == Some(parent_id) {
                            gp_node.left = Some(sibling);
                        } else {
                            gp_node.right = Some(sibling);
                        }
                    }
                }
                self.free.push(parent_id);
            }
        }
    }

    pub fn state_of(&self, node: NodeId) -> Option<StateId> {
        self.nodes[node].state
    }

    /// Number of live leaves.
    pub fn leaves(&self) -> usize {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(id, n)| n.state.is_some() && !self.free.contains(id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateId;

    #[test]
    fn attach_and_remove_keep_the_tree_compact() {
        let mut tree = ProcessTree::new();
        let s0 = StateId(0);
        let s1 = StateId(1);
        let s2 = StateId(2);

        let root = tree.root(s0);
        let (left, right) = tree.attach(root, s0, s1);
        assert_eq!(tree.state_of(left), Some(s0));
        assert_eq!(tree.state_of(right), Some(s1));
        assert_eq!(tree.leaves(), 2);

        let (ll, lr) = tree.attach(left, s0, s2);
        assert_eq!(tree.leaves(), 3);

        tree.remove(lr);
        assert_eq!(tree.leaves(), 2);
        tree.remove(ll);
        assert_eq!(tree.leaves(), 1);
        tree.remove(right);
        assert_eq!(tree.leaves(), 0);
    }
}
