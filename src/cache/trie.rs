//! Shared prefix index.
//!
//! A token trie mapping a prefix of token ids to the block that caches the
//! state for exactly that prefix. Requests sharing a common prefix (e.g. a
//! system prompt) find the already-computed blocks by walking the trie.
//!
//! Nodes live in an arena and are never removed, so a [`NodeId`] stays valid
//! for the life of the trie. Entries are retired by clearing their anchor
//! when the backing block is recycled, never by pruning nodes. Each node
//! counts the anchors in its subtree so searches skip anchor-free branches.

use std::collections::HashMap;

use crate::cache::block::{BlockId, BlockStatus, TokenId};

/// Index of a node in the trie arena.
pub type NodeId = usize;

/// Associates a trie node with the block caching the state of its prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixAnchor {
    /// Block holding the state. Not an owning reference: the pool owns blocks.
    pub block_id: BlockId,

    /// Token offset where the block's content begins.
    pub start: usize,

    /// Full prefix from token 0 through the last token held by the block.
    pub prefix: Vec<TokenId>,

    /// Last known status of the block.
    pub status: BlockStatus,
}

impl PrefixAnchor {
    /// Prefix length in tokens.
    pub fn len(&self) -> usize {
        self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }

    /// Number of tokens held by the block.
    pub fn span(&self) -> usize {
        self.prefix.len() - self.start
    }

    /// Whether the recorded prefix is itself a prefix of `tokens`.
    pub fn is_prefix_of(&self, tokens: &[TokenId]) -> bool {
        tokens.len() >= self.prefix.len() && tokens[..self.prefix.len()] == self.prefix[..]
    }
}

#[derive(Debug)]
struct TrieNode {
    children: HashMap<TokenId, NodeId>,
    parent: Option<NodeId>,
    depth: usize,
    anchor: Option<PrefixAnchor>,

    /// Anchors in the subtree rooted here, this node included.
    anchors_below: usize,
}

impl TrieNode {
    fn new(parent: Option<NodeId>, depth: usize) -> Self {
        Self {
            children: HashMap::new(),
            parent,
            depth,
            anchor: None,
            anchors_below: 0,
        }
    }
}

/// Token trie over cached prefixes.
#[derive(Debug)]
pub struct PrefixTrie {
    nodes: Vec<TrieNode>,
}

impl Default for PrefixTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixTrie {
    pub const ROOT: NodeId = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new(None, 0)],
        }
    }

    /// Follow `path` from the root, returning None on any missing edge.
    pub fn get_node(&self, path: &[TokenId]) -> Option<NodeId> {
        self.get_node_from(Self::ROOT, path)
    }

    /// Follow `suffix` from `node`, returning None on any missing edge.
    pub fn get_node_from(&self, node: NodeId, suffix: &[TokenId]) -> Option<NodeId> {
        let mut cur = node;
        for tok in suffix {
            cur = *self.nodes[cur].children.get(tok)?;
        }
        Some(cur)
    }

    /// Follow `path` from the root, creating missing edges.
    pub fn get_or_create_node(&mut self, path: &[TokenId]) -> NodeId {
        self.get_or_create_node_from(Self::ROOT, path)
    }

    /// Follow `suffix` from `node`, creating missing edges.
    pub fn get_or_create_node_from(&mut self, node: NodeId, suffix: &[TokenId]) -> NodeId {
        let mut cur = node;
        for &tok in suffix {
            cur = match self.nodes[cur].children.get(&tok) {
                Some(&next) => next,
                None => {
                    let next = self.nodes.len();
                    let depth = self.nodes[cur].depth + 1;
                    self.nodes.push(TrieNode::new(Some(cur), depth));
                    self.nodes[cur].children.insert(tok, next);
                    next
                }
            };
        }
        cur
    }

    /// Nodes visited while following `suffix` from `node` for as long as
    /// edges exist, shallowest first. `node` itself is not included.
    pub fn walk(&self, node: NodeId, suffix: &[TokenId]) -> Vec<NodeId> {
        let mut visited = Vec::new();
        let mut cur = node;
        for tok in suffix {
            match self.nodes[cur].children.get(tok) {
                Some(&next) => {
                    visited.push(next);
                    cur = next;
                }
                None => break,
            }
        }
        visited
    }

    /// Length of the prefix reaching `node`.
    pub fn depth(&self, node: NodeId) -> usize {
        self.nodes[node].depth
    }

    pub fn anchor(&self, node: NodeId) -> Option<&PrefixAnchor> {
        self.nodes[node].anchor.as_ref()
    }

    /// Attach an anchor to `node`, returning the one it replaces.
    pub fn set_anchor(&mut self, node: NodeId, anchor: PrefixAnchor) -> Option<PrefixAnchor> {
        debug_assert_eq!(anchor.len(), self.nodes[node].depth);
        let old = self.nodes[node].anchor.replace(anchor);
        if old.is_none() {
            self.update_counts(node, |n| n + 1);
        }
        old
    }

    pub fn clear_anchor(&mut self, node: NodeId) -> Option<PrefixAnchor> {
        let old = self.nodes[node].anchor.take();
        if old.is_some() {
            self.update_counts(node, |n| n - 1);
        }
        old
    }

    /// Apply `f` to the subtree anchor count of `node` and every ancestor.
    fn update_counts(&mut self, node: NodeId, f: impl Fn(usize) -> usize) {
        let mut cur = Some(node);
        while let Some(id) = cur {
            let n = &mut self.nodes[id];
            n.anchors_below = f(n.anchors_below);
            cur = n.parent;
        }
    }

    /// Number of anchors in the subtree rooted at `node`, itself included.
    pub fn anchors_below(&self, node: NodeId) -> usize {
        self.nodes[node].anchors_below
    }

    pub fn set_anchor_status(&mut self, node: NodeId, status: BlockStatus) {
        if let Some(anchor) = self.nodes[node].anchor.as_mut() {
            anchor.status = status;
        }
    }

    /// Depth-first search of the subtree rooted at `node` (inclusive) for an
    /// anchor accepted by `pred`, visiting nodes no deeper than `max_depth`.
    /// Branches holding no anchors are never entered.
    pub fn find_anchor_below<F>(&self, node: NodeId, max_depth: usize, pred: F) -> Option<NodeId>
    where
        F: Fn(&PrefixAnchor) -> bool,
    {
        let mut stack = vec![node];
        while let Some(cur) = stack.pop() {
            let n = &self.nodes[cur];
            if n.anchors_below == 0 {
                continue;
            }
            if n.anchor.as_ref().is_some_and(|a| pred(a)) {
                return Some(cur);
            }
            if n.depth < max_depth {
                stack.extend(
                    n.children
                        .values()
                        .copied()
                        .filter(|&c| self.nodes[c].anchors_below > 0),
                );
            }
        }
        None
    }

    /// Total number of nodes, root included.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_anchors(&self) -> usize {
        self.nodes[Self::ROOT].anchors_below
    }
}
