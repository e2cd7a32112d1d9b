//! Subscription trie
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Each node
//! holds the subscriptions registered exactly at its path and at most one
//! retained message. Wildcard filter levels are ordinary children labelled
//! `+` or `#`; published topics can never contain those labels, so a single
//! ordered child map serves both exact lookups and wildcard branches.
//!
//! A node is pruned as soon as it has no children, no leaves and no retained
//! message, walking upward until a node that is still in use is reached.

use std::collections::BTreeMap;
use std::sync::Arc;

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::error::BrokerError;
use crate::protocol::{QoS, SubscriptionOptions};
use crate::store::MessageRef;

/// Arena handle of a trie node
pub type NodeId = usize;

const ROOT: NodeId = 0;

/// One client's subscription at a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub client_id: Arc<str>,
    pub options: SubscriptionOptions,
}

impl Leaf {
    pub fn new(client_id: Arc<str>, options: SubscriptionOptions) -> Self {
        Self { client_id, options }
    }
}

/// Result of registering a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The client had no subscription on this filter
    New,
    /// Existing subscription replaced; carries the options it had before
    Updated { previous: SubscriptionOptions },
}

/// A subscriber selected by [`SubscriptionTrie::publish_match`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedSubscriber {
    /// Highest QoS granted among the client's matching filters
    pub qos: QoS,
    pub retain_as_published: bool,
}

#[derive(Debug)]
struct TrieNode {
    label: CompactString,
    parent: Option<NodeId>,
    children: BTreeMap<CompactString, NodeId>,
    leaves: SmallVec<[Leaf; 1]>,
    retained: Option<MessageRef>,
}

impl TrieNode {
    fn new(label: &str, parent: Option<NodeId>) -> Self {
        Self {
            label: CompactString::new(label),
            parent,
            children: BTreeMap::new(),
            leaves: SmallVec::new(),
            retained: None,
        }
    }

    fn is_unused(&self) -> bool {
        self.children.is_empty() && self.leaves.is_empty() && self.retained.is_none()
    }
}

/// Arena-backed topic trie holding subscriptions and retained messages
#[derive(Debug)]
pub struct SubscriptionTrie {
    nodes: Vec<Option<TrieNode>>,
    free: Vec<NodeId>,
    live: usize,
    leaves: usize,
    retained: usize,
    /// Maximum number of non-root nodes (0 = unlimited)
    max_nodes: usize,
}

impl SubscriptionTrie {
    pub fn new() -> Self {
        Self::with_node_limit(0)
    }

    /// Create a trie that refuses to grow beyond `max_nodes` non-root nodes
    pub fn with_node_limit(max_nodes: usize) -> Self {
        Self {
            nodes: vec![Some(TrieNode::new("", None))],
            free: Vec::new(),
            live: 1,
            leaves: 0,
            retained: 0,
            max_nodes,
        }
    }

    #[inline]
    fn node(&self, id: NodeId) -> Option<&TrieNode> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    #[inline]
    fn node_mut(&mut self, id: NodeId) -> Option<&mut TrieNode> {
        self.nodes.get_mut(id).and_then(Option::as_mut)
    }

    /// Find the node for an exact level path
    fn find(&self, levels: &[&str]) -> Option<NodeId> {
        let mut current = ROOT;
        for level in levels {
            current = *self.node(current)?.children.get(*level)?;
        }
        Some(current)
    }

    /// Make sure the whole path can be created before touching the arena.
    fn reserve_path(&mut self, levels: &[&str]) -> Result<(), BrokerError> {
        let mut missing = 0;
        let mut current = Some(ROOT);
        for level in levels {
            current = current
                .and_then(|id| self.node(id))
                .and_then(|node| node.children.get(*level).copied());
            if current.is_none() {
                missing += 1;
            }
        }

        if missing == 0 {
            return Ok(());
        }

        if self.max_nodes > 0 && self.live - 1 + missing > self.max_nodes {
            return Err(BrokerError::ResourceExhausted("subscription trie node limit"));
        }

        let recycled = missing.min(self.free.len());
        self.nodes
            .try_reserve(missing - recycled)
            .map_err(|_| BrokerError::ResourceExhausted("trie node allocation failed"))
    }

    fn alloc(&mut self, label: &str, parent: NodeId) -> NodeId {
        let node = TrieNode::new(label, Some(parent));
        self.live += 1;
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    /// Walk the path, creating missing nodes. Callers reserve first.
    fn ensure_path(&mut self, levels: &[&str]) -> NodeId {
        let mut current = ROOT;
        for level in levels {
            let existing = self
                .node(current)
                .and_then(|node| node.children.get(*level).copied());
            current = match existing {
                Some(child) => child,
                None => {
                    let child = self.alloc(level, current);
                    if let Some(parent) = self.node_mut(current) {
                        parent.children.insert(CompactString::new(*level), child);
                    }
                    child
                }
            };
        }
        current
    }

    /// Remove unused nodes from `id` upward
    fn prune(&mut self, mut id: NodeId) {
        while id != ROOT {
            let (parent, label) = match self.node(id) {
                Some(node) if node.is_unused() => match node.parent {
                    Some(parent) => (parent, node.label.clone()),
                    None => return,
                },
                _ => return,
            };

            if let Some(parent_node) = self.node_mut(parent) {
                parent_node.children.remove(&label);
            }
            self.nodes[id] = None;
            self.free.push(id);
            self.live -= 1;
            id = parent;
        }
    }

    /// Register a client's subscription on a tokenized filter.
    ///
    /// Fails with `ResourceExhausted` before any node is created if the path
    /// cannot be built.
    pub fn subscribe(
        &mut self,
        levels: &[&str],
        leaf: Leaf,
    ) -> Result<(NodeId, SubscribeOutcome), BrokerError> {
        self.reserve_path(levels)?;
        let id = self.ensure_path(levels);

        let Some(node) = self.node_mut(id) else {
            return Err(BrokerError::ResourceExhausted("trie node missing"));
        };

        if let Some(existing) = node
            .leaves
            .iter_mut()
            .find(|l| l.client_id == leaf.client_id)
        {
            let previous = existing.options;
            existing.options = leaf.options;
            return Ok((id, SubscribeOutcome::Updated { previous }));
        }

        node.leaves.push(leaf);
        self.leaves += 1;
        Ok((id, SubscribeOutcome::New))
    }

    /// Remove a client's subscription on a tokenized filter
    pub fn unsubscribe(&mut self, levels: &[&str], client_id: &str) -> bool {
        match self.find(levels) {
            Some(id) => self.remove_leaf(id, client_id),
            None => false,
        }
    }

    /// Remove a client's leaf from a known node, pruning what is left unused
    pub fn remove_leaf(&mut self, id: NodeId, client_id: &str) -> bool {
        let Some(node) = self.node_mut(id) else {
            return false;
        };
        let Some(pos) = node
            .leaves
            .iter()
            .position(|l| l.client_id.as_ref() == client_id)
        else {
            return false;
        };

        node.leaves.remove(pos);
        self.leaves -= 1;
        self.prune(id);
        true
    }

    /// Subscription options a client holds at a node
    pub fn leaf(&self, id: NodeId, client_id: &str) -> Option<&Leaf> {
        self.node(id)?
            .leaves
            .iter()
            .find(|l| l.client_id.as_ref() == client_id)
    }

    /// Visit every leaf whose filter matches a tokenized topic name.
    ///
    /// A client may be visited more than once when several of its filters
    /// match.
    pub fn matches<F>(&self, levels: &[&str], mut callback: F)
    where
        F: FnMut(&Leaf),
    {
        let is_system_topic = levels.first().is_some_and(|l| l.starts_with('$'));
        self.matches_recursive(ROOT, levels, 0, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        &self,
        id: NodeId,
        levels: &[&str],
        index: usize,
        is_system_topic: bool,
        callback: &mut F,
    ) where
        F: FnMut(&Leaf),
    {
        let Some(node) = self.node(id) else {
            return;
        };

        // $-topics are not matched by wildcards in the first filter level
        let wildcards_allowed = !(is_system_topic && index == 0);

        // `#` matches this level and everything below it, including nothing
        if wildcards_allowed {
            if let Some(multi) = node.children.get("#").and_then(|&c| self.node(c)) {
                multi.leaves.iter().for_each(|leaf| callback(leaf));
            }
        }

        if index == levels.len() {
            node.leaves.iter().for_each(|leaf| callback(leaf));
            return;
        }

        if wildcards_allowed {
            if let Some(&single) = node.children.get("+") {
                self.matches_recursive(single, levels, index + 1, is_system_topic, callback);
            }
        }

        if let Some(&exact) = node.children.get(levels[index]) {
            self.matches_recursive(exact, levels, index + 1, is_system_topic, callback);
        }
    }

    /// Subscribers for a published topic, one entry per client keeping the
    /// highest granted QoS among its matching filters
    pub fn publish_match(&self, levels: &[&str]) -> BTreeMap<Arc<str>, MatchedSubscriber> {
        self.publish_match_filtered(levels, |_| true)
    }

    /// Like [`publish_match`](Self::publish_match), skipping leaves rejected
    /// by `accept` before deduplication
    pub fn publish_match_filtered<F>(
        &self,
        levels: &[&str],
        mut accept: F,
    ) -> BTreeMap<Arc<str>, MatchedSubscriber>
    where
        F: FnMut(&Leaf) -> bool,
    {
        let mut matched: BTreeMap<Arc<str>, MatchedSubscriber> = BTreeMap::new();
        self.matches(levels, |leaf| {
            if !accept(leaf) {
                return;
            }
            let candidate = MatchedSubscriber {
                qos: leaf.options.qos,
                retain_as_published: leaf.options.retain_as_published,
            };
            matched
                .entry(leaf.client_id.clone())
                .and_modify(|current| {
                    if candidate.qos > current.qos {
                        *current = candidate;
                    } else if candidate.qos == current.qos {
                        current.retain_as_published |= candidate.retain_as_published;
                    }
                })
                .or_insert(candidate);
        });
        matched
    }

    /// Install or clear the retained message for a concrete topic.
    ///
    /// Returns the message previously retained there.
    pub fn set_retained(
        &mut self,
        levels: &[&str],
        message: Option<MessageRef>,
    ) -> Result<Option<MessageRef>, BrokerError> {
        match message {
            Some(message) => {
                self.reserve_path(levels)?;
                let id = self.ensure_path(levels);
                let previous = self
                    .node_mut(id)
                    .and_then(|node| node.retained.replace(message));
                if previous.is_none() {
                    self.retained += 1;
                }
                Ok(previous)
            }
            None => {
                let Some(id) = self.find(levels) else {
                    return Ok(None);
                };
                let previous = self.node_mut(id).and_then(|node| node.retained.take());
                if previous.is_some() {
                    self.retained -= 1;
                    self.prune(id);
                }
                Ok(previous)
            }
        }
    }

    /// Retained message stored at a concrete topic
    pub fn retained_at(&self, levels: &[&str]) -> Option<&MessageRef> {
        self.node(self.find(levels)?)?.retained.as_ref()
    }

    /// Retained messages whose topics match a tokenized filter, in trie order
    pub fn retained_matching(&self, filter: &[&str]) -> Vec<MessageRef> {
        let mut out = Vec::new();
        self.retained_recursive(ROOT, filter, 0, &mut out);
        out
    }

    fn retained_recursive(
        &self,
        id: NodeId,
        filter: &[&str],
        index: usize,
        out: &mut Vec<MessageRef>,
    ) {
        let Some(node) = self.node(id) else {
            return;
        };

        if index == filter.len() {
            out.extend(node.retained.iter().cloned());
            return;
        }

        match filter[index] {
            "#" => {
                out.extend(node.retained.iter().cloned());
                let mut stack: Vec<NodeId> = self
                    .topic_children(node, index == 0)
                    .rev()
                    .collect();
                while let Some(next) = stack.pop() {
                    if let Some(n) = self.node(next) {
                        out.extend(n.retained.iter().cloned());
                        stack.extend(self.topic_children(n, false).rev());
                    }
                }
            }
            "+" => {
                for child in self.topic_children(node, index == 0) {
                    self.retained_recursive(child, filter, index + 1, out);
                }
            }
            level => {
                if let Some(&child) = node.children.get(level) {
                    self.retained_recursive(child, filter, index + 1, out);
                }
            }
        }
    }

    /// Children that can lie on a published topic path
    fn topic_children<'a>(
        &'a self,
        node: &'a TrieNode,
        at_root: bool,
    ) -> impl DoubleEndedIterator<Item = NodeId> + 'a {
        node.children
            .iter()
            .filter(move |(label, _)| {
                label.as_str() != "+"
                    && label.as_str() != "#"
                    && !(at_root && label.starts_with('$'))
            })
            .map(|(_, &id)| id)
    }

    /// Every retained message in the trie
    pub fn all_retained(&self) -> Vec<MessageRef> {
        self.nodes
            .iter()
            .flatten()
            .filter_map(|node| node.retained.clone())
            .collect()
    }

    /// Rebuild the filter string of a node
    pub fn filter_of(&self, id: NodeId) -> Option<String> {
        let mut labels: SmallVec<[&str; 8]> = SmallVec::new();
        let mut current = id;
        while current != ROOT {
            let node = self.node(current)?;
            labels.push(node.label.as_str());
            current = node.parent?;
        }
        labels.reverse();
        Some(labels.join("/"))
    }

    /// Live nodes including the root
    pub fn node_count(&self) -> usize {
        self.live
    }

    /// Registered subscriptions across all nodes
    pub fn leaf_count(&self) -> usize {
        self.leaves
    }

    /// Topics currently holding a retained message
    pub fn retained_count(&self) -> usize {
        self.retained
    }
}

impl Default for SubscriptionTrie {
    fn default() -> Self {
        Self::new()
    }
}
