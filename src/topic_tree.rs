//! Per-broker hierarchy of every topic seen and its last payload.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. A node is never
//! replaced once created, so a handle obtained for `a` stays valid and refers
//! to the same node after any number of later inserts below or beside it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;

/// Topic trees of all brokers, keyed by broker name.
pub type SharedTrees = Arc<Mutex<HashMap<String, TopicTree>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub struct TopicNode {
    segment: String,
    children: Vec<NodeId>,
    child_index: HashMap<String, NodeId>,
    payload: Option<String>,
    last_updated: Option<OffsetDateTime>,
}

impl TopicNode {
    fn new(segment: &str) -> Self {
        Self {
            segment: segment.to_string(),
            children: Vec::new(),
            child_index: HashMap::new(),
            payload: None,
            last_updated: None,
        }
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn last_updated(&self) -> Option<OffsetDateTime> {
        self.last_updated
    }

    /// Children in the order they were first seen.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

#[derive(Debug, Clone)]
pub struct TopicTree {
    nodes: Vec<TopicNode>,
}

impl Default for TopicTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicTree {
    const ROOT: NodeId = NodeId(0);

    pub fn new() -> Self {
        Self {
            nodes: vec![TopicNode::new("")],
        }
    }

    pub fn root(&self) -> NodeId {
        Self::ROOT
    }

    pub fn node(&self, id: NodeId) -> &TopicNode {
        &self.nodes[id.0]
    }

    /// Number of topic nodes, the implicit root excluded.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `payload` as the latest value of `topic`, creating missing
    /// segments on the way. Existing nodes and their children are left alone.
    pub fn insert(&mut self, topic: &str, payload: impl Into<String>) -> NodeId {
        let mut current = Self::ROOT;
        for segment in topic.split('/') {
            current = self.child_or_insert(current, segment);
        }

        let node = &mut self.nodes[current.0];
        node.payload = Some(payload.into());
        node.last_updated = Some(OffsetDateTime::now_utc());
        current
    }

    /// Node addressed by `topic`, if every segment exists.
    pub fn find(&self, topic: &str) -> Option<NodeId> {
        topic.split('/').try_fold(Self::ROOT, |current, segment| {
            self.nodes[current.0].child_index.get(segment).copied()
        })
    }

    /// Last payload stored for `topic`.
    pub fn lookup(&self, topic: &str) -> Option<&str> {
        self.find(topic).and_then(|id| self.node(id).payload())
    }

    /// Depth-first walk over every node, children in first-seen order.
    pub fn snapshot(&self) -> Snapshot<'_> {
        let stack = self.nodes[0]
            .children
            .iter()
            .rev()
            .map(|&id| (id, 0))
            .collect();

        Snapshot {
            tree: self,
            stack,
            path: Vec::new(),
        }
    }

    /// Indented text view of the tree with the stored payloads.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        for entry in self.snapshot() {
            let depth = entry.path.len() - 1;
            let label = if entry.node.segment.is_empty() {
                "\"\""
            } else {
                entry.node.segment.as_str()
            };
            let _ = write!(out, "{:indent$}{}", "", label, indent = depth * 2);
            if let Some(payload) = entry.node.payload() {
                let _ = write!(out, " = {}", payload);
            }
            out.push('\n');
        }
        out
    }

    fn child_or_insert(&mut self, parent: NodeId, segment: &str) -> NodeId {
        if let Some(&id) = self.nodes[parent.0].child_index.get(segment) {
            return id;
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(TopicNode::new(segment));
        let parent = &mut self.nodes[parent.0];
        parent.children.push(id);
        parent.child_index.insert(segment.to_string(), id);
        id
    }
}

/// Item produced by [`TopicTree::snapshot`].
#[derive(Debug, Clone)]
pub struct TopicEntry<'a> {
    pub id: NodeId,
    /// Segments from the root down to and including this node.
    pub path: Vec<&'a str>,
    pub node: &'a TopicNode,
}

impl TopicEntry<'_> {
    pub fn topic(&self) -> String {
        self.path.join("/")
    }
}

pub struct Snapshot<'a> {
    tree: &'a TopicTree,
    stack: Vec<(NodeId, usize)>,
    path: Vec<&'a str>,
}

impl<'a> Iterator for Snapshot<'a> {
    type Item = TopicEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (id, depth) = self.stack.pop()?;
        let node = self.tree.node(id);

        self.path.truncate(depth);
        self.path.push(node.segment.as_str());
        self.stack
            .extend(node.children.iter().rev().map(|&child| (child, depth + 1)));

        Some(TopicEntry {
            id,
            path: self.path.clone(),
            node,
        })
    }
}
