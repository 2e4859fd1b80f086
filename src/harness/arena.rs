//! Node storage for the test tree.
//!
//! Nodes live in a flat vector and refer to each other by [`NodeId`]; a
//! parent link is an index, never an owning reference. Heavy per-node state
//! (log buffers, join handles) is released once the node has reported.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Index of a node in the [`Arena`].
pub type NodeId = usize;

/// The root node every top-level test hangs off.
pub const ROOT: NodeId = 0;

/// Lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NotStarted,
    Running,
    /// Called `parallel()` and is waiting for its parent and a free slot.
    WaitingToStart,
    Done,
}

/// What a child tells the `run` call that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Yield {
    /// The child finished.
    Done,
    /// The child went parallel; the parent may continue.
    Parallel,
}

pub(crate) struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub level: usize,
    pub state: NodeState,

    /// Sticky; never cleared once set.
    pub failed: bool,
    /// Set when a child completes with `failed`.
    pub child_failed: bool,
    pub skipped: bool,
    pub is_parallel: bool,
    pub fail_fast: bool,

    pub started: Instant,
    pub duration: Duration,

    /// This node's own log lines.
    pub log: String,
    /// Log lines interleaved with reports flushed up from children.
    pub output: String,

    pub signal: Option<oneshot::Sender<Yield>>,
    /// Flipped to `true` when the body returns; parallel children wait on it.
    pub barrier: watch::Sender<bool>,
    pub parallel_subs: Vec<JoinHandle<()>>,
    pub token: CancellationToken,
}

impl Node {
    fn new(
        name: String,
        parent: Option<NodeId>,
        level: usize,
        signal: Option<oneshot::Sender<Yield>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            level,
            state: NodeState::NotStarted,
            failed: false,
            child_failed: false,
            skipped: false,
            is_parallel: false,
            fail_fast: false,
            started: Instant::now(),
            duration: Duration::ZERO,
            log: String::new(),
            output: String::new(),
            signal,
            barrier: watch::channel(false).0,
            parallel_subs: Vec::new(),
            token,
        }
    }
}

/// All nodes of one harness run.
pub(crate) struct Arena {
    nodes: Vec<Node>,
    /// Next suffix to use for each full name handed out so far.
    sub_names: HashMap<String, usize>,
}

impl Arena {
    /// Creates an arena holding only the root node.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            nodes: vec![Node::new(String::new(), None, 0, None, token)],
            sub_names: HashMap::new(),
        }
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Adds a child of `parent` with a unique path-qualified name.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        sub_name: &str,
        signal: oneshot::Sender<Yield>,
    ) -> NodeId {
        let parent_name = self.nodes[parent].name.clone();
        let name = self.unique(&parent_name, &rewrite(sub_name));
        let level = self.nodes[parent].level + 1;
        let token = self.nodes[parent].token.child_token();

        let id = self.nodes.len();
        self.nodes
            .push(Node::new(name, Some(parent), level, Some(signal), token));
        self.nodes[parent].children.push(id);
        id
    }

    /// Ensures a full name is unused, appending `#NN` when it is taken.
    /// Empty names become `#00`, `#01`, ...
    fn unique(&mut self, parent: &str, sub: &str) -> String {
        let mut name = if parent.is_empty() {
            sub.to_string()
        } else {
            format!("{parent}/{sub}")
        };
        let mut empty = sub.is_empty();

        loop {
            match self.sub_names.get(&name).copied() {
                None if !empty => {
                    self.sub_names.insert(name.clone(), 1);
                    return name;
                }
                next => {
                    let next = next.unwrap_or(0);
                    self.sub_names.insert(name.clone(), next + 1);
                    name = format!("{name}#{next:02}");
                    empty = false;
                }
            }
        }
    }
}

/// Replaces whitespace so names stay single tokens in logs and paths.
fn rewrite(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}
