//! Adjacency graph and next-hop routing.
//!
//! The graph holds undirected edges between identities plus a display label
//! per node. Edges are stored as ordered pairs, so symmetry holds by
//! construction. Routes are recomputed by breadth-first search from the
//! local identity whenever the graph changes, with ties broken by ascending
//! identity so the table is deterministic.

use crate::error::{Error, Result};
use crate::identity::NodeId;
use crate::wire::body::{Reader, Writer};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Display-only node label carried in adjacency maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeLabel {
    /// Node hostname
    pub hostname: String,
    /// Node operating system
    pub os: String,
}

impl NodeLabel {
    /// Label describing the current process's host.
    #[must_use]
    pub fn local() -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into()),
            os: std::env::consts::OS.into(),
        }
    }
}

/// The overlay graph as seen from one node, with its routing table.
pub struct Topology {
    local: NodeId,
    edges: HashSet<(NodeId, NodeId)>,
    labels: HashMap<NodeId, NodeLabel>,
    routes: HashMap<NodeId, NodeId>,
}

fn edge_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl Topology {
    /// Create a graph containing only the local node.
    #[must_use]
    pub fn new(local: NodeId, label: NodeLabel) -> Self {
        let mut labels = HashMap::new();
        labels.insert(local, label);
        Self {
            local,
            edges: HashSet::new(),
            labels,
            routes: HashMap::new(),
        }
    }

    /// The local identity this graph is rooted at.
    #[must_use]
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Add an undirected edge. Self-loops and duplicates are ignored.
    pub fn add_edge(&mut self, a: NodeId, b: NodeId) {
        if a != b {
            self.edges.insert(edge_key(a, b));
        }
    }

    /// True when the graph contains the edge, in either orientation.
    #[must_use]
    pub fn has_edge(&self, a: NodeId, b: NodeId) -> bool {
        self.edges.contains(&edge_key(a, b))
    }

    /// Record a display label for a node.
    pub fn set_label(&mut self, id: NodeId, label: NodeLabel) {
        self.labels.insert(id, label);
    }

    /// The display label of a node, when known.
    #[must_use]
    pub fn label(&self, id: NodeId) -> Option<&NodeLabel> {
        self.labels.get(&id)
    }

    /// Drop a node: all touching edges and its label.
    pub fn remove_node(&mut self, id: NodeId) {
        self.edges.retain(|&(a, b)| a != id && b != id);
        if id != self.local {
            self.labels.remove(&id);
        }
    }

    /// Reset the edge set to the local node's direct links, the starting
    /// point of a synchronization round. Labels are kept; they are
    /// display-only and re-merged from replies.
    pub fn reset_to_direct(&mut self, directs: &[NodeId]) {
        self.edges.clear();
        for &d in directs {
            self.add_edge(self.local, d);
        }
    }

    /// All identities appearing in the graph, local node included.
    #[must_use]
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes: BTreeSet<NodeId> = BTreeSet::new();
        nodes.insert(self.local);
        for &(a, b) in &self.edges {
            nodes.insert(a);
            nodes.insert(b);
        }
        nodes
    }

    /// Snapshot of the edge set.
    #[must_use]
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.edges.iter().copied().collect()
    }

    /// Serialize the graph for a SYNC or admission frame.
    #[must_use]
    pub fn encode_map(&self) -> Vec<u8> {
        let nodes = self.nodes();
        let mut w = Writer::new();

        w.put_u32(nodes.len() as u32);
        for id in &nodes {
            w.put_id(id);
            let label = self.labels.get(id).cloned().unwrap_or_default();
            w.put_lp16(label.hostname.as_bytes());
            w.put_lp16(label.os.as_bytes());
        }

        w.put_u32(self.edges.len() as u32);
        for &(a, b) in &self.edges {
            w.put_id(&a);
            w.put_id(&b);
        }
        w.into_bytes()
    }

    /// Merge a received adjacency map into this graph. Duplicate edges are
    /// deduplicated; labels are unioned.
    ///
    /// # Errors
    ///
    /// `MalformedFrame` when the map bytes do not parse.
    pub fn merge_map(&mut self, bytes: &[u8]) -> Result<()> {
        let mut r = Reader::new(bytes);

        let node_count = r.u32()?;
        for _ in 0..node_count {
            let id = r.id()?;
            let hostname = r.lp16_str()?;
            let os = r.lp16_str()?;
            if id != self.local {
                self.labels.insert(id, NodeLabel { hostname, os });
            }
        }

        let edge_count = r.u32()?;
        for _ in 0..edge_count {
            let a = r.id()?;
            let b = r.id()?;
            self.add_edge(a, b);
        }
        r.finish()
    }

    /// Recompute the routing table: unweighted BFS from the local identity,
    /// neighbor order ascending by identity.
    pub fn recompute_routes(&mut self) {
        let mut adjacency: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();
        for &(a, b) in &self.edges {
            adjacency.entry(a).or_default().insert(b);
            adjacency.entry(b).or_default().insert(a);
        }

        self.routes.clear();
        let mut visited: HashSet<NodeId> = HashSet::new();
        visited.insert(self.local);
        let mut queue = VecDeque::new();
        queue.push_back(self.local);

        while let Some(node) = queue.pop_front() {
            let Some(neighbors) = adjacency.get(&node) else {
                continue;
            };
            for &next in neighbors {
                if visited.insert(next) {
                    let hop = if node == self.local {
                        next
                    } else {
                        self.routes[&node]
                    };
                    self.routes.insert(next, hop);
                    queue.push_back(next);
                }
            }
        }
    }

    /// The direct peer a frame for `dst` must be handed to.
    ///
    /// # Errors
    ///
    /// `NotRoutable` when the destination is absent from the table.
    pub fn next_hop(&self, dst: NodeId) -> Result<NodeId> {
        self.routes
            .get(&dst)
            .copied()
            .ok_or(Error::NotRoutable(dst))
    }

    /// Snapshot of the routing table.
    #[must_use]
    pub fn routes(&self) -> HashMap<NodeId, NodeId> {
        self.routes.clone()
    }
}
