//! Experiment graph store.
//!
//! Owns the authoring graph: nodes in insertion order and the edges between
//! them. Edge semantics come from the node kinds plus the handles the edge
//! is attached to:
//!
//! - `bottom`-sourced edge out of a Sequence or Loop: containment
//! - Sequence to Sequence edge leaving `right` or entering `left`: chaining
//!
//! The store never holds an edge whose endpoints are missing.

use crate::lenient::Lenient;
use crate::node::{Node, NodeData, NodeKind, Position};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trialflow_core::{CoreError, CoreResult, EdgeId, NodeId};

/// A side of a node an edge can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Port {
    /// Top side
    Top,
    /// Bottom side
    Bottom,
    /// Left side
    Left,
    /// Right side
    Right,
}

impl Port {
    /// Handle name used on the canvas
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Bottom => "bottom",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// Handle name as written by the canvas; only the four sides carry meaning
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Create from any handle name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The side this handle names, if any
    #[must_use]
    pub fn port(&self) -> Option<Port> {
        match self.0.as_str() {
            "top" => Some(Port::Top),
            "bottom" => Some(Port::Bottom),
            "left" => Some(Port::Left),
            "right" => Some(Port::Right),
            _ => None,
        }
    }

    /// Get as string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Port> for Handle {
    fn from(port: Port) -> Self {
        Self(port.as_str().to_string())
    }
}

/// A directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Unique edge ID
    pub id: EdgeId,
    /// Source node
    pub source: NodeId,
    /// Handle on the source node
    #[serde(default, alias = "sourcePort", skip_serializing_if = "Lenient::is_missing")]
    pub source_handle: Lenient<Handle>,
    /// Target node
    pub target: NodeId,
    /// Handle on the target node
    #[serde(default, alias = "targetPort", skip_serializing_if = "Lenient::is_missing")]
    pub target_handle: Lenient<Handle>,
    /// Fields owned by the canvas (animated, style, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Edge {
    /// Create a new edge with a generated id
    #[must_use]
    pub fn new(
        source: impl Into<NodeId>,
        source_port: Option<Port>,
        target: impl Into<NodeId>,
        target_port: Option<Port>,
    ) -> Self {
        let handle = |port: Option<Port>| port.map_or(Lenient::Missing, |p| Handle::from(p).into());
        Self {
            id: EdgeId::generate(),
            source: source.into(),
            source_handle: handle(source_port),
            target: target.into(),
            target_handle: handle(target_port),
            extra: Map::new(),
        }
    }

    /// Container-to-child edge (`bottom` to `top`)
    #[must_use]
    pub fn containment(container: impl Into<NodeId>, child: impl Into<NodeId>) -> Self {
        Self::new(container, Some(Port::Bottom), child, Some(Port::Top))
    }

    /// Sequence-to-sequence edge (`right` to `left`)
    #[must_use]
    pub fn chain(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self::new(from, Some(Port::Right), to, Some(Port::Left))
    }

    /// Replace the generated id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<EdgeId>) -> Self {
        self.id = id.into();
        self
    }

    /// Side of the source node, if the handle names one
    #[must_use]
    pub fn source_port(&self) -> Option<Port> {
        self.source_handle.get().and_then(Handle::port)
    }

    /// Side of the target node, if the handle names one
    #[must_use]
    pub fn target_port(&self) -> Option<Port> {
        self.target_handle.get().and_then(Handle::port)
    }

    /// Same endpoints and same handles
    #[must_use]
    pub fn same_connection(&self, other: &Edge) -> bool {
        self.source == other.source
            && self.target == other.target
            && self.source_handle == other.source_handle
            && self.target_handle == other.target_handle
    }

    /// Source equals target
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

/// Direction for [`Graph::move_node`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards the front of the iteration order
    Up,
    /// Towards the back of the iteration order
    Down,
}

/// Read-only copy of the graph handed to the compiler and the snapshot writer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Nodes in store order
    pub nodes: Vec<Node>,
    /// Edges in insertion order
    pub edges: Vec<Edge>,
}

/// The authoring graph
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: IndexMap<NodeId, Node>,
    edges: Vec<Edge>,
    node_counter: u64,
}

impl Graph {
    /// Create a new empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from loaded nodes and edges, keeping their order
    ///
    /// # Errors
    ///
    /// Returns error on duplicate node or edge ids, or on an edge whose
    /// endpoint is not among `nodes`
    pub fn from_parts(
        nodes: impl IntoIterator<Item = Node>,
        edges: impl IntoIterator<Item = Edge>,
    ) -> CoreResult<Self> {
        let mut graph = Self::new();
        for node in nodes {
            graph.add_node(node)?;
        }
        for edge in edges {
            graph.add_edge(edge)?;
        }

        graph.node_counter = graph
            .nodes
            .keys()
            .filter_map(|id| id.as_str().rsplit_once('-'))
            .filter_map(|(_, suffix)| suffix.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max.saturating_add(1));

        Ok(graph)
    }

    /// Create a node of `kind` with the authoring tool's defaults
    pub fn create_node(&mut self, kind: NodeKind, position: Position) -> NodeId {
        let mut id = NodeId::for_kind(kind.type_name(), self.node_counter);
        while self.nodes.contains_key(&id) {
            self.node_counter += 1;
            id = NodeId::for_kind(kind.type_name(), self.node_counter);
        }

        let mut node = Node::new(id.clone(), NodeData::defaults_for(&kind, self.node_counter)).at(position);
        let mut order = Map::new();
        order.insert("order".to_string(), Value::from(self.node_counter));
        node.merge_data(order);

        tracing::debug!(node = %id, kind = %kind, "node created");
        self.nodes.insert(id.clone(), node);
        self.node_counter += 1;
        id
    }

    /// Add a node
    ///
    /// # Errors
    ///
    /// Returns error if a node with the same id exists
    pub fn add_node(&mut self, node: Node) -> CoreResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(CoreError::AlreadyExists {
                kind: "Node".to_string(),
                id: node.id.to_string(),
            });
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node together with every edge touching it
    ///
    /// # Errors
    ///
    /// Returns error if the node does not exist
    pub fn remove_node(&mut self, id: &NodeId) -> CoreResult<Node> {
        let node = self.nodes.shift_remove(id).ok_or_else(|| not_found("Node", id))?;
        let before = self.edges.len();
        self.edges.retain(|e| &e.source != id && &e.target != id);
        tracing::debug!(node = %id, edges_removed = before - self.edges.len(), "node removed");
        Ok(node)
    }

    /// Connect two nodes; an identical connection replaces the old edge in
    /// place, so edge order (and with it containment precedence) is kept
    ///
    /// # Errors
    ///
    /// Returns error if either endpoint does not exist
    pub fn connect(
        &mut self,
        source: &NodeId,
        source_port: Option<Port>,
        target: &NodeId,
        target_port: Option<Port>,
    ) -> CoreResult<EdgeId> {
        let edge = Edge::new(source.clone(), source_port, target.clone(), target_port);
        self.check_endpoints(&edge)?;
        let id = edge.id.clone();
        match self.edges.iter().position(|e| e.same_connection(&edge)) {
            Some(index) => {
                // later duplicates can only come from add_edge
                let mut seen = 0;
                self.edges.retain(|e| {
                    let duplicate = e.same_connection(&edge);
                    seen += usize::from(duplicate);
                    !duplicate || seen == 1
                });
                self.edges[index] = edge;
            }
            None => self.edges.push(edge),
        }
        Ok(id)
    }

    /// Add a prebuilt edge
    ///
    /// # Errors
    ///
    /// Returns error on a duplicate edge id or an unknown endpoint
    pub fn add_edge(&mut self, edge: Edge) -> CoreResult<()> {
        self.check_endpoints(&edge)?;
        if self.edges.iter().any(|e| e.id == edge.id) {
            return Err(CoreError::AlreadyExists {
                kind: "Edge".to_string(),
                id: edge.id.to_string(),
            });
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Remove an edge
    ///
    /// # Errors
    ///
    /// Returns error if the edge does not exist
    pub fn remove_edge(&mut self, id: &EdgeId) -> CoreResult<Edge> {
        let index = self
            .edges
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| not_found("Edge", id))?;
        Ok(self.edges.remove(index))
    }

    /// Shallow-merge `patch` into a node's payload
    ///
    /// # Errors
    ///
    /// Returns error if the node does not exist
    pub fn update_node_data(&mut self, id: &NodeId, patch: Map<String, Value>) -> CoreResult<()> {
        let node = self.nodes.get_mut(id).ok_or_else(|| not_found("Node", id))?;
        node.merge_data(patch);
        Ok(())
    }

    /// Swap a node with its neighbour in iteration order
    ///
    /// Returns `false` when the node is already at that end.
    ///
    /// # Errors
    ///
    /// Returns error if the node does not exist
    pub fn move_node(&mut self, id: &NodeId, direction: Direction) -> CoreResult<bool> {
        let index = self.nodes.get_index_of(id).ok_or_else(|| not_found("Node", id))?;
        let other = match direction {
            Direction::Up if index > 0 => index - 1,
            Direction::Down if index + 1 < self.nodes.len() => index + 1,
            _ => return Ok(false),
        };
        self.nodes.swap_indices(index, other);
        Ok(true)
    }

    /// Copy of the current nodes and edges
    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.clone(),
        }
    }

    /// Get node by ID
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in store order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Edges in insertion order
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Nodes reached by containment edges out of `container`
    #[must_use]
    pub fn children(&self, container: &NodeId) -> IndexSet<NodeId> {
        match self.nodes.get(container) {
            Some(node) if node.is_container() => self
                .edges
                .iter()
                .filter(|e| &e.source == container && e.source_port() == Some(Port::Bottom))
                .map(|e| e.target.clone())
                .collect(),
            _ => IndexSet::new(),
        }
    }

    /// Counter used for the next created node
    #[must_use]
    pub fn node_counter(&self) -> u64 {
        self.node_counter
    }

    /// Get total node count
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get total edge count
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Check if graph is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn check_endpoints(&self, edge: &Edge) -> CoreResult<()> {
        for endpoint in [&edge.source, &edge.target] {
            if !self.nodes.contains_key(endpoint) {
                return Err(not_found("Node", endpoint));
            }
        }
        Ok(())
    }
}

fn not_found(kind: &str, id: &impl std::fmt::Display) -> CoreError {
    CoreError::NotFound {
        kind: kind.to_string(),
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph_with(kinds: &[NodeKind]) -> (Graph, Vec<NodeId>) {
        let mut graph = Graph::new();
        let ids = kinds
            .iter()
            .map(|k| graph.create_node(k.clone(), Position::origin()))
            .collect();
        (graph, ids)
    }

    #[test]
    fn test_graph_new() {
        let graph = Graph::new();
        assert!(graph.is_empty());
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_create_node_ids_and_defaults() {
        let (graph, ids) = graph_with(&[NodeKind::Stimulus, NodeKind::Sequence, NodeKind::Loop]);
        assert_eq!(ids[0].as_str(), "stimulus-0");
        assert_eq!(ids[1].as_str(), "sequence-1");
        assert_eq!(ids[2].as_str(), "loop-2");
        assert_eq!(graph.node_counter(), 3);

        let data = serde_json::to_value(graph.node(&ids[1]).unwrap()).unwrap();
        assert_eq!(data["data"]["label"], json!("Sequence 1"));
        assert_eq!(data["data"]["order"], json!(1));
    }

    #[test]
    fn test_add_node_duplicate() {
        let (mut graph, ids) = graph_with(&[NodeKind::Stimulus]);
        let dup = graph.node(&ids[0]).unwrap().clone();
        let result = graph.add_node(dup);
        assert!(matches!(result, Err(CoreError::AlreadyExists { .. })));
    }

    #[test]
    fn test_remove_node_cascades() {
        let (mut graph, ids) = graph_with(&[NodeKind::Sequence, NodeKind::Stimulus, NodeKind::Response]);
        graph.connect(&ids[0], Some(Port::Bottom), &ids[1], Some(Port::Top)).unwrap();
        graph.connect(&ids[0], Some(Port::Bottom), &ids[2], Some(Port::Top)).unwrap();
        assert_eq!(graph.edge_count(), 2);

        graph.remove_node(&ids[1]).unwrap();
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.edges().iter().all(|e| e.target != ids[1]));

        graph.remove_node(&ids[0]).unwrap();
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.remove_node(&ids[0]).is_err());
    }

    #[test]
    fn test_connect_rejects_unknown_endpoint() {
        let (mut graph, ids) = graph_with(&[NodeKind::Sequence]);
        let ghost = NodeId::new("stimulus-99");
        let result = graph.connect(&ids[0], Some(Port::Bottom), &ghost, None);
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_connect_identical_replaces() {
        let (mut graph, ids) = graph_with(&[NodeKind::Sequence, NodeKind::Sequence]);
        let first = graph.connect(&ids[0], Some(Port::Right), &ids[1], Some(Port::Left)).unwrap();
        let second = graph.connect(&ids[0], Some(Port::Right), &ids[1], Some(Port::Left)).unwrap();
        assert_ne!(first, second);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edges()[0].id, second);

        graph.connect(&ids[0], Some(Port::Bottom), &ids[1], Some(Port::Top)).unwrap();
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_redrawn_connection_keeps_its_place() {
        let (mut graph, ids) = graph_with(&[NodeKind::Sequence, NodeKind::Sequence, NodeKind::Stimulus]);
        graph.connect(&ids[0], Some(Port::Bottom), &ids[2], Some(Port::Top)).unwrap();
        graph.connect(&ids[1], Some(Port::Bottom), &ids[2], Some(Port::Top)).unwrap();
        let redrawn = graph.connect(&ids[0], Some(Port::Bottom), &ids[2], Some(Port::Top)).unwrap();

        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.edges()[0].id, redrawn);
        assert_eq!(graph.edges()[0].source, ids[0]);
        assert_eq!(graph.edges()[1].source, ids[1]);
    }

    #[test]
    fn test_add_and_remove_edge() {
        let (mut graph, ids) = graph_with(&[NodeKind::Loop, NodeKind::Sound]);
        let edge = Edge::containment(ids[0].clone(), ids[1].clone()).with_id("edge-1");
        graph.add_edge(edge.clone()).unwrap();
        assert!(matches!(graph.add_edge(edge), Err(CoreError::AlreadyExists { .. })));

        let removed = graph.remove_edge(&EdgeId::new("edge-1")).unwrap();
        assert_eq!(removed.source_port(), Some(Port::Bottom));
        assert!(graph.remove_edge(&EdgeId::new("edge-1")).is_err());
    }

    #[test]
    fn test_update_node_data() {
        let (mut graph, ids) = graph_with(&[NodeKind::Loop]);
        let mut patch = Map::new();
        patch.insert("iterations".to_string(), json!(5));
        patch.insert("isRandom".to_string(), json!(true));
        graph.update_node_data(&ids[0], patch).unwrap();

        let NodeData::Loop(data) = &graph.node(&ids[0]).unwrap().data else {
            panic!("expected loop payload");
        };
        assert_eq!(data.iteration_count(), 5);
        assert!(data.shuffles());
        assert_eq!(data.label.as_str(), "Loop 0");

        assert!(graph.update_node_data(&NodeId::new("nope"), Map::new()).is_err());
    }

    #[test]
    fn test_move_node() {
        let (mut graph, ids) = graph_with(&[NodeKind::Stimulus, NodeKind::Response, NodeKind::Sound]);
        assert!(!graph.move_node(&ids[0], Direction::Up).unwrap());
        assert!(graph.move_node(&ids[2], Direction::Up).unwrap());
        let order: Vec<_> = graph.nodes().map(|n| n.id.clone()).collect();
        assert_eq!(order, vec![ids[0].clone(), ids[2].clone(), ids[1].clone()]);
        assert!(!graph.move_node(&ids[1], Direction::Down).unwrap());
    }

    #[test]
    fn test_children_only_follow_bottom_handle() {
        let (mut graph, ids) = graph_with(&[NodeKind::Sequence, NodeKind::Stimulus, NodeKind::Response]);
        graph.connect(&ids[0], Some(Port::Bottom), &ids[1], Some(Port::Top)).unwrap();
        graph.connect(&ids[0], Some(Port::Right), &ids[2], None).unwrap();
        let children = graph.children(&ids[0]);
        assert_eq!(children.len(), 1);
        assert!(children.contains(&ids[1]));
        assert!(graph.children(&ids[1]).is_empty());
    }

    #[test]
    fn test_from_parts_resumes_counter() {
        let (graph, _) = graph_with(&[NodeKind::Stimulus, NodeKind::Stimulus]);
        let snapshot = graph.snapshot();
        let mut loaded = Graph::from_parts(snapshot.nodes, snapshot.edges).unwrap();
        assert_eq!(loaded.node_counter(), 2);
        let id = loaded.create_node(NodeKind::Response, Position::origin());
        assert_eq!(id.as_str(), "response-2");
    }

    #[test]
    fn test_from_parts_rejects_dangling_edge() {
        let (graph, ids) = graph_with(&[NodeKind::Sequence]);
        let edge = Edge::containment(ids[0].clone(), "stimulus-7");
        let result = Graph::from_parts(graph.snapshot().nodes, vec![edge]);
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn test_edge_accepts_port_aliases() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e1",
            "source": "sequence-0",
            "sourcePort": "right",
            "target": "sequence-1",
            "targetHandle": null,
            "animated": true
        }))
        .unwrap();
        assert_eq!(edge.source_port(), Some(Port::Right));
        assert_eq!(edge.target_port(), None);
        assert_eq!(edge.extra.get("animated"), Some(&json!(true)));

        let written = serde_json::to_value(&edge).unwrap();
        assert_eq!(written["sourceHandle"], json!("right"));
        assert_eq!(written["targetHandle"], json!(null));
    }
}
