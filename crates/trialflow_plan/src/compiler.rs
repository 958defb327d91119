//! Compiler from an authoring graph to a playback timeline.
//!
//! Any graph compiles: malformed structure (multiple parents, chain cycles,
//! dangling edges) falls back to a documented choice and is reported as a
//! [`CompilerWarning`], never an error.
//!
//! Emission order:
//!
//! 1. sequences reached by walking chains from their entry points
//! 2. sequences no chain reached
//! 3. loops, each body replicated per iteration
//! 4. leaves that belong to no container

use crate::graph::{Edge, Graph, GraphSnapshot, Port};
use crate::node::{Node, NodeData};
use crate::step::{Step, StepOrigin, Timeline};
use indexmap::{IndexMap, IndexSet};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use trialflow_core::{EdgeId, NodeId};

/// Compiler settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Seed for randomized loops; `None` draws from OS entropy
    pub shuffle_seed: Option<u64>,
    /// Most repetitions a single loop expands to
    pub max_iterations: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            shuffle_seed: None,
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl CompileOptions {
    /// Loop repetition cap used unless configured otherwise
    pub const DEFAULT_MAX_ITERATIONS: u32 = 1000;

    /// Create default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make randomized loops reproducible
    #[must_use]
    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// Cap loop repetitions (at least one)
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }
}

/// Output from compiling a graph
#[derive(Debug, Clone)]
pub struct CompilerOutput {
    /// The compiled timeline
    pub timeline: Timeline,
    /// Structural problems that were worked around
    pub warnings: Vec<CompilerWarning>,
}

/// Compilation warning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerWarning {
    /// Node is contained by more than one container; the first edge wins
    MultipleParents {
        /// The contained node
        node: NodeId,
        /// Container that keeps it
        kept: NodeId,
        /// Container whose edge was ignored
        ignored: NodeId,
    },
    /// Edge connects a node to itself
    SelfLoop {
        /// The ignored edge
        edge: EdgeId,
    },
    /// Edge endpoint is not in the graph
    DanglingEdge {
        /// The ignored edge
        edge: EdgeId,
    },
    /// Every sequence has a chain predecessor
    NoChainEntry {
        /// Sequence used as the sole entry point
        fallback: NodeId,
    },
    /// Loop asked for more repetitions than the cap allows
    IterationsClamped {
        /// The loop
        container: NodeId,
        /// Repetitions requested
        requested: u32,
        /// Repetitions emitted
        used: u32,
    },
    /// Container contributes no step
    EmptyContainer {
        /// The container
        container: NodeId,
    },
}

impl std::fmt::Display for CompilerWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MultipleParents { node, kept, ignored } => {
                write!(f, "{} has several parents; kept {}, ignored {}", node, kept, ignored)
            }
            Self::SelfLoop { edge } => write!(f, "edge {} connects a node to itself", edge),
            Self::DanglingEdge { edge } => write!(f, "edge {} has a missing endpoint", edge),
            Self::NoChainEntry { fallback } => {
                write!(f, "sequence chain has no entry point; starting at {}", fallback)
            }
            Self::IterationsClamped { container, requested, used } => {
                write!(f, "{} asks for {} iterations; expanded {}", container, requested, used)
            }
            Self::EmptyContainer { container } => write!(f, "{} has no leaf children", container),
        }
    }
}

/// Compiler for turning a graph into a timeline
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    /// Create a new compiler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with options
    #[must_use]
    pub fn with_options(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Compile nodes (in store order) and edges into a timeline
    pub fn compile<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a Node>,
        edges: impl IntoIterator<Item = &'a Edge>,
    ) -> CompilerOutput {
        let nodes: IndexMap<&NodeId, &Node> = nodes.into_iter().map(|n| (&n.id, n)).collect();
        let mut pass = Pass::new(&nodes, self.rng(), self.options.max_iterations);

        if !nodes.values().any(|n| n.is_container()) {
            let steps = nodes
                .values()
                .map(|n| Step::new(vec![(*n).clone()], StepOrigin::Trivial))
                .collect();
            return pass.finish(steps);
        }

        pass.resolve_edges(edges);
        let mut steps = Vec::new();
        pass.walk_chains(&mut steps);
        pass.orphan_sequences(&mut steps);
        pass.loops(&mut steps);
        pass.unaffiliated(&mut steps);
        pass.finish(steps)
    }

    /// Compile the current contents of a graph
    pub fn compile_graph(&self, graph: &Graph) -> CompilerOutput {
        self.compile(graph.nodes(), graph.edges())
    }

    /// Compile a graph snapshot
    pub fn compile_snapshot(&self, snapshot: &GraphSnapshot) -> CompilerOutput {
        self.compile(&snapshot.nodes, &snapshot.edges)
    }

    fn rng(&self) -> ChaCha8Rng {
        match self.options.shuffle_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        }
    }
}

/// Compile with default options
pub fn compile<'a>(
    nodes: impl IntoIterator<Item = &'a Node>,
    edges: impl IntoIterator<Item = &'a Edge>,
) -> CompilerOutput {
    Compiler::new().compile(nodes, edges)
}

/// State of one compilation
struct Pass<'g> {
    nodes: &'g IndexMap<&'g NodeId, &'g Node>,
    /// Child -> the one container that keeps it
    parent: IndexMap<&'g NodeId, &'g NodeId>,
    /// Sequence -> chained sequences, edge order
    successors: IndexMap<&'g NodeId, Vec<&'g NodeId>>,
    has_predecessor: IndexSet<&'g NodeId>,
    visited: IndexSet<&'g NodeId>,
    warnings: Vec<CompilerWarning>,
    rng: ChaCha8Rng,
    max_iterations: u32,
}

impl<'g> Pass<'g> {
    fn new(nodes: &'g IndexMap<&'g NodeId, &'g Node>, rng: ChaCha8Rng, max_iterations: u32) -> Self {
        Self {
            nodes,
            parent: IndexMap::new(),
            successors: IndexMap::new(),
            has_predecessor: IndexSet::new(),
            visited: IndexSet::new(),
            warnings: Vec::new(),
            rng,
            max_iterations: max_iterations.max(1),
        }
    }

    fn resolve_edges<'a>(&mut self, edges: impl IntoIterator<Item = &'a Edge>) {
        let nodes = self.nodes;
        for edge in edges {
            let (Some(source), Some(target)) = (nodes.get(&edge.source), nodes.get(&edge.target)) else {
                self.warnings.push(CompilerWarning::DanglingEdge { edge: edge.id.clone() });
                continue;
            };
            if edge.is_self_loop() {
                self.warnings.push(CompilerWarning::SelfLoop { edge: edge.id.clone() });
                continue;
            }

            if source.is_container() && edge.source_port() == Some(Port::Bottom) {
                match self.parent.get(&target.id) {
                    Some(kept) => self.warnings.push(CompilerWarning::MultipleParents {
                        node: target.id.clone(),
                        kept: (*kept).clone(),
                        ignored: source.id.clone(),
                    }),
                    None => {
                        self.parent.insert(&target.id, &source.id);
                    }
                }
            } else if is_sequence(source)
                && is_sequence(target)
                && (edge.source_port() == Some(Port::Right) || edge.target_port() == Some(Port::Left))
            {
                self.successors.entry(&source.id).or_default().push(&target.id);
                self.has_predecessor.insert(&target.id);
            }
        }
    }

    /// Direct children of `container`, in store order
    fn children(&self, container: &NodeId) -> Vec<&'g Node> {
        self.nodes
            .values()
            .filter(|n| self.parent.get(&n.id).is_some_and(|p| *p == container))
            .copied()
            .collect()
    }

    fn leaf_children(&self, container: &NodeId) -> Vec<Node> {
        self.children(container)
            .into_iter()
            .filter(|n| n.is_leaf())
            .cloned()
            .collect()
    }

    fn is_loop_child(&self, id: &NodeId) -> bool {
        self.parent
            .get(id)
            .and_then(|p| self.nodes.get(*p))
            .is_some_and(|p| matches!(p.data, NodeData::Loop(_)))
    }

    fn sequences(&self) -> impl Iterator<Item = &'g Node> + '_ {
        self.nodes.values().copied().filter(|n| is_sequence(n))
    }

    fn walk_chains(&mut self, steps: &mut Vec<Step>) {
        let mut entries: Vec<&'g NodeId> = self
            .sequences()
            .filter(|n| !self.has_predecessor.contains(&n.id))
            .map(|n| &n.id)
            .collect();

        if entries.is_empty() {
            let first = self.sequences().next();
            if let Some(first) = first {
                self.warnings.push(CompilerWarning::NoChainEntry {
                    fallback: first.id.clone(),
                });
                entries.push(&first.id);
            }
        }

        for entry in entries {
            if self.visited.contains(entry) || self.is_loop_child(entry) {
                continue;
            }

            let mut current = Some(entry);
            while let Some(id) = current {
                if !self.visited.insert(id) {
                    break;
                }
                if !self.is_loop_child(id) {
                    self.emit_sequence(id, StepOrigin::Sequence { container: id.clone() }, steps);
                }
                current = self
                    .successors
                    .get(id)
                    .and_then(|next| next.iter().find(|n| !self.visited.contains(*n)))
                    .copied();
            }
        }
    }

    fn orphan_sequences(&mut self, steps: &mut Vec<Step>) {
        let orphans: Vec<&'g NodeId> = self
            .sequences()
            .filter(|n| !self.visited.contains(&n.id) && !self.is_loop_child(&n.id))
            .map(|n| &n.id)
            .collect();

        for id in orphans {
            self.visited.insert(id);
            self.emit_sequence(id, StepOrigin::OrphanSequence { container: id.clone() }, steps);
        }
    }

    fn emit_sequence(&mut self, id: &NodeId, origin: StepOrigin, steps: &mut Vec<Step>) {
        let members = self.leaf_children(id);
        if members.is_empty() {
            self.warnings.push(CompilerWarning::EmptyContainer { container: id.clone() });
        } else {
            steps.push(Step::new(members, origin));
        }
    }

    fn loops(&mut self, steps: &mut Vec<Step>) {
        let loops: Vec<&'g Node> = self
            .nodes
            .values()
            .copied()
            .filter(|n| matches!(n.data, NodeData::Loop(_)))
            .collect();

        for node in loops {
            let NodeData::Loop(settings) = &node.data else {
                continue;
            };

            let children = self.children(&node.id);
            let mut body: Vec<(Option<NodeId>, Vec<Node>)> = children
                .iter()
                .filter(|c| is_sequence(c))
                .map(|seq| (Some(seq.id.clone()), self.leaf_children(&seq.id)))
                .filter(|(_, members)| !members.is_empty())
                .collect();
            let leaves: Vec<Node> = children.iter().filter(|c| c.is_leaf()).map(|c| (*c).clone()).collect();
            if !leaves.is_empty() {
                body.push((None, leaves));
            }

            if body.is_empty() {
                self.warnings.push(CompilerWarning::EmptyContainer {
                    container: node.id.clone(),
                });
                continue;
            }

            let requested = settings.iteration_count();
            let iterations = requested.min(self.max_iterations);
            if iterations < requested {
                self.warnings.push(CompilerWarning::IterationsClamped {
                    container: node.id.clone(),
                    requested,
                    used: iterations,
                });
            }
            let shuffle = settings.shuffles();
            tracing::debug!(
                container = %node.id,
                iterations,
                shuffle,
                body_steps = body.len(),
                "expanding loop"
            );

            for iteration in 0..iterations {
                let mut copy = body.clone();
                if shuffle {
                    copy.shuffle(&mut self.rng);
                }
                steps.extend(copy.into_iter().map(|(sequence, members)| {
                    Step::new(
                        members,
                        StepOrigin::Loop {
                            container: node.id.clone(),
                            iteration,
                            sequence,
                        },
                    )
                }));
            }
        }
    }

    fn unaffiliated(&mut self, steps: &mut Vec<Step>) {
        steps.extend(
            self.nodes
                .values()
                .filter(|n| n.is_leaf() && !self.parent.contains_key(&n.id))
                .map(|n| Step::new(vec![(*n).clone()], StepOrigin::Standalone)),
        );
    }

    fn finish(self, steps: Vec<Step>) -> CompilerOutput {
        for warning in &self.warnings {
            tracing::warn!(%warning, "graph fallback applied");
        }
        tracing::debug!(
            nodes = self.nodes.len(),
            steps = steps.len(),
            warnings = self.warnings.len(),
            "timeline compiled"
        );
        CompilerOutput {
            timeline: Timeline::new(steps),
            warnings: self.warnings,
        }
    }
}

fn is_sequence(node: &Node) -> bool {
    matches!(node.data, NodeData::Sequence(_))
}
