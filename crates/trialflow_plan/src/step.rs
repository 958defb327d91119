//! Compiled timeline steps and how long each one stays on screen.

use crate::node::{Node, NodeData};
use serde::{Deserialize, Serialize};
use trialflow_core::{Millis, NodeId};

/// Where a step came from in the authoring graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOrigin {
    /// Graph had no containers; one step per node
    Trivial,
    /// Children of a sequence reached by the chain walk
    Sequence {
        /// The sequence node
        container: NodeId,
    },
    /// Children of a sequence no chain reached
    OrphanSequence {
        /// The sequence node
        container: NodeId,
    },
    /// One body step of one loop iteration
    Loop {
        /// The loop node
        container: NodeId,
        /// Zero-based iteration
        iteration: u32,
        /// Child sequence this step came from; `None` for the combined leaf step
        sequence: Option<NodeId>,
    },
    /// Leaf belonging to no container
    Standalone,
}

/// A set of leaf nodes presented together
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Members; order carries no meaning
    pub members: Vec<Node>,
    /// Provenance
    pub origin: StepOrigin,
}

impl Step {
    /// Create a new step
    #[must_use]
    pub fn new(members: Vec<Node>, origin: StepOrigin) -> Self {
        Self { members, origin }
    }

    /// Member ids
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|n| n.id.clone()).collect()
    }

    /// Check if the step has no members
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether a member is an instruction waiting for the continue button
    #[must_use]
    pub fn awaits_continue(&self) -> bool {
        self.members.iter().any(waits_for_continue)
    }
}

/// Ordered steps; order is playback order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    steps: Vec<Step>,
}

impl Timeline {
    /// Create from steps
    #[must_use]
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Get step by index
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// All steps in playback order
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if there are no steps
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps as lists of member ids
    #[must_use]
    pub fn id_lists(&self) -> Vec<Vec<NodeId>> {
        self.steps.iter().map(Step::node_ids).collect()
    }
}

impl From<Vec<Step>> for Timeline {
    fn from(steps: Vec<Step>) -> Self {
        Self::new(steps)
    }
}

/// Per-kind display durations used when a node sets none
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationPolicy {
    /// Stimulus default
    pub stimulus: Millis,
    /// Sound default
    pub sound: Millis,
    /// Response default (its `timeout`)
    pub response: Millis,
    /// Instruction default when there is no continue button
    pub instruction: Millis,
    /// Any other kind
    pub other: Millis,
    /// No timed step is shorter than this
    pub floor: Millis,
}

impl DurationPolicy {
    /// Create with the standard defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            stimulus: Millis::new(1000),
            sound: Millis::new(1000),
            response: Millis::new(5000),
            instruction: Millis::new(3000),
            other: Millis::new(1000),
            floor: Millis::new(1000),
        }
    }

    /// Set the instruction default
    #[must_use]
    pub fn with_instruction_default(mut self, millis: Millis) -> Self {
        self.instruction = millis;
        self
    }

    /// Set the minimum step duration
    #[must_use]
    pub fn with_floor(mut self, millis: Millis) -> Self {
        self.floor = millis;
        self
    }

    /// How long one member wants to stay up; `None` means "until continue"
    #[must_use]
    pub fn member_duration(&self, node: &Node) -> Option<Millis> {
        match &node.data {
            NodeData::Stimulus(d) => Some(d.duration.positive_millis().unwrap_or(self.stimulus)),
            NodeData::Sound(d) => Some(d.duration.positive_millis().unwrap_or(self.sound)),
            NodeData::Response(d) => Some(d.timeout.positive_millis().unwrap_or(self.response)),
            NodeData::Instruction(d) if d.show_continue_button.is_set() => None,
            NodeData::Instruction(d) => Some(d.duration.positive_millis().unwrap_or(self.instruction)),
            NodeData::Sequence(_) | NodeData::Loop(_) | NodeData::Other { .. } => Some(self.other),
        }
    }

    /// Countdown for a whole step: the longest member, floored
    ///
    /// `None` when no member is time bound, including an empty step.
    #[must_use]
    pub fn step_duration(&self, step: &Step) -> Option<Millis> {
        step.members
            .iter()
            .filter_map(|n| self.member_duration(n))
            .max()
            .map(|longest| longest.max(self.floor))
    }
}

impl Default for DurationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn waits_for_continue(node: &Node) -> bool {
    matches!(&node.data, NodeData::Instruction(d) if d.show_continue_button.is_set())
}
