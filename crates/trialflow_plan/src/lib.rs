//! TRIALFLOW Planner
//!
//! Experiment graph model and the compiler that turns an authoring graph
//! into an ordered timeline of presentation steps.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lenient;
pub mod node;
pub mod graph;
pub mod step;
pub mod compiler;

pub use lenient::Lenient;
pub use node::{
    Collection, InputMode, InstructionData, LoopData, Node, NodeData, NodeKind, Position,
    ResponseData, ResponseSettings, ScreenAnchor, SequenceData, SoundData, StimulusData,
};
pub use graph::{Direction, Edge, Graph, GraphSnapshot, Handle, Port};
pub use step::{DurationPolicy, Step, StepOrigin, Timeline};
pub use compiler::{compile, CompileOptions, Compiler, CompilerOutput, CompilerWarning};
