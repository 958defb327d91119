//! Experiment nodes and their kind-specific payloads.
//!
//! On disk a node looks like `{ "id", "type", "position", "data", ... }`.
//! In memory the `type` tag and the `data` object are folded into one
//! [`NodeData`] variant so that the compiler and the engine can match
//! exhaustively on the kind.

use crate::lenient::{number, Lenient};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use trialflow_core::{Millis, NodeId};

/// Node kind - the closed set of things an experiment graph can hold
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Visual stimulus (image)
    Stimulus,
    /// Participant response prompt
    Response,
    /// Instruction text
    Instruction,
    /// Audio stimulus
    Sound,
    /// Container presented as one step; chains horizontally
    Sequence,
    /// Container whose body repeats
    Loop,
    /// Any type name this version does not know (e.g. legacy `group`)
    Other(String),
}

impl NodeKind {
    /// The `type` tag used in snapshots
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Stimulus => "stimulus",
            Self::Response => "response",
            Self::Instruction => "instruction",
            Self::Sound => "sound",
            Self::Sequence => "sequence",
            Self::Loop => "loop",
            Self::Other(name) => name,
        }
    }

    /// Parse a `type` tag; unknown tags become [`NodeKind::Other`]
    #[must_use]
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "stimulus" => Self::Stimulus,
            "response" => Self::Response,
            "instruction" => Self::Instruction,
            "sound" => Self::Sound,
            "sequence" => Self::Sequence,
            "loop" => Self::Loop,
            other => Self::Other(other.to_string()),
        }
    }

    /// Sequence or Loop
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Sequence | Self::Loop)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Canvas coordinates; kept as raw JSON numbers so integers stay integers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate
    pub x: Number,
    /// Vertical coordinate
    pub y: Number,
}

impl Position {
    /// Create from floating point coordinates
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        let coord = |v: f64| Number::from_f64(v).unwrap_or_else(|| Number::from(0));
        Self {
            x: coord(x),
            y: coord(y),
        }
    }

    /// The canvas origin
    #[must_use]
    pub fn origin() -> Self {
        Self {
            x: Number::from(0),
            y: Number::from(0),
        }
    }
}

/// How a collector listens for the participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Any key, or a key from the allow-list
    Keyboard,
    /// Pointer click anywhere
    Mouse,
    /// First touch point
    Touch,
    /// On-screen continue button
    Button,
}

/// Where a visual stimulus is anchored on screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScreenAnchor {
    /// Top left corner
    TopLeft,
    /// Top edge, centered
    Top,
    /// Top right corner
    TopRight,
    /// Left edge, centered
    Left,
    /// Screen center
    Center,
    /// Right edge, centered
    Right,
    /// Bottom left corner
    BottomLeft,
    /// Bottom edge, centered
    Bottom,
    /// Bottom right corner
    BottomRight,
}

/// Response-collection settings shared by every leaf payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSettings {
    /// Attach a collector while the node is on screen
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub collect_response: Lenient<bool>,
    /// Input mode
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub response_type: Lenient<InputMode>,
    /// How long to wait for input, in milliseconds
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub response_timeout: Lenient<Number>,
    /// Comma separated key allow-list; empty accepts any key
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub valid_responses: Lenient<String>,
}

impl ResponseSettings {
    /// Allowed key names, trimmed, empty entries dropped
    #[must_use]
    pub fn allowed_keys(&self) -> Vec<String> {
        self.valid_responses
            .as_str()
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Payload of a stimulus node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StimulusData {
    /// Image reference (URL or data URL)
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub image_url: Lenient<String>,
    /// Display time in milliseconds
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub duration: Lenient<Number>,
    /// Screen anchor
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub position: Lenient<ScreenAnchor>,
    /// Draw a fixation cross
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub show_fixation_point: Lenient<bool>,
    /// Response collection
    #[serde(flatten)]
    pub response: ResponseSettings,
    /// Fields this version does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a response node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseData {
    /// How long the prompt stays up, in milliseconds
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub timeout: Lenient<Number>,
    /// Expected answer, for later scoring
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub correct_response: Lenient<String>,
    /// Input mode and collector settings
    #[serde(flatten)]
    pub response: ResponseSettings,
    /// Fields this version does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of an instruction node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionData {
    /// Instruction copy
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub text: Lenient<String>,
    /// Display time when there is no continue button
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub duration: Lenient<Number>,
    /// Wait for the participant to press continue
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub show_continue_button: Lenient<bool>,
    /// CSS color of the copy
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub text_color: Lenient<String>,
    /// Response collection
    #[serde(flatten)]
    pub response: ResponseSettings,
    /// Fields this version does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a sound node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoundData {
    /// Audio reference (URL or data URL)
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub audio_url: Lenient<String>,
    /// Playback window in milliseconds
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub duration: Lenient<Number>,
    /// Delay before playback in milliseconds
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub delay: Lenient<Number>,
    /// Volume, 0-100
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub volume: Lenient<Number>,
    /// Repeat the clip while on screen
    #[serde(default, rename = "loop", skip_serializing_if = "Lenient::is_missing")]
    pub looping: Lenient<bool>,
    /// Response collection
    #[serde(flatten)]
    pub response: ResponseSettings,
    /// Fields this version does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a sequence container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceData {
    /// Canvas label
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub label: Lenient<String>,
    /// Fields this version does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a loop container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopData {
    /// Canvas label
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub label: Lenient<String>,
    /// Body repetitions
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub iterations: Lenient<Number>,
    /// Shuffle each repetition independently
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub is_random: Lenient<bool>,
    /// Authoring hint for the gap between trials, in milliseconds
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    pub inter_stimulus_interval: Lenient<Number>,
    /// Fields this version does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LoopData {
    /// Repetitions used when `iterations` is absent or not a number
    pub const DEFAULT_ITERATIONS: u32 = 3;

    /// Effective repetition count, never below one
    #[must_use]
    pub fn iteration_count(&self) -> u32 {
        match self.iterations.as_f64() {
            Some(n) if n >= 1.0 => n.ceil().min(f64::from(u32::MAX)) as u32,
            Some(_) => 1,
            None => Self::DEFAULT_ITERATIONS,
        }
    }

    /// Whether repetitions are shuffled
    #[must_use]
    pub fn shuffles(&self) -> bool {
        self.is_random.is_set()
    }
}

/// Kind tag plus payload
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    /// Visual stimulus
    Stimulus(StimulusData),
    /// Response prompt
    Response(ResponseData),
    /// Instruction text
    Instruction(InstructionData),
    /// Audio stimulus
    Sound(SoundData),
    /// Sequence container
    Sequence(SequenceData),
    /// Loop container
    Loop(LoopData),
    /// Unknown type; payload kept as-is
    Other {
        /// The unrecognised `type` tag
        type_name: String,
        /// Raw payload
        data: Map<String, Value>,
    },
}

impl NodeData {
    /// Default payload the authoring tool assigns when a node is dropped
    #[must_use]
    pub fn defaults_for(kind: &NodeKind, counter: u64) -> Self {
        match kind {
            NodeKind::Stimulus => Self::Stimulus(StimulusData {
                image_url: String::new().into(),
                duration: number(1000),
                position: ScreenAnchor::Center.into(),
                ..Default::default()
            }),
            NodeKind::Response => Self::Response(ResponseData {
                timeout: number(5000),
                correct_response: String::new().into(),
                response: ResponseSettings {
                    response_type: InputMode::Keyboard.into(),
                    ..Default::default()
                },
                ..Default::default()
            }),
            NodeKind::Instruction => Self::Instruction(InstructionData {
                text: "Instructions for the participant".to_string().into(),
                text_color: "#ffffff".to_string().into(),
                ..Default::default()
            }),
            NodeKind::Sound => Self::Sound(SoundData {
                audio_url: String::new().into(),
                duration: number(3000),
                delay: number(0),
                volume: number(80),
                ..Default::default()
            }),
            NodeKind::Sequence => Self::Sequence(SequenceData {
                label: format!("Sequence {}", counter).into(),
                ..Default::default()
            }),
            NodeKind::Loop => Self::Loop(LoopData {
                label: format!("Loop {}", counter).into(),
                iterations: number(u64::from(LoopData::DEFAULT_ITERATIONS)),
                is_random: false.into(),
                inter_stimulus_interval: number(500),
                ..Default::default()
            }),
            NodeKind::Other(name) => Self::Other {
                type_name: name.clone(),
                data: Map::new(),
            },
        }
    }

    /// Read a payload object for the given `type` tag
    #[must_use]
    pub fn from_map(type_name: &str, data: Map<String, Value>) -> Self {
        match NodeKind::from_type_name(type_name) {
            NodeKind::Stimulus => Self::Stimulus(typed(data)),
            NodeKind::Response => Self::Response(typed(data)),
            NodeKind::Instruction => Self::Instruction(typed(data)),
            NodeKind::Sound => Self::Sound(typed(data)),
            NodeKind::Sequence => Self::Sequence(typed(data)),
            NodeKind::Loop => Self::Loop(typed(data)),
            NodeKind::Other(type_name) => Self::Other { type_name, data },
        }
    }

    /// Write the payload back to a JSON object
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        let value = match self {
            Self::Stimulus(d) => serde_json::to_value(d),
            Self::Response(d) => serde_json::to_value(d),
            Self::Instruction(d) => serde_json::to_value(d),
            Self::Sound(d) => serde_json::to_value(d),
            Self::Sequence(d) => serde_json::to_value(d),
            Self::Loop(d) => serde_json::to_value(d),
            Self::Other { data, .. } => return data.clone(),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// The kind tag
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Stimulus(_) => NodeKind::Stimulus,
            Self::Response(_) => NodeKind::Response,
            Self::Instruction(_) => NodeKind::Instruction,
            Self::Sound(_) => NodeKind::Sound,
            Self::Sequence(_) => NodeKind::Sequence,
            Self::Loop(_) => NodeKind::Loop,
            Self::Other { type_name, .. } => NodeKind::Other(type_name.clone()),
        }
    }
}

/// Payload types that can fall back to "defaults plus raw fields"
trait Payload: DeserializeOwned + Default {
    fn extra_mut(&mut self) -> &mut Map<String, Value>;
}

macro_rules! impl_payload {
    ($($ty:ty),*) => {
        $(impl Payload for $ty {
            fn extra_mut(&mut self) -> &mut Map<String, Value> {
                &mut self.extra
            }
        })*
    };
}

impl_payload!(StimulusData, ResponseData, InstructionData, SoundData, SequenceData, LoopData);

/// Every declared field is lenient, so this only fails on odd shapes such as
/// a flattened key colliding with a declared one; keep the raw object then.
fn typed<T: Payload>(data: Map<String, Value>) -> T {
    match serde_json::from_value(Value::Object(data.clone())) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::debug!(error = %err, "payload kept as raw fields");
            let mut payload = T::default();
            *payload.extra_mut() = data;
            payload
        }
    }
}

/// A node in the experiment graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawNode", into = "RawNode")]
pub struct Node {
    /// Unique node ID
    pub id: NodeId,
    /// Canvas position
    pub position: Lenient<Position>,
    /// Kind and payload
    pub data: NodeData,
    /// Node-level fields owned by the canvas (size, selection, ...)
    pub extra: Map<String, Value>,
}

impl Node {
    /// Create a node with the given payload
    #[must_use]
    pub fn new(id: impl Into<NodeId>, data: NodeData) -> Self {
        Self {
            id: id.into(),
            position: Position::origin().into(),
            data,
            extra: Map::new(),
        }
    }

    /// Set the canvas position
    #[must_use]
    pub fn at(mut self, position: Position) -> Self {
        self.position = position.into();
        self
    }

    /// The kind tag
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.data.kind()
    }

    /// Sequence or Loop
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self.data, NodeData::Sequence(_) | NodeData::Loop(_))
    }

    /// Anything that can be put on screen
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        !self.is_container()
    }

    /// Shallow-merge `patch` into the payload
    pub fn merge_data(&mut self, patch: Map<String, Value>) {
        let type_name = self.kind().type_name().to_string();
        let mut data = self.data.to_map();
        data.extend(patch);
        self.data = NodeData::from_map(&type_name, data);
    }

    /// Collector settings, when this node listens for the participant
    ///
    /// Response nodes always listen; other leaves only with
    /// `collectResponse` set.
    #[must_use]
    pub fn collection(&self) -> Option<Collection> {
        let (settings, forced, fallback_timeout) = match &self.data {
            NodeData::Response(d) => (&d.response, true, d.timeout.positive_millis()),
            NodeData::Stimulus(d) => (&d.response, false, None),
            NodeData::Instruction(d) => (&d.response, false, None),
            NodeData::Sound(d) => (&d.response, false, None),
            NodeData::Sequence(_) | NodeData::Loop(_) | NodeData::Other { .. } => return None,
        };

        if !forced && !settings.collect_response.is_set() {
            return None;
        }

        Some(Collection {
            mode: settings.response_type.get_or(InputMode::Keyboard),
            timeout: settings
                .response_timeout
                .positive_millis()
                .or(fallback_timeout)
                .unwrap_or(Collection::DEFAULT_TIMEOUT),
            allowed_keys: settings.allowed_keys(),
        })
    }
}

/// Resolved response-collection settings for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    /// Input mode
    pub mode: InputMode,
    /// Time allowed before a synthetic timeout
    pub timeout: Millis,
    /// Key allow-list; empty accepts any key
    pub allowed_keys: Vec<String>,
}

impl Collection {
    /// Timeout used when a node does not configure one
    pub const DEFAULT_TIMEOUT: Millis = Millis::new(3000);
}

/// On-disk node shape
#[derive(Serialize, Deserialize)]
struct RawNode {
    id: NodeId,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default, skip_serializing_if = "Lenient::is_missing")]
    position: Lenient<Position>,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<RawNode> for Node {
    fn from(raw: RawNode) -> Self {
        Self {
            id: raw.id,
            position: raw.position,
            data: NodeData::from_map(&raw.type_name, raw.data),
            extra: raw.extra,
        }
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            type_name: node.data.kind().type_name().to_string(),
            position: node.position,
            data: node.data.to_map(),
            extra: node.extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_from_authoring_json() {
        let node: Node = serde_json::from_value(json!({
            "id": "stimulus-0",
            "type": "stimulus",
            "position": { "x": 120, "y": 40.5 },
            "data": { "order": 0, "imageUrl": "", "duration": 750, "position": "top-left" },
            "width": 200,
            "selected": false
        }))
        .unwrap();

        assert_eq!(node.kind(), NodeKind::Stimulus);
        assert!(node.is_leaf());
        let NodeData::Stimulus(data) = &node.data else {
            panic!("expected stimulus payload");
        };
        assert_eq!(data.duration.positive_millis(), Some(Millis::new(750)));
        assert_eq!(data.position.get(), Some(&ScreenAnchor::TopLeft));
        assert_eq!(data.extra.get("order"), Some(&json!(0)));
        assert_eq!(node.extra.get("width"), Some(&json!(200)));
    }

    #[test]
    fn test_node_round_trip_is_exact() {
        let raw = json!({
            "id": "loop-3",
            "type": "loop",
            "position": { "x": 10, "y": 20 },
            "data": {
                "label": "Loop 3",
                "iterations": "many",
                "isRandom": true,
                "childNodes": [],
                "order": 3
            },
            "measured": { "width": 300, "height": 200 }
        });
        let node: Node = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&node).unwrap(), raw);
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let raw = json!({
            "id": "group-1",
            "type": "group",
            "position": { "x": 0, "y": 0 },
            "data": { "label": "Group 1", "duration": 1000 }
        });
        let node: Node = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(node.kind(), NodeKind::Other("group".to_string()));
        assert!(node.is_leaf());
        assert_eq!(serde_json::to_value(&node).unwrap(), raw);
    }

    #[test]
    fn test_loop_iteration_count() {
        let mut data = LoopData::default();
        assert_eq!(data.iteration_count(), 3);
        data.iterations = number(0);
        assert_eq!(data.iteration_count(), 1);
        data.iterations = number(5);
        assert_eq!(data.iteration_count(), 5);
        data.iterations = Lenient::Invalid(json!("5"));
        assert_eq!(data.iteration_count(), 3);
        data.iterations = Lenient::Valid(Number::from(-4));
        assert_eq!(data.iteration_count(), 1);
    }

    #[test]
    fn test_defaults_for_kinds() {
        let NodeData::Response(r) = NodeData::defaults_for(&NodeKind::Response, 2) else {
            panic!("expected response payload");
        };
        assert_eq!(r.timeout.positive_millis(), Some(Millis::new(5000)));
        assert_eq!(r.response.response_type.get(), Some(&InputMode::Keyboard));

        let NodeData::Loop(l) = NodeData::defaults_for(&NodeKind::Loop, 7) else {
            panic!("expected loop payload");
        };
        assert_eq!(l.label.as_str(), "Loop 7");
        assert!(!l.shuffles());
    }

    #[test]
    fn test_merge_data() {
        let mut node = Node::new("instruction-1", NodeData::defaults_for(&NodeKind::Instruction, 1));
        let mut patch = Map::new();
        patch.insert("showContinueButton".to_string(), json!(true));
        patch.insert("duration".to_string(), json!(4000));
        node.merge_data(patch);

        let NodeData::Instruction(d) = &node.data else {
            panic!("expected instruction payload");
        };
        assert!(d.show_continue_button.is_set());
        assert_eq!(d.duration.positive_millis(), Some(Millis::new(4000)));
        assert_eq!(d.text.as_str(), "Instructions for the participant");
    }

    #[test]
    fn test_collection_settings() {
        let stimulus = Node::new("stimulus-0", NodeData::defaults_for(&NodeKind::Stimulus, 0));
        assert!(stimulus.collection().is_none());

        let response = Node::new("response-1", NodeData::defaults_for(&NodeKind::Response, 1));
        let collection = response.collection().unwrap();
        assert_eq!(collection.mode, InputMode::Keyboard);
        assert_eq!(collection.timeout, Millis::new(5000));

        let mut listening = stimulus.clone();
        let mut patch = Map::new();
        patch.insert("collectResponse".to_string(), json!(true));
        patch.insert("validResponses".to_string(), json!("ArrowLeft, ArrowRight,,"));
        listening.merge_data(patch);
        let collection = listening.collection().unwrap();
        assert_eq!(collection.timeout, Collection::DEFAULT_TIMEOUT);
        assert_eq!(collection.allowed_keys, vec!["ArrowLeft", "ArrowRight"]);
    }
}
