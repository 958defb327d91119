//! Persisted experiment snapshot.
//!
//! A snapshot is the whole authoring graph plus presentation settings:
//!
//! ```json
//! { "nodes": [...], "edges": [...], "runnerBackgroundColor": "#000000",
//!   "version": "1.0.0", "timestamp": "2024-06-01T09:30:00.000Z" }
//! ```
//!
//! Nodes and edges load back into a [`Graph`] unchanged; every field this
//! version does not interpret is carried through.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use trialflow_core::{CoreError, Version};
use trialflow_plan::{Edge, Graph, Node};

/// Format version written by this crate
pub const SNAPSHOT_VERSION: Version = Version::new(1, 0, 0);

/// Runner background used when a snapshot does not set one
pub const DEFAULT_BACKGROUND: &str = "#000000";

/// Snapshot error
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// File could not be read or written
    #[error("Snapshot I/O failed for {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// Not valid snapshot JSON
    #[error("Invalid snapshot JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// Written by an incompatible format version
    #[error("Unsupported snapshot version {found} (reader is {supported})")]
    UnsupportedVersion {
        /// Version in the file
        found: Version,
        /// Version of this reader
        supported: Version,
    },
    /// Timestamp is not RFC 3339
    #[error("Invalid snapshot timestamp {value:?}: {reason}")]
    InvalidTimestamp {
        /// Raw timestamp
        value: String,
        /// Parser message
        reason: String,
    },
    /// Nodes and edges do not form a valid graph
    #[error("Invalid snapshot graph: {reason}")]
    InvalidGraph {
        /// What was wrong
        reason: String,
    },
    /// File exceeds the configured size limit
    #[error("Snapshot too large: {size} bytes (limit: {limit})")]
    TooLarge {
        /// File size
        size: u64,
        /// Limit in bytes
        limit: u64,
    },
    /// No snapshot with that name
    #[error("Snapshot not found: {name}")]
    NotFound {
        /// Requested name
        name: String,
    },
}

impl From<SnapshotError> for CoreError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Io { .. } => CoreError::Io {
                reason: err.to_string(),
            },
            SnapshotError::NotFound { name } => CoreError::NotFound {
                kind: "Snapshot".to_string(),
                id: name,
            },
            other => CoreError::Validation {
                field: "snapshot".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Saved experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSnapshot {
    /// Nodes in store order
    pub nodes: Vec<Node>,
    /// Edges in insertion order
    pub edges: Vec<Edge>,
    /// CSS color behind the runner
    #[serde(default = "default_background")]
    pub runner_background_color: String,
    /// Format version
    pub version: Version,
    /// Save time, RFC 3339 UTC with milliseconds
    pub timestamp: String,
    /// Top-level fields this version does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExperimentSnapshot {
    /// Capture `graph` now
    #[must_use]
    pub fn capture(graph: &Graph, runner_background_color: impl Into<String>) -> Self {
        Self::capture_at(graph, runner_background_color, Utc::now())
    }

    /// Capture `graph` with an explicit save time
    #[must_use]
    pub fn capture_at(
        graph: &Graph,
        runner_background_color: impl Into<String>,
        saved_at: DateTime<Utc>,
    ) -> Self {
        let snapshot = graph.snapshot();
        Self {
            nodes: snapshot.nodes,
            edges: snapshot.edges,
            runner_background_color: runner_background_color.into(),
            version: SNAPSHOT_VERSION,
            timestamp: saved_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            extra: Map::new(),
        }
    }

    /// Parse from JSON text
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a snapshot
    pub fn from_json(text: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize as indented JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json_pretty(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parsed save time
    ///
    /// # Errors
    ///
    /// Returns error if the timestamp is not RFC 3339
    pub fn saved_at(&self) -> Result<DateTime<Utc>, SnapshotError> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| SnapshotError::InvalidTimestamp {
                value: self.timestamp.clone(),
                reason: e.to_string(),
            })
    }

    /// Check that this reader understands the format version
    ///
    /// # Errors
    ///
    /// Returns error on a different major version
    pub fn check_version(&self) -> Result<(), SnapshotError> {
        if SNAPSHOT_VERSION.reads(&self.version) {
            Ok(())
        } else {
            Err(SnapshotError::UnsupportedVersion {
                found: self.version,
                supported: SNAPSHOT_VERSION,
            })
        }
    }

    /// Load the nodes and edges into a graph store
    ///
    /// # Errors
    ///
    /// Returns error on an unsupported version, duplicate ids, or an edge
    /// with a missing endpoint
    pub fn to_graph(&self) -> Result<Graph, SnapshotError> {
        self.check_version()?;
        Graph::from_parts(self.nodes.iter().cloned(), self.edges.iter().cloned()).map_err(|e| {
            SnapshotError::InvalidGraph {
                reason: e.to_string(),
            }
        })
    }

    /// File name the authoring tool suggests for this snapshot
    #[must_use]
    pub fn suggested_file_name(&self) -> String {
        let date = self.saved_at().unwrap_or_else(|_| Utc::now());
        format!("experiment-{}.json", date.format("%Y-%m-%d"))
    }
}

fn default_background() -> String {
    DEFAULT_BACKGROUND.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use trialflow_plan::{NodeKind, Position};

    fn authored() -> Value {
        json!({
            "nodes": [
                {
                    "id": "sequence-0",
                    "type": "sequence",
                    "position": { "x": 100, "y": 50 },
                    "data": { "label": "Sequence 0", "order": 0 },
                    "width": 240,
                    "selected": true
                },
                {
                    "id": "stimulus-1",
                    "type": "stimulus",
                    "position": { "x": 100.5, "y": 220 },
                    "data": { "imageUrl": "data:image/png;base64,AAAA", "duration": "oops", "order": 1 },
                    "dragging": false
                },
                {
                    "id": "group-2",
                    "type": "group",
                    "position": { "x": 0, "y": 0 },
                    "data": { "label": "Old group" }
                }
            ],
            "edges": [
                {
                    "id": "edge-1718000000000",
                    "source": "sequence-0",
                    "sourceHandle": "bottom",
                    "target": "stimulus-1",
                    "targetHandle": "top",
                    "animated": true
                }
            ],
            "runnerBackgroundColor": "#1a1a1a",
            "version": "1.0.0",
            "timestamp": "2024-06-01T09:30:00.000Z",
            "title": "Stroop pilot"
        })
    }

    #[test]
    fn test_snapshot_round_trip_preserves_unknown_fields() {
        let raw = authored();
        let snapshot: ExperimentSnapshot = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(snapshot.extra.get("title"), Some(&json!("Stroop pilot")));
        assert_eq!(serde_json::to_value(&snapshot).unwrap(), raw);
    }

    #[test]
    fn test_graph_load_is_lossless() {
        let raw = authored();
        let snapshot: ExperimentSnapshot = serde_json::from_value(raw.clone()).unwrap();
        let graph = snapshot.to_graph().unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.node_counter(), 3);

        let saved_at = Utc.with_ymd_and_hms(2024, 6, 2, 8, 0, 0).unwrap();
        let again = ExperimentSnapshot::capture_at(&graph, "#1a1a1a", saved_at);
        let written = serde_json::to_value(&again).unwrap();
        assert_eq!(written["nodes"], raw["nodes"]);
        assert_eq!(written["edges"], raw["edges"]);
        assert_eq!(written["timestamp"], json!("2024-06-02T08:00:00.000Z"));
    }

    #[test]
    fn test_missing_background_defaults() {
        let snapshot = ExperimentSnapshot::from_json(
            r#"{ "nodes": [], "edges": [], "version": "1.0.0", "timestamp": "2024-01-01T00:00:00.000Z" }"#,
        )
        .unwrap();
        assert_eq!(snapshot.runner_background_color, DEFAULT_BACKGROUND);
        assert!(snapshot.to_graph().unwrap().is_empty());
    }

    #[test]
    fn test_unsupported_version() {
        let mut raw = authored();
        raw["version"] = json!("2.0.0");
        let snapshot: ExperimentSnapshot = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            snapshot.to_graph(),
            Err(SnapshotError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_dangling_edge_is_rejected() {
        let mut raw = authored();
        raw["edges"][0]["target"] = json!("stimulus-99");
        let snapshot: ExperimentSnapshot = serde_json::from_value(raw).unwrap();
        let err = snapshot.to_graph().unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidGraph { .. }));
        assert!(matches!(CoreError::from(err), CoreError::Validation { .. }));
    }

    #[test]
    fn test_capture_and_file_name() {
        let mut graph = Graph::new();
        graph.create_node(NodeKind::Instruction, Position::new(10.0, 20.0));
        let saved_at = Utc.with_ymd_and_hms(2025, 3, 9, 17, 45, 12).unwrap();
        let snapshot = ExperimentSnapshot::capture_at(&graph, DEFAULT_BACKGROUND, saved_at);

        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.timestamp, "2025-03-09T17:45:12.000Z");
        assert_eq!(snapshot.saved_at().unwrap(), saved_at);
        assert_eq!(snapshot.suggested_file_name(), "experiment-2025-03-09.json");
    }
}
