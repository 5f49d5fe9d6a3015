//! Descriptions of the two loop primitives.
//!
//! [`IterateDesc`] is the structured form: body parameters and results are
//! addressed by index and each input/output carries a tagged kind
//! ([`InputKind`], [`OutputKind`]). [`LoopDesc`] is the lowered form the
//! runtime executes: flat [`InputMapping`]/[`OutputMapping`]/[`BackedgeMapping`]
//! lists keyed by primitive ids, plus the resolved `max_iteration`.
//!
//! Both are plain serializable data. The body of a loop is its own
//! [`Topology`] and is compiled separately from the enclosing one.

use serde::{Deserialize, Serialize};

use crate::id::PrimitiveId;
use crate::mapping::{AxisSlice, BackedgeMapping, InputMapping, OutputMapping};
use crate::topology::Topology;

/// Suffix of the generated num-iterations output of an `Iterate` node.
pub const NUM_ITERATIONS_SUFFIX: &str = "num_iterations";

/// Where the trip count of a loop comes from.
///
/// A negative count means "unbounded": iteration is then governed by the
/// continue condition alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripCount {
    Static(i64),
    /// Scalar integer tensor in the enclosing graph, read at every run.
    Dynamic(PrimitiveId),
}

/// Where the initial execution condition of a loop comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionCondition {
    Static(bool),
    /// Scalar tensor in the enclosing graph, read at every run.
    Dynamic(PrimitiveId),
}

impl Default for ExecutionCondition {
    fn default() -> Self {
        ExecutionCondition::Static(true)
    }
}

fn unknown_bound() -> i64 {
    -1
}

// ---------------------------------------------------------------------------
// Lowered form
// ---------------------------------------------------------------------------

/// A recurrent sub-graph with explicit mapping descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDesc {
    pub body: Topology,
    pub trip_count: TripCount,
    #[serde(default)]
    pub initial_condition: ExecutionCondition,
    /// Iteration count per-iteration buffers are allocated for. `-1` when
    /// not known, which is only valid without axis mappings.
    #[serde(default = "unknown_bound")]
    pub max_iteration: i64,
    #[serde(default)]
    pub input_mappings: Vec<InputMapping>,
    #[serde(default)]
    pub output_mappings: Vec<OutputMapping>,
    #[serde(default)]
    pub back_edges: Vec<BackedgeMapping>,
    /// Body primitive holding the zero-based iteration index.
    #[serde(default)]
    pub current_iteration_id: Option<PrimitiveId>,
    /// Body primitive whose value decides whether another iteration runs.
    #[serde(default)]
    pub condition_id: Option<PrimitiveId>,
    /// Loop output receiving the number of iterations executed.
    #[serde(default)]
    pub num_iterations_id: Option<PrimitiveId>,
}

impl LoopDesc {
    /// Output port ids of a loop named `own`: `own` first, then every other
    /// distinct output mapping target in order, then the num-iterations id.
    pub fn output_ids(&self, own: &PrimitiveId) -> Vec<PrimitiveId> {
        let mut ids = vec![own.clone()];
        let extra = self
            .output_mappings
            .iter()
            .map(|m| &m.external_id)
            .chain(self.num_iterations_id.iter());
        for id in extra {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Whether any mapping slices along an axis.
    pub fn has_axis_mapping(&self) -> bool {
        self.input_mappings.iter().any(InputMapping::is_sliced)
            || self.output_mappings.iter().any(OutputMapping::is_sliced)
    }

    /// Outer primitives read by the loop besides its input mappings.
    pub fn control_inputs(&self) -> Vec<&PrimitiveId> {
        let mut ids = Vec::new();
        if let TripCount::Dynamic(id) = &self.trip_count {
            ids.push(id);
        }
        if let ExecutionCondition::Dynamic(id) = &self.initial_condition {
            ids.push(id);
        }
        ids
    }

    /// Input mappings whose body parameter is `internal_id`.
    pub fn input_mappings_for<'a>(
        &'a self,
        internal_id: &'a PrimitiveId,
    ) -> impl Iterator<Item = &'a InputMapping> + 'a {
        self.input_mappings
            .iter()
            .filter(move |m| &m.internal_id == internal_id)
    }
}

// ---------------------------------------------------------------------------
// Structured form
// ---------------------------------------------------------------------------

/// Body of an [`IterateDesc`]: a topology plus its ordered parameter and
/// result ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyGraph {
    pub topology: Topology,
    pub parameters: Vec<PrimitiveId>,
    pub results: Vec<PrimitiveId>,
}

/// How one outer input enters the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    /// Same tensor every iteration.
    Invariant,
    /// One slice per iteration.
    Sliced(AxisSlice),
    /// Initial value of a recurrent state; later iterations read body
    /// result `result` of the previous iteration.
    Merged { result: usize },
}

/// One input of an `Iterate` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterateInput {
    /// Index into the node's input list.
    pub external: usize,
    /// Index into [`BodyGraph::parameters`].
    pub parameter: usize,
    pub kind: InputKind,
}

/// How one body result leaves the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    /// Value of the last iteration.
    Final,
    /// All iterations concatenated.
    Concat(AxisSlice),
}

/// One output of an `Iterate` node. Output `k` is exposed as port `k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterateOutput {
    /// Index into [`BodyGraph::results`].
    pub result: usize,
    pub kind: OutputKind,
}

/// Structured iterate-and-combine node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterateDesc {
    pub body: BodyGraph,
    #[serde(default)]
    pub inputs: Vec<IterateInput>,
    #[serde(default)]
    pub outputs: Vec<IterateOutput>,
    pub trip_count: TripCount,
    #[serde(default)]
    pub initial_condition: ExecutionCondition,
    /// Declared upper bound on the number of iterations.
    #[serde(default)]
    pub max_iterations: Option<i64>,
    /// Index of the body parameter receiving the iteration index.
    #[serde(default)]
    pub current_iteration: Option<usize>,
    /// Index of the body result holding the continue condition.
    #[serde(default)]
    pub condition: Option<usize>,
    /// Whether to expose the executed iteration count as an output.
    #[serde(default)]
    pub num_iterations_output: bool,
}

impl IterateDesc {
    /// Id of the num-iterations output of a node named `own`, if requested.
    /// It takes port 0 when the node has no other outputs.
    pub fn num_iterations_id(&self, own: &PrimitiveId) -> Option<PrimitiveId> {
        if !self.num_iterations_output {
            None
        } else if self.outputs.is_empty() {
            Some(own.clone())
        } else {
            Some(own.with_suffix(NUM_ITERATIONS_SUFFIX))
        }
    }

    /// Output port ids of a node named `own`: output `k` is `own.port(k)`,
    /// followed by the num-iterations id.
    pub fn output_ids(&self, own: &PrimitiveId) -> Vec<PrimitiveId> {
        let mut ids: Vec<PrimitiveId> = (0..self.outputs.len()).map(|k| own.port(k)).collect();
        if let Some(id) = self.num_iterations_id(own) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            ids.push(own.clone());
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_loop() -> LoopDesc {
        LoopDesc {
            body: Topology::new(),
            trip_count: TripCount::Static(3),
            initial_condition: ExecutionCondition::default(),
            max_iteration: 3,
            input_mappings: Vec::new(),
            output_mappings: Vec::new(),
            back_edges: Vec::new(),
            current_iteration_id: None,
            condition_id: None,
            num_iterations_id: None,
        }
    }

    #[test]
    fn loop_output_ids_dedup_and_order() {
        let own = PrimitiveId::new("loop");
        let mut desc = empty_loop();
        desc.output_mappings = vec![
            OutputMapping::final_value("loop", "h"),
            OutputMapping::concatenated("loop:1", "h", AxisSlice::forward(0)),
            OutputMapping::final_value("loop:1", "h"),
        ];
        desc.num_iterations_id = Some(PrimitiveId::new("loop:n"));
        let ids: Vec<String> = desc
            .output_ids(&own)
            .iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(ids, vec!["loop", "loop:1", "loop:n"]);
    }

    #[test]
    fn control_inputs_lists_dynamic_sources() {
        let mut desc = empty_loop();
        assert!(desc.control_inputs().is_empty());
        desc.trip_count = TripCount::Dynamic(PrimitiveId::new("trip"));
        desc.initial_condition = ExecutionCondition::Dynamic(PrimitiveId::new("cond"));
        let ids: Vec<&str> = desc.control_inputs().iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["trip", "cond"]);
    }

    #[test]
    fn axis_mapping_detection() {
        let mut desc = empty_loop();
        desc.input_mappings.push(InputMapping::invariant("x", "p"));
        assert!(!desc.has_axis_mapping());
        desc.output_mappings
            .push(OutputMapping::concatenated("loop", "r", AxisSlice::forward(0)));
        assert!(desc.has_axis_mapping());
    }

    #[test]
    fn iterate_output_ids() {
        let own = PrimitiveId::new("ti");
        let mut desc = IterateDesc {
            body: BodyGraph {
                topology: Topology::new(),
                parameters: Vec::new(),
                results: Vec::new(),
            },
            inputs: Vec::new(),
            outputs: vec![
                IterateOutput {
                    result: 0,
                    kind: OutputKind::Final,
                },
                IterateOutput {
                    result: 0,
                    kind: OutputKind::Concat(AxisSlice::forward(0)),
                },
            ],
            trip_count: TripCount::Static(2),
            initial_condition: ExecutionCondition::default(),
            max_iterations: None,
            current_iteration: None,
            condition: None,
            num_iterations_output: true,
        };
        let ids: Vec<String> = desc.output_ids(&own).iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["ti", "ti:1", "ti:num_iterations"]);

        desc.outputs.clear();
        assert_eq!(desc.output_ids(&own), vec![own.clone()]);
        assert_eq!(desc.num_iterations_id(&own), Some(own));
    }

    #[test]
    fn loop_desc_defaults_on_deserialize() {
        let json = r#"{"body":{"primitives":[]},"trip_count":{"Static":4}}"#;
        let desc: LoopDesc = serde_json::from_str(json).unwrap();
        assert_eq!(desc.max_iteration, -1);
        assert_eq!(desc.initial_condition, ExecutionCondition::Static(true));
        assert!(desc.back_edges.is_empty());
    }
}
