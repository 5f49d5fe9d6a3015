pub mod types;
pub mod id;
pub mod error;
pub mod memory;
pub mod ops;
pub mod mapping;
pub mod loop_desc;
pub mod topology;
pub mod edge;
pub mod graph;

// Re-export commonly used types
pub use types::{DataType, Layout, Scalar, Shape, TensorValues};
pub use id::{NodeId, PrimitiveId};
pub use error::CoreError;
pub use memory::MemoryView;
pub use ops::{ActivationFunction, CompareOp, EltwiseMode, PrimitiveOp};
pub use mapping::{AxisSlice, BackedgeMapping, InputMapping, OutputMapping};
pub use loop_desc::{
    BodyGraph, ExecutionCondition, InputKind, IterateDesc, IterateInput, IterateOutput, LoopDesc,
    OutputKind, TripCount,
};
pub use topology::{Primitive, Topology};
pub use graph::{ProgramGraph, ProgramNode, Producer};
