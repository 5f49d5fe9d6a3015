//! Compilation and execution of loopnet topologies.
//!
//! [`Program::compile`] turns a [`Topology`](loopnet_core::Topology) into a
//! program: processing order, resolved layouts, one kernel per compute
//! primitive and one [`LoopNode`] per loop. A [`Network`] instantiates a
//! program on an [`Engine`], and every loop node in it is driven by a
//! [`RecurrentExecutor`].

pub mod config;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod loop_builder;
pub mod network;
pub mod program;
pub mod recurrent;
pub mod stream;
pub mod trace;

pub use config::{CompileOptions, EngineConfig, NetworkConfig, QueueKind, RuntimeConfig};
pub use engine::Engine;
pub use error::{CompileError, ExecutionError, KernelError};
pub use kernels::{ImplementationSelector, Kernel, ReferenceSelector};
pub use loop_builder::LoopNode;
pub use network::Network;
pub use program::{Implementation, Program};
pub use recurrent::{LoopIo, LoopRun, LoopState, RecurrentExecutor};
pub use stream::{create_stream, Event, ImmediateStream, InOrderQueue, Stream};
pub use trace::IterationTrace;
