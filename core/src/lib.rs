pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod flow;
pub mod logging;
pub mod owner;
pub mod parser;
pub mod script;
pub mod steps;

// Re-export main types
pub use config::{Config, DurabilityHint, EngineConfig};
pub use engine::{Engine, EngineBuilder, StepContext, StepDescriptor, StepExecution, StepRegistry};
pub use error::{EngineError, EngineResult, Failure};
pub use execution::{ExecutionRecord, FlowExecution, LoadState, StartOptions};
pub use flow::{FlowNode, FlowResult, NodeId};
pub use owner::{DirectoryOwner, FlowExecutionOwner, TaskListener};
pub use script::Val;
