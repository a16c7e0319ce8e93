pub mod engine;
pub mod flow;
pub mod office;

pub use engine::WorkflowEngine;
pub use flow::{FlowPlan, Step, StepKind};
pub use office::filter_offices;
