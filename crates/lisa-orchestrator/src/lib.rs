pub mod coordinator;
pub mod expression;
pub mod graph;
pub mod template;

pub use coordinator::Coordinator;
pub use expression::ExpressionEvaluator;
pub use graph::TaskGraph;
pub use template::{resolve_input, InputResolver, References};
