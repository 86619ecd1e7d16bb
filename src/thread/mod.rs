//! Execution contexts and cross-context dispatch

pub mod context;
pub mod dispatcher;

pub use context::{Context, ContextHandle, ContextKind};
pub use dispatcher::Dispatcher;
