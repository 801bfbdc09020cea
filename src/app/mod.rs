//! Node lifecycle and the coordinator that serializes all shared state.

mod coordinator;
mod node;

pub use node::Node;
