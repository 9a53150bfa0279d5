//! Built-in agent implementations.

mod bridge;
mod retrieval;

pub use bridge::BridgeAgent;
pub use retrieval::{RetrievalAgent, node_query};
