//! Mempool, relay policy and the node facade over the chain state.

pub mod admission;
pub mod config;
pub mod mempool;
pub mod node;
pub mod package;
pub mod policy;

pub use node::{Node, NodeError};
