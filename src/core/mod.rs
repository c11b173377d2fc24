//! Foundational and often-reused types.

pub mod addr;
pub mod id;
pub mod message;
pub mod node_info;
pub(crate) mod traits;
