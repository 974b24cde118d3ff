//! Top-level facade crate for websocketd.
//!
//! Re-exports core types and the gateway library so users can depend on a
//! single crate.

pub mod core {
    pub use websocketd_core::*;
}

pub mod gateway {
    pub use websocketd_gateway::*;
}
