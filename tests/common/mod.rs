//! Common test utilities for bus integration tests.

pub mod mesh;

pub use mesh::{connect, recorder, Node, SilentPeer};
