//! Connection authorization: access specs, derived auth state and the
//! per-socket auth engine.

pub mod access;
pub mod engine;
pub mod state;

pub use access::{AccessConfig, AccessValue, ClientAccessConfig, ProtocolAccessConfig};
pub use engine::AuthEngine;
pub use state::AuthState;
