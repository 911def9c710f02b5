//! Client tokens: payload, edits, the token-info store and the per-socket
//! mutation engine.

pub mod edit;
pub mod engine;
pub mod info_store;
pub mod model;

pub use edit::{ObjectEditAction, ObjectPath};
pub use engine::{TokenEngine, TokenServices};
pub use info_store::{InMemoryTokenInfoStore, StoreError, TokenInfoStore};
pub use model::{IdentityUpdate, Token, RESERVED_KEYS};
