//! # Worker Test Utilities
//!
//! Shared test utilities for the app worker.
//!
//! - `fixtures` - configuration and token builders
//! - `mock_bus` - recording and failing cluster buses
//! - `mock_controllers` - controllers with canned behavior
//!
//! ## Usage
//!
//! ```rust,ignore
//! use worker_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let config = TestConfigBuilder::new().with_auth_groups(["user"]).build();
//!     let bus = RecordingBus::new();
//!     let signed = TestTokenBuilder::new().in_group("user").for_auth_id(42_i64).sign();
//!     // Start a worker and connect with `signed`...
//! }
//! ```

pub mod fixtures;
pub mod mock_bus;
pub mod mock_controllers;

pub use fixtures::*;
pub use mock_bus::*;
pub use mock_controllers::*;
