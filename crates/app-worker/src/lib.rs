//! App Worker Library
//!
//! Core of one worker process in a clustered real-time server. A worker holds
//! a disjoint subset of live client connections and keeps each connection's
//! signed token and auth state consistent while requests, cluster broadcasts
//! and token mutations race against each other.
//!
//! # Architecture
//!
//! ```text
//! Worker (one per process)
//! ├── SocketRegistry ── AuthEngine per socket ── TokenEngine
//! ├── MidTaskScheduler (requests vs. bus token edits and store sweeps)
//! ├── ControllerReqHandler (request pipeline)
//! ├── DataboxHost ── FetchManager per socket and databox
//! └── InternalChannelEngine ──> WorkerBus (local broadcast or Redis pub/sub)
//!                  PackageProcessor <── worker channel
//! ```
//!
//! # Modules
//!
//! - [`auth`] - auth state, access rules and the per-connection auth engine
//! - [`bus`] - cluster bus adapters, packages and the package processor
//! - [`config`] - configuration from environment
//! - [`controller`] - controllers, registry and the request pipeline
//! - [`databox`] - pull-style data sources with admission control
//! - [`errors`] - framework errors and their client-facing form
//! - [`scheduling`] - async chain, mid-task scheduler, fetch managers
//! - [`socket`] - live connections and special channels
//! - [`token`] - token model, edits, engine and token-info store
//! - [`transport`] - WebSocket and HTTP endpoints
//! - [`worker`] - the worker context

pub mod auth;
pub mod bus;
pub mod config;
pub mod controller;
pub mod databox;
pub mod errors;
pub mod observability;
pub mod scheduling;
pub mod socket;
pub mod token;
pub mod transport;
pub mod worker;
