//! hatchery - ephemeral sandboxed workers with token-gated terminal access.
//!
//! Two service planes share this library:
//!
//! - The **controller** (`hatchery-controller`) admits job requests, mints
//!   single-use capability tokens, launches workers in the orchestrator, and
//!   publishes its verification keys as a JWKS document.
//! - The **gateway** (`hatchery-gateway`) terminates browser WebSockets,
//!   verifies capability tokens, consumes the one-shot token record, and
//!   proxies the byte stream to the worker's terminal server.
//!
//! The planes never call each other directly: the controller writes session
//! and token rows to the store, the gateway reads sessions and deletes token
//! rows, and the gateway fetches the controller's JWKS over plain HTTP.

pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod pruner;
pub mod ratelimit;
pub mod shutdown;
pub mod signer;
pub mod store;
pub mod testutil;
