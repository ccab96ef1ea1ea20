//! greetq is a small asynchronous RPC exchange: a server that answers a single
//! "say hello" method and a client that stress-tests it with many concurrent
//! calls. Instead of blocking one thread per call, both sides drive their
//! in-flight requests off a completion queue (`sync::cq`): every asynchronous
//! operation is submitted with an opaque tag, and the queue later yields
//! `(tag, success)` events as operations finish. The server resolves each tag
//! back to a per-request state machine (`task::call`) and the client resolves
//! it to a per-call record that feeds aggregate latency and success
//! statistics (`task::client`).

pub mod config;
pub mod proto;

mod sync;
mod task;

pub use config::Config;
pub use task::client::{Client, Summary};
pub use task::server::{Server, State};

/// Generic boxed error used at task boundaries.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
