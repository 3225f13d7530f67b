//! Launch and supervise a local `redis-server`.
//!
//! This crate spawns a redis server process on the local host, blocks until the server is
//! reachable and answers `PING`, and later shuts it down with `SHUTDOWN`, falling back to killing
//! the process if it doesn't exit in time. It's intended for tests and other short-lived tasks that
//! need an isolated server for their duration.
//!
//! # Usage
//!
//! The main type is [`LocalServer`](server::LocalServer). It is built from a
//! [`ServerConfig`](config::ServerConfig) (how to run the server), some
//! [`ConnectionProperties`](config::ConnectionProperties) (how hard to try), and a
//! [`LifecyclePolicy`](policy::LifecyclePolicy) (what to do when things go wrong).
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), Box<dyn std::error::Error>> { // single-threaded for doctest only
//! use redis_launcher::{
//!     config::{Configuration, ConnectionProperties},
//!     policy::Policy,
//!     server::{LocalServer, Server},
//! };
//!
//! let config = Configuration::programmatic()
//!     .command("/usr/bin/redis-server")
//!     .port(6380)
//!     .property("save", "")?
//!     .build()?;
//!
//! let mut server = LocalServer::new(config, ConnectionProperties::default(), Policy::always_destroy());
//! server.start().await?;
//! // ... talk to redis on localhost:6380 ...
//! server.stop().await?;
//! # Ok(()) }
//! ```
//!
//! # Theory of Operation
//!
//! Starting a server creates an [`Execution`](execution::Execution): the process is spawned, its
//! stdout and stderr are drained by two background tasks, and a third task owns the child and waits
//! for it to exit, publishing the result to a [`Completion`](execution::Completion) handle.
//!
//! Every spawned process is tracked by [destroyers](destroyer): registries of weak process
//! handles which can kill everything they track. Each execution has its own destroyer, which is
//! merged with the one supplied by the lifecycle policy. That lets a policy kill the server out of
//! band, for example when the supervising program receives Ctrl-C.
//!
//! Once spawned, the server is connected to with a bounded number of attempts, then probed with
//! `PING` until it answers `+PONG`. When either runs out of attempts, the policy's
//! [`failed_to_start`](policy::LifecyclePolicy::failed_to_start) hook is called before the error is
//! returned. Stopping sends `SHUTDOWN` and waits, up to a timeout, for the process to exit; any
//! problem along the way goes to [`failed_to_stop`](policy::LifecyclePolicy::failed_to_stop), but
//! the stop sequence always runs to the end and always leaves the server stopped.

#![warn(clippy::unwrap_used, missing_docs, rustdoc::unescaped_backticks)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(rust_2018_idioms)]

pub mod config;
pub mod destroyer;
pub mod errors;
pub mod execution;
pub mod interrupt;
pub mod policy;
pub mod reply;
pub mod server;

mod connect;
mod flag;
mod ready;
mod shutdown;

#[doc(inline)]
pub use self::{
	config::{Configuration, ConnectionProperties, ServerConfig},
	errors::ServerError,
	policy::Policy,
	server::{LocalServer, Managed, Server},
};
