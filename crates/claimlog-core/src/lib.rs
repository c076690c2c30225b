//! claimlog-core
//!
//! Decentralized task claiming on top of a shared, versioned log.
//!
//! Workers never talk to each other or to a server. Every state change (claim,
//! heartbeat, completion, reclaim) is a record rewrite published with an
//! optimistic compare-and-swap on a branch head; losers re-read and retry.
//!
//! # Modules
//! - **domain**: names, lifecycle states, the task entity and its transitions
//! - **ports**: Substrate, Clock, Sleeper, IdGenerator
//! - **backlog**: record layout, decoding, eligibility, dependency graph, backoff
//! - **app**: claim / heartbeat / complete / reclaim / status / worker loop
//! - **impls**: InMemorySubstrate, GitSubstrate
//! - **config**, **telemetry**, **error**

pub mod app;
pub mod backlog;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use app::{Coordinator, CoordinatorBuilder};
pub use config::CoordinationConfig;
