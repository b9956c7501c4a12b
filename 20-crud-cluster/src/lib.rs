//! Multi-process CRUD cluster on one machine.
//!
//! A supervisor process forks a fixed pool of worker processes and puts a
//! round-robin reverse proxy in front of them. Each worker owns its own
//! in-memory user store and serves a small REST API on a private port.
//! Workers stay loosely in sync by publishing every local mutation to the
//! supervisor, which relays it to all of their siblings.
//!
//! - [`config`] parses both roles' command line and environment.
//! - [`supervisor`] forks, restarts and relays; [`supervisor::proxy`]
//!   balances HTTP traffic.
//! - [`worker`] runs one worker: store, replication and API server.
//! - [`link`] and [`message`] carry JSON-line replication frames over a
//!   child's stdin/stdout.
//! - [`store`], [`user`] and [`api`] are the per-worker CRUD application.
//! - [`replication`] turns store mutations into messages and back.
//!
//! Consistency is best effort: there is no ordering across workers, no
//! acknowledgement, and a worker that is bootstrapping adopts whichever
//! sibling snapshot arrives last.

pub mod api;
pub mod config;
pub mod error;
pub mod link;
pub mod message;
pub mod replication;
pub mod signal;
pub mod store;
pub mod supervisor;
pub mod user;
pub mod worker;
