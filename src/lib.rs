//! Ratewarden - Distributed Sliding-Window Rate Limiting
//!
//! This crate enforces per-key request limits across a fleet of stateless
//! nodes that share one Redis store. Each check runs the whole sliding-window
//! algorithm as a single server-side script, so concurrent callers on any
//! node can never jointly exceed a limit. Nodes discover each other through
//! expiring presence records in the same store.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod registry;
pub mod store;
