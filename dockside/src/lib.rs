//! Dockside Library
//!
//! Builds container images from source, runs them on this server, streams
//! their logs and compiles the routing table of the fleet.

pub mod app;
pub mod bus;
pub mod deploy;
pub mod engine;
pub mod errors;
pub mod filesys;
pub mod kv;
pub mod logs;
pub mod logstream;
pub mod models;
pub mod registry;
pub mod routing;
pub mod storage;
pub mod utils;
pub mod workers;
