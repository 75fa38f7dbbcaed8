//! batchfleet control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod admission;
pub mod api;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod pipelines;
pub mod refresh;
pub mod remote;
pub mod state;
pub mod tasks;
