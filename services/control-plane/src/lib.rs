//! Gantry control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod provisioning;
pub mod state;
pub mod transfers;
