//! Session lease gateway: single-owner session hubs, idempotent sandbox tool
//! callbacks and automation completion.

pub mod cli;
pub mod config;
pub mod hub;
pub mod lease;
pub mod persistence;
pub mod policy;
pub mod router;
pub mod runtime;
pub mod services;
pub mod session;
pub mod tasks;
pub mod tools;

include!(concat!(env!("OUT_DIR"), "/version.rs"));
