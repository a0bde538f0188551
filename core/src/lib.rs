//! lineage-core: durable run queue, progress log, artifact lineage and
//! suite batch orchestration for calcutta analytics runs.
//!
//! Layering (leaves first):
//!   types / status / payload      identities, lifecycle, typed params
//!   store                         the only module that executes SQL
//!   resolve / runs / orchestrator creation-time resolution and pinning
//!   worker / processor / retry    the claim loop and external engines
//!   api                           transport-agnostic HTTP handlers

pub mod api;
pub mod artifact;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod orchestrator;
pub mod payload;
pub mod processor;
pub mod resolve;
pub mod retry;
pub mod run;
pub mod runs;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod suite;
pub mod types;
pub mod worker;
