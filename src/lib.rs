//! `convergence_core`: the product-specification convergence engine (§1).
//!
//! Modules map directly onto the component breakdown from §2 — one module
//! per component, plus the shared `types`/`contract`/`store`/`error` leaves
//! everything else builds on. `engine` is the only module that reaches
//! across component boundaries; it exists because something has to drive
//! DP -> FS -> EI -> TR -> EC -> CE -> NS round after round, and that
//! orchestration isn't itself a numbered component.

pub mod config;
pub mod consensus;
pub mod contract;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod evidence_index;
pub mod extraction;
pub mod fetch;
pub mod frontier;
pub mod identity;
pub mod learning;
pub mod needset;
pub mod queue;
pub mod retrieval;
pub mod round;
pub mod store;
pub mod telemetry;
pub mod types;

pub mod api;
pub mod cli;
