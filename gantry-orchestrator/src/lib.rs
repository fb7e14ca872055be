//! Gantry orchestrator
//!
//! Turns repository events into pipeline executions, hands their stages to
//! runners and reports progress outward through webhooks, commit checks and
//! live streams. [`app::App`] wires the components together; [`api`] exposes
//! them over HTTP.

pub mod api;
pub mod app;
pub mod bus;
pub mod canceler;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod git;
pub mod lock;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod trigger;
pub mod webhook;
