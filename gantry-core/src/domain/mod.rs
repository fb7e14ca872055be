//! Core domain types
//!
//! This module contains the core domain structures used across Gantry services.
//! These types represent the fundamental business entities and are shared between
//! the orchestrator (which owns and persists them) and runners or operator tools
//! (which only read them or report against them).

pub mod check;
pub mod event;
pub mod execution;
pub mod job;
pub mod log;
pub mod pipeline;
pub mod runner;
pub mod trigger;
pub mod webhook;
