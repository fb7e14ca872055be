//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs used for communication between Gantry services
//! (orchestrator, runner, CLI). DTOs are request and response shapes; the
//! entities they refer to live in [`crate::domain`].

pub mod event;
pub mod execution;
pub mod pipeline;
pub mod runner;
pub mod trigger;
pub mod webhook;
