//! Gantry Core
//!
//! Core types and abstractions for the Gantry pipeline orchestration system.
//!
//! This crate contains:
//! - Domain types: Core business entities (Pipeline, Execution, Stage, Webhook, etc.)
//! - DTOs: Data transfer objects for the runner protocol and the operator API

pub mod domain;
pub mod dto;
