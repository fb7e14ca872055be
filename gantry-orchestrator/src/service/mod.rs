//! Service Module
//!
//! Operator-facing business logic and the observers that mirror execution
//! state outward (commit checks, live streams).

pub mod check;
pub mod pipeline;
pub mod runner;
pub mod stream;
