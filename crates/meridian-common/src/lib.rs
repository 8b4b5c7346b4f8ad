//! # meridian-common
//!
//! Shared records, configuration, error handling, and utilities used across all
//! Meridian crates. This is the foundation layer: no business logic, just
//! primitives and contracts.

pub mod config;
pub mod error;
pub mod ids;
pub mod inbound_event;
pub mod models;
pub mod permissions;
pub mod validation;
