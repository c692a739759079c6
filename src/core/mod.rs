//! Core shared types: configuration, errors and common data structures

pub mod config;
pub mod error;
pub mod types;
