//! Core types, config, errors, and wire protocol for Voxline.

pub mod config;
pub mod credentials;
pub mod error;
pub mod protocol;
pub mod types;
