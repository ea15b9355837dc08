//! Core types, config, errors, and credential lookup for kbchat.

pub mod citation;
pub mod config;
pub mod credentials;
pub mod error;
pub mod types;
