//! CLI commands

pub mod template;
