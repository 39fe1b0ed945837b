//! Clearwell Configuration Module
//!
//! Process configuration loaded from TOML, with built-in defaults for every
//! field so an empty or missing file yields a working setup.
//!
//! ## Loading Order
//!
//! 1. `CLEARWELL_CONFIG` environment variable (path to TOML file)
//! 2. `clearwell.toml` in the current working directory
//! 3. Built-in defaults (see `defaults`)
//!
//! `CLEARWELL_INTERVAL_SECS` then overrides `scheduler.interval_secs`, and
//! CLI flags override the rest. The resulting config is passed explicitly
//! into the pipeline context; there is no global instance.

mod clearwell_config;
pub mod defaults;
pub mod validation;

pub use clearwell_config::*;
