//! KDL configuration parsing for Gantry.
//!
//! This crate handles parsing of:
//! - Workflow definitions (`.gantry/workflows/*.kdl`)
//! - System configuration
//! - `${{ vars.NAME }}` interpolation

mod kdl_util;

pub mod error;
pub mod system;
pub mod variables;
pub mod workflow;

pub use error::{ConfigError, ConfigResult};
pub use system::{SystemConfig, load_system_config, parse_duration, parse_system_config};
pub use variables::interpolate_vars;
pub use workflow::{Workflow, parse_workflow};
