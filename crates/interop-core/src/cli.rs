//! Shared CLI argument primitives, in the style of the teacher toolkit's `cli_utils` module
//! (`RUMTKArgs`). The engine binary's own argument struct lives in `interop-engine`; what's
//! common across binaries built on this crate (config path, dry-run, log-level override) lives
//! here.

use clap::Parser;

#[derive(Debug, Parser, Clone)]
pub struct CommonArgs {
    /// Path to the engine's YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    pub config: String,

    /// Named environment overlay to apply on top of the base config.
    #[arg(long)]
    pub environment: Option<String>,

    /// Validate configuration and wiring, then exit without starting any listener.
    #[arg(long)]
    pub dry_run: bool,

    /// Overrides `global.log_level` from the config file.
    #[arg(long)]
    pub log_level: Option<String>,
}
