//! CLI commands

pub mod diagnostics;
pub mod root;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Check engine, database and storage health
    Diagnostics,
}
