//! Command-line interface definitions for the `pg-reflinker` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `pg-reflinker` binary.
#[derive(Debug, Parser)]
#[command(
    name = "pg-reflinker",
    about = "Provision PersistentVolumes as reflink clones of live CloudNativePG data directories",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run the claim and volume controllers for this node.
    #[command(name = "run", about = "Run the claim and volume controllers for this node")]
    Run(RunCommand),
    /// Check whether a string is accepted as a snapshot label.
    #[command(
        name = "check-label",
        about = "Check whether a string is accepted as a snapshot label"
    )]
    CheckLabel(CheckLabelCommand),
}

/// Arguments for the `pg-reflinker run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Override the node name normally injected through the downward API.
    #[arg(long, value_name = "NODE")]
    pub(crate) node_name: Option<String>,
    /// Override the log format (`text` or `json`).
    #[arg(long, value_name = "FORMAT")]
    pub(crate) log_format: Option<String>,
}

/// Arguments for the `pg-reflinker check-label` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CheckLabelCommand {
    /// Candidate snapshot label.
    #[arg(value_name = "LABEL")]
    pub(crate) label: String,
}
