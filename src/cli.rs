//! CLI argument parsing for the sheet-import-worker binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sheet-import-worker", about = "Streaming spreadsheet import worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker server (default if no subcommand given)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Import one local .xlsx or .csv file and print the final job record
    Import {
        /// File to import; it is deleted once the job finishes
        file: PathBuf,
    },
}
