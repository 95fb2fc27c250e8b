//! Command-line argument parsing for the `relay` binary.

use clap::{Args, Parser, Subcommand};
use db_relay::config::Config;
use db_relay::error::{RelayError, Result};
use std::path::PathBuf;

/// Runs SQL against configured engines and streams results into a result store.
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a query and store each statement's result
    Run {
        /// Engine name from the config file
        #[arg(short, long, value_name = "NAME")]
        engine: String,

        #[command(flatten)]
        source: SqlSource,

        /// Use the in-process mock engine instead of the configured one
        #[arg(long)]
        mock: bool,

        /// User recorded on the execution
        #[arg(short, long, env = "USER", default_value = "relay")]
        user: String,

        /// Result lines printed per statement
        #[arg(long, value_name = "N", default_value = "10")]
        preview: usize,
    },

    /// Check that an engine answers
    Check {
        /// Engine name from the config file
        #[arg(short, long, value_name = "NAME")]
        engine: String,

        /// Use the in-process mock engine instead of the configured one
        #[arg(long)]
        mock: bool,
    },

    /// Print the statement ranges of a query
    Split {
        #[command(flatten)]
        source: SqlSource,
    },

    /// Print a stored result, or its download URL
    Read {
        /// Result URI as printed by `run`
        #[arg(long, value_name = "URI")]
        uri: String,

        /// Maximum number of lines
        #[arg(long, value_name = "N")]
        limit: Option<usize>,

        /// Print a presigned download URL naming the file NAME instead
        #[arg(long, value_name = "NAME")]
        filename: Option<String>,
    },
}

/// Where the SQL text comes from.
#[derive(Args, Debug)]
pub struct SqlSource {
    /// Read SQL from a file ("-" for stdin)
    #[arg(short, long, value_name = "PATH", conflicts_with = "sql", required_unless_present = "sql")]
    pub file: Option<PathBuf>,

    /// SQL text
    #[arg(long, value_name = "TEXT")]
    pub sql: Option<String>,
}

impl SqlSource {
    /// Returns the SQL text.
    pub fn read(&self) -> Result<String> {
        if let Some(sql) = &self.sql {
            return Ok(sql.clone());
        }
        match self.file.as_deref() {
            Some(path) if path.as_os_str() == "-" => std::io::read_to_string(std::io::stdin())
                .map_err(|e| RelayError::config(format!("Failed to read stdin: {e}"))),
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                RelayError::config(format!("Failed to read {}: {e}", path.display()))
            }),
            None => Err(RelayError::config("Either --file or --sql is required")),
        }
    }
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }
}
