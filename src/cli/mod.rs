//! CLI module for Gatehouse
//!
//! Provides command-line interface parsing for the gatehouse-server binary.
//! One binary runs either service and carries the admin tooling used to
//! bootstrap them.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// Gatehouse - token issuing and policy-driven authorization
#[derive(Parser, Debug)]
#[command(
    name = "gatehouse-server",
    author = "Dirmacs <build@dirmacs.com>",
    version,
    about = "Gatehouse - token issuing and policy-driven authorization",
    long_about = "Runs the auth service, which holds the signing keys and answers\n\
                  authentication and authorization questions, or the sales service,\n\
                  which delegates those questions to it.",
    after_help = "EXAMPLES:\n    \
                  gatehouse-server auth                       # Start the auth service\n    \
                  gatehouse-server sales                      # Start the sales service\n    \
                  gatehouse-server config --validate          # Check gatehouse.toml\n    \
                  gatehouse-server useradd --email a@b.com --password x --roles ADMIN"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "gatehouse.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the auth service
    Auth,

    /// Run the sales service
    Sales,

    /// Show configuration information
    Config {
        /// Show the full configuration
        #[arg(short = 'f', long)]
        full: bool,

        /// Validate the configuration file
        #[arg(long)]
        validate: bool,
    },

    /// Add a user to the identity store
    Useradd {
        /// Display name
        #[arg(long, default_value = "Admin")]
        name: String,

        /// Email address, unique per user
        #[arg(long)]
        email: String,

        /// Plain-text password
        #[arg(long, env = "GATEHOUSE_USER_PASSWORD")]
        password: String,

        /// Comma separated roles
        #[arg(long, value_delimiter = ',', default_value = "USER")]
        roles: Vec<String>,

        /// Optional department
        #[arg(long)]
        department: Option<String>,
    },

    /// Sign a token with the active kid
    Gentoken {
        /// Subject of the token
        #[arg(long)]
        user_id: Uuid,

        /// Comma separated roles
        #[arg(long, value_delimiter = ',', default_value = "USER")]
        roles: Vec<String>,

        /// Token lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl_secs: i64,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
