//! opdrive CLI
//!
//! Runs simulated workloads through the transaction driver pipeline.
//!
//! # Commands
//!
//! - `simulate` - Drive leader and follower operations and report throughput
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// opdrive transaction driver tools.
#[derive(Parser)]
#[command(name = "opdrive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated workload through prepare, replication and apply
    Simulate {
        /// Leader operations to submit
        #[arg(short, long, default_value = "10000")]
        ops: usize,

        /// Follower operations to replay after the leader phase
        #[arg(long, default_value = "0")]
        followers: usize,

        /// Apply pool threads
        #[arg(short, long, default_value = "4")]
        apply_threads: usize,

        /// Leader rounds per replication batch (1 disables batching)
        #[arg(short, long, default_value = "32")]
        batch_size: usize,

        /// Make every operation wait out clock uncertainty before committing
        #[arg(short, long)]
        commit_wait: bool,

        /// Random delay added to prepare and apply, in microseconds
        #[arg(short, long, default_value = "0")]
        jitter_us: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Simulate {
            ops,
            followers,
            apply_threads,
            batch_size,
            commit_wait,
            jitter_us,
            format,
        } => {
            let options = commands::simulate::SimOptions {
                ops,
                followers,
                apply_threads,
                batch_size,
                commit_wait,
                jitter_us,
            };
            commands::simulate::run(&options, &format)?;
        }
        Commands::Version => {
            println!("opdrive CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("opdrive core v{}", opdrive_core::VERSION);
        }
    }

    Ok(())
}
