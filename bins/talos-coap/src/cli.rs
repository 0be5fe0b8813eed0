use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "talos-coap", about = "CoAP client for constrained devices")]
pub struct Cli {
    /// Optional TOML file with transmission parameters.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log protocol activity.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// GET a resource.
    Get {
        url: String,

        /// Send non-confirmable.
        #[arg(long)]
        non_confirmable: bool,

        /// Negotiate a block size for the response body.
        #[arg(long)]
        block_size: Option<usize>,
    },

    /// POST a payload to a resource.
    Post { url: String, payload: String },

    /// PUT a payload to a resource.
    Put { url: String, payload: String },

    /// DELETE a resource.
    Delete { url: String },

    /// Subscribe to a resource and print notifications until interrupted.
    Observe { url: String },

    /// Probe a peer with a CoAP ping.
    Ping { endpoint: String },
}
