use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "metamcp", version)]
#[command(about = "MetaMCP: aggregation gateway for the Model Context Protocol")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway.
    Serve {
        /// Path to the gateway TOML config.
        #[arg(long, default_value = "metamcp.toml")]
        config: PathBuf,

        /// Bind address for the endpoint server.
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Bind port; 0 picks an ephemeral port.
        #[arg(long, default_value_t = 12008)]
        port: u16,

        /// Run stdio backends inside supervised containers.
        #[arg(long)]
        containers: bool,

        /// Image for the in-container stdio runner.
        #[arg(long)]
        container_image: Option<String>,

        /// Bridge network for container name resolution; omit to publish
        /// host ports instead.
        #[arg(long)]
        container_network: Option<String>,

        /// `key=client_id` pairs accepted as X-API-Key credentials.
        /// Without any, the endpoints are open.
        #[arg(long = "api-key", value_name = "KEY=CLIENT")]
        api_keys: Vec<String>,

        /// Rebuild middleware tables on every request instead of caching.
        #[arg(long)]
        no_middleware_cache: bool,
    },

    /// Show whether a gateway is running and what it serves.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:12008")]
        addr: String,

        #[arg(long)]
        api_key: Option<String>,
    },

    /// Validate a gateway config and exit.
    Check {
        #[arg(long, default_value = "metamcp.toml")]
        config: PathBuf,
    },

    /// Container operations against a running gateway.
    Container {
        #[command(subcommand)]
        command: ContainerCommands,
    },
}

#[derive(Subcommand)]
pub enum ContainerCommands {
    /// Reset a backend's sticky error state and recreate its container.
    Retry {
        /// Backend server uuid.
        server_uuid: String,

        #[arg(long, default_value = "http://127.0.0.1:12008")]
        addr: String,

        #[arg(long)]
        api_key: Option<String>,
    },

    /// Tail a backend's logs (container logs, or the stderr ring buffer).
    Logs {
        /// Backend server uuid.
        server_uuid: String,

        /// Number of lines.
        #[arg(short, default_value_t = 100)]
        n: usize,

        #[arg(long, default_value = "http://127.0.0.1:12008")]
        addr: String,

        #[arg(long)]
        api_key: Option<String>,
    },
}
