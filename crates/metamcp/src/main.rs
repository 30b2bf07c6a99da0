use anyhow::Result;
use clap::Parser;

mod admin_cmds;
mod cli;
mod serve_cmd;

use cli::{Cli, Commands, ContainerCommands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            bind,
            port,
            containers,
            container_image,
            container_network,
            api_keys,
            no_middleware_cache,
        } => {
            serve_cmd::run_serve(serve_cmd::ServeArgs {
                config,
                bind,
                port,
                containers,
                container_image,
                container_network,
                api_keys,
                no_middleware_cache,
            })
            .await
        }
        Commands::Status { addr, api_key } => {
            admin_cmds::status(&addr, api_key.as_deref()).await
        }
        Commands::Check { config } => serve_cmd::run_check(&config),
        Commands::Container { command } => match command {
            ContainerCommands::Retry {
                server_uuid,
                addr,
                api_key,
            } => admin_cmds::retry_container(&addr, &server_uuid, api_key.as_deref()).await,
            ContainerCommands::Logs {
                server_uuid,
                n,
                addr,
                api_key,
            } => admin_cmds::tail_logs(&addr, &server_uuid, n, api_key.as_deref()).await,
        },
    }
}
