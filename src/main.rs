use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use component_broker::comms::callback_api;
use component_broker::config::BrokerConfig;
use component_broker::utils;

#[derive(Parser)]
#[command(name = "component-broker", version, about = "Delegated credential broker")]
struct AppCli {
    /// Config file path; BROKER_* environment variables override it
    #[arg(short, long, global = true, env = "BROKER_CONFIG")]
    config: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the callback HTTP server
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// List every authorized tenant as JSON
    Tenants,
    /// Print a fresh authorization URL
    AuthorizeUrl {
        #[arg(long)]
        redirect_uri: String,
        #[arg(long, default_value_t = 3)]
        auth_type: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();
    utils::logging::init(if args.verbose { "debug" } else { "info" });

    let config = BrokerConfig::load(args.config.as_deref()).context("loading broker config")?;

    match args.command {
        Commands::Serve { port } => {
            info!("Starting callback server on port {port}");
            callback_api::serve(config, port).await?;
        }
        Commands::Tenants => {
            let broker = config.token_broker(config.credential_store()?)?;
            let tenants = broker.list_all_tenants().await?;
            info!(count = tenants.len(), "tenant listing complete");
            println!("{}", serde_json::to_string_pretty(&tenants)?);
        }
        Commands::AuthorizeUrl {
            redirect_uri,
            auth_type,
        } => {
            let broker = config.token_broker(config.credential_store()?)?;
            println!("{}", broker.authorization_url(&redirect_uri, auth_type).await?);
        }
    }

    Ok(())
}
