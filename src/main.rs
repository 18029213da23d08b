use anyhow::Result;
use clap::Parser;
use keyserver::cli::{App, Cli, Commands, Config, ConfigCommand, IssuerCommand};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut app = App::new(cli.config)?;

    match cli.command {
        Commands::Serve { bind, threads } => {
            info!("Starting key server...");
            app.handle_serve(bind, threads).await?;
        }
        Commands::Request {
            address,
            name,
            out_dir,
            timeout,
        } => {
            app.handle_request(
                &address,
                &name,
                out_dir.as_deref(),
                Duration::from_secs(timeout),
            )
            .await?;
        }
        Commands::Issuer { command } => match command {
            IssuerCommand::Generate { bits, force } => {
                app.handle_issuer_generate(bits, force)?;
            }
            IssuerCommand::Info => {
                app.handle_issuer_info()?;
            }
        },
        Commands::Config { command } => match command {
            ConfigCommand::Path => {
                println!("Config file: {}", app.config_path.display());
                if let Ok(data_dir) = Config::default_data_dir() {
                    println!("Data dir:    {}", data_dir.display());
                }
            }
            ConfigCommand::Show => {
                app.handle_config_show()?;
            }
        },
    }

    Ok(())
}
