use clap::{Parser, Subcommand};
use dynproxy::config::GatewayConfig;
use tracing_subscriber::EnvFilter;

/// dynproxy: dynamic reverse-proxy gateway
#[derive(Parser)]
#[command(name = "dynproxy", version, about)]
struct Cli {
    /// Path to configuration file (.hcl)
    #[arg(short, long, default_value = "gateway.hcl")]
    config: String,

    /// Override listen address (e.g., 0.0.0.0:8080)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without starting the gateway
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long, default_value = "gateway.hcl")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> dynproxy::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Validate { config: config_path }) = &cli.command {
        return validate_config(config_path).await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("dynproxy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!(config = cli.config, "Loading configuration");
        GatewayConfig::from_file(&cli.config).await?
    } else {
        tracing::warn!("Config file not found, using defaults");
        GatewayConfig::default()
    };

    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }

    let gateway = dynproxy::Gateway::new(config)?;
    gateway.load_persisted().await?;
    gateway.start().await?;

    tracing::info!("Gateway ready, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    gateway.stop().await
}

/// Validate a configuration file and print diagnostics
async fn validate_config(path: &str) -> dynproxy::Result<()> {
    if !std::path::Path::new(path).exists() {
        eprintln!("✗ Config file not found: {}", path);
        std::process::exit(1);
    }

    let config = match GatewayConfig::from_file(path).await {
        Ok(c) => {
            println!("✓ Config parsed successfully ({})", path);
            c
        }
        Err(e) => {
            eprintln!("✗ Parse error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("✗ Validation error: {}", e);
        std::process::exit(1);
    }

    println!("✓ Configuration is valid");
    println!();
    println!("  Listen:      {} (tls: {})", config.listen, config.tls_enabled());
    if let Some(redirect) = &config.http_redirect {
        println!("  Redirect:    {}", redirect.address);
    }
    println!("  CONNECT:     {}", if config.allow_connect { "allowed" } else { "refused" });
    let endpoints = config.all_endpoints();
    println!("  Endpoints:   {}", endpoints.len());
    for ep in &endpoints {
        println!(
            "    - {} [{}] → {} upstream(s), {} virtual director{}",
            ep.key(),
            ep.kind,
            ep.upstreams.len(),
            ep.virtual_directories.len(),
            if ep.virtual_directories.len() == 1 { "y" } else { "ies" }
        );
    }
    if let Some(dir) = &config.store_dir {
        println!("  Store:       {}", dir);
    }

    Ok(())
}
