use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use s3link::cli::commands;
use s3link::config;
use s3link::S3Client;

#[derive(Parser)]
#[command(name = "s3link")]
#[command(version, about = "Client for S3-compatible object storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Profile to use from config
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Disable SSL certificate verification
    #[arg(long, global = true)]
    insecure: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show object size
    Stat {
        /// Object path (s3://bucket/key or bucket/key)
        path: String,
    },

    /// Print object contents
    Cat {
        /// Object path
        path: String,

        /// First byte to print
        #[arg(long, default_value = "0")]
        offset: u64,

        /// Number of bytes to print (default: to end of object)
        #[arg(long)]
        length: Option<u64>,
    },

    /// Upload a local file
    Put {
        /// Local file
        source: String,

        /// Destination object path
        destination: String,

        /// Multipart part size in bytes (minimum 5 MiB)
        #[arg(long)]
        part_size: Option<usize>,
    },

    /// Remove an object
    Rm {
        /// Object path
        path: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Commands run one operation at a time; part uploads still overlap
    // because they are spawned tasks on this runtime.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = config::load_config(cli.config.as_deref(), cli.profile.as_deref())?;
    if cli.insecure {
        config.client.insecure_tls = true;
    }

    let profile = config
        .get_profile(cli.profile.as_deref())
        .context("No profile configured")?;
    let client = S3Client::from_profile(profile, &config.client)?;

    let result = match cli.command {
        Commands::Stat { path } => commands::cmd_stat(&client, &path).await,
        Commands::Cat {
            path,
            offset,
            length,
        } => commands::cmd_cat(&client, &path, offset, length).await,
        Commands::Put {
            source,
            destination,
            part_size,
        } => commands::cmd_put(&client, &source, &destination, part_size).await,
        Commands::Rm { path } => commands::cmd_rm(&client, &path).await,
    };

    client.close().await;
    result
}
