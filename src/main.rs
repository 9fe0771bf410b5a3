use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use dasher_monitor::config::Config;
use dasher_monitor::events::EventBus;
use dasher_monitor::llm::LlmClassifier;
use dasher_monitor::mail_client::{HttpMailClient, MailApi};
use dasher_monitor::repository::{MemoryRepository, Repository};
use dasher_monitor::scanner::Scanner;

#[derive(Parser)]
#[command(name = "dasher-monitor", about = "Email-driven lifecycle monitor for Dasher inboxes", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one full fleet scan and print the summary
    Scan,
    /// Run the periodic provider reconciliation loop until interrupted
    AutoSync,
    /// Validate the configuration file
    ValidateConfig,
    /// Write an example configuration file
    InitConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dasher_monitor=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("dasher_monitor=info,warn,error"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::InitConfig => {
            Config::create_example(&cli.config).await?;
            println!("Wrote example configuration to {:?}", cli.config);
            return Ok(());
        }
        Commands::ValidateConfig => {
            let config = Config::load(&cli.config).await?;
            config.validate()?;
            println!("Configuration at {:?} is valid", cli.config);
            return Ok(());
        }
        _ => {}
    }

    let config = Config::load(&cli.config).await?;
    config.validate()?;

    let mail: Arc<dyn MailApi> = Arc::new(HttpMailClient::with_settings(
        config.mail.api_base.clone(),
        config.mail.api_key.clone(),
        Duration::from_secs(config.mail.cache_ttl_seconds),
        config.mail.max_concurrent_requests,
    )?);
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let events = Arc::new(EventBus::new());
    let llm = Arc::new(LlmClassifier::from_config(&config.llm));
    let scanner = Scanner::new(repo.clone(), mail, events, llm, &config.scanner);

    match cli.command {
        Commands::Scan => {
            let scan_id = scanner.begin_scan().await?;
            scanner.run_scan(scan_id).await;

            if let Some(log) = repo.get_scan_log(scan_id).await? {
                println!("Scan {scan_id}: {:?}", log.status);
                println!(
                    "  accounts: {}  scanned: {}  transitions: {}  errors: {}",
                    log.total_accounts, log.scanned, log.transitions, log.errors
                );
                if let Some(details) = log.error_details {
                    println!("  error details: {details}");
                }
            }
        }
        Commands::AutoSync => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let sync_task = tokio::spawn(async move { scanner.auto_sync(shutdown_rx).await });

            tokio::signal::ctrl_c().await?;
            println!("Shutting down...");
            let _ = shutdown_tx.send(true);
            sync_task.await?;
        }
        Commands::ValidateConfig | Commands::InitConfig => unreachable!(),
    }

    Ok(())
}
