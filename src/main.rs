use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orgsync::lister::ListingOutcome;
use orgsync::{CredentialArgs, Credentials, LocalInventory, RunOutcome, RunSummary, Settings, SyncEngine};

#[derive(Parser)]
#[command(name = "orgsync")]
#[command(about = "Clone or update every repository of a GitHub organization")]
#[command(version)]
struct Cli {
    /// GitHub username [env: GIT_USER]
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Local directory holding the organization's repositories [env: REPO_DIR]
    #[arg(short = 'r', long = "repo-dir")]
    repo_dir: Option<String>,

    /// GitHub personal access token [env: GITHUB_API_KEY]
    #[arg(short = 'a', long = "api-key")]
    api_key: Option<String>,

    /// GitHub organization to sync [env: GITHUB_ORG]
    #[arg(short = 'o', long = "org")]
    org: Option<String>,

    /// Settings file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;
    info!("Starting orgsync v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings(cli.config)?;

    let credentials = Credentials::resolve(CredentialArgs {
        user: cli.user,
        repo_dir: cli.repo_dir,
        token: cli.api_key,
        org: cli.org,
    })?;
    info!(
        "Syncing organization {} into {} as {}",
        credentials.org,
        credentials.repo_dir.display(),
        credentials.user
    );

    let inventory = LocalInventory::snapshot(&credentials.repo_dir)?;
    let engine = SyncEngine::connect(&credentials, &settings, inventory)?;
    let summary = engine.run().await?;

    print_summary(&summary);

    if summary.outcome == RunOutcome::DeadlineExceeded {
        std::process::exit(summary.outcome.exit_code());
    }

    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load settings from specified path or default location
fn load_settings(config_path: Option<PathBuf>) -> Result<Settings> {
    match config_path {
        Some(path) => Settings::load(&path),
        None => Settings::load_or_default(),
    }
}

fn print_summary(summary: &RunSummary) {
    match summary.outcome {
        RunOutcome::Completed => println!("\n🎉 Synchronization Complete!"),
        RunOutcome::DeadlineExceeded => println!("\n⏰ Synchronization stopped: deadline exceeded"),
    }
    println!("   📄 Pages processed: {}", summary.pages.len());
    println!("   🔄 Updated: {}", summary.updated());
    println!("   📥 Acquired: {}", summary.acquired());
    println!("   ❌ Failed: {}", summary.failed());
    if summary.abandoned() > 0 {
        println!("   ⏭️  Abandoned: {}", summary.abandoned());
    }
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    match &summary.listing {
        ListingOutcome::RateLimited { pages } => {
            println!("\n⚠️  GitHub rate limit reached after {} page(s), the listing is incomplete", pages);
        }
        ListingOutcome::Failed { reason, .. } => {
            println!("\n⚠️  Listing failed, the listing is incomplete: {}", reason);
        }
        _ => {}
    }

    if summary.failed() > 0 {
        println!("\n🔍 Failed Operations:");
        for report in summary.failures() {
            if let orgsync::SyncOutcome::Failed(failure) = &report.outcome {
                println!("   ❌ {} ({}): {}", report.name, report.kind, failure);
            }
        }
    }
}
