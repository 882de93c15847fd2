use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use ebs_shrink::cloud::{CredentialProvider, Ec2Client};
use ebs_shrink::host::{self, LocalHost};
use ebs_shrink::imds::Imds;
use ebs_shrink::migrate::DeviceOutcome;
use ebs_shrink::recoverable::list_recoverable;
use ebs_shrink::{Config, Migrator, RunReport};

#[derive(Parser, Debug)]
#[command(author, version, about = "Shrink or replace EBS data volumes on this instance", long_about = None)]
struct Args {
    /// Migration configuration (JSON)
    #[arg(short = 'c', long, value_name = "PATH", default_value = "./ebs-shrink.json")]
    config: PathBuf,

    /// Run all checks and show what would be done without making changes
    #[arg(long)]
    dry_run: bool,

    /// Do not ask for confirmation before modifying volumes
    #[arg(short = 'y', long)]
    yes: bool,

    /// Append the run log to this file
    #[arg(long, value_name = "PATH", default_value = "ebs-shrink.log")]
    log_file: PathBuf,

    /// List volumes retired by earlier runs that are still tagged for recovery
    #[arg(long)]
    list_recoverable: bool,

    /// Debug-level logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_file, args.verbose)?;
    tracing::info!(started = %chrono::Utc::now(), "ebs-shrink start");

    let result = run(&args);
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "run failed");
    }
    tracing::info!("ebs-shrink end of run");
    result
}

fn init_logging(path: &Path, verbose: bool) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    println!("EBS Volume Shrink Tool");
    println!("======================\n");

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))?;

    let imds = Imds::new().context("Failed to create instance metadata client")?;
    let region = match &config.region {
        Some(region) => region.clone(),
        None => imds
            .region()
            .context("No region configured and instance metadata did not provide one")?,
    };
    let credentials = CredentialProvider::from_environment(imds.clone());
    let ec2 = Ec2Client::new(&region, credentials).context("Failed to create EC2 client")?;

    if args.list_recoverable {
        return print_recoverable(&ec2);
    }

    if !args.dry_run && !host::is_root() {
        bail!("This program must be run as root");
    }

    println!("Instance: {}", config.instance_id);
    println!("Region: {}", region);
    for device in &config.devices {
        println!(
            "  {} -> {} ({} GiB), {} via {}",
            device.source_device,
            device.replacement_device,
            device.new_size_gib,
            device.data_dir.display(),
            device.staging_dir.display()
        );
    }

    if args.dry_run {
        println!("\n=== DRY RUN MODE - No changes will be made ===\n");
    } else if !args.yes {
        println!("\nWARNING: This will replace the volumes above and remount their data directories!");
        println!("Press Enter to continue or Ctrl+C to cancel...");
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
    }

    let migrator = Migrator::new(config, &ec2, &LocalHost).dry_run(args.dry_run);
    let report = migrator.run(&imds).context("Migration aborted")?;

    print_summary(&report);
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!("\n=== Summary ===");
    for device in &report.devices {
        match &device.outcome {
            DeviceOutcome::Completed(done) => println!(
                "  {}: replaced {} with {} (snapshot {})",
                device.source_device,
                done.retired_volume_id,
                done.replacement_volume_id,
                done.snapshot_id
            ),
            DeviceOutcome::Skipped(reason) => {
                println!("  {}: skipped, {}", device.source_device, reason)
            }
            DeviceOutcome::Planned(plan) => println!(
                "  {}: would replace {} with {} GiB",
                device.source_device, plan.source_volume_id, plan.replacement.size_gib
            ),
        }
    }
    println!("\nProcess completed!");
}

fn print_recoverable(ec2: &Ec2Client) -> Result<()> {
    let volumes = list_recoverable(ec2).context("Failed to list recoverable volumes")?;
    if volumes.is_empty() {
        println!("No volumes are tagged for recovery.");
        return Ok(());
    }

    println!("Volumes tagged for recovery:");
    for volume in &volumes {
        println!(
            "  {} ({} GiB, {}) from {} {} at {}, replaced by {}, retired {}",
            volume.volume_id,
            volume.size_gib,
            volume.state,
            volume.original_host.as_deref().unwrap_or("?"),
            volume.device.as_deref().unwrap_or("?"),
            volume.mount_point.as_deref().unwrap_or("?"),
            volume.replaced_by.as_deref().unwrap_or("?"),
            volume.retired_at.as_deref().unwrap_or("?")
        );
    }
    Ok(())
}
