use anyhow::{Context, Result};
use bkmirror::config::AppConfig;
use bkmirror::context::AppContext;
use bkmirror::core::home::{HomeSelection, scan_home};
use bkmirror::core::operation::{OperationHandle, Outcome};
use bkmirror::core::ownership::resolve_home;
use bkmirror::core::{
    BackupRequest, BackupType, DriveInfo, Orchestrator, RestoreRequest, VerifyRequest,
};
use bkmirror::error::format_bytes;
use bkmirror::logging::{self, LogConfig};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Parser)]
#[command(name = "bkmirror")]
#[command(about = "Mirror a live system or home directory onto a removable drive", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use simulated drives instead of real hardware.
    #[arg(long, global = true)]
    simulation: bool,

    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Config file to use instead of /etc/bkmirror/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List removable drives usable as backup targets.
    Drives,
    /// Mirror the system or a home directory onto a drive.
    Backup(BackupArgs),
    /// Mirror a backup drive back onto the machine.
    Restore(RestoreArgs),
    /// Audit a backup drive against its source.
    Verify(VerifyArgs),
    /// Show home folders and their sizes.
    Home,
    /// Print the effective configuration.
    Config,
}

#[derive(Args)]
struct DriveArgs {
    /// Drive number as shown by `bkmirror drives`.
    #[arg(long, short)]
    drive: usize,

    /// Environment variable holding the passphrase of an encrypted drive.
    #[arg(long)]
    passphrase_env: Option<String>,
}

#[derive(Args)]
struct BackupArgs {
    #[command(flatten)]
    target: DriveArgs,

    #[arg(long = "type", value_enum, default_value_t = BackupType::System)]
    backup_type: BackupType,

    /// Top-level home folders to include (selective-home only).
    #[arg(long = "select")]
    select: Vec<String>,

    /// Include .config and .local (selective-home only).
    #[arg(long)]
    include_config: bool,

    /// Include themes, icons and fonts (selective-home only).
    #[arg(long = "include-wm")]
    include_wm: bool,
}

#[derive(Args)]
struct RestoreArgs {
    #[command(flatten)]
    target: DriveArgs,

    /// Restore here instead of where the manifest points.
    #[arg(long = "target")]
    destination: Option<PathBuf>,
}

#[derive(Args)]
struct VerifyArgs {
    #[command(flatten)]
    target: DriveArgs,

    /// Compare against this tree instead of where the manifest points.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Also compare file contents of sampled files.
    #[arg(long)]
    checksum: bool,
}

/// Global flags layered over file and environment configuration.
#[derive(Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    simulation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
}

impl From<&Cli> for Overrides {
    fn from(cli: &Cli) -> Self {
        Self {
            simulation: cli.simulation.then_some(true),
            verbose: cli.verbose.then_some(true),
            json_logs: cli.json_logs.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides::from(&cli);
    let config = match &cli.config {
        Some(path) => AppConfig::load(path, Some(&overrides))?,
        None => AppConfig::new(Some(&overrides))?,
    };

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    let ctx = AppContext::new(config);

    match cli.command {
        Commands::Drives => run_drives(&ctx),
        Commands::Backup(args) => run_backup(ctx, args)
            .await
            .context("Backup failed"),
        Commands::Restore(args) => run_restore(ctx, args)
            .await
            .context("Restore failed"),
        Commands::Verify(args) => run_verify(ctx, args)
            .await
            .context("Verification failed"),
        Commands::Home => run_home(&ctx),
        Commands::Config => {
            print!("{}", ctx.config.to_toml()?);
            Ok(())
        }
    }
}

fn run_drives(ctx: &AppContext) -> Result<()> {
    let drives = ctx.drive_manager().list_drives();
    if drives.is_empty() {
        println!("No removable drives found.");
        return Ok(());
    }
    for (i, drive) in drives.iter().enumerate() {
        let mut line = format!(
            "{:>2}. {:<20} {:>10}  {:<16} {:<6}",
            i + 1,
            drive.device.display(),
            format_bytes(drive.size),
            drive.display_name(),
            drive.filesystem,
        );
        if drive.encrypted {
            line.push_str("  [encrypted]");
        }
        if let Some(mp) = &drive.mount_point {
            line.push_str(&format!("  mounted at {}", mp.display()));
        }
        println!("{}", line);
    }
    Ok(())
}

fn run_home(ctx: &AppContext) -> Result<()> {
    let home = resolve_home(ctx.config.home_dir.as_deref())
        .context("Cannot determine the home directory")?;
    println!("{}", home.display());
    for folder in scan_home(&home) {
        let mark = if folder.always_include {
            "always"
        } else if folder.selected {
            "x"
        } else {
            " "
        };
        println!(
            "  [{:^6}] {:<32} {:>10}",
            mark,
            folder.name,
            format_bytes(folder.size)
        );
        for child in &folder.children {
            println!(
                "             {:<30} {:>10}",
                child.name,
                format_bytes(child.size)
            );
        }
    }
    Ok(())
}

/// Resolve a 1-based drive number from `bkmirror drives`.
fn pick_drive(ctx: &AppContext, number: usize) -> Result<DriveInfo> {
    let index = number
        .checked_sub(1)
        .context("Drive numbers start at 1")?;
    Ok(ctx.drive_manager().select(index)?)
}

fn passphrase_for(drive: &DriveInfo, env_var: Option<&str>) -> Result<Option<String>> {
    if !drive.encrypted || drive.mapped_device.is_some() {
        return Ok(None);
    }
    if let Some(var) = env_var {
        let value = std::env::var(var)
            .with_context(|| format!("Environment variable {} is not set", var))?;
        return Ok(Some(value));
    }

    eprint!("Passphrase for {}: ", drive.device.display());
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read passphrase")?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn run_backup(ctx: AppContext, args: BackupArgs) -> Result<()> {
    let drive = pick_drive(&ctx, args.target.drive)?;
    let passphrase = passphrase_for(&drive, args.target.passphrase_env.as_deref())?;

    let selection = match args.backup_type {
        BackupType::SelectiveHome => {
            let home = resolve_home(ctx.config.home_dir.as_deref())
                .context("Cannot determine the home directory")?;
            let folders = scan_home(&home);
            let mut selection = if args.select.is_empty() {
                HomeSelection {
                    folders,
                    ..Default::default()
                }
            } else {
                HomeSelection::with_selected(folders, &args.select)
            };
            selection.include_config = args.include_config;
            selection.include_window_manager = args.include_wm;
            Some(selection)
        }
        _ => None,
    };

    let interval = ctx.config.progress_interval();
    let handle = Orchestrator::new(ctx).backup(BackupRequest {
        drive,
        backup_type: args.backup_type,
        selection,
        passphrase,
    });
    let outcome = follow(handle, interval).await?;
    println!("{}", outcome.summary());
    Ok(())
}

async fn run_restore(ctx: AppContext, args: RestoreArgs) -> Result<()> {
    let drive = pick_drive(&ctx, args.target.drive)?;
    let passphrase = passphrase_for(&drive, args.target.passphrase_env.as_deref())?;

    let interval = ctx.config.progress_interval();
    let handle = Orchestrator::new(ctx).restore(RestoreRequest {
        drive,
        target: args.destination,
        passphrase,
    });
    let outcome = follow(handle, interval).await?;
    println!("{}", outcome.summary());
    Ok(())
}

async fn run_verify(ctx: AppContext, args: VerifyArgs) -> Result<()> {
    let drive = pick_drive(&ctx, args.target.drive)?;
    let passphrase = passphrase_for(&drive, args.target.passphrase_env.as_deref())?;

    let interval = ctx.config.progress_interval();
    let handle = Orchestrator::new(ctx).verify(VerifyRequest {
        drive,
        source: args.source,
        checksum: args.checksum,
        passphrase,
        seed: None,
    });
    let report = follow(handle, interval).await?;
    println!("{}", report.details(20));
    if !report.is_final || !report.is_clean() {
        anyhow::bail!("{}", report.summary());
    }
    Ok(())
}

/// Poll the operation on a fixed tick, redrawing one status line, until it
/// reports done. Ctrl-C requests cancellation once.
async fn follow<T>(handle: OperationHandle<T>, interval: Duration) -> Result<T>
where
    T: Outcome + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;
    let mut stderr = std::io::stderr();
    debug!(operation = %handle.id(), "Following operation");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let update = handle.progress();
                if update.done {
                    break;
                }
                let pct = if update.is_indeterminate() {
                    " ...".to_string()
                } else {
                    format!("{:>3.0}%", update.percentage * 100.0)
                };
                write!(stderr, "\r\x1b[2K[{}] {}", pct, update.message)?;
                stderr.flush()?;
            }
            _ = &mut ctrl_c, if !cancelling => {
                cancelling = true;
                writeln!(stderr, "\nCancelling after the current file...")?;
                handle.cancel();
            }
        }
    }
    writeln!(stderr)?;

    Ok(handle.wait().await?)
}
