//! # Rewind CLI - Point-in-time restores from the command line
//!
//! A command-line front end for the Rewind library.
//!
//! ## Features
//! - List the backup history of a repository
//! - Export per-run statistics as CSV
//! - Browse any directory as it was at a point in time
//! - Restore a file or directory tree as a zip or tar.gz archive
//! - Verify that every file version in a repository can be rebuilt
//!
//! ## Usage
//! ```bash
//! # Show the restorable points of a repository
//! rewind -r /backups/laptop history
//!
//! # Browse a directory as it was on a given day
//! rewind -r /backups/laptop ls projects --at 2024-03-01T12:00:00Z
//!
//! # Restore it as a tar.gz archive
//! rewind -r /backups/laptop restore projects --at 2024-03-01T12:00:00Z --format tar-gz
//!
//! # Stream a single file to stdout
//! rewind -r /backups/laptop restore notes/todo.txt --output - > todo.txt.zip
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use rewind::increment::EntryKind;
use rewind::utils::format_bytes;
use rewind::{
    ArchiveKind, RepositoryStatus, RestoreRequest, Result, Rewind, RewindBuilder, RewindConfig, RewindError,
    Timestamp,
};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Rewind CLI - Browse and restore incremental backups
#[derive(Parser)]
#[command(name = "rewind")]
#[command(version)]
#[command(about = "Browse and restore files from incremental backup repositories")]
#[command(long_about = None)]
struct Cli {
    /// Repository root (defaults to current directory)
    #[arg(short, long, global = true)]
    repo: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List restorable points
    #[command(alias = "log")]
    History {
        /// Show per-run statistics
        #[arg(short, long)]
        detailed: bool,

        /// Show only the newest N entries
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Export per-run statistics as CSV
    Stats {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List a directory as it was at a point in time
    Ls {
        /// Directory inside the repository (defaults to the root)
        #[arg(default_value = "")]
        path: String,

        /// Point in time (seconds since the epoch or RFC 3339; defaults to now)
        #[arg(short, long)]
        at: Option<Timestamp>,
    },

    /// Restore a file or directory as an archive
    #[command(alias = "rs")]
    Restore {
        /// File or directory inside the repository (defaults to the root)
        #[arg(default_value = "")]
        path: String,

        /// Point in time (seconds since the epoch or RFC 3339; defaults to now)
        #[arg(short, long)]
        at: Option<Timestamp>,

        /// Archive format
        #[arg(short, long, value_enum, default_value = "zip")]
        format: FormatArg,

        /// Output file, `-` for stdout (defaults to the download filename)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Glob patterns of entries to leave out
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Show repository status
    Info {
        /// Report the repository as stale after this many days
        #[arg(long, default_value_t = 0)]
        max_age: i64,
    },

    /// Verify the whole increment chain
    Verify,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    /// Zip archive
    Zip,
    /// Gzip-compressed tarball
    TarGz,
}

impl From<FormatArg> for ArchiveKind {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Zip => ArchiveKind::Zip,
            FormatArg::TarGz => ArchiveKind::TarGz,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so archives can be streamed to stdout
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    let repo = cli.repo.unwrap_or_else(|| PathBuf::from("."));
    let rewind = open_rewind(&repo, cli.config.as_deref())?;

    match cli.command {
        Commands::History { detailed, limit } => cmd_history(&rewind, detailed, limit),
        Commands::Stats { output } => cmd_stats(&rewind, output),
        Commands::Ls { path, at } => cmd_ls(&rewind, &path, at.unwrap_or_else(Timestamp::now)),
        Commands::Restore {
            path,
            at,
            format,
            output,
            exclude,
            progress,
        } => {
            let request = RestoreRequest::new(path, at.unwrap_or_else(Timestamp::now), format.into()).exclude(exclude);
            cmd_restore(&rewind, request, output, progress)
        }
        Commands::Info { max_age } => cmd_info(&rewind, max_age),
        Commands::Verify => cmd_verify(&rewind),
    }
}

fn open_rewind(repo: &Path, config: Option<&Path>) -> Result<Rewind> {
    let config = match config {
        Some(path) => RewindConfig::from_file(path)?,
        None => RewindConfig::default(),
    };
    RewindBuilder::new().config(config).build(repo)
}

/// List restorable points, newest first
fn cmd_history(rewind: &Rewind, detailed: bool, limit: Option<usize>) -> Result<()> {
    let history = rewind.history()?;

    println!("{} {}", "History of".blue().bold(), rewind.repository().display_name().bold());
    println!();

    let display_count = limit.unwrap_or(history.len()).min(history.len());
    for entry in history.iter().rev().take(display_count) {
        let marker = if entry.is_base { "base".yellow().bold() } else { "    ".normal() };
        let stats = &entry.statistics;

        print!("{} {} ", marker, entry.timestamp.to_string().bold());
        print!(
            "{} ",
            format!(
                "+{} ~{} -{}",
                stats.new_files, stats.changed_files, stats.deleted_files
            )
            .dimmed()
        );
        if stats.errors > 0 {
            print!("{}", format!("{} errors", stats.errors).red());
        }
        println!();

        if detailed {
            let elapsed = Duration::try_from_secs_f64(stats.elapsed_time).unwrap_or_default();
            println!(
                "       Source: {} files, {} | Increment: {} files, {}",
                stats.source_files.to_string().dimmed(),
                format_bytes(stats.source_file_size).dimmed(),
                stats.increment_files.to_string().dimmed(),
                format_bytes(stats.increment_file_size).dimmed()
            );
            println!("       Elapsed: {}", format_duration(elapsed).to_string().dimmed());
            println!();
        }
    }

    if display_count < history.len() {
        println!(
            "\n{}",
            format!("Showing {} of {} increments", display_count, history.len()).dimmed()
        );
    }
    Ok(())
}

fn cmd_stats(rewind: &Rewind, output: Option<PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            rewind.write_statistics_csv(File::create(&path)?)?;
            eprintln!("{} Statistics written to {}", "✓".green().bold(), path.display());
        }
        None => rewind.write_statistics_csv(io::stdout().lock())?,
    }
    Ok(())
}

fn cmd_ls(rewind: &Rewind, path: &str, at: Timestamp) -> Result<()> {
    for child in rewind.list_children(path, at)? {
        match child.kind {
            EntryKind::Directory => println!("{}", format!("{}/", child.name).blue().bold()),
            EntryKind::File => println!("{}", child.name),
        }
    }
    Ok(())
}

/// Restore a path and write the archive to a file or stdout
fn cmd_restore(rewind: &Rewind, request: RestoreRequest, output: Option<PathBuf>, progress: bool) -> Result<()> {
    let start = Instant::now();
    let mut restore = rewind.restore(request)?;

    let to_stdout = output.as_deref() == Some(Path::new("-"));
    let target = output.unwrap_or_else(|| PathBuf::from(&restore.filename));

    let pb = progress.then(|| {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Restoring {}...", restore.filename));
        pb
    });

    let copied = if to_stdout {
        copy_archive(&mut restore.stream, &mut io::stdout().lock(), pb.as_ref())
    } else {
        File::create(&target).map_err(RewindError::from).and_then(|mut file| {
            let copied = copy_archive(&mut restore.stream, &mut file, pb.as_ref())?;
            file.sync_all()?;
            Ok(copied)
        })
    };

    let report = match copied {
        Ok(_) => restore.stream.finish()?,
        Err(e) => {
            // A fatal producer error explains a broken read better than the io error
            restore.stream.finish()?;
            return Err(e);
        }
    };

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    if !to_stdout {
        println!(
            "{} Restored {} as of {} to {}",
            "✓".green().bold(),
            restore.filename.bold(),
            restore.timestamp,
            target.display()
        );
    }
    eprintln!(
        "  Files: {} | Directories: {} | Content: {} | Archive: {}",
        report.files_written,
        report.directories_written,
        format_bytes(report.bytes_written),
        format_bytes(report.archive_bytes)
    );
    eprintln!("  Duration: {}", format_duration(Duration::from_millis(start.elapsed().as_millis() as u64)));

    if !report.failures.is_empty() {
        eprintln!(
            "\n{} {} entries could not be rebuilt and are empty in the archive:",
            "⚠".yellow().bold(),
            report.failures.len()
        );
        for failure in &report.failures {
            eprintln!("  {} {}", failure.path.yellow(), failure.reason.dimmed());
        }
    }
    Ok(())
}

fn copy_archive<R: Read, W: Write>(reader: &mut R, writer: &mut W, pb: Option<&ProgressBar>) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
        if let Some(pb) = pb {
            pb.set_message(format!("Written {}", format_bytes(total)));
            pb.tick();
        }
    }
    writer.flush()?;
    Ok(total)
}

fn cmd_info(rewind: &Rewind, max_age: i64) -> Result<()> {
    let info = rewind.repository_info();

    println!("{}", "Repository:".blue().bold());
    println!("  Name: {}", info.display_name.bold());
    println!("  Path: {}", rewind.repository().root().display());
    let status = match &info.status {
        RepositoryStatus::Ok => info.status.as_str().green(),
        RepositoryStatus::InProgress => info.status.as_str().yellow(),
        RepositoryStatus::Failed(_) => info.status.as_str().red(),
    };
    println!("  Status: {}", status);
    if let RepositoryStatus::Failed(reason) = &info.status {
        println!("  Reason: {}", reason.dimmed());
    }
    match info.last_backup_date {
        Some(ts) => println!("  Last backup: {}", ts),
        None => println!("  Last backup: {}", "never".dimmed()),
    }
    println!("  Increments: {}", info.increment_count);

    if max_age > 0 {
        if rewind.check_activity(max_age, Timestamp::now()) {
            println!("  Activity: {}", format!("✓ backed up within {} days", max_age).green());
        } else {
            println!("  Activity: {}", format!("✗ no backup within {} days", max_age).red());
        }
    }
    Ok(())
}

fn cmd_verify(rewind: &Rewind) -> Result<()> {
    println!("{}", "Verifying increment chain...".blue().bold());
    let report = rewind.verify()?;

    println!("\n{}", "Verification Report:".bold());
    println!("  Increments: {}", report.increments_checked);
    println!("  File versions: {}", report.files_checked);
    println!("  Objects: {}", report.objects_checked);
    println!("  Missing objects: {}", count(report.missing_objects.len()));
    println!("  Corrupt objects: {}", count(report.corrupt_objects.len()));
    println!("  Unbuildable files: {}", count(report.unbuildable.len()));
    println!("  Unreadable increments: {}", count(report.errors.len()));
    println!("  Orphaned objects: {}", report.orphaned_objects.len().to_string().dimmed());
    println!("  Verification time: {}ms", report.verification_time_ms);

    for failure in &report.unbuildable {
        println!("    {} at {}: {}", failure.path.yellow(), failure.timestamp, failure.reason.dimmed());
    }

    if report.is_valid() {
        println!("\n{} {}", "✓".green().bold(), report.summary());
        Ok(())
    } else {
        Err(RewindError::internal(report.summary()))
    }
}

fn count(n: usize) -> ColoredString {
    if n == 0 {
        n.to_string().green()
    } else {
        n.to_string().red()
    }
}
