//! kura command-line front end.
//!
//! Every command goes through the kernel's `VirtualFs`, so paths are routed
//! and containment-checked exactly as a server adapter would do it.
//!
//! Usage:
//!   kura --root ./site ls /
//!   kura --config kura.toml stat /docs/guide.md --json
//!   kura cat /docs/guide.md
//!   kura zip /docs -o docs.zip

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kura_kernel::archive::{self, ArchiveError, ArchiveJob, ArchiveReport, ArchiveStreamer};
use kura_kernel::{FileInfo, KuraConfig, VirtualFs, Visibility};

/// Browse and archive directories through kura's virtual filesystem.
#[derive(Parser, Debug)]
#[command(name = "kura", version)]
#[command(about = "Browse and archive directories through kura's virtual filesystem")]
struct Args {
    /// Configuration file
    #[arg(long, global = true, default_value = "kura.toml")]
    config: PathBuf,

    /// Serve a single directory instead of reading a config file
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured mounts
    Mounts {
        #[arg(long)]
        json: bool,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Include hidden entries
        #[arg(short, long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show metadata for a path
    Stat {
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Write a file to stdout
    Cat { path: String },
    /// Archive a directory as ZIP
    Zip {
        #[arg(default_value = "/")]
        path: String,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct MountRow<'a> {
    path: String,
    display_name: &'a str,
    directory: &'a Path,
    read_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("kura: {e:#}");
            if matches!(e.downcast_ref::<ArchiveError>(), Some(ArchiveError::Cancelled)) {
                ExitCode::from(130)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = match &args.root {
        Some(root) => KuraConfig::single_root(root),
        None => KuraConfig::load(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?,
    };
    let vfs = VirtualFs::new(config.mount_table()?);

    match args.command {
        Command::Mounts { json } => mounts(&vfs, json),
        Command::Ls { path, all, json } => {
            let visibility = if all {
                Visibility::ShowHidden
            } else {
                config.visibility()
            };
            let entries = vfs
                .read_dir(&path, visibility)
                .await
                .map_err(|e| e.conceal(&path))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!("{}", format_entry(entry));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Stat { path, json } => {
            let info = vfs.stat(&path).await.map_err(|e| e.conceal(&path))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{}", format_entry(&info));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Cat { path } => {
            let mut open = vfs.open(&path).await.map_err(|e| e.conceal(&path))?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut open.file, &mut stdout).await?;
            stdout.flush().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Zip { path, output } => {
            let streamer = ArchiveStreamer::new(vfs, config.archive_options());
            let job = streamer
                .job(&path, config.visibility())
                .await
                .map_err(|e| e.conceal(&path))?;
            cancel_on_ctrl_c(job.cancellation().clone());

            let report = match output {
                Some(file) => zip_to_file(&streamer, job, &file).await?,
                None => {
                    tracing::info!(name = %archive::suggested_file_name(&job), "writing archive to stdout");
                    write_archive(&streamer, job, tokio::io::stdout()).await?
                }
            };

            for skip in &report.skipped {
                eprintln!("skipped {}: {}", skip.path, skip.reason);
            }
            eprintln!(
                "{} files, {} directories, {} bytes",
                report.files, report.directories, report.bytes_written
            );
            Ok(if report.skipped.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
    }
}

fn mounts(vfs: &VirtualFs, json: bool) -> Result<ExitCode> {
    let rows: Vec<MountRow<'_>> = vfs
        .mounts()
        .map(|m| MountRow {
            path: format!("/{}", m.name()),
            display_name: m.display_name(),
            directory: m.root_path(),
            read_only: m.read_only(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            println!(
                "{:<20} {} {:<24} {}",
                row.path,
                if row.read_only { "ro" } else { "rw" },
                row.display_name,
                row.directory.display()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn zip_to_file(streamer: &ArchiveStreamer, job: ArchiveJob, path: &Path) -> Result<ArchiveReport> {
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    let result = write_archive(streamer, job, file).await;
    if result.is_err() {
        // Leave no truncated archive behind.
        let _ = tokio::fs::remove_file(path).await;
    }
    result
}

async fn write_archive<W>(streamer: &ArchiveStreamer, job: ArchiveJob, sink: W) -> Result<ArchiveReport>
where
    W: AsyncWrite + Unpin + Send,
{
    let url_path = job.url_path().to_string();
    let report = streamer
        .run(job, sink)
        .await
        .map_err(|e| e.conceal(&url_path))?;
    Ok(report)
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling archive");
            token.cancel();
        }
    });
}

fn format_entry(info: &FileInfo) -> String {
    let kind = match (info.is_dir, info.is_symlink) {
        (true, true) => "dl",
        (true, false) => "d-",
        (false, true) => "-l",
        (false, false) => "--",
    };
    let modified: DateTime<Utc> = info.modified.into();
    let suffix = if info.is_dir { "/" } else { "" };
    format!(
        "{kind} {:>12} {} {}{suffix}",
        info.size,
        modified.format("%Y-%m-%d %H:%M"),
        info.name
    )
}
