use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use barque_core::commands;
use barque_core::config;
use barque_core::error::Result;
use barque_core::report::Report;
use barque_core::splitter::DEFAULT_SPLIT_BITS;

#[derive(Parser)]
#[command(
    name = "barque",
    version,
    about = "Deduplicating, content-addressed backups",
    after_help = "\
Environment variables:
  BK_DIR             Repository location: a directory path or gs://bucket
  BK_GCS_PROJECT_ID  Billing project when BK_DIR is a gs:// bucket
  BK_GCS_TOKEN       Bearer token for the bucket (optional)
  BK_PASSPHRASE      Passphrase for encrypted repositories

The process exit code is the number of errors logged (0 = success)."
)]
struct Cli {
    /// Log progress details
    #[arg(long, global = true)]
    verbose: bool,

    /// Log internal tracing
    #[arg(long, global = true)]
    debug: bool,

    /// Report wall-clock and transfer totals at exit
    #[arg(long, global = true)]
    profile: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository
    Init {
        /// Encrypt everything stored in the repository
        #[arg(long)]
        encrypt: bool,
    },

    /// Back up a directory tree as a named snapshot
    Backup {
        /// Reuse unchanged file bodies from this earlier snapshot
        #[arg(long)]
        base: Option<String>,

        /// Matching bits for the rolling checksum (8-22)
        #[arg(long, default_value_t = DEFAULT_SPLIT_BITS)]
        split_bits: u32,

        /// Snapshot name (timestamp is appended)
        name: String,

        /// Directory to back up
        dir: PathBuf,
    },

    /// Restore a snapshot into a directory
    Restore {
        /// Full snapshot name, as printed by `list`
        name: String,

        /// Target directory (must be empty or absent)
        dir: PathBuf,
    },

    /// Save standard input as a named bitstream
    Savebits {
        /// Matching bits for the rolling checksum (8-22)
        #[arg(long, default_value_t = DEFAULT_SPLIT_BITS)]
        split_bits: u32,

        /// Stream name (timestamp is appended)
        name: String,
    },

    /// Write a named bitstream to standard output
    Restorebits {
        /// Full stream name, as printed by `list`
        name: String,
    },

    /// List snapshots and bitstreams
    List,

    /// Check the integrity of everything in the repository
    Fsck,
}

fn main() {
    // Argument errors exit 1.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    let filter = if cli.debug {
        "barque_core=trace,barque=trace,info"
    } else if cli.verbose {
        "barque_core=debug,barque=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let started = Instant::now();
    let report = Report::new();

    if let Err(e) = dispatch(&cli.command, &report) {
        if e.is_usage() {
            eprintln!("barque: {e}");
            std::process::exit(1);
        }
        report.error(e);
    }

    if cli.profile {
        let elapsed = started.elapsed();
        eprintln!(
            "profile: {:.2}s elapsed, {} bytes processed",
            elapsed.as_secs_f64(),
            report.bytes_processed()
        );
    }

    std::process::exit(i32::from(report.exit_code()));
}

fn dispatch(command: &Commands, report: &Report) -> Result<()> {
    match command {
        Commands::Init { encrypt } => {
            let backend = config::base_backend()?;
            let passphrase = if *encrypt {
                Some(config::passphrase()?)
            } else {
                None
            };
            commands::init::run(backend, *encrypt, passphrase.as_deref())
        }
        Commands::Backup {
            base,
            split_bits,
            name,
            dir,
        } => {
            let mut store = config::open_store()?;
            let full_name = commands::backup::run(
                &mut store,
                name,
                dir,
                *split_bits,
                base.as_deref(),
                report,
            )?;
            println!("{full_name}: successfully saved backup");
            Ok(())
        }
        Commands::Restore { name, dir } => {
            let mut store = config::open_store()?;
            let stats = commands::restore::run(&mut store, name, dir, report)?;
            println!(
                "{name}: restored {} files, {} dirs, {} symlinks",
                stats.files, stats.dirs, stats.symlinks
            );
            Ok(())
        }
        Commands::Savebits { split_bits, name } => {
            let mut store = config::open_store()?;
            let mut stdin = std::io::stdin().lock();
            let full_name =
                commands::savebits::run(&mut store, name, *split_bits, &mut stdin, report)?;
            println!("{full_name}: successfully saved bits");
            Ok(())
        }
        Commands::Restorebits { name } => {
            let mut store = config::open_store()?;
            let mut stdout = std::io::stdout().lock();
            commands::restorebits::run(&mut store, name, &mut stdout)?;
            stdout.flush()?;
            Ok(())
        }
        Commands::List => {
            let mut store = config::open_store()?;
            let listing = commands::list::run(&mut store)?;
            if !listing.backups.is_empty() {
                println!("Total of {} backups:", listing.backups.len());
                for name in &listing.backups {
                    println!("  {name}");
                }
            }
            if !listing.bits.is_empty() {
                println!("Total of {} bitstreams:", listing.bits.len());
                for name in &listing.bits {
                    println!("  {name}");
                }
            }
            Ok(())
        }
        Commands::Fsck => {
            let mut store = config::open_store()?;
            let totals = commands::fsck::run(&mut store, report)?;
            println!(
                "checked {} names, {} chunks, {} bytes; {} errors",
                totals.names_checked,
                totals.chunks_checked,
                totals.bytes_verified,
                report.error_count()
            );
            Ok(())
        }
    }
}
