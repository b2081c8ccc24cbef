//! Storm Tracker CLI Application
//!
//! Command-line front end for the storm-tracker library:
//! - `track`: run the tracker over scan series files (one run per file, in parallel)
//! - `dump`: list or print the complex tracks stored in an archive file
//! - `restart`: show the restart window for a trigger time

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use std::fs;
use std::path::PathBuf;

mod config;
mod report;
mod runner;

use config::{load_config, OutputFormat};
use runner::{load_series, run_series, RunOptions, RunOutcome};
use storm_tracker::RestartWindow;

/// Storm Tracker - Identify and track storm cells through successive scans
#[derive(Parser, Debug)]
#[command(name = "storm-tracker-cli")]
#[command(about = "Identify and track storm cells in thresholded radar scans", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track storms through scan series files
    Track {
        /// Path to configuration file (config.toml)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Scan series files (JSON); overrides the files listed in the config
        #[arg(value_name = "FILE")]
        scans: Vec<PathBuf>,

        /// Continue from existing archives instead of starting fresh
        #[arg(long)]
        resume: bool,

        /// Summary format (txt or json); overrides the config
        #[arg(short, long, value_name = "FORMAT")]
        format: Option<String>,
    },

    /// Show the contents of a track archive
    Dump {
        /// Archive file
        #[arg(value_name = "FILE")]
        archive: PathBuf,

        /// Print only the complex track with this id
        #[arg(long, value_name = "ID")]
        complex: Option<u32>,

        /// Print the index table instead of XML
        #[arg(long)]
        index: bool,
    },

    /// Compute the restart window for a trigger time
    Restart {
        /// Trigger time (RFC 3339, default: now)
        #[arg(long, value_name = "TIME")]
        time: Option<DateTime<Utc>>,

        /// Restart hour (UTC)
        #[arg(long, default_value_t = 0)]
        hour: u32,

        /// Restart minute
        #[arg(long, default_value_t = 0)]
        minute: u32,

        /// Overlap period in minutes
        #[arg(long, default_value_t = 120)]
        overlap_mins: i64,
    },
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("Storm Tracker CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using tracker library v{}", storm_tracker::VERSION);

    match args.command {
        Command::Track {
            config,
            scans,
            resume,
            format,
        } => track_mode(config, scans, resume, format),
        Command::Dump {
            archive,
            complex,
            index,
        } => dump_mode(archive, complex, index),
        Command::Restart {
            time,
            hour,
            minute,
            overlap_mins,
        } => restart_mode(time.unwrap_or_else(Utc::now), hour, minute, overlap_mins),
    }
}

/// Track mode - one independent run per scan series file
fn track_mode(
    config_path: PathBuf,
    scans: Vec<PathBuf>,
    resume: bool,
    format: Option<String>,
) -> Result<()> {
    let mut config = load_config(&config_path)?;
    if !scans.is_empty() {
        config.input.scan_files = scans;
    }
    if let Some(format) = format {
        config.output.format = match format.as_str() {
            "txt" => OutputFormat::Txt,
            "json" => OutputFormat::Json,
            other => anyhow::bail!("Unknown output format: {}", other),
        };
    }
    if config.input.scan_files.is_empty() {
        anyhow::bail!("No scan files given");
    }

    fs::create_dir_all(&config.output.archive_dir).with_context(|| {
        format!("Failed to create archive directory: {:?}", config.output.archive_dir)
    })?;

    let options = RunOptions {
        archive_dir: config.output.archive_dir.clone(),
        resume,
        write_events: config.output.write_events,
    };

    log::info!(
        "Tracking {} scan series into {:?}",
        config.input.scan_files.len(),
        options.archive_dir
    );

    let results: Vec<Result<RunOutcome>> = config
        .input
        .scan_files
        .par_iter()
        .map(|path| {
            let series = load_series(path)?;
            run_series(&series, &config.tracker, &options)
                .with_context(|| format!("Tracking failed for {:?}", path))
        })
        .collect();

    let mut outcomes = Vec::new();
    let mut failed = 0;
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                log::error!("{:#}", e);
                failed += 1;
            }
        }
    }

    match config.output.format {
        OutputFormat::Txt => print!("{}", report::outcomes_txt(&outcomes)),
        OutputFormat::Json => println!("{}", report::outcomes_json(&outcomes)?),
    }

    if failed > 0 {
        anyhow::bail!("{} of {} runs failed", failed, config.input.scan_files.len());
    }
    Ok(())
}

/// Dump mode - index table or XML of an archive's complex tracks
fn dump_mode(path: PathBuf, complex: Option<u32>, index_only: bool) -> Result<()> {
    let bytes = fs::read(&path).with_context(|| format!("Failed to read archive: {:?}", path))?;
    let index = storm_tracker::index_archive(&bytes)
        .with_context(|| format!("Failed to index archive: {:?}", path))?;

    let selected: Vec<_> = index
        .iter()
        .filter(|entry| complex.map_or(true, |id| entry.complex_id == id))
        .cloned()
        .collect();
    if let Some(id) = complex {
        if selected.is_empty() {
            anyhow::bail!("Complex track {} not found in {:?}", id, path);
        }
    }

    if index_only {
        print!("{}", report::index_txt(&selected));
        return Ok(());
    }

    for entry in &selected {
        let track = storm_tracker::read_at(&bytes, entry.offset)?;
        println!("{}", storm_tracker::to_xml(&track)?);
    }
    Ok(())
}

/// Restart mode - print the window as JSON
fn restart_mode(trigger: DateTime<Utc>, hour: u32, minute: u32, overlap_mins: i64) -> Result<()> {
    let window = restart_window(trigger, hour, minute, overlap_mins)?;
    println!("{}", serde_json::to_string_pretty(&window)?);
    Ok(())
}

fn restart_window(
    trigger: DateTime<Utc>,
    hour: u32,
    minute: u32,
    overlap_mins: i64,
) -> Result<RestartWindow> {
    let overlap = Duration::try_minutes(overlap_mins)
        .with_context(|| format!("Overlap of {} minutes is out of range", overlap_mins))?;
    Ok(storm_tracker::compute_restart(trigger, hour, minute, overlap)?)
}

/// Initialize logging based on verbosity
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_track_args() {
        let args = Args::try_parse_from([
            "storm-tracker-cli",
            "-vv",
            "track",
            "--config",
            "run.toml",
            "a.json",
            "b.json",
            "--resume",
        ])
        .unwrap();
        assert_eq!(args.verbose, 2);
        match args.command {
            Command::Track { scans, resume, .. } => {
                assert_eq!(scans.len(), 2);
                assert!(resume);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_restart_args() {
        let args = Args::try_parse_from([
            "storm-tracker-cli",
            "restart",
            "--time",
            "2024-03-10T14:30:00Z",
            "--hour",
            "6",
        ])
        .unwrap();
        match args.command {
            Command::Restart {
                time,
                hour,
                overlap_mins,
                ..
            } => {
                assert!(time.is_some());
                assert_eq!(hour, 6);
                assert_eq!(overlap_mins, 120);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_restart_window_rejects_huge_overlap() {
        let trigger = "2024-03-10T14:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let window = restart_window(trigger, 6, 0, 90).unwrap();
        assert_eq!(window.start, window.reference - Duration::minutes(90));

        assert!(restart_window(trigger, 6, 0, i64::MAX).is_err());
        assert!(restart_window(trigger, 6, 0, 150_000_000_000).is_err());
    }
}
