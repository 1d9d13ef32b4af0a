//! CLI entry point for frame-enhance
//!
//! Parses command line arguments, loads the configuration and runs one
//! pipeline command as a background task while printing its progress.

use clap::{Parser, Subcommand};
use frame_enhance::config::{OutputFormat, TriState};
use frame_enhance::{
    new_shared_status, run_status_server, spawn_status_forwarder, CancelFlag, Config, Pipeline,
    PipelineCommand, PipelineError, PipelineReport, ProgressEvent, ProgressReporter, Requirements,
    RunStatistics,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CANCELLED: u8 = 130;

/// frame-enhance - batch image and video enhancement through a remote service
#[derive(Parser, Debug)]
#[command(name = "frame-enhance")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults are used when it does not exist
    #[arg(short, long, global = true, default_value = "frame-enhance.toml")]
    config: PathBuf,

    /// Number of sessions driven together (1-20)
    #[arg(long, global = true)]
    concurrency: Option<u32>,

    /// Force the browser headless
    #[arg(long, global = true, conflicts_with = "no_headless")]
    headless: bool,

    /// Force a visible browser window
    #[arg(long, global = true)]
    no_headless: bool,

    /// Force a private browser profile
    #[arg(long, global = true, conflicts_with = "no_private")]
    private: bool,

    /// Force a regular browser profile
    #[arg(long, global = true)]
    no_private: bool,

    /// Output image format (png or jpg)
    #[arg(long, global = true, value_parser = parse_format)]
    format: Option<OutputFormat>,

    /// Serve the run status as JSON on this address (GET /status)
    #[arg(long, global = true)]
    status_addr: Option<SocketAddr>,

    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Enhance images (files or directories, searched recursively)
    Images {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Extract, enhance and re-encode videos
    Video {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Drop the audio track
        #[arg(long)]
        mute: bool,
    },
    /// Continue enhancing an already extracted frame directory
    Resume {
        frame_dir: PathBuf,
        /// Drop the audio track
        #[arg(long)]
        mute: bool,
    },
    /// Check that ffmpeg, ffprobe and the WebDriver are usable
    Check,
    /// Empty the video work directory
    CleanTemp {
        /// Directory the work directory must stay inside
        #[arg(long, default_value = ".")]
        base: PathBuf,
    },
}

fn parse_format(value: &str) -> Result<OutputFormat, String> {
    OutputFormat::parse(value).ok_or_else(|| format!("unsupported format '{}' (png or jpg)", value))
}

fn flag_pair(on: bool, off: bool) -> Option<TriState> {
    match (on, off) {
        (true, _) => Some(TriState::On),
        (_, true) => Some(TriState::Off),
        _ => None,
    }
}

/// Command line flags win over file and environment settings
fn apply_cli_overrides(config: &mut Config, args: &Args) {
    if let Some(concurrency) = args.concurrency {
        config.batch.concurrency = concurrency;
    }
    if let Some(headless) = flag_pair(args.headless, args.no_headless) {
        config.session.headless = headless;
    }
    if let Some(private_mode) = flag_pair(args.private, args.no_private) {
        config.session.private_mode = private_mode;
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Progress { message, percent } => println!("[{:5.1}%] {}", percent, message),
        ProgressEvent::JobFinished { path, success } => {
            let mark = if *success { "done" } else { "FAILED" };
            println!("        {} {}", mark, path.display());
        }
        ProgressEvent::RunStarted { .. } | ProgressEvent::JobStarted { .. } => {}
    }
}

fn print_statistics(stats: &RunStatistics) {
    println!(
        "{} succeeded, {} failed in {:.1}s",
        stats.total_succeeded,
        stats.total_failed,
        (stats.end_time - stats.start_time).num_milliseconds() as f64 / 1000.0
    );
    for result in stats.results.iter().filter(|r| !r.success) {
        println!(
            "  {}: {}",
            result.source_path.display(),
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    for dir in &stats.distinct_output_directories {
        println!("Output: {}", dir.display());
    }
}

/// Print the report and decide the exit code
fn report(result: Result<PipelineReport, PipelineError>) -> ExitCode {
    match result {
        Ok(PipelineReport::Images(stats)) => {
            print_statistics(&stats);
            if stats.total_failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Ok(PipelineReport::Videos(videos)) => {
            let mut failed = 0;
            for video in &videos {
                match &video.result {
                    Ok(outcome) => {
                        println!("{} -> {}", video.source.display(), outcome.video.display())
                    }
                    Err(e) => {
                        failed += 1;
                        println!("{}: {}", video.source.display(), e);
                    }
                }
            }
            println!("{} of {} videos done", videos.len() - failed, videos.len());
            if failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Ok(PipelineReport::Resume(outcome)) => {
            println!(
                "{} frames merged into {}",
                outcome.enhanced_frames.len(),
                outcome.video.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) if e.is_cancelled() => {
            warn!("Run cancelled");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), "{}", e);
            return ExitCode::FAILURE;
        }
    };
    apply_cli_overrides(&mut config, &args);
    info!(
        config = %args.config.display(),
        concurrency = config.batch.concurrency,
        "Configuration loaded"
    );

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current step");
                cancel.cancel();
            }
        });
    }

    let (reporter, rx) = ProgressReporter::channel();
    let status = new_shared_status();
    let forwarder = spawn_status_forwarder(rx, status.clone(), print_event);

    if let Some(addr) = args.status_addr {
        let status = status.clone();
        tokio::spawn(async move {
            if let Err(e) = run_status_server(status, addr).await {
                error!("Status server error: {}", e);
            }
        });
    }

    let mute_default = config.video.mute_audio;
    let pipeline = Pipeline::new(config, reporter, cancel);

    let (requirements, command) = match args.command {
        Command::Check => {
            return match pipeline.check(Requirements::ALL).await {
                Ok(()) => {
                    println!("All checks passed");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("{}", e);
                    ExitCode::FAILURE
                }
            };
        }
        Command::CleanTemp { base } => {
            return match pipeline.clean_work_dir(&base) {
                Ok(outcome) => {
                    println!(
                        "Cleaned {} ({} entries removed)",
                        outcome.root.display(),
                        outcome.removed
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("{}", e);
                    ExitCode::FAILURE
                }
            };
        }
        Command::Images { paths } => (Requirements::IMAGES, PipelineCommand::Images { paths }),
        Command::Video { paths, mute } => (
            Requirements::ALL,
            PipelineCommand::Videos {
                paths,
                mute_audio: mute || mute_default,
            },
        ),
        Command::Resume { frame_dir, mute } => (
            Requirements::ALL,
            PipelineCommand::Resume {
                frame_dir,
                mute_audio: mute || mute_default,
            },
        ),
    };

    if let Err(e) = pipeline.check(requirements).await {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    let result = match pipeline.spawn(command).await {
        Ok(result) => result,
        Err(e) => Err(PipelineError::Task(e.to_string())),
    };
    // The pipeline owned the last reporter, so the forwarder drains and ends
    let _ = forwarder.await;

    report(result)
}
