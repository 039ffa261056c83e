use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use imagerpi_core::command::SystemRunner;
use imagerpi_core::pipeline::{self, CaptureOptions, DeployOptions, Outcome, Progress};
use imagerpi_core::{platform, units};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imagerpi")]
#[command(about = "Capture or deploy images to SD cards", version)]
struct Cli {
    /// Use a transfer buffer of size SIZE. Accepts suffixes of B, K, M, G, ...
    #[arg(short, long, global = true, value_name = "SIZE", default_value = "512K", value_parser = parse_buffer_size)]
    buffer_size: u64,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture an image of a block device, shrinking its last partition first
    Capture {
        /// Source disk
        #[arg(value_parser = parse_block_device)]
        src: PathBuf,

        /// Destination file
        dest: PathBuf,

        /// Don't copy to dest
        #[arg(long)]
        no_copy: bool,

        /// Skip the filesystem shrinking step
        #[arg(long)]
        no_shrink: bool,

        /// Shrink the last partition's filesystem to keep a minimum of SIZE free space
        #[arg(short, long, value_name = "SIZE", default_value = "500M", value_parser = parse_size)]
        free: u64,

        /// Compare the image against the device after copying
        #[arg(long)]
        verify: bool,
    },
    /// Deploy a disk image to a block device
    Deploy {
        /// Source file
        src: PathBuf,

        /// Destination disk
        #[arg(value_parser = parse_block_device)]
        dest: PathBuf,

        /// Compare the device against the image after writing
        #[arg(long)]
        verify: bool,
    },
}

fn parse_size(s: &str) -> Result<u64, String> {
    units::parse(s).map_err(|e| e.to_string())
}

fn parse_buffer_size(s: &str) -> Result<u64, String> {
    units::parse_nonzero(s).map_err(|e| e.to_string())
}

fn parse_block_device(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if !platform::is_block_device(&path) {
        return Err(format!("{s} is not a block device"));
    }
    Ok(path)
}

/// Sets up logging on stderr. `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Asks before overwriting an existing image file. Defaults to yes.
fn confirm_overwrite(path: &Path) -> imagerpi_core::Result<bool> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "File '{}' already exists. Overwrite?",
            path.display()
        ))
        .default(true)
        .interact()
        .map_err(|e| imagerpi_core::ImageError::Io(std::io::Error::other(e)))
}

fn bar_style(color: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(&format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
        ))
        .unwrap()
        .progress_chars("■ ")
}

/// Connects the core library's progress reporting to our progress bars.
fn progress_bars<'a>(
    copy_pb: &'a ProgressBar,
    verify_pb: &'a ProgressBar,
    copy_label: &'static str,
) -> Progress<impl FnOnce(u64) + 'a, impl FnMut(u64) + 'a, impl FnOnce(u64) + 'a, impl FnMut(u64) + 'a>
{
    Progress {
        on_copy_start: move |len: u64| {
            copy_pb.set_length(len);
            copy_pb.set_prefix(copy_label);
            copy_pb.set_style(bar_style("green"));
        },
        on_copy_progress: move |bytes: u64| copy_pb.set_position(bytes),
        on_verify_start: move |len: u64| {
            copy_pb.finish_with_message("Copy complete.");
            verify_pb.set_length(len);
            verify_pb.set_prefix("Verifying");
            verify_pb.set_style(bar_style("magenta"));
        },
        on_verify_progress: move |bytes: u64| verify_pb.set_position(bytes),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let verify = match &cli.command {
        Commands::Capture { verify, no_copy, .. } => *verify && !*no_copy,
        Commands::Deploy { verify, .. } => *verify,
    };

    // Conditionally create progress bars so they don't flash on screen if not needed.
    let copy_pb = ProgressBar::new(0);
    let verify_pb = if verify {
        ProgressBar::new(0)
    } else {
        ProgressBar::hidden()
    };

    let (result, src, dest) = match cli.command {
        Commands::Capture {
            src,
            dest,
            no_copy,
            no_shrink,
            free,
            verify,
        } => {
            let options = CaptureOptions {
                shrink: !no_shrink,
                copy: !no_copy,
                min_free: free,
                buffer_size: cli.buffer_size,
                verify,
            };
            let result = pipeline::capture(
                &SystemRunner,
                &src,
                &dest,
                &options,
                confirm_overwrite,
                progress_bars(&copy_pb, &verify_pb, "Capturing"),
            )
            .with_context(|| format!("Failed to capture {}", src.display()));
            (result, src, dest)
        }
        Commands::Deploy { src, dest, verify } => {
            println!(
                "{} This will overwrite data on '{}'.",
                style("WARNING:").red().bold(),
                dest.display()
            );
            let options = DeployOptions {
                buffer_size: cli.buffer_size,
                verify,
            };
            let result = pipeline::deploy(
                &src,
                &dest,
                &options,
                progress_bars(&copy_pb, &verify_pb, "Deploying"),
            )
            .with_context(|| format!("Failed to deploy {}", src.display()));
            (result, src, dest)
        }
    };

    // Cleanly finish progress bars based on the result.
    match result {
        Ok(Outcome::Completed { bytes }) => {
            copy_pb.finish_and_clear();
            verify_pb.finish_and_clear();
            println!(
                "\n✨ Finished {} -> {} ({} bytes).",
                style(src.display()).cyan(),
                style(dest.display()).cyan(),
                bytes
            );
        }
        Ok(Outcome::Aborted) => {
            println!("Operation aborted.");
        }
        Err(e) => {
            copy_pb.abandon_with_message("❌ Operation failed.");
            verify_pb.finish_and_clear();
            return Err(e);
        }
    }

    Ok(())
}
