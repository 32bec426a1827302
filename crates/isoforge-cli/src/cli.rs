use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Subcommand)]
pub enum Command {
  /// Build an ISO image from a directory tree.
  Create {
    /// Path of the image to write.
    output: PathBuf,
    /// Directory whose contents become the volume.
    directory: PathBuf,
    /// Volume identifier recorded in the descriptor (d-characters).
    #[clap(long, default_value = "ISOFORGE")]
    volume_id: String,
    /// No-emulation x86 boot image attached through an El Torito catalog.
    #[clap(long)]
    boot_image: Option<PathBuf>,
    /// Interchange level (1-3).
    #[clap(long, default_value_t = 1)]
    level: u8,
  },
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
  #[clap(subcommand)]
  pub command: Command,
}
