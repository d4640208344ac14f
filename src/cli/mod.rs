use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::options::{ArchiveOptions, DEFAULT_BUF_SIZE, DEFAULT_CHUNK_SIZE};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create a new archive from the specified files and directories.
    #[command(alias = "c")]
    Create {
        /// One or more input files or directories to archive.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// The path for the output archive file (e.g. tree.tar).
        #[arg(short = 'f', long)]
        archive: PathBuf,

        /// Number of parallel workers. [0 = auto-detect from CPU cores]
        #[arg(long, default_value_t = 0)]
        ranks: usize,

        /// Size of one parallel data unit in bytes.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,

        /// Per-worker I/O buffer size in bytes.
        #[arg(long, default_value_t = DEFAULT_BUF_SIZE)]
        buf_size: usize,

        /// Capture extended attributes into entry headers.
        #[arg(long)]
        preserve: bool,

        /// Use the work-stealing data phase instead of static chunks.
        #[arg(long)]
        steal: bool,

        /// Show a live progress line on stderr.
        #[arg(long)]
        progress: bool,
    },

    /// Extract files from an archive.
    #[command(alias = "x")]
    Extract {
        /// The archive file to extract.
        #[arg(required = true)]
        archive: PathBuf,

        /// The directory to extract into. Defaults to the current directory.
        #[arg(short = 'C', long)]
        output: Option<PathBuf>,

        /// Number of parallel workers. [0 = auto-detect from CPU cores]
        #[arg(long, default_value_t = 0)]
        ranks: usize,

        /// Size of one parallel data unit in bytes.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,

        /// Per-worker I/O buffer size in bytes.
        #[arg(long, default_value_t = DEFAULT_BUF_SIZE)]
        buf_size: usize,

        /// Restore extended attributes recorded in entry headers.
        #[arg(long)]
        preserve: bool,

        /// Drive the tar reader per entry instead of positional chunk copies.
        #[arg(long)]
        libtar: bool,

        /// Show a live progress line on stderr.
        #[arg(long)]
        progress: bool,
    },

    /// List the contents of an archive without extracting it.
    #[command(alias = "l")]
    List {
        /// The archive file to list.
        #[arg(required = true)]
        archive: PathBuf,
    },
}

impl Commands {
    /// Engine options for this invocation.
    pub fn to_options(&self) -> ArchiveOptions {
        match self {
            Commands::Create {
                archive,
                ranks,
                chunk_size,
                buf_size,
                preserve,
                steal,
                ..
            } => ArchiveOptions {
                dest: archive.clone(),
                ranks: *ranks,
                chunk_size: *chunk_size,
                buf_size: *buf_size,
                preserve: *preserve,
                steal_create: *steal,
                lib_extract: false,
            },
            Commands::Extract {
                output,
                ranks,
                chunk_size,
                buf_size,
                preserve,
                libtar,
                ..
            } => ArchiveOptions {
                dest: output.clone().unwrap_or_else(|| PathBuf::from(".")),
                ranks: *ranks,
                chunk_size: *chunk_size,
                buf_size: *buf_size,
                preserve: *preserve,
                lib_extract: *libtar,
                ..Default::default()
            },
            Commands::List { .. } => ArchiveOptions::default(),
        }
    }
}

/// Parse command-line arguments and return the command to execute.
pub fn run() -> Result<Commands, Box<dyn std::error::Error>> {
    let args = Args::parse();
    Ok(args.command)
}
