//! Command-line entry point for partar.
//!
//! Usage:
//!   partar create -f tree.tar dir1 dir2    → archive trees in parallel
//!   partar extract tree.tar -C out/        → restore an archive
//!   partar list tree.tar                   → print the member list

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use partar::cli::{self, Commands};
use partar::flist::FileList;
use partar::progress::{ProgressCallback, ProgressState};
use partar::{create, extract};

fn main() -> std::process::ExitCode {
    env_logger::init();
    if let Err(e) = run_cli() {
        if e.downcast_ref::<clap::Error>().is_none() {
            eprintln!("Error: {e}");
        }
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_cli() -> Result<(), Box<dyn std::error::Error>> {
    let command = cli::run()?;
    let opts = command.to_options();

    match &command {
        Commands::Create {
            inputs,
            archive,
            preserve,
            progress,
            ..
        } => {
            let start = Instant::now();
            let flist = FileList::walk(inputs, *preserve)?;
            println!(
                "[partar] Archiving {} entries with {} workers → {}",
                flist.global_count(),
                opts.worker_count(),
                archive.display()
            );
            let callback = progress.then(|| progress_line("create"));
            create::create_archive_with_progress(&flist, &opts, callback)?;
            finish_progress(*progress);

            let written = std::fs::metadata(archive).map(|m| m.len()).unwrap_or(0);
            let secs = start.elapsed().as_secs_f64();
            println!(
                "[partar] Archive complete | Entries: {} | Size: {:.2} MiB | Time: {:.2}s | {:.1} MB/s",
                flist.global_count(),
                written as f64 / (1024.0 * 1024.0),
                secs,
                if secs > 0.0 {
                    written as f64 / (1024.0 * 1024.0) / secs
                } else {
                    0.0
                },
            );
        }
        Commands::Extract {
            archive, progress, ..
        } => {
            let start = Instant::now();
            println!(
                "[partar] Extracting {} with {} workers → {}",
                archive.display(),
                opts.worker_count(),
                opts.dest.display()
            );
            let callback = progress.then(|| progress_line("extract"));
            extract::extract_archive_with_progress(archive, &opts, callback)?;
            finish_progress(*progress);
            println!(
                "[partar] Extract complete | Time: {:.2}s",
                start.elapsed().as_secs_f64()
            );
        }
        Commands::List { archive } => {
            extract::list_archive(archive)?;
        }
    }

    Ok(())
}

/// Single-line progress display, throttled by the tracker and overwritten
/// in place on stderr.
fn progress_line(operation: &str) -> Box<ProgressCallback> {
    let operation = operation.to_uppercase();
    let prev_len = Arc::new(Mutex::new(0usize));
    let done = Arc::new(AtomicBool::new(false));

    Box::new(move |state: ProgressState| {
        if done.load(Ordering::Relaxed) {
            return;
        }
        let mut line = format!(
            "[{}] {:.1}% | {} items | {:.1} MB/s",
            operation, state.percent, state.items, state.mb_per_sec
        );
        {
            let mut prev = prev_len.lock().unwrap();
            if *prev > line.len() {
                let pad = *prev - line.len();
                line.push_str(&" ".repeat(pad));
            }
            *prev = line.len();
        }
        eprint!("\r{line}");
        std::io::stderr().flush().ok();
        if state.percent >= 100.0 {
            done.store(true, Ordering::Relaxed);
        }
    })
}

fn finish_progress(enabled: bool) {
    if enabled {
        eprintln!();
    }
}
